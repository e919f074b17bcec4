//! Composition root for one logged-in account.
//!
//! Owns the storage handle and wires the reconnector to the sync loop and
//! the send scheduler: every request goes through a [`ReconnectingClient`],
//! and when the connection comes back `Online` sync restarts and each room's
//! outbox resumes.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::net::{ConnectionStatus, HomeServerApi, ReconnectingClient, Reconnector};
use crate::send::SendScheduler;
use crate::session::Session;
use crate::store::Storage;
use crate::sync::{SyncLoop, SyncStatus};

pub struct SessionContainer {
    reconnector: Arc<Reconnector>,
    session: Arc<Session>,
    sync: Arc<SyncLoop>,
    watcher: JoinHandle<()>,
}

impl SessionContainer {
    /// Load the session from `storage` and start syncing and sending.
    ///
    /// `api` is the raw homeserver client. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the stored session cannot be loaded; nothing is started then.
    pub async fn start(
        api: Arc<dyn HomeServerApi>,
        storage: Storage,
        user_id: &str,
        config: &ClientConfig,
    ) -> Result<Self> {
        let reconnector = Arc::new(Reconnector::new(Arc::clone(&api), &config.reconnect));
        let api: Arc<dyn HomeServerApi> =
            Arc::new(ReconnectingClient::new(api, Arc::clone(&reconnector)));
        let scheduler = Arc::new(SendScheduler::new(Arc::clone(&api), &config.send));
        let session = Arc::new(Session::new(
            user_id,
            storage,
            Arc::clone(&api),
            scheduler,
            &config.timeline,
        ));
        session.load().await?;

        let sync = Arc::new(SyncLoop::new(api, Arc::clone(&session), &config.sync));
        sync.start();
        session.start();

        let watcher = tokio::spawn(watch_connection(
            reconnector.subscribe(),
            Arc::clone(&session),
            Arc::clone(&sync),
        ));
        tracing::info!(user_id, "session started");
        Ok(Self {
            reconnector,
            session,
            sync,
            watcher,
        })
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<SyncLoop> {
        &self.sync
    }

    #[must_use]
    pub fn reconnector(&self) -> &Arc<Reconnector> {
        &self.reconnector
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.reconnector.status()
    }

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn stop(&self) {
        self.watcher.abort();
        self.sync.stop();
        self.session.stop();
        tracing::info!(user_id = self.session.user_id(), "session stopped");
    }
}

impl Drop for SessionContainer {
    fn drop(&mut self) {
        self.watcher.abort();
        self.sync.stop();
    }
}

async fn watch_connection(
    mut status: watch::Receiver<ConnectionStatus>,
    session: Arc<Session>,
    sync: Arc<SyncLoop>,
) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        if current != ConnectionStatus::Online {
            continue;
        }
        if sync.status() == SyncStatus::Stopped {
            tracing::info!("connection restored, restarting sync");
            sync.start();
        }
        session.start();
    }
}
