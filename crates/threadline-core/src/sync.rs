//! The `/sync` loop.
//!
//! ```text
//! InitialSync --ok--> CatchupSync --empty response--> Syncing
//!      |                  |                              |
//!      +------------------+------error or stop-----------+--> Stopped
//! ```
//!
//! Every response is written in one transaction over all stores; memory is
//! only touched after that transaction commits. Until the loop reaches
//! `Syncing` it polls without a server-side wait.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::net::{HomeServerApi, default_sync_filter};
use crate::session::Session;
use crate::store::StoreName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// First sync for this session, no token yet.
    InitialSync,
    /// Fetching what happened while the client was away.
    CatchupSync,
    /// Long-polling for live updates.
    Syncing,
    Stopped,
}

#[derive(Default)]
struct RunState {
    /// Stop signal of the running loop, if any.
    stop: Option<watch::Sender<bool>>,
    error: Option<Arc<Error>>,
}

pub struct SyncLoop {
    api: Arc<dyn HomeServerApi>,
    session: Arc<Session>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    run: Mutex<RunState>,
}

impl SyncLoop {
    #[must_use]
    pub fn new(api: Arc<dyn HomeServerApi>, session: Arc<Session>, config: &SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::Stopped);
        Self {
            api,
            session,
            config: config.clone(),
            status,
            run: Mutex::default(),
        }
    }

    fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// The error that stopped the loop, cleared by the next [`start`](Self::start).
    #[must_use]
    pub fn error(&self) -> Option<Arc<Error>> {
        self.run_state().error.clone()
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(from = ?*current, to = ?status, "sync status changed");
            *current = status;
            true
        });
    }

    /// Start the loop unless it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let stop_rx = {
            let mut run = self.run_state();
            if run.stop.is_some() {
                return;
            }
            let (stop, stop_rx) = watch::channel(false);
            run.stop = Some(stop);
            run.error = None;
            stop_rx
        };
        if self.session.sync_token().is_some() {
            self.set_status(SyncStatus::CatchupSync);
        } else {
            self.set_status(SyncStatus::InitialSync);
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop(stop_rx).await });
    }

    /// Abort the in-flight request and stop. A response that already
    /// arrived is still written.
    pub fn stop(&self) {
        let Some(stop) = self.run_state().stop.take() else {
            return;
        };
        let _ = stop.send(true);
        self.set_status(SyncStatus::Stopped);
    }

    async fn run_loop(&self, mut stop_rx: watch::Receiver<bool>) {
        loop {
            let result = self.sync_once(&mut stop_rx).await;
            if *stop_rx.borrow() {
                tracing::debug!("sync loop stopped");
                return;
            }
            match result {
                Ok(next) => self.set_status(next),
                Err(error) if error.is_abort() => {
                    tracing::debug!("sync request aborted");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, code = %error.code(), "sync failed, stopping");
                    let mut run = self.run_state();
                    run.stop = None;
                    run.error = Some(Arc::new(error));
                    drop(run);
                    self.set_status(SyncStatus::Stopped);
                    return;
                }
            }
        }
    }

    /// One request/write round. Returns the status to move to.
    async fn sync_once(&self, stop_rx: &mut watch::Receiver<bool>) -> Result<SyncStatus> {
        let filter_id = match self.session.filter_id() {
            Some(filter_id) => filter_id,
            None => {
                let filter = default_sync_filter(self.config.timeline_limit);
                let filter_id = abortable(
                    stop_rx,
                    self.api.create_filter(self.session.user_id(), &filter),
                )
                .await?;
                self.session.set_filter_id(&filter_id).await?;
                filter_id
            }
        };

        let status = self.status();
        let timeout = if status == SyncStatus::Syncing {
            self.config.timeout()
        } else {
            Duration::ZERO
        };
        let request_timeout = timeout + Duration::from_millis(self.config.request_slack_ms);
        let since = self.session.sync_token();
        let is_initial_sync = since.is_none();

        let response = abortable(
            stop_rx,
            self.api
                .sync(since.as_deref(), Some(&filter_id), timeout, request_timeout),
        )
        .await?;
        tracing::debug!(next_batch = %response.next_batch, "sync response received");

        let txn = self.session.storage().write_txn(&StoreName::ALL).await?;
        let result = match self.session.write_sync(&response, is_initial_sync, &txn) {
            Ok(result) => result,
            Err(error) => {
                if let Err(abort_error) = txn.abort() {
                    tracing::warn!(error = %abort_error, "could not abort sync transaction");
                }
                return Err(error);
            }
        };
        txn.complete()?;
        self.session.after_sync(result);

        Ok(match status {
            SyncStatus::InitialSync => SyncStatus::CatchupSync,
            SyncStatus::CatchupSync if !response.rooms.is_empty() => SyncStatus::CatchupSync,
            _ => SyncStatus::Syncing,
        })
    }
}

/// Race `request` against the stop signal; dropping the request cancels it.
async fn abortable<T>(
    stop_rx: &mut watch::Receiver<bool>,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = request => result,
        _ = stop_rx.wait_for(|stopped| *stopped) => Err(Error::Aborted),
    }
}
