//! Connection health state machine.
//!
//! ```text
//! Online --request failed--> Waiting --delay elapsed / try_now--> Reconnecting
//!                               ^                                    |
//!                               +------------probe failed------------+
//!
//! Reconnecting --probe ok--> Online
//! ```
//!
//! Every probe is preceded by a backoff wait, doubling after each full one.
//!
//! Subscribers watch [`ConnectionStatus`] and resume sync and sending when it
//! flips back to `Online`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::{self, Instant};

use crate::config::ReconnectConfig;
use crate::net::HomeServerApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Online,
    /// Backing off before the next probe.
    Waiting,
    /// Probe in flight.
    Reconnecting,
}

// ---------------------------------------------------------------------------
// ExponentialRetryDelay
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DelayState {
    current: Duration,
    wait_until: Option<Instant>,
}

/// Doubling backoff with a ceiling and an interruptible wait.
#[derive(Debug)]
pub struct ExponentialRetryDelay {
    start: Duration,
    max: Duration,
    state: Mutex<DelayState>,
    interrupt: Notify,
}

impl ExponentialRetryDelay {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            state: Mutex::new(DelayState {
                current: start,
                wait_until: None,
            }),
            interrupt: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for the current delay.
    ///
    /// Returns `true` when [`abort`](Self::abort) cut the wait short. Only a
    /// full wait doubles the next delay.
    pub async fn wait_for_retry(&self) -> bool {
        let notified = self.interrupt.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let delay = {
            let mut state = self.state();
            state.wait_until = Some(Instant::now() + state.current);
            state.current
        };

        let interrupted = tokio::select! {
            () = time::sleep(delay) => false,
            () = &mut notified => true,
        };

        let mut state = self.state();
        state.wait_until = None;
        if !interrupted {
            state.current = (state.current * 2).min(self.max);
        }
        interrupted
    }

    /// Wake a pending [`wait_for_retry`](Self::wait_for_retry) now.
    pub fn abort(&self) {
        self.interrupt.notify_waiters();
    }

    pub fn reset(&self) {
        self.state().current = self.start;
    }

    /// The delay the next wait will use.
    #[must_use]
    pub fn next_value(&self) -> Duration {
        self.state().current
    }

    /// Time left in the wait currently in progress.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.state()
            .wait_until
            .map(|until| until.saturating_duration_since(Instant::now()))
    }
}

// ---------------------------------------------------------------------------
// Reconnector
// ---------------------------------------------------------------------------

pub struct Reconnector {
    api: Arc<dyn HomeServerApi>,
    probe_timeout: Duration,
    delay: ExponentialRetryDelay,
    status: watch::Sender<ConnectionStatus>,
    reconnecting: AtomicBool,
}

impl Reconnector {
    /// `api` must be the raw client, not a [`super::ReconnectingClient`]
    /// wrapping this reconnector.
    #[must_use]
    pub fn new(api: Arc<dyn HomeServerApi>, config: &ReconnectConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Online);
        Self {
            api,
            probe_timeout: config.probe_timeout(),
            delay: ExponentialRetryDelay::new(config.initial_delay(), config.max_delay()),
            status,
            reconnecting: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Time until the next probe while `Waiting`.
    #[must_use]
    pub fn retry_in(&self) -> Option<Duration> {
        if self.status() == ConnectionStatus::Waiting {
            self.delay.remaining()
        } else {
            None
        }
    }

    /// Start reconnecting unless a reconnect loop is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_request_failed(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.delay.reset();
        self.set_status(ConnectionStatus::Waiting);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    /// Skip the rest of the current backoff and probe immediately.
    pub fn try_now(&self) {
        if self.reconnecting.load(Ordering::Acquire) {
            self.delay.abort();
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(from = ?*current, to = ?status, "connection status changed");
            *current = status;
            true
        });
    }

    async fn reconnect_loop(&self) {
        loop {
            self.set_status(ConnectionStatus::Waiting);
            tracing::info!(retry_in = ?self.delay.next_value(), "waiting to reconnect");
            self.delay.wait_for_retry().await;

            self.set_status(ConnectionStatus::Reconnecting);
            let probe = time::timeout(self.probe_timeout, self.api.versions(self.probe_timeout));
            match probe.await {
                Ok(Ok(_)) => break,
                Ok(Err(error)) if error.is_connection() => {
                    tracing::debug!(%error, "versions probe failed");
                }
                Ok(Err(error)) => {
                    // Any server response proves the homeserver is reachable.
                    tracing::warn!(%error, "versions probe rejected, treating server as reachable");
                    break;
                }
                Err(_) => tracing::debug!(timeout = ?self.probe_timeout, "versions probe timed out"),
            }
        }
        self.delay.reset();
        self.reconnecting.store(false, Ordering::Release);
        self.set_status(ConnectionStatus::Online);
    }
}
