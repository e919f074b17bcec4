//! Serializes outgoing requests and absorbs rate limiting.
//!
//! Callers queue for a single slot in arrival order. The slot holder's
//! callback performs one attempt; a rate-limited attempt sleeps for the
//! server-provided delay and runs the same callback again. A connection
//! failure stops the scheduler and fails every queued caller, who must
//! request again once [`SendScheduler::start`] is called after reconnecting.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time;

use crate::config::SendConfig;
use crate::error::{Error, Result};
use crate::net::HomeServerApi;

#[derive(Debug, Default)]
struct SchedulerState {
    stopped: bool,
    /// Bumped whenever the scheduler stops, so queued callers can tell.
    epoch: u64,
}

pub struct SendScheduler {
    api: Arc<dyn HomeServerApi>,
    default_retry_after: Duration,
    slot: tokio::sync::Mutex<()>,
    state: Mutex<SchedulerState>,
}

impl SendScheduler {
    /// The scheduler starts out accepting requests.
    #[must_use]
    pub fn new(api: Arc<dyn HomeServerApi>, config: &SendConfig) -> Self {
        Self {
            api,
            default_retry_after: config.default_retry_after(),
            slot: tokio::sync::Mutex::new(()),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.state().stopped
    }

    pub fn start(&self) {
        let mut state = self.state();
        if state.stopped {
            tracing::info!("send scheduler started");
            state.stopped = false;
        }
    }

    /// Fail queued requests and refuse new ones until [`start`](Self::start).
    pub fn stop(&self) {
        let mut state = self.state();
        if !state.stopped {
            tracing::info!("send scheduler stopped");
            state.stopped = true;
            state.epoch += 1;
        }
    }

    /// Admission ticket: the epoch the caller joined in.
    fn admit(&self) -> Result<u64> {
        let state = self.state();
        if state.stopped {
            return Err(Error::Connection("send scheduler is stopped".into()));
        }
        Ok(state.epoch)
    }

    fn check_epoch(&self, epoch: u64) -> Result<()> {
        let state = self.state();
        if state.stopped || state.epoch != epoch {
            return Err(Error::Connection(
                "send scheduler stopped while request was queued".into(),
            ));
        }
        Ok(())
    }

    /// Run `callback` once the slot is free, retrying it on rate limiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the scheduler is or becomes stopped; a
    ///   connection failure of the callback itself also stops the scheduler
    /// - any other error of the callback, unretried
    pub async fn request<T, F, Fut>(&self, mut callback: F) -> Result<T>
    where
        F: FnMut(Arc<dyn HomeServerApi>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let epoch = self.admit()?;
        let _slot = self.slot.lock().await;
        loop {
            self.check_epoch(epoch)?;
            match callback(Arc::clone(&self.api)).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_rate_limited() => {
                    let delay = error.retry_after().unwrap_or(self.default_retry_after);
                    tracing::info!(retry_after = ?delay, "rate limited, retrying request");
                    time::sleep(delay).await;
                }
                Err(error) if error.is_connection() => {
                    tracing::warn!(%error, "connection lost, failing queued requests");
                    self.stop();
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::fake::Offline;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn scheduler() -> Arc<SendScheduler> {
        Arc::new(SendScheduler::new(Arc::new(Offline), &SendConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_same_callback_after_server_delay() {
        let scheduler = scheduler();
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&attempts);
        let result = scheduler
            .request(move |_api| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(Error::rate_limited(Some(Duration::from_millis(2000))))
                    } else {
                        Ok("$sent")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("sent"), "$sent");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_delay_uses_default() {
        let scheduler = scheduler();
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&attempts);
        scheduler
            .request(move |_api| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(Error::rate_limited(None))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .expect("sent");
        assert!(started.elapsed() >= SendConfig::default().default_retry_after());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failure_stops_and_fails_queued_callers() {
        let scheduler = scheduler();
        let release = Arc::new(tokio::sync::Notify::new());

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                scheduler
                    .request(move |_api| {
                        let release = Arc::clone(&release);
                        async move {
                            release.notified().await;
                            Err::<(), _>(Error::Connection("unreachable".into()))
                        }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.request(|_api| async { Ok(()) }).await })
        };
        tokio::task::yield_now().await;
        release.notify_one();

        assert!(first.await.expect("join").expect_err("first").is_connection());
        assert!(second.await.expect("join").expect_err("second").is_connection());
        assert!(!scheduler.is_started());

        let refused = scheduler.request(|_api| async { Ok(()) }).await;
        assert!(refused.expect_err("stopped").is_connection());

        scheduler.start();
        scheduler
            .request(|_api| async { Ok(()) })
            .await
            .expect("accepted after start");
    }

    #[tokio::test]
    async fn other_server_errors_are_not_retried() {
        let scheduler = scheduler();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let err = scheduler
            .request(move |_api| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::Server {
                        status: 403,
                        errcode: "M_FORBIDDEN".into(),
                        message: "no".into(),
                        retry_after: None,
                    })
                }
            })
            .await
            .expect_err("forbidden");
        assert!(!err.is_rate_limited());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_started());
    }
}
