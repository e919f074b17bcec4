//! Homeserver client boundary.
//!
//! The engine never speaks HTTP itself. Hosts implement [`HomeServerApi`]
//! and hand it in; [`ReconnectingClient`] wraps an implementation so that
//! every connection failure also kicks the [`Reconnector`].

#[cfg(test)]
pub(crate) mod fake;
pub mod reconnector;
pub mod types;

pub use reconnector::{ConnectionStatus, ExponentialRetryDelay, Reconnector};
pub use types::{
    MessagesRequest, MessagesResponse, RoomResponse, RoomSummaryResponse, RoomsResponse,
    SendResponse, ServerVersions, StateResponse, SyncResponse, TimelineResponse,
    UnreadNotifications, default_sync_filter,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// The endpoints the engine consumes.
///
/// Implementations map transport failures (unreachable, timed out) to
/// [`crate::Error::Connection`] and non-2xx responses to
/// [`crate::Error::Server`], including `retry_after` for rate limits.
/// Dropping a returned future must cancel the request.
#[async_trait]
pub trait HomeServerApi: Send + Sync {
    /// Long-poll `/sync`. `timeout` is the server-side wait; `request_timeout`
    /// bounds the whole request.
    async fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout: Duration,
        request_timeout: Duration,
    ) -> Result<SyncResponse>;

    /// Register a filter and return its id.
    async fn create_filter(&self, user_id: &str, filter: &Value) -> Result<String>;

    async fn messages(&self, room_id: &str, request: &MessagesRequest)
    -> Result<MessagesResponse>;

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<SendResponse>;

    /// Lightweight probe used by the reconnector.
    async fn versions(&self, timeout: Duration) -> Result<ServerVersions>;
}

// ---------------------------------------------------------------------------
// ReconnectingClient
// ---------------------------------------------------------------------------

/// Forwards to an inner client and reports connection failures.
pub struct ReconnectingClient {
    inner: Arc<dyn HomeServerApi>,
    reconnector: Arc<Reconnector>,
}

impl ReconnectingClient {
    #[must_use]
    pub fn new(inner: Arc<dyn HomeServerApi>, reconnector: Arc<Reconnector>) -> Self {
        Self { inner, reconnector }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if error.is_connection() {
                tracing::debug!(%error, "request failed, starting reconnect");
                self.reconnector.on_request_failed();
            }
        }
        result
    }
}

#[async_trait]
impl HomeServerApi for ReconnectingClient {
    async fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout: Duration,
        request_timeout: Duration,
    ) -> Result<SyncResponse> {
        let result = self
            .inner
            .sync(since, filter_id, timeout, request_timeout)
            .await;
        self.observe(result)
    }

    async fn create_filter(&self, user_id: &str, filter: &Value) -> Result<String> {
        let result = self.inner.create_filter(user_id, filter).await;
        self.observe(result)
    }

    async fn messages(
        &self,
        room_id: &str,
        request: &MessagesRequest,
    ) -> Result<MessagesResponse> {
        let result = self.inner.messages(room_id, request).await;
        self.observe(result)
    }

    async fn send(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<SendResponse> {
        let result = self.inner.send(room_id, event_type, txn_id, content).await;
        self.observe(result)
    }

    async fn versions(&self, timeout: Duration) -> Result<ServerVersions> {
        let result = self.inner.versions(timeout).await;
        self.observe(result)
    }
}
