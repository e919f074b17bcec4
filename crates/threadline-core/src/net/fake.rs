//! In-crate test double for [`HomeServerApi`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    HomeServerApi, MessagesRequest, MessagesResponse, SendResponse, ServerVersions, SyncResponse,
};
use crate::error::{Error, Result};

/// Every request fails as if the network were down.
pub struct Offline;

fn unreachable<T>() -> Result<T> {
    Err(Error::Connection("offline".into()))
}

#[async_trait]
impl HomeServerApi for Offline {
    async fn sync(
        &self,
        _: Option<&str>,
        _: Option<&str>,
        _: Duration,
        _: Duration,
    ) -> Result<SyncResponse> {
        unreachable()
    }

    async fn create_filter(&self, _: &str, _: &Value) -> Result<String> {
        unreachable()
    }

    async fn messages(&self, _: &str, _: &MessagesRequest) -> Result<MessagesResponse> {
        unreachable()
    }

    async fn send(&self, _: &str, _: &str, _: &str, _: &Value) -> Result<SendResponse> {
        unreachable()
    }

    async fn versions(&self, _: Duration) -> Result<ServerVersions> {
        unreachable()
    }
}

/// One recorded `/sync` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCall {
    pub since: Option<String>,
    pub filter_id: Option<String>,
    pub timeout: Duration,
}

/// Answers `/sync` from a script and hangs once the script runs out.
#[derive(Default)]
pub struct ScriptedSync {
    responses: Mutex<VecDeque<Result<SyncResponse>>>,
    calls: Mutex<Vec<SyncCall>>,
}

impl ScriptedSync {
    pub fn push(&self, response: Result<SyncResponse>) {
        self.responses.lock().expect("lock").push_back(response);
    }

    pub fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl HomeServerApi for ScriptedSync {
    async fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout: Duration,
        _: Duration,
    ) -> Result<SyncResponse> {
        self.calls.lock().expect("lock").push(SyncCall {
            since: since.map(str::to_string),
            filter_id: filter_id.map(str::to_string),
            timeout,
        });
        let next = self.responses.lock().expect("lock").pop_front();
        match next {
            Some(response) => response,
            None => std::future::pending().await,
        }
    }

    async fn create_filter(&self, _: &str, _: &Value) -> Result<String> {
        Ok("filter-1".to_string())
    }

    async fn messages(&self, _: &str, _: &MessagesRequest) -> Result<MessagesResponse> {
        unreachable()
    }

    async fn send(&self, _: &str, _: &str, _: &str, _: &Value) -> Result<SendResponse> {
        unreachable()
    }

    async fn versions(&self, _: Duration) -> Result<ServerVersions> {
        Ok(ServerVersions::default())
    }
}
