//! Per-room outbox.
//!
//! Pending events are persisted before anything is sent, sent one at a time
//! in `queue_index` order through the [`SendScheduler`], and retired when
//! their remote echo arrives through sync. A send the server rejects is
//! marked failed and skipped until [`SendQueue::retry_event`] is called.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{PendingEvent, RoomEvent, make_txn_id};
use crate::send::SendScheduler;
use crate::store::{Storage, StoreName, Txn};

const UPDATE_CAPACITY: usize = 64;

/// Change to the in-memory outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    Added(PendingEvent),
    /// The server accepted the send; `remote_id` is now set.
    Updated(PendingEvent),
    /// The server rejected the send; `error` is set.
    Failed(PendingEvent),
    /// The remote echo arrived.
    Removed(PendingEvent),
}

#[derive(Debug, Default)]
struct QueueState {
    /// Ascending by `queue_index`.
    pending: Vec<PendingEvent>,
    is_sending: bool,
    offline: bool,
}

impl QueueState {
    fn insert(&mut self, event: PendingEvent) {
        let at = self
            .pending
            .partition_point(|p| p.queue_index < event.queue_index);
        self.pending.insert(at, event);
    }

    fn next_unsent(&self) -> Option<PendingEvent> {
        self.pending
            .iter()
            .find(|p| !p.is_sent() && !p.is_failed())
            .cloned()
    }

    fn find_mut(&mut self, txn_id: &str) -> Option<&mut PendingEvent> {
        self.pending.iter_mut().find(|p| p.txn_id == txn_id)
    }
}

pub struct SendQueue {
    room_id: String,
    storage: Storage,
    scheduler: Arc<SendScheduler>,
    state: Mutex<QueueState>,
    updates: broadcast::Sender<PendingUpdate>,
}

impl SendQueue {
    #[must_use]
    pub fn new(room_id: impl Into<String>, storage: Storage, scheduler: Arc<SendScheduler>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            room_id: room_id.into(),
            storage,
            scheduler,
            state: Mutex::new(QueueState::default()),
            updates,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, update: PendingUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PendingUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of the outbox, ascending by `queue_index`.
    #[must_use]
    pub fn pending_events(&self) -> Vec<PendingEvent> {
        self.state().pending.clone()
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.state().is_sending
    }

    /// Restore the outbox from storage. Does not start sending.
    ///
    /// # Errors
    ///
    /// Fails if `txn` lacks the pending events store.
    pub fn load(&self, txn: &Txn) -> Result<()> {
        let pending = txn.pending_events()?.get_all_for_room(&self.room_id)?;
        if !pending.is_empty() {
            tracing::debug!(room_id = %self.room_id, count = pending.len(), "loaded pending events");
        }
        self.state().pending = pending;
        Ok(())
    }

    /// Persist a new outgoing event and start sending if idle.
    ///
    /// # Errors
    ///
    /// Fails if the event cannot be persisted; nothing is queued then.
    pub async fn enqueue_event(
        self: &Arc<Self>,
        event_type: &str,
        content: Value,
    ) -> Result<PendingEvent> {
        let txn = self.storage.write_txn(&[StoreName::PendingEvents]).await?;
        let store = txn.pending_events()?;
        let queue_index = store
            .get_max_queue_index(&self.room_id)?
            .map_or(1, |max| max + 1);
        let pending = PendingEvent {
            room_id: self.room_id.clone(),
            queue_index,
            event_type: event_type.to_string(),
            content,
            txn_id: make_txn_id(),
            remote_id: None,
            error: None,
        };
        store.add(&pending)?;
        txn.complete()?;
        tracing::info!(
            room_id = %self.room_id,
            queue_index,
            txn_id = %pending.txn_id,
            event_type,
            "queued event"
        );

        let start = {
            let mut state = self.state();
            state.insert(pending.clone());
            let start = !state.is_sending && !state.offline;
            if start {
                state.is_sending = true;
            }
            start
        };
        self.emit(PendingUpdate::Added(pending.clone()));
        if start {
            self.spawn_send_loop();
        }
        Ok(pending)
    }

    /// Clear the offline flag and send whatever is still unsent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn resume_sending(self: &Arc<Self>) {
        let start = {
            let mut state = self.state();
            state.offline = false;
            let start = !state.is_sending && state.next_unsent().is_some();
            if start {
                state.is_sending = true;
            }
            start
        };
        if start {
            tracing::debug!(room_id = %self.room_id, "resuming send queue");
            self.spawn_send_loop();
        }
    }

    /// Clear the error on a failed event and send it again.
    ///
    /// Returns `false` if no failed event has `txn_id`.
    pub fn retry_event(self: &Arc<Self>, txn_id: &str) -> bool {
        let retried = {
            let mut state = self.state();
            match state.find_mut(txn_id) {
                Some(slot) if slot.is_failed() => {
                    slot.error = None;
                    Some(slot.clone())
                }
                _ => None,
            }
        };
        let Some(retried) = retried else {
            return false;
        };
        tracing::info!(room_id = %self.room_id, txn_id, "retrying failed event");
        self.emit(PendingUpdate::Updated(retried));
        self.resume_sending();
        true
    }

    fn spawn_send_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.send_loop().await });
    }

    async fn send_loop(&self) {
        loop {
            let next = {
                let mut state = self.state();
                let next = state.next_unsent();
                if next.is_none() {
                    state.is_sending = false;
                }
                next
            };
            let Some(pending) = next else {
                return;
            };
            let txn_id = pending.txn_id.clone();

            let Err(error) = self.send_one(pending).await else {
                continue;
            };
            if error.is_connection() {
                let mut state = self.state();
                state.is_sending = false;
                state.offline = true;
                tracing::warn!(room_id = %self.room_id, %error, "offline, send queue paused");
                return;
            }
            tracing::error!(room_id = %self.room_id, %txn_id, %error, "send failed");
            let failed = self.state().find_mut(&txn_id).map(|slot| {
                slot.error = Some(error.to_string());
                slot.clone()
            });
            if let Some(failed) = failed {
                self.emit(PendingUpdate::Failed(failed));
            }
        }
    }

    async fn send_one(&self, mut pending: PendingEvent) -> Result<()> {
        let request = pending.clone();
        let response = self
            .scheduler
            .request(move |api| {
                let request = request.clone();
                async move {
                    api.send(
                        &request.room_id,
                        &request.event_type,
                        &request.txn_id,
                        &request.content,
                    )
                    .await
                }
            })
            .await?;
        tracing::info!(
            room_id = %self.room_id,
            txn_id = %pending.txn_id,
            event_id = %response.event_id,
            "event sent"
        );
        pending.remote_id = Some(response.event_id);

        let txn = self.storage.write_txn(&[StoreName::PendingEvents]).await?;
        let store = txn.pending_events()?;
        // The remote echo may have retired the event while the request ran.
        if store.exists(&self.room_id, pending.queue_index)? {
            store.update(&pending)?;
        }
        txn.complete()?;

        let updated = {
            let mut state = self.state();
            state.find_mut(&pending.txn_id).map(|slot| {
                slot.remote_id.clone_from(&pending.remote_id);
                slot.clone()
            })
        };
        if let Some(updated) = updated {
            self.emit(PendingUpdate::Updated(updated));
        }
        Ok(())
    }

    /// Delete the pending events that `events` echo, inside the sync
    /// transaction. A match on `unsigned.transaction_id` wins over a match on
    /// the remote event id.
    ///
    /// Memory is untouched; pass the result to
    /// [`emit_removals`](Self::emit_removals) after commit.
    ///
    /// # Errors
    ///
    /// Fails if `txn` lacks the pending events store.
    pub fn remove_remote_echos(&self, events: &[RoomEvent], txn: &Txn) -> Result<Vec<PendingEvent>> {
        let mut candidates = self.pending_events();
        if candidates.is_empty() || events.is_empty() {
            return Ok(Vec::new());
        }
        let store = txn.pending_events()?;
        let mut removed = Vec::new();
        for event in events {
            let by_txn_id = event
                .transaction_id()
                .and_then(|txn_id| candidates.iter().position(|p| p.txn_id == txn_id));
            let position = by_txn_id.or_else(|| {
                candidates
                    .iter()
                    .position(|p| p.remote_id.as_deref() == Some(event.event_id.as_str()))
            });
            if let Some(position) = position {
                let echoed = candidates.remove(position);
                store.remove(&self.room_id, echoed.queue_index)?;
                tracing::debug!(
                    room_id = %self.room_id,
                    txn_id = %echoed.txn_id,
                    event_id = %event.event_id,
                    "remote echo retired pending event"
                );
                removed.push(echoed);
            }
        }
        Ok(removed)
    }

    /// Drop committed removals from memory and notify subscribers.
    pub fn emit_removals(&self, removed: &[PendingEvent]) {
        if removed.is_empty() {
            return;
        }
        {
            let mut state = self.state();
            state
                .pending
                .retain(|p| !removed.iter().any(|r| r.txn_id == p.txn_id));
        }
        for event in removed {
            self.emit(PendingUpdate::Removed(event.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendConfig;
    use crate::error::Error;
    use crate::net::{
        HomeServerApi, MessagesRequest, MessagesResponse, SendResponse, ServerVersions,
        SyncResponse,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers sends from a script; everything else is unreachable.
    #[derive(Default)]
    struct ScriptedSend {
        replies: Mutex<VecDeque<Result<SendResponse>>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedSend {
        fn with(replies: Vec<Result<SendResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::default(),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("lock").clone()
        }
    }

    fn ok(event_id: &str) -> Result<SendResponse> {
        Ok(SendResponse {
            event_id: event_id.to_string(),
        })
    }

    #[async_trait]
    impl HomeServerApi for ScriptedSend {
        async fn sync(
            &self,
            _: Option<&str>,
            _: Option<&str>,
            _: Duration,
            _: Duration,
        ) -> Result<SyncResponse> {
            Err(Error::Connection("unused".into()))
        }

        async fn create_filter(&self, _: &str, _: &Value) -> Result<String> {
            Err(Error::Connection("unused".into()))
        }

        async fn messages(&self, _: &str, _: &MessagesRequest) -> Result<MessagesResponse> {
            Err(Error::Connection("unused".into()))
        }

        async fn send(&self, _: &str, _: &str, txn_id: &str, _: &Value) -> Result<SendResponse> {
            self.sent.lock().expect("lock").push(txn_id.to_string());
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(Error::Connection("script exhausted".into())))
        }

        async fn versions(&self, _: Duration) -> Result<ServerVersions> {
            Ok(ServerVersions::default())
        }
    }

    fn queue(server: &Arc<ScriptedSend>) -> (Storage, Arc<SendScheduler>, Arc<SendQueue>) {
        let storage = Storage::open_in_memory().expect("open");
        let api: Arc<dyn HomeServerApi> = server.clone();
        let scheduler = Arc::new(SendScheduler::new(api, &SendConfig::default()));
        let queue = Arc::new(SendQueue::new("!r", storage.clone(), Arc::clone(&scheduler)));
        (storage, scheduler, queue)
    }

    async fn next_update(rx: &mut broadcast::Receiver<PendingUpdate>) -> PendingUpdate {
        rx.recv().await.expect("update")
    }

    #[tokio::test]
    async fn enqueue_assigns_increasing_indices_and_sends_in_order() {
        let server = ScriptedSend::with(vec![ok("$1"), ok("$2")]);
        let (storage, _scheduler, queue) = queue(&server);
        let mut updates = queue.subscribe();

        let first = queue
            .enqueue_event("m.room.message", json!({"body": "one"}))
            .await
            .expect("enqueue");
        let second = queue
            .enqueue_event("m.room.message", json!({"body": "two"}))
            .await
            .expect("enqueue");
        assert_eq!((first.queue_index, second.queue_index), (1, 2));

        let mut sent_ids = Vec::new();
        while sent_ids.len() < 2 {
            if let PendingUpdate::Updated(event) = next_update(&mut updates).await {
                sent_ids.push(event.remote_id.expect("remote id"));
            }
        }
        assert_eq!(sent_ids, ["$1", "$2"]);
        assert_eq!(server.sent(), [first.txn_id, second.txn_id]);

        let txn = storage
            .read_txn(&[StoreName::PendingEvents])
            .await
            .expect("txn");
        let stored = txn
            .pending_events()
            .expect("store")
            .get_all_for_room("!r")
            .expect("all");
        assert!(stored.iter().all(PendingEvent::is_sent));
    }

    #[tokio::test]
    async fn connection_error_pauses_until_resumed() {
        let server = ScriptedSend::with(vec![Err(Error::Connection("down".into())), ok("$1")]);
        let (_storage, scheduler, queue) = queue(&server);
        let mut updates = queue.subscribe();

        queue
            .enqueue_event("m.room.message", json!({"body": "one"}))
            .await
            .expect("enqueue");
        assert!(matches!(next_update(&mut updates).await, PendingUpdate::Added(_)));
        while queue.is_sending() {
            tokio::task::yield_now().await;
        }
        assert!(!queue.pending_events()[0].is_sent());
        assert!(!scheduler.is_started());

        scheduler.start();
        queue.resume_sending();
        match next_update(&mut updates).await {
            PendingUpdate::Updated(event) => assert_eq!(event.remote_id.as_deref(), Some("$1")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.sent().len(), 2);
    }

    fn forbidden() -> Error {
        Error::Server {
            status: 403,
            errcode: "M_FORBIDDEN".into(),
            message: "not allowed".into(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn rejected_send_is_reported_and_not_resent_until_retried() {
        let server = ScriptedSend::with(vec![Err(forbidden()), ok("$b"), ok("$a")]);
        let (_storage, scheduler, queue) = queue(&server);
        let mut updates = queue.subscribe();

        let a = queue
            .enqueue_event("m.room.message", json!({"body": "a"}))
            .await
            .expect("enqueue");
        assert!(matches!(next_update(&mut updates).await, PendingUpdate::Added(_)));
        match next_update(&mut updates).await {
            PendingUpdate::Failed(event) => {
                assert_eq!(event.txn_id, a.txn_id);
                assert!(event.error.expect("error").contains("M_FORBIDDEN"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(scheduler.is_started());

        let b = queue
            .enqueue_event("m.room.message", json!({"body": "b"}))
            .await
            .expect("enqueue");
        assert!(matches!(next_update(&mut updates).await, PendingUpdate::Added(_)));
        match next_update(&mut updates).await {
            PendingUpdate::Updated(event) => assert_eq!(event.txn_id, b.txn_id),
            other => panic!("unexpected {other:?}"),
        }
        while queue.is_sending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.sent(), [a.txn_id.clone(), b.txn_id.clone()]);
        assert!(queue.pending_events()[0].is_failed());

        assert!(!queue.retry_event(&b.txn_id), "only failed events retry");
        assert!(queue.retry_event(&a.txn_id));
        match next_update(&mut updates).await {
            PendingUpdate::Updated(event) => assert!(event.error.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        match next_update(&mut updates).await {
            PendingUpdate::Updated(event) => assert_eq!(event.remote_id.as_deref(), Some("$a")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.sent(), [a.txn_id.clone(), b.txn_id, a.txn_id]);
    }

    #[tokio::test]
    async fn removal_matches_transaction_id_not_a_reused_index() {
        let server = ScriptedSend::with(Vec::new());
        let (_storage, scheduler, queue) = queue(&server);
        scheduler.stop();

        let old = queue
            .enqueue_event("m.room.message", json!({"body": "old"}))
            .await
            .expect("enqueue");
        while queue.is_sending() {
            tokio::task::yield_now().await;
        }
        {
            // Same slot, different event: the index was handed out again.
            let mut state = queue.state();
            let mut reused = old.clone();
            reused.txn_id = "tnew".into();
            state.pending = vec![reused];
        }

        queue.emit_removals(&[old]);
        let left = queue.pending_events();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].txn_id, "tnew");
    }

    #[tokio::test]
    async fn remote_echo_matches_txn_id_then_event_id() {
        let server = ScriptedSend::with(Vec::new());
        let (storage, scheduler, queue) = queue(&server);
        scheduler.stop();

        let by_txn = queue
            .enqueue_event("m.room.message", json!({"body": "a"}))
            .await
            .expect("enqueue");
        let by_remote = queue
            .enqueue_event("m.room.message", json!({"body": "b"}))
            .await
            .expect("enqueue");
        while queue.is_sending() {
            tokio::task::yield_now().await;
        }
        {
            // Pretend the second send already went through.
            let mut state = queue.state();
            state.pending[1].remote_id = Some("$b".into());
        }

        let echoes = vec![
            RoomEvent::new("$a", "m.room.message", json!({})).with_transaction_id(&by_txn.txn_id),
            RoomEvent::new("$b", "m.room.message", json!({})),
            RoomEvent::new("$other", "m.room.message", json!({})),
        ];
        let mut updates = queue.subscribe();
        let txn = storage
            .write_txn(&[StoreName::PendingEvents])
            .await
            .expect("txn");
        let removed = queue.remove_remote_echos(&echoes, &txn).expect("remove");
        txn.complete().expect("commit");
        assert_eq!(
            removed.iter().map(|p| p.queue_index).collect::<Vec<_>>(),
            [by_txn.queue_index, by_remote.queue_index]
        );
        assert_eq!(queue.pending_events().len(), 2, "memory waits for emit");

        queue.emit_removals(&removed);
        assert!(queue.pending_events().is_empty());
        assert!(matches!(next_update(&mut updates).await, PendingUpdate::Removed(_)));

        let txn = storage
            .read_txn(&[StoreName::PendingEvents])
            .await
            .expect("txn");
        assert!(txn.pending_events().expect("store").get_all().expect("all").is_empty());
    }

    #[tokio::test]
    async fn load_restores_the_outbox_in_order() {
        let server = ScriptedSend::with(Vec::new());
        let (storage, scheduler, queue) = queue(&server);
        scheduler.stop();
        for body in ["a", "b", "c"] {
            queue
                .enqueue_event("m.room.message", json!({ "body": body }))
                .await
                .expect("enqueue");
        }

        let reloaded = SendQueue::new("!r", storage.clone(), scheduler);
        let txn = storage
            .read_txn(&[StoreName::PendingEvents])
            .await
            .expect("txn");
        reloaded.load(&txn).expect("load");
        let indices: Vec<u64> = reloaded.pending_events().iter().map(|p| p.queue_index).collect();
        assert_eq!(indices, [1, 2, 3]);
    }
}
