//! End-to-end timeline scenarios: sync writes, gap fills and read-back.


use fake_server::{Fixture, ROOM_ID, message, page, timeline};
use threadline_core::model::Membership;
use threadline_core::ordering::MIDDLE_INDEX;
use threadline_core::store::StoreName;
use threadline_core::{Direction, EventKey, FragmentId, TimelineEntry};

fn event_ids(entries: &[TimelineEntry]) -> Vec<&str> {
    entries.iter().filter_map(TimelineEntry::event_id).collect()
}

// ---------------------------------------------------------------------------
// Sync writer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn limited_sync_closes_live_fragment_and_opens_a_linked_one() {
    let fx = Fixture::new();
    let first = fx
        .sync(&timeline(&["$1", "$2", "$3", "$4", "$5"], false, "p0"))
        .await;
    let live_key = first.new_live_key.expect("live key");
    assert_eq!(live_key, EventKey::new(FragmentId::FIRST, MIDDLE_INDEX + 5));

    let limited = fx.sync(&timeline(&["$6", "$7"], true, "p1")).await;
    let entries = &limited.new_timeline_entries;
    assert_eq!(entries.len(), 4, "end, start, event, event: {entries:?}");

    let old_end = entries[0].as_boundary().expect("old end boundary");
    let new_start = entries[1].as_boundary().expect("new start boundary");
    assert!(!old_end.is_start);
    assert!(new_start.is_start);
    assert_eq!(old_end.fragment_id(), FragmentId::FIRST);
    let new_id = new_start.fragment_id();
    assert_eq!(old_end.fragment.next_id, Some(new_id));
    assert_eq!(new_start.fragment.previous_id, Some(FragmentId::FIRST));
    assert_eq!(new_start.token(), Some("p1"));
    assert!(new_start.is_gap());

    let keys: Vec<EventKey> = entries[2..]
        .iter()
        .map(|entry| entry.as_event().expect("event").key)
        .collect();
    assert!(keys.iter().all(|key| key.fragment_id == new_id));
    assert!(keys[0].event_index < keys[1].event_index);
    assert_eq!(limited.new_live_key, Some(keys[1]));
}

#[tokio::test]
async fn repeated_event_ids_are_stored_once() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a", "$b"], false, "p0")).await;
    let second = fx.sync(&timeline(&["$b", "$c", "$c"], false, "p1")).await;

    assert_eq!(event_ids(&second.new_timeline_entries), ["$c"]);
    assert_eq!(fx.stored_event_ids().await, ["$a", "$b", "$c"]);
}

#[tokio::test]
async fn aborted_sync_write_changes_nothing() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    let summary_before = fx.room.summary();

    let txn = fx.storage.write_txn(&StoreName::ALL).await.expect("txn");
    fx.room
        .write_sync(&timeline(&["$b", "$c"], true, "p1"), Membership::Join, &txn)
        .expect("write");
    txn.abort().expect("abort");

    assert_eq!(fx.stored_event_ids().await, ["$a"]);
    assert_eq!(fx.fragments().await.len(), 1);
    assert_eq!(fx.room.summary(), summary_before);

    // The live cursor did not move: the next write continues right after $a.
    let next = fx.sync(&timeline(&["$b"], false, "p1")).await;
    assert_eq!(
        next.new_live_key,
        Some(EventKey::new(FragmentId::FIRST, MIDDLE_INDEX + 2))
    );
}

#[tokio::test]
async fn dropped_transaction_rolls_back_like_abort() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    {
        let txn = fx.storage.write_txn(&StoreName::ALL).await.expect("txn");
        fx.room
            .write_sync(&timeline(&["$b"], false, "p1"), Membership::Join, &txn)
            .expect("write");
    }
    assert_eq!(fx.stored_event_ids().await, ["$a"]);
}

#[tokio::test]
async fn at_most_one_live_fragment_after_several_limited_syncs() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    fx.sync(&timeline(&["$b"], true, "p1")).await;
    fx.sync(&timeline(&["$c"], true, "p2")).await;
    fx.sync(&timeline(&["$d"], false, "p3")).await;

    let fragments = fx.fragments().await;
    assert_eq!(fragments.len(), 3);
    let live: Vec<_> = fragments.iter().filter(|f| f.is_live()).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, FragmentId(2));
}

// ---------------------------------------------------------------------------
// Gap writer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backward_fill_overlapping_previous_fragment_closes_the_gap() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a", "$b"], false, "p0")).await;
    let limited = fx.sync(&timeline(&["$y", "$z"], true, "p1")).await;
    let gap = limited.new_timeline_entries[1]
        .as_boundary()
        .expect("gap boundary")
        .clone();

    fx.server
        .push_page(Ok(page(&["$x", "$b", "$a"], "p1", Some("p2"))));
    let written = fx.room.fill_gap(&gap, Some(30)).await.expect("fill");
    assert_eq!(event_ids(&written), ["$x"]);

    let request = &fx.server.message_requests()[0];
    assert_eq!(request.from, "p1");
    assert_eq!(request.dir, Direction::Backward);
    assert_eq!(request.limit, 30);

    let fragments = fx.fragments().await;
    let first = &fragments[0];
    let second = &fragments[1];
    assert_eq!(first.next_id, Some(second.id));
    assert_eq!(second.previous_id, Some(first.id));
    assert_eq!(first.next_token, None);
    assert_eq!(second.previous_token, None);

    assert_eq!(fx.stored_event_ids().await, ["$a", "$b", "$x", "$y", "$z"]);
}

#[tokio::test]
async fn fill_without_overlap_keeps_a_gap_with_the_new_token() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    let limited = fx.sync(&timeline(&["$z"], true, "p1")).await;
    let gap = limited.new_timeline_entries[1]
        .as_boundary()
        .expect("gap boundary")
        .clone();

    fx.server.push_page(Ok(page(&["$y", "$x"], "p1", Some("p2"))));
    fx.room.fill_gap(&gap, None).await.expect("fill");

    let fragments = fx.fragments().await;
    assert_eq!(fragments[1].previous_token.as_deref(), Some("p2"));
    assert_eq!(fx.stored_event_ids().await, ["$a", "$x", "$y", "$z"]);
}

#[tokio::test]
async fn failed_request_writes_nothing() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    let limited = fx.sync(&timeline(&["$z"], true, "p1")).await;
    let gap = limited.new_timeline_entries[1]
        .as_boundary()
        .expect("gap boundary")
        .clone();

    // No page scripted: the request fails as a connection error.
    let err = fx.room.fill_gap(&gap, None).await.expect_err("offline");
    assert!(err.is_connection());
    assert_eq!(fx.stored_event_ids().await, ["$a", "$z"]);
    assert_eq!(fx.fragments().await[1].previous_token.as_deref(), Some("p1"));
}

// ---------------------------------------------------------------------------
// Read-back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeline_reads_back_in_append_order() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$1", "$2"], false, "p0")).await;
    fx.sync(&timeline(&["$3"], false, "p1")).await;
    fx.sync(&timeline(&["$4", "$5", "$6"], false, "p2")).await;

    let view = fx.room.open_timeline().await.expect("open");
    let entries = view.entries();
    assert_eq!(event_ids(&entries), ["$1", "$2", "$3", "$4", "$5", "$6"]);
    assert!(entries.first().and_then(TimelineEntry::as_boundary).is_some());
    assert!(entries.last().and_then(TimelineEntry::as_boundary).is_some());
}

#[tokio::test]
async fn reading_stops_at_a_gap_and_crosses_it_once_filled() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a", "$b"], false, "p0")).await;
    let limited = fx.sync(&timeline(&["$y", "$z"], true, "p1")).await;

    let view = fx.room.open_timeline().await.expect("open");
    assert_eq!(event_ids(&view.entries()), ["$y", "$z"]);

    let gap = limited.new_timeline_entries[1]
        .as_boundary()
        .expect("gap boundary")
        .clone();
    fx.server.push_page(Ok(page(&["$x", "$b"], "p1", Some("p2"))));
    fx.room.fill_gap(&gap, None).await.expect("fill");
    assert_eq!(event_ids(&view.entries()), ["$x", "$y", "$z"]);

    view.load().await.expect("reload");
    assert_eq!(event_ids(&view.entries()), ["$a", "$b", "$x", "$y", "$z"]);
}

#[tokio::test]
async fn live_entries_reach_an_open_timeline() {
    let fx = Fixture::new();
    fx.sync(&timeline(&["$a"], false, "p0")).await;
    let view = fx.room.open_timeline().await.expect("open");
    let mut updates = view.subscribe();

    fx.sync(&timeline(&["$b"], false, "p1")).await;
    updates.recv().await.expect("update");
    assert_eq!(event_ids(&view.entries()), ["$a", "$b"]);

    let stored = fx
        .read_txn()
        .await
        .timeline_events()
        .expect("events")
        .get_by_event_id(ROOM_ID, "$b")
        .expect("query")
        .expect("stored");
    assert_eq!(stored.event, message("$b"));
}
