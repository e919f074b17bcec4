//! SQLite schema for the client store.
//!
//! One table per logical store:
//! - `session` keeps sync cursors and other per-account values
//! - `room_summary` and `room_state` hold the latest room projection
//! - `timeline_fragments` is the fragment link graph
//! - `timeline_events` is keyed by `(room, fragment, index)` with a unique
//!   `(room, event_id)` index used for deduplication
//! - `pending_events` is the per-room outbox ordered by `queue_index`

/// Migration v1: every store plus schema metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS storage_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO storage_meta (id, schema_version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS session (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_summary (
    room_id TEXT PRIMARY KEY,
    summary_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_state (
    room_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    state_key TEXT NOT NULL,
    event_json TEXT NOT NULL,
    PRIMARY KEY (room_id, event_type, state_key)
);

CREATE TABLE IF NOT EXISTS timeline_fragments (
    room_id TEXT NOT NULL,
    fragment_id INTEGER NOT NULL CHECK (fragment_id >= 0),
    previous_id INTEGER,
    next_id INTEGER,
    previous_token TEXT,
    next_token TEXT,
    start_reached INTEGER NOT NULL DEFAULT 0 CHECK (start_reached IN (0, 1)),
    end_reached INTEGER NOT NULL DEFAULT 0 CHECK (end_reached IN (0, 1)),
    PRIMARY KEY (room_id, fragment_id),
    CHECK (previous_id IS NULL OR previous_id <> fragment_id),
    CHECK (next_id IS NULL OR next_id <> fragment_id)
);

CREATE TABLE IF NOT EXISTS timeline_events (
    room_id TEXT NOT NULL,
    fragment_id INTEGER NOT NULL,
    event_index INTEGER NOT NULL CHECK (event_index >= 0),
    event_id TEXT NOT NULL,
    event_json TEXT NOT NULL,
    PRIMARY KEY (room_id, fragment_id, event_index),
    FOREIGN KEY (room_id, fragment_id)
        REFERENCES timeline_fragments(room_id, fragment_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_timeline_events_event_id
    ON timeline_events(room_id, event_id);

CREATE TABLE IF NOT EXISTS pending_events (
    room_id TEXT NOT NULL,
    queue_index INTEGER NOT NULL CHECK (queue_index >= 0),
    event_type TEXT NOT NULL,
    content_json TEXT NOT NULL,
    txn_id TEXT NOT NULL,
    remote_id TEXT,
    PRIMARY KEY (room_id, queue_index)
);

CREATE INDEX IF NOT EXISTS idx_pending_events_txn_id
    ON pending_events(room_id, txn_id);
";
