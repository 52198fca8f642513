//! v001 -- Initial schema creation.
//!
//! Creates the key/value cache, the two list projections and the pending
//! operation queue.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key/value entries
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cache_entries (
    key        TEXT PRIMARY KEY NOT NULL,
    value      BLOB NOT NULL,                 -- opaque serialized bytes
    expires_at INTEGER                        -- unix millis, NULL = no expiry
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at) WHERE expires_at IS NOT NULL;

-- Last write per cache key, used for staleness checks.
CREATE TABLE IF NOT EXISTS cache_timestamps (
    key        TEXT PRIMARY KEY NOT NULL,
    written_at INTEGER NOT NULL               -- unix millis
);

-- ----------------------------------------------------------------
-- Messages by chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages_by_chat (
    chat_id   TEXT NOT NULL,
    id        TEXT NOT NULL,                  -- assigned by the sending device
    sender_id TEXT NOT NULL,
    content   TEXT NOT NULL,
    timestamp INTEGER NOT NULL,               -- unix millis
    status    TEXT NOT NULL,                  -- SENT | DELIVERED | READ
    kind      TEXT NOT NULL,                  -- TEXT | IMAGE | SYSTEM | URGENT

    PRIMARY KEY (chat_id, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_by_chat_order
    ON messages_by_chat(chat_id, timestamp, id);

-- ----------------------------------------------------------------
-- Chat previews by owner
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_previews_by_owner (
    owner_id          TEXT NOT NULL,
    chat_id           TEXT NOT NULL,
    other_party_id    TEXT NOT NULL,
    other_party_name  TEXT NOT NULL,
    last_message      TEXT NOT NULL DEFAULT '',
    last_message_time INTEGER,                -- unix millis
    unread_count      INTEGER NOT NULL DEFAULT 0,
    is_online         INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1

    PRIMARY KEY (owner_id, chat_id)
);

-- ----------------------------------------------------------------
-- Pending operations (replayed in seq order)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_operations (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    op_type     TEXT NOT NULL,
    payload     TEXT NOT NULL,                -- JSON object
    enqueued_at INTEGER NOT NULL,             -- unix millis
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
