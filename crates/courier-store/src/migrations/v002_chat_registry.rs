use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chats (
    id           TEXT PRIMARY KEY NOT NULL,
    pair_key     TEXT NOT NULL,               -- sorted "a|b" participant ids
    participants TEXT NOT NULL,               -- JSON array of {id, name}
    created_at   INTEGER NOT NULL             -- unix millis
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_chats_pair ON chats(pair_key);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
