//! The two list projections: `messages_by_chat` and `chat_previews_by_owner`.
//!
//! `replace_*` has full-replace semantics: the caller hands over the complete
//! list for the key and anything not in it is dropped.  The remaining helpers
//! patch single rows for optimistic local writes.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::{ChatPreview, Message, MessageStatus};

use crate::database::{datetime_from_millis, parse_column, Database};
use crate::entries::touch_key;
use crate::error::{Result, StoreError};
use crate::keys;

impl Database {
    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn replace_messages(
        &mut self,
        chat_id: &str,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages_by_chat WHERE chat_id = ?1",
            params![chat_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO messages_by_chat
                     (chat_id, id, sender_id, content, timestamp, status, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for m in messages {
                stmt.execute(params![
                    chat_id,
                    m.id,
                    m.sender_id,
                    m.content,
                    m.timestamp.timestamp_millis(),
                    m.status.as_str(),
                    m.kind.as_str(),
                ])?;
            }
        }
        touch_key(&tx, &keys::messages(chat_id), now)?;
        tx.commit()?;
        Ok(())
    }

    /// Messages of a chat ordered by timestamp, ties broken by id.
    pub fn cached_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_id, content, timestamp, status, kind
             FROM messages_by_chat
             WHERE chat_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Insert a single message.  A message whose id already exists in the
    /// chat is left as it is; returns whether a row was added.
    pub fn insert_message(&self, chat_id: &str, message: &Message) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages_by_chat
                 (chat_id, id, sender_id, content, timestamp, status, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chat_id,
                message.id,
                message.sender_id,
                message.content,
                message.timestamp.timestamp_millis(),
                message.status.as_str(),
                message.kind.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn set_message_status(
        &self,
        chat_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages_by_chat SET status = ?1 WHERE chat_id = ?2 AND id = ?3",
            params![status.as_str(), chat_id, message_id],
        )?;
        Ok(affected > 0)
    }

    /// Mark every message not sent by `reader_id` as read.  Returns the number
    /// of messages that changed.
    pub fn mark_chat_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages_by_chat SET status = 'READ'
             WHERE chat_id = ?1 AND sender_id != ?2 AND status != 'READ'",
            params![chat_id, reader_id],
        )?;
        Ok(affected)
    }

    /// Messages in the chat from other parties that `reader_id` has not read.
    pub fn unread_count(&self, chat_id: &str, reader_id: &str) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages_by_chat
             WHERE chat_id = ?1 AND sender_id != ?2 AND status != 'READ'",
            params![chat_id, reader_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Chat previews
    // ------------------------------------------------------------------

    pub fn replace_chat_previews(
        &mut self,
        owner_id: &str,
        previews: &[ChatPreview],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM chat_previews_by_owner WHERE owner_id = ?1",
            params![owner_id],
        )?;
        for p in previews {
            write_preview(&tx, owner_id, p)?;
        }
        touch_key(&tx, &keys::chat_previews(owner_id), now)?;
        tx.commit()?;
        Ok(())
    }

    /// Previews for an owner, most recent conversation first.
    pub fn cached_chat_previews(&self, owner_id: &str) -> Result<Vec<ChatPreview>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, other_party_id, other_party_name, last_message,
                    last_message_time, unread_count, is_online
             FROM chat_previews_by_owner
             WHERE owner_id = ?1
             ORDER BY COALESCE(last_message_time, 0) DESC, chat_id ASC",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_preview)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn upsert_chat_preview(&self, owner_id: &str, preview: &ChatPreview) -> Result<()> {
        write_preview(self.conn(), owner_id, preview)?;
        Ok(())
    }

    /// Reflect a newly stored message in every preview of its chat: owners
    /// other than the sender gain one unread, and the last message moves
    /// forward unless the preview already shows something newer.  Returns
    /// the owners whose preview changed.
    pub fn apply_message_to_previews(
        &mut self,
        chat_id: &str,
        message: &Message,
    ) -> Result<Vec<String>> {
        let ts = message.timestamp.timestamp_millis();
        let tx = self.conn_mut().transaction()?;
        let mut owners = {
            let mut bump = tx.prepare(
                "UPDATE chat_previews_by_owner
                 SET unread_count = unread_count + 1
                 WHERE chat_id = ?1 AND owner_id != ?2
                 RETURNING owner_id",
            )?;
            let bumped = bump
                .query_map(params![chat_id, message.sender_id], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut advance = tx.prepare(
                "UPDATE chat_previews_by_owner
                 SET last_message = ?1, last_message_time = ?2
                 WHERE chat_id = ?3
                   AND (last_message_time IS NULL OR last_message_time <= ?2)
                 RETURNING owner_id",
            )?;
            let advanced = advance
                .query_map(params![message.content, ts, chat_id], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut owners = bumped;
            owners.extend(advanced);
            owners
        };
        tx.commit()?;

        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    pub fn set_preview_unread(&self, owner_id: &str, chat_id: &str, unread: u32) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chat_previews_by_owner SET unread_count = ?1
             WHERE owner_id = ?2 AND chat_id = ?3",
            params![unread, owner_id, chat_id],
        )?;
        Ok(affected > 0)
    }
}

const UPSERT_PREVIEW_SQL: &str = "INSERT INTO chat_previews_by_owner
        (owner_id, chat_id, other_party_id, other_party_name, last_message,
         last_message_time, unread_count, is_online)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(owner_id, chat_id) DO UPDATE SET
        other_party_id = excluded.other_party_id,
        other_party_name = excluded.other_party_name,
        last_message = excluded.last_message,
        last_message_time = excluded.last_message_time,
        unread_count = excluded.unread_count,
        is_online = excluded.is_online";

fn write_preview(
    conn: &rusqlite::Connection,
    owner_id: &str,
    p: &ChatPreview,
) -> rusqlite::Result<()> {
    conn.prepare_cached(UPSERT_PREVIEW_SQL)?.execute(params![
        owner_id,
        p.chat_id,
        p.other_party_id,
        p.other_party_name,
        p.last_message,
        p.last_message_time.map(|t| t.timestamp_millis()),
        p.unread_count,
        p.is_online,
    ])?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(4)?;
    let kind: String = row.get(5)?;

    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        content: row.get(2)?,
        timestamp: datetime_from_millis(3, row.get(3)?)?,
        status: parse_column(4, &status)?,
        kind: parse_column(5, &kind)?,
    })
}

fn row_to_preview(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatPreview> {
    let last_message_time = match row.get::<_, Option<i64>>(4)? {
        Some(ms) => Some(datetime_from_millis(4, ms)?),
        None => None,
    };

    Ok(ChatPreview {
        chat_id: row.get(0)?,
        other_party_id: row.get(1)?,
        other_party_name: row.get(2)?,
        last_message: row.get(3)?,
        last_message_time,
        unread_count: row.get(5)?,
        is_online: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use courier_shared::{Chat, MessageType, Participant};

    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn msg(id: &str, sender: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: sender.to_string(),
            content: format!("content {id}"),
            timestamp: at(ts),
            status: MessageStatus::Sent,
            kind: MessageType::Text,
        }
    }

    fn preview(chat_id: &str, other: &str, ts: Option<i64>, unread: u32) -> ChatPreview {
        ChatPreview {
            chat_id: chat_id.to_string(),
            other_party_id: other.to_string(),
            other_party_name: other.to_uppercase(),
            last_message: String::new(),
            last_message_time: ts.map(at),
            unread_count: unread,
            is_online: false,
        }
    }

    #[test]
    fn cached_messages_are_ordered_regardless_of_insert_order() {
        let mut db = Database::open_in_memory().unwrap();
        let input = vec![msg("b", "u1", 20), msg("c", "u2", 10), msg("a", "u1", 20)];
        db.replace_messages("c1", &input, at(0)).unwrap();

        let ids: Vec<String> = db
            .cached_messages("c1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn replace_messages_drops_rows_not_in_the_new_list() {
        let mut db = Database::open_in_memory().unwrap();
        db.replace_messages("c1", &[msg("a", "u1", 1), msg("b", "u1", 2)], at(0))
            .unwrap();
        db.replace_messages("c1", &[msg("b", "u1", 2)], at(1)).unwrap();
        db.replace_messages("c2", &[msg("z", "u1", 2)], at(1)).unwrap();

        let remaining = db.cached_messages("c1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");
        assert_eq!(db.last_written_at(&keys::messages("c1")).unwrap(), Some(at(1)));
    }

    #[test]
    fn inserting_the_same_message_twice_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        let m = msg("a", "u1", 1);
        assert!(db.insert_message("c1", &m).unwrap());

        let mut changed = m.clone();
        changed.content = "edited".to_string();
        assert!(!db.insert_message("c1", &changed).unwrap());

        let stored = db.cached_messages("c1").unwrap();
        assert_eq!(stored, vec![m]);
    }

    #[test]
    fn mark_chat_read_skips_own_messages() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message("c1", &msg("a", "u1", 1)).unwrap();
        db.insert_message("c1", &msg("b", "u2", 2)).unwrap();
        db.insert_message("c1", &msg("c", "u2", 3)).unwrap();

        assert_eq!(db.unread_count("c1", "u1").unwrap(), 2);
        assert_eq!(db.mark_chat_read("c1", "u1").unwrap(), 2);
        assert_eq!(db.unread_count("c1", "u1").unwrap(), 0);
        assert_eq!(db.unread_count("c1", "u2").unwrap(), 1);
    }

    #[test]
    fn previews_are_sorted_most_recent_first() {
        let mut db = Database::open_in_memory().unwrap();
        let previews = vec![
            preview("c1", "u2", Some(100), 3),
            preview("c2", "u3", None, 0),
            preview("c3", "u4", Some(300), 2),
        ];
        db.replace_chat_previews("u1", &previews, at(0)).unwrap();

        let cached = db.cached_chat_previews("u1").unwrap();
        let ids: Vec<&str> = cached.iter().map(|p| p.chat_id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c1", "c2"]);
        assert_eq!(courier_shared::total_unread(&cached), 5);
        assert!(db.cached_chat_previews("u9").unwrap().is_empty());
    }

    #[test]
    fn message_updates_previews_of_both_parties() {
        let mut db = Database::open_in_memory().unwrap();
        let chat = Chat::between(&Participant::new("u1", "Al"), &Participant::new("u2", "Bo"));
        for owner in ["u1", "u2"] {
            let p = ChatPreview::for_new_chat(&chat, owner).unwrap();
            db.upsert_chat_preview(owner, &p).unwrap();
        }

        let owners = db
            .apply_message_to_previews(&chat.id, &msg("m1", "u1", 50))
            .unwrap();
        assert_eq!(owners, vec!["u1", "u2"]);

        let sender_view = &db.cached_chat_previews("u1").unwrap()[0];
        let receiver_view = &db.cached_chat_previews("u2").unwrap()[0];
        assert_eq!(sender_view.unread_count, 0);
        assert_eq!(receiver_view.unread_count, 1);
        assert_eq!(receiver_view.last_message, "content m1");

        // An older message does not move the preview backwards.
        let owners = db
            .apply_message_to_previews(&chat.id, &msg("m0", "u2", 10))
            .unwrap();
        assert_eq!(owners, vec!["u1"]);
        assert_eq!(db.cached_chat_previews("u2").unwrap()[0].last_message, "content m1");
    }

    #[test]
    fn late_older_message_still_counts_as_unread() {
        let mut db = Database::open_in_memory().unwrap();
        let chat = Chat::between(&Participant::new("u1", "Al"), &Participant::new("u2", "Bo"));
        for owner in ["u1", "u2"] {
            let p = ChatPreview::for_new_chat(&chat, owner).unwrap();
            db.upsert_chat_preview(owner, &p).unwrap();
        }

        for m in [msg("new", "u2", 200), msg("old", "u2", 100)] {
            assert!(db.insert_message(&chat.id, &m).unwrap());
            db.apply_message_to_previews(&chat.id, &m).unwrap();
        }

        let view = &db.cached_chat_previews("u1").unwrap()[0];
        assert_eq!(view.unread_count, 2);
        assert_eq!(view.last_message, "content new");
        assert_eq!(view.unread_count, db.unread_count(&chat.id, "u1").unwrap());
        assert_eq!(db.cached_chat_previews("u2").unwrap()[0].unread_count, 0);
    }
}
