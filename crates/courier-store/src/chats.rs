//! Local chat registry, used to find an existing chat between two parties
//! without the remote store.

use rusqlite::{params, OptionalExtension};

use courier_shared::{Chat, Participant};

use crate::database::{datetime_from_millis, Database};
use crate::error::Result;
use crate::keys;
use crate::pending::retarget_operations;

impl Database {
    /// Register a chat.  Returns `false` if a chat with the same id or the
    /// same pair of participants already exists.
    pub fn insert_chat(&self, chat: &Chat) -> Result<bool> {
        let participants = serde_json::to_string(&chat.participants)?;
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO chats (id, pair_key, participants, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                chat.id,
                chat.key(),
                participants,
                chat.created_at.timestamp_millis(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn find_chat_between(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        let chat = self
            .conn()
            .query_row(
                "SELECT id, participants, created_at FROM chats WHERE pair_key = ?1",
                params![Chat::pair_key(a, b)],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }

    /// Fold a locally created chat into the chat that already exists for the
    /// same pair under another id: the registry row, both projections, the
    /// staleness timestamp and every queued operation addressed to `from`
    /// move over to `into`.  Returns the preview owners that were touched.
    pub fn merge_chat(&mut self, from: &str, into: &Chat) -> Result<Vec<String>> {
        let participants = serde_json::to_string(&into.participants)?;
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "DELETE FROM chats WHERE id = ?1 OR id = ?2 OR pair_key = ?3",
            params![from, into.id, into.key()],
        )?;
        tx.execute(
            "INSERT INTO chats (id, pair_key, participants, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                into.id,
                into.key(),
                participants,
                into.created_at.timestamp_millis(),
            ],
        )?;

        tx.execute(
            "UPDATE OR REPLACE messages_by_chat SET chat_id = ?2 WHERE chat_id = ?1",
            params![from, into.id],
        )?;
        tx.execute(
            "UPDATE OR REPLACE cache_timestamps SET key = ?2 WHERE key = ?1",
            params![keys::messages(from), keys::messages(&into.id)],
        )?;

        let owners = {
            let mut stmt =
                tx.prepare("SELECT owner_id FROM chat_previews_by_owner WHERE chat_id = ?1")?;
            let rows = stmt.query_map(params![from], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        // A preview already known under the surviving id wins.
        tx.execute(
            "UPDATE OR IGNORE chat_previews_by_owner SET chat_id = ?2 WHERE chat_id = ?1",
            params![from, into.id],
        )?;
        tx.execute(
            "DELETE FROM chat_previews_by_owner WHERE chat_id = ?1",
            params![from],
        )?;

        let retargeted = retarget_operations(&tx, from, &into.id)?;
        tx.commit()?;

        tracing::info!(from, into = %into.id, retargeted, "merged chat into existing chat");
        Ok(owners)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let participants_json: String = row.get(1)?;
    let participants: Vec<Participant> = serde_json::from_str(&participants_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Chat {
        id: row.get(0)?,
        participants,
        created_at: datetime_from_millis(2, row.get(2)?)?,
    })
}

#[cfg(test)]
mod tests {
    use courier_shared::{ChatPreview, ChatWrite, Message, PendingOperation};

    use super::*;

    fn alice() -> Participant {
        Participant::new("u1", "Alice")
    }

    fn bob() -> Participant {
        Participant::new("u2", "Bob")
    }

    #[test]
    fn find_chat_is_order_independent() {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat::between(&alice(), &bob());
        assert!(db.insert_chat(&chat).unwrap());

        let found = db.find_chat_between("u2", "u1").unwrap().unwrap();
        assert_eq!(found, chat);
        assert!(db.find_chat_between("u1", "u3").unwrap().is_none());
    }

    #[test]
    fn duplicate_pair_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_chat(&Chat::between(&alice(), &bob())).unwrap());
        assert!(!db.insert_chat(&Chat::between(&bob(), &alice())).unwrap());
    }

    #[test]
    fn merge_moves_everything_to_the_existing_chat() {
        let mut db = Database::open_in_memory().unwrap();
        let local = Chat::between(&alice(), &bob());
        let existing = Chat::between(&bob(), &alice());
        db.insert_chat(&local).unwrap();
        for owner in ["u1", "u2"] {
            let preview = ChatPreview::for_new_chat(&local, owner).unwrap();
            db.upsert_chat_preview(owner, &preview).unwrap();
        }
        let message = Message::text("u1", "hello bob");
        db.insert_message(&local.id, &message).unwrap();

        let send = PendingOperation::from_write(&ChatWrite::SendMessage {
            chat_id: local.id.clone(),
            message: message.clone(),
        })
        .unwrap();
        let elsewhere = PendingOperation::from_write(&ChatWrite::MarkAllRead {
            chat_id: "c9".to_string(),
            reader_id: "u1".to_string(),
        })
        .unwrap();
        db.enqueue_operation(&send).unwrap();
        db.enqueue_operation(&elsewhere).unwrap();

        let mut owners = db.merge_chat(&local.id, &existing).unwrap();
        owners.sort();
        assert_eq!(owners, vec!["u1", "u2"]);

        assert_eq!(db.find_chat_between("u1", "u2").unwrap().unwrap().id, existing.id);
        assert!(db.cached_messages(&local.id).unwrap().is_empty());
        assert_eq!(db.cached_messages(&existing.id).unwrap(), vec![message]);
        assert_eq!(db.cached_chat_previews("u2").unwrap()[0].chat_id, existing.id);

        let queued: Vec<Option<String>> = db
            .pending_operations()
            .unwrap()
            .iter()
            .map(|op| op.to_write().unwrap().chat_id().map(str::to_string))
            .collect();
        assert_eq!(
            queued,
            vec![Some(existing.id.clone()), Some("c9".to_string())]
        );
    }
}
