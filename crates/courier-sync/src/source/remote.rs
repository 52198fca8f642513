//! Reads and writes against the realtime backend.
//!
//! Remote layout:
//!
//! | path                       | value                                  |
//! |----------------------------|----------------------------------------|
//! | `chats/{chatId}`           | [`ChatDocument`]                       |
//! | `messages/{chatId}/{id}`   | [`Message`]                            |
//! | `typing/{chatId}/{userId}` | [`TypingStatus`]                       |
//! | `users/{userId}`           | `{ "name": .., "online": .. }`         |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use courier_shared::constants::{REMOTE_CHATS, REMOTE_MESSAGES, REMOTE_TYPING, REMOTE_USERS};
use courier_shared::{
    sort_messages, timestamp_now, Chat, ChatPreview, ChatWrite, Message, MessageStatus,
    Participant, TypingStatus,
};

use super::{effective_typing, ChatSource};
use crate::error::{Result, SyncError};
use crate::remote::{join, Filter, RemoteStore};
use crate::subscription::Subscription;
use crate::sync_manager::OperationReplayer;

/// A chat as stored remotely: the chat itself plus the fields every
/// participant's preview is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDocument {
    pub id: String,
    pub participants: Vec<Participant>,
    /// Flat id list so collection filters can match a member.
    pub participant_ids: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread: HashMap<String, u32>,
}

impl ChatDocument {
    pub fn from_chat(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            participants: chat.participants.clone(),
            participant_ids: chat.participants.iter().map(|p| p.id.clone()).collect(),
            created_at: chat.created_at,
            last_message: String::new(),
            last_message_time: None,
            unread: HashMap::new(),
        }
    }

    pub fn chat(&self) -> Chat {
        Chat {
            id: self.id.clone(),
            participants: self.participants.clone(),
            created_at: self.created_at,
        }
    }

    fn preview_for(&self, owner_id: &str, is_online: bool) -> Option<ChatPreview> {
        let other = self.participants.iter().find(|p| p.id != owner_id)?;
        Some(ChatPreview {
            chat_id: self.id.clone(),
            other_party_id: other.id.clone(),
            other_party_name: other.name.clone(),
            last_message: self.last_message.clone(),
            last_message_time: self.last_message_time,
            unread_count: self.unread.get(owner_id).copied().unwrap_or(0),
            is_online,
        })
    }
}

fn chat_path(chat_id: &str) -> String {
    join(&[REMOTE_CHATS, chat_id])
}

fn messages_path(chat_id: &str) -> String {
    join(&[REMOTE_MESSAGES, chat_id])
}

fn message_path(chat_id: &str, message_id: &str) -> String {
    join(&[REMOTE_MESSAGES, chat_id, message_id])
}

fn typing_path(chat_id: &str, user_id: &str) -> String {
    join(&[REMOTE_TYPING, chat_id, user_id])
}

fn user_path(user_id: &str) -> String {
    join(&[REMOTE_USERS, user_id])
}

fn member_filter(user_id: &str) -> Filter {
    Filter::ArrayContains {
        field: "participantIds".to_string(),
        value: json!(user_id),
    }
}

#[derive(Clone)]
pub struct RemoteChatSource {
    remote: Arc<dyn RemoteStore>,
    typing_ttl: Duration,
}

impl RemoteChatSource {
    pub fn new(remote: Arc<dyn RemoteStore>, typing_ttl: Duration) -> Self {
        Self { remote, typing_ttl }
    }

    /// Publish presence.  Presence is ephemeral and never queued.
    pub async fn set_presence(&self, user_id: &str, online: bool) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("online".to_string(), json!(online));
        self.remote.update_fields(&user_path(user_id), fields).await?;
        Ok(())
    }

    async fn chat_document(&self, chat_id: &str) -> Result<Option<ChatDocument>> {
        Ok(self.remote.get_once(&chat_path(chat_id)).await?.decode()?)
    }

    /// Deliver a message, then bring the chat's summary up to date.  The
    /// summary is recomputed from the stored messages, so replaying a send
    /// whose message already landed repairs the summary instead of
    /// skipping it.
    async fn send_message(&self, chat_id: &str, message: &Message) -> Result<()> {
        let Some(doc) = self.chat_document(chat_id).await? else {
            return Err(SyncError::MissingChat(chat_id.to_string()));
        };

        let path = message_path(chat_id, &message.id);
        if self.remote.get_once(&path).await?.exists() {
            debug!(chat_id, message_id = %message.id, "message already delivered");
        } else {
            self.remote.set(&path, serde_json::to_value(message)?).await?;
        }

        let messages = self.remote_messages(chat_id).await?;
        let mut fields = Map::new();
        let newer = doc
            .last_message_time
            .map_or(true, |t| t <= message.timestamp);
        if newer {
            fields.insert("lastMessage".to_string(), json!(message.content));
            fields.insert(
                "lastMessageTime".to_string(),
                json!(message.timestamp.timestamp_millis()),
            );
        }
        for id in doc.participant_ids.iter().filter(|id| **id != message.sender_id) {
            fields.insert(format!("unread/{id}"), json!(unread_for(&messages, id)));
        }
        if !fields.is_empty() {
            self.remote.update_fields(&chat_path(chat_id), fields).await?;
        }
        Ok(())
    }

    async fn remote_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let snapshot = self.remote.get_once(&messages_path(chat_id)).await?;
        Ok(snapshot.decode_children())
    }

    async fn set_unread(&self, chat_id: &str, reader_id: &str, unread: u32) -> Result<()> {
        if !self.remote.get_once(&chat_path(chat_id)).await?.exists() {
            return Ok(());
        }
        let mut fields = Map::new();
        fields.insert(format!("unread/{reader_id}"), json!(unread));
        self.remote.update_fields(&chat_path(chat_id), fields).await?;
        Ok(())
    }

    async fn mark_read(&self, chat_id: &str, message_id: &str, reader_id: &str) -> Result<()> {
        let path = message_path(chat_id, message_id);
        if !self.remote.get_once(&path).await?.exists() {
            debug!(chat_id, message_id, "nothing to mark read");
            return Ok(());
        }
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(MessageStatus::Read.as_str()));
        self.remote.update_fields(&path, fields).await?;

        let unread = unread_for(&self.remote_messages(chat_id).await?, reader_id);
        self.set_unread(chat_id, reader_id, unread).await
    }

    async fn mark_all_read(&self, chat_id: &str, reader_id: &str) -> Result<()> {
        let fields: Map<String, Value> = self
            .remote_messages(chat_id)
            .await?
            .into_iter()
            .filter(|m| m.sender_id != reader_id && m.status != MessageStatus::Read)
            .map(|m| (format!("{}/status", m.id), json!(MessageStatus::Read.as_str())))
            .collect();
        if !fields.is_empty() {
            self.remote
                .update_fields(&messages_path(chat_id), fields)
                .await?;
        }
        self.set_unread(chat_id, reader_id, 0).await
    }

    async fn create_chat(&self, chat: &Chat) -> Result<()> {
        if self.chat_document(&chat.id).await?.is_some() {
            return Ok(());
        }
        let key = chat.key();
        let existing = self
            .chat_documents(None)
            .await?
            .into_iter()
            .find(|doc| doc.chat().key() == key);
        if let Some(doc) = existing {
            return Err(SyncError::ChatExists {
                chat_id: chat.id.clone(),
                existing: Box::new(doc.chat()),
            });
        }
        let doc = ChatDocument::from_chat(chat);
        self.remote
            .set(&chat_path(&chat.id), serde_json::to_value(doc)?)
            .await?;
        Ok(())
    }

    async fn chat_documents(&self, member: Option<&str>) -> Result<Vec<ChatDocument>> {
        let snapshot = self.remote.get_once(REMOTE_CHATS).await?;
        let docs: Vec<ChatDocument> = snapshot.decode_children();
        Ok(match member {
            Some(user_id) => docs
                .into_iter()
                .filter(|d| d.participant_ids.iter().any(|id| id == user_id))
                .collect(),
            None => docs,
        })
    }
}

/// Messages from other parties that `reader_id` has not read.
fn unread_for(messages: &[Message], reader_id: &str) -> u32 {
    messages
        .iter()
        .filter(|m| m.sender_id != reader_id && m.status != MessageStatus::Read)
        .count() as u32
}

/// Build previews for `owner_id`, reading each other party's presence.
async fn previews_for(
    remote: &dyn RemoteStore,
    owner_id: &str,
    docs: Vec<ChatDocument>,
) -> Vec<ChatPreview> {
    let mut previews = Vec::with_capacity(docs.len());
    for doc in docs {
        let Some(other) = doc.participants.iter().find(|p| p.id != owner_id) else {
            continue;
        };
        let online_path = join(&[REMOTE_USERS, &other.id, "online"]);
        let is_online = match remote.get_once(&online_path).await {
            Ok(snapshot) => snapshot.value.as_ref().and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                debug!(user_id = %other.id, error = %e, "presence unavailable");
                false
            }
        };
        if let Some(preview) = doc.preview_for(owner_id, is_online) {
            previews.push(preview);
        }
    }
    previews.sort_by(|a, b| {
        b.last_message_time
            .cmp(&a.last_message_time)
            .then_with(|| a.chat_id.cmp(&b.chat_id))
    });
    previews
}

#[async_trait]
impl ChatSource for RemoteChatSource {
    fn chat_list(&self, user_id: &str) -> Subscription<Result<Vec<ChatPreview>>> {
        let remote = Arc::clone(&self.remote);
        let owner = user_id.to_string();
        let docs = remote.subscribe(REMOTE_CHATS, Some(member_filter(user_id)));

        docs.pipe(move |mut docs, tx| async move {
            while let Some(snapshot) = docs.recv().await {
                let previews = previews_for(remote.as_ref(), &owner, snapshot.decode_children()).await;
                if tx.send(Ok(previews)).is_err() {
                    return;
                }
            }
        })
    }

    fn messages(&self, chat_id: &str) -> Subscription<Result<Vec<Message>>> {
        let snapshots = self.remote.subscribe(&messages_path(chat_id), None);
        snapshots.pipe(|mut snapshots, tx| async move {
            while let Some(snapshot) = snapshots.recv().await {
                let mut messages: Vec<Message> = snapshot.decode_children();
                sort_messages(&mut messages);
                if tx.send(Ok(messages)).is_err() {
                    return;
                }
            }
        })
    }

    fn typing_status(&self, chat_id: &str, user_id: &str) -> Subscription<Result<TypingStatus>> {
        let snapshots = self.remote.subscribe(&typing_path(chat_id, user_id), None);
        let user_id = user_id.to_string();
        let ttl = self.typing_ttl;

        snapshots.pipe(move |mut snapshots, tx| async move {
            let mut current: Option<TypingStatus> = None;
            let mut expires_in: Option<Duration> = None;
            loop {
                let next = match expires_in {
                    Some(left) => tokio::select! {
                        snapshot = snapshots.recv() => Some(snapshot),
                        _ = tokio::time::sleep(left) => None,
                    },
                    None => Some(snapshots.recv().await),
                };
                match next {
                    Some(None) => return,
                    Some(Some(snapshot)) => {
                        current = match snapshot.decode::<TypingStatus>() {
                            Ok(status) => status,
                            Err(e) => {
                                warn!(path = %snapshot.path, error = %e, "undecodable typing record");
                                None
                            }
                        };
                    }
                    // The record outlived its TTL; re-evaluate below.
                    None => {}
                }

                let (status, left) = effective_typing(current.clone(), &user_id, ttl, timestamp_now());
                expires_in = left;
                if tx.send(Ok(status)).is_err() {
                    return;
                }
            }
        })
    }

    async fn search_chats(&self, user_id: &str, query: &str) -> Result<Vec<ChatPreview>> {
        let docs = self.chat_documents(Some(user_id)).await?;
        let previews = previews_for(self.remote.as_ref(), user_id, docs).await;
        Ok(previews.into_iter().filter(|p| p.matches(query)).collect())
    }

    async fn find_chat(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        let key = Chat::pair_key(a, b);
        Ok(self
            .chat_documents(Some(a))
            .await?
            .into_iter()
            .map(|doc| doc.chat())
            .find(|chat| chat.key() == key))
    }

    async fn apply(&self, write: &ChatWrite) -> Result<()> {
        match write {
            ChatWrite::SendMessage { chat_id, message } => self.send_message(chat_id, message).await,
            ChatWrite::MarkRead {
                chat_id,
                message_id,
                reader_id,
            } => self.mark_read(chat_id, message_id, reader_id).await,
            ChatWrite::MarkAllRead { chat_id, reader_id } => {
                self.mark_all_read(chat_id, reader_id).await
            }
            ChatWrite::SetTyping { chat_id, status } => {
                self.remote
                    .set(
                        &typing_path(chat_id, &status.user_id),
                        serde_json::to_value(status)?,
                    )
                    .await?;
                Ok(())
            }
            ChatWrite::CreateChat { chat } => self.create_chat(chat).await,
            ChatWrite::UpdateProfile {
                user_id,
                display_name,
            } => {
                let mut fields = Map::new();
                fields.insert("name".to_string(), json!(display_name));
                self.remote.update_fields(&user_path(user_id), fields).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl OperationReplayer for RemoteChatSource {
    async fn replay(&self, write: &ChatWrite) -> Result<()> {
        self.apply(write).await
    }
}

#[cfg(test)]
mod tests {
    use crate::remote::MemoryRemoteStore;

    use super::*;

    fn setup() -> (Arc<MemoryRemoteStore>, RemoteChatSource, Chat) {
        let store = Arc::new(MemoryRemoteStore::new());
        let source = RemoteChatSource::new(store.clone(), Duration::from_secs(5));
        let chat = Chat::between(&Participant::new("u1", "Al"), &Participant::new("u2", "Bo"));
        (store, source, chat)
    }

    #[tokio::test]
    async fn resending_a_message_does_not_double_count_unread() {
        let (store, source, chat) = setup();
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();

        let send = ChatWrite::SendMessage {
            chat_id: chat.id.clone(),
            message: Message::text("u1", "hi"),
        };
        source.apply(&send).await.unwrap();
        source.apply(&send).await.unwrap();

        let doc: ChatDocument = serde_json::from_value(
            store.get_value(&chat_path(&chat.id)).unwrap(),
        )
        .unwrap();
        assert_eq!(doc.unread.get("u2"), Some(&1));
        assert_eq!(doc.unread.get("u1"), None);
        assert_eq!(doc.last_message, "hi");
    }

    #[tokio::test]
    async fn mark_all_read_clears_unread() {
        let (store, source, chat) = setup();
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();
        for text in ["a", "b"] {
            source
                .apply(&ChatWrite::SendMessage {
                    chat_id: chat.id.clone(),
                    message: Message::text("u1", text),
                })
                .await
                .unwrap();
        }

        source
            .apply(&ChatWrite::MarkAllRead {
                chat_id: chat.id.clone(),
                reader_id: "u2".to_string(),
            })
            .await
            .unwrap();

        let messages = source.remote_messages(&chat.id).await.unwrap();
        assert!(messages.iter().all(|m| m.status == MessageStatus::Read));
        assert_eq!(
            store.get_value(&format!("chats/{}/unread/u2", chat.id)),
            Some(json!(0))
        );
    }

    #[tokio::test]
    async fn duplicate_pair_is_not_created_twice() {
        let (store, source, chat) = setup();
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();
        // Same chat again is a no-op.
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();

        let again = Chat::between(&Participant::new("u2", "Bo"), &Participant::new("u1", "Al"));
        let err = source
            .apply(&ChatWrite::CreateChat { chat: again.clone() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ChatExists { ref chat_id, ref existing }
                if *chat_id == again.id && existing.id == chat.id
        ));

        let chats = store.get_value("chats").unwrap();
        assert_eq!(chats.as_object().unwrap().len(), 1);
        assert_eq!(source.find_chat("u2", "u1").await.unwrap().unwrap().id, chat.id);
    }

    #[tokio::test]
    async fn send_to_unknown_chat_fails_without_writing() {
        let (store, source, chat) = setup();
        let err = source
            .apply(&ChatWrite::SendMessage {
                chat_id: chat.id.clone(),
                message: Message::text("u1", "hi"),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::MissingChat(ref id) if *id == chat.id));
        assert!(!err.is_network());
        assert_eq!(store.write_count(), 0);
        assert!(store.get_value(&messages_path(&chat.id)).is_none());
    }

    #[tokio::test]
    async fn resend_repairs_summary_of_a_delivered_message() {
        let (store, source, chat) = setup();
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();

        // The message landed but the summary update did not.
        let message = Message::text("u1", "hi");
        store
            .seed(
                &message_path(&chat.id, &message.id),
                serde_json::to_value(&message).unwrap(),
            )
            .unwrap();

        let send = ChatWrite::SendMessage {
            chat_id: chat.id.clone(),
            message,
        };
        source.apply(&send).await.unwrap();
        source.apply(&send).await.unwrap();

        let doc: ChatDocument =
            serde_json::from_value(store.get_value(&chat_path(&chat.id)).unwrap()).unwrap();
        assert_eq!(doc.last_message, "hi");
        assert_eq!(doc.unread.get("u2"), Some(&1));
    }

    #[tokio::test]
    async fn chat_list_carries_presence_and_unread() {
        let (store, source, chat) = setup();
        source
            .apply(&ChatWrite::CreateChat { chat: chat.clone() })
            .await
            .unwrap();
        source.set_presence("u2", true).await.unwrap();
        source
            .apply(&ChatWrite::SendMessage {
                chat_id: chat.id.clone(),
                message: Message::text("u2", "ping"),
            })
            .await
            .unwrap();

        let mut list = source.chat_list("u1");
        let previews = list.recv().await.unwrap().unwrap();
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].other_party_name, "Bo");
        assert!(previews[0].is_online);
        assert_eq!(previews[0].unread_count, 1);
        assert_eq!(previews[0].last_message, "ping");

        list.cancel();
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn stale_remote_typing_reads_as_idle() {
        let (store, source, chat) = setup();
        let mut old = TypingStatus::new("u2", true);
        old.timestamp = timestamp_now() - chrono::Duration::seconds(30);
        store
            .seed(&typing_path(&chat.id, "u2"), serde_json::to_value(&old).unwrap())
            .unwrap();

        let mut typing = source.typing_status(&chat.id, "u2");
        assert!(!typing.recv().await.unwrap().unwrap().is_typing);
    }
}
