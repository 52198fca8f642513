//! Chat domain entities.
//!
//! Every struct serializes with camelCase field names, which is also the
//! document shape used in the remote store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;
use crate::types::timestamp_now;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(Self::Sent),
            "DELIVERED" => Ok(Self::Delivered),
            "READ" => Ok(Self::Read),
            other => Err(SharedError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    System,
    Urgent,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::System => "SYSTEM",
            Self::Urgent => "URGENT",
        }
    }
}

impl FromStr for MessageType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(Self::Text),
            "IMAGE" => Ok(Self::Image),
            "SYSTEM" => Ok(Self::System),
            "URGENT" => Ok(Self::Urgent),
            other => Err(SharedError::InvalidValue {
                field: "type",
                value: other.to_string(),
            }),
        }
    }
}

/// A single chat message.
///
/// The id is chosen by the sending device when the message is created and is
/// never reassigned, so delivering the same message twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
}

impl Message {
    /// Create a new outgoing message with a fresh id.
    pub fn new(sender_id: impl Into<String>, content: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            content: content.into(),
            timestamp: timestamp_now(),
            status: MessageStatus::Sent,
            kind,
        }
    }

    pub fn text(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(sender_id, content, MessageType::Text)
    }
}

/// Sort messages by timestamp, ties broken by id.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A one-to-one conversation.  Chats are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub participants: Vec<Participant>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn between(a: &Participant, b: &Participant) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participants: vec![a.clone(), b.clone()],
            created_at: timestamp_now(),
        }
    }

    /// Order-independent key identifying the pair of parties.
    pub fn pair_key(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}|{b}")
        } else {
            format!("{b}|{a}")
        }
    }

    pub fn key(&self) -> String {
        let ids: Vec<&str> = self.participants.iter().map(|p| p.id.as_str()).collect();
        match ids.as_slice() {
            [a, b] => Self::pair_key(a, b),
            _ => ids.join("|"),
        }
    }

    /// The participant that is not `me`.
    pub fn other_party(&self, me: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != me)
    }
}

impl fmt::Display for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat:{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// ChatPreview
// ---------------------------------------------------------------------------

/// Chat-list row, derived from a chat's messages and the other party's
/// presence.  Only ever written locally as a cache projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPreview {
    pub chat_id: String,
    pub other_party_id: String,
    pub other_party_name: String,
    pub last_message: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_online: bool,
}

impl ChatPreview {
    /// Empty preview for a freshly created chat.
    pub fn for_new_chat(chat: &Chat, owner_id: &str) -> Option<Self> {
        let other = chat.other_party(owner_id)?;
        Some(Self {
            chat_id: chat.id.clone(),
            other_party_id: other.id.clone(),
            other_party_name: other.name.clone(),
            last_message: String::new(),
            last_message_time: None,
            unread_count: 0,
            is_online: false,
        })
    }

    /// Case-insensitive match against the other party's name and the last
    /// message.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.other_party_name.to_lowercase().contains(&query)
            || self.last_message.to_lowercase().contains(&query)
    }
}

/// Total unread count shown on the chat-list badge.
pub fn total_unread(previews: &[ChatPreview]) -> u32 {
    previews.iter().map(|p| p.unread_count).sum()
}

// ---------------------------------------------------------------------------
// TypingStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub user_id: String,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl TypingStatus {
    pub fn new(user_id: impl Into<String>, is_typing: bool) -> Self {
        Self {
            user_id: user_id.into(),
            is_typing,
            timestamp: timestamp_now(),
        }
    }

    /// The status reported when no record exists.
    pub fn idle(user_id: impl Into<String>) -> Self {
        Self::new(user_id, false)
    }

    /// A typing record older than `ttl` counts as not typing.
    pub fn is_active(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.is_typing && now - self.timestamp < ttl
    }
}
