//! Queued write operations.
//!
//! A [`PendingOperation`] keeps its payload as a plain key-value map so the
//! queue table never depends on the shape of the domain types.  The typed view
//! of the same data is [`ChatWrite`]; both convert into each other through the
//! same JSON representation the remote store uses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::chat::{Chat, Message, TypingStatus};
use crate::error::SharedError;
use crate::types::timestamp_now;

pub type Payload = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    SendMessage,
    MarkRead,
    MarkAllRead,
    SetTyping,
    CreateChat,
    UpdateProfile,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "SEND_MESSAGE",
            Self::MarkRead => "MARK_READ",
            Self::MarkAllRead => "MARK_ALL_READ",
            Self::SetTyping => "SET_TYPING",
            Self::CreateChat => "CREATE_CHAT",
            Self::UpdateProfile => "UPDATE_PROFILE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEND_MESSAGE" => Ok(Self::SendMessage),
            "MARK_READ" => Ok(Self::MarkRead),
            "MARK_ALL_READ" => Ok(Self::MarkAllRead),
            "SET_TYPING" => Ok(Self::SetTyping),
            "CREATE_CHAT" => Ok(Self::CreateChat),
            "UPDATE_PROFILE" => Ok(Self::UpdateProfile),
            other => Err(SharedError::UnknownOperation(other.to_string())),
        }
    }
}

/// Typed form of every mutating chat action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatWrite {
    #[serde(rename_all = "camelCase")]
    SendMessage { chat_id: String, message: Message },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        chat_id: String,
        message_id: String,
        reader_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MarkAllRead { chat_id: String, reader_id: String },
    #[serde(rename_all = "camelCase")]
    SetTyping { chat_id: String, status: TypingStatus },
    #[serde(rename_all = "camelCase")]
    CreateChat { chat: Chat },
    #[serde(rename_all = "camelCase")]
    UpdateProfile { user_id: String, display_name: String },
}

impl ChatWrite {
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::SendMessage { .. } => OperationType::SendMessage,
            Self::MarkRead { .. } => OperationType::MarkRead,
            Self::MarkAllRead { .. } => OperationType::MarkAllRead,
            Self::SetTyping { .. } => OperationType::SetTyping,
            Self::CreateChat { .. } => OperationType::CreateChat,
            Self::UpdateProfile { .. } => OperationType::UpdateProfile,
        }
    }

    /// The chat this write targets, if any.
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            Self::SendMessage { chat_id, .. }
            | Self::MarkRead { chat_id, .. }
            | Self::MarkAllRead { chat_id, .. }
            | Self::SetTyping { chat_id, .. } => Some(chat_id),
            Self::CreateChat { chat } => Some(&chat.id),
            Self::UpdateProfile { .. } => None,
        }
    }

    // Sends and chat creations derive their id from the entity id, so the
    // same logical write always maps to the same queue entry.
    fn operation_id(&self) -> String {
        match self {
            Self::SendMessage { chat_id, message } => {
                format!("{}:{}:{}", self.op_type(), chat_id, message.id)
            }
            Self::CreateChat { chat } => format!("{}:{}", self.op_type(), chat.id),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

/// A write waiting for remote confirmation.
///
/// The id is stable across retries so the remote side can deduplicate.  Only
/// `attempts` changes while the operation sits in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub payload: Payload,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingOperation {
    pub fn from_write(write: &ChatWrite) -> Result<Self, SharedError> {
        let payload = match serde_json::to_value(write)? {
            Value::Object(mut envelope) => match envelope.remove("payload") {
                Some(Value::Object(map)) => map,
                other => {
                    return Err(SharedError::InvalidValue {
                        field: "payload",
                        value: format!("{other:?}"),
                    })
                }
            },
            other => {
                return Err(SharedError::InvalidValue {
                    field: "payload",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            id: write.operation_id(),
            op_type: write.op_type(),
            payload,
            enqueued_at: timestamp_now(),
            attempts: 0,
        })
    }

    pub fn to_write(&self) -> Result<ChatWrite, SharedError> {
        let mut envelope = Payload::new();
        envelope.insert("type".to_string(), Value::from(self.op_type.as_str()));
        envelope.insert("payload".to_string(), Value::Object(self.payload.clone()));
        Ok(serde_json::from_value(Value::Object(envelope))?)
    }
}
