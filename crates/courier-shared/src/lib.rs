// Domain model shared by the store and sync crates.

pub mod chat;
pub mod constants;
pub mod error;
pub mod operation;
pub mod types;

pub use chat::{
    sort_messages, total_unread, Chat, ChatPreview, Message, MessageStatus, MessageType,
    Participant, TypingStatus,
};
pub use error::SharedError;
pub use operation::{ChatWrite, OperationType, Payload, PendingOperation};
pub use types::{timestamp_now, ConnectionQuality, ConnectivityState};
