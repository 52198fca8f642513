//! The two places chat data can come from.
//!
//! [`RealtimeChatRepository`](crate::repository::RealtimeChatRepository)
//! picks one of them per call from the connectivity state.

mod local;
mod remote;

pub use local::LocalChatSource;
pub use remote::RemoteChatSource;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_shared::{Chat, ChatPreview, ChatWrite, Message, TypingStatus};

use crate::error::Result;
use crate::subscription::Subscription;

#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Chat-list previews of `user_id`, most recent first.
    fn chat_list(&self, user_id: &str) -> Subscription<Result<Vec<ChatPreview>>>;

    /// Messages of a chat ordered by timestamp, ties by id.
    fn messages(&self, chat_id: &str) -> Subscription<Result<Vec<Message>>>;

    /// Whether `user_id` is typing in `chat_id`.  No record reads as not
    /// typing.
    fn typing_status(&self, chat_id: &str, user_id: &str) -> Subscription<Result<TypingStatus>>;

    async fn search_chats(&self, user_id: &str, query: &str) -> Result<Vec<ChatPreview>>;

    /// The chat between `a` and `b`, whichever order they are given in.
    async fn find_chat(&self, a: &str, b: &str) -> Result<Option<Chat>>;

    async fn apply(&self, write: &ChatWrite) -> Result<()>;
}

/// What a stored typing record means right now, and how long until that
/// changes.
fn effective_typing(
    status: Option<TypingStatus>,
    user_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> (TypingStatus, Option<Duration>) {
    let ttl = chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
    match status {
        Some(status) if status.is_active(now, ttl) => {
            let left = (status.timestamp + ttl - now).to_std().unwrap_or_default();
            (status, Some(left))
        }
        Some(status) if !status.is_typing => (status, None),
        _ => (TypingStatus::idle(user_id), None),
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::timestamp_now;

    use super::*;

    #[test]
    fn stale_typing_reads_as_idle() {
        let now = timestamp_now();
        let mut status = TypingStatus::new("u2", true);
        status.timestamp = now - chrono::Duration::seconds(10);

        let (effective, expires) = effective_typing(Some(status), "u2", Duration::from_secs(5), now);
        assert!(!effective.is_typing);
        assert!(expires.is_none());
    }

    #[test]
    fn active_typing_reports_time_left() {
        let now = timestamp_now();
        let mut status = TypingStatus::new("u2", true);
        status.timestamp = now - chrono::Duration::seconds(2);

        let (effective, expires) = effective_typing(Some(status), "u2", Duration::from_secs(5), now);
        assert!(effective.is_typing);
        assert_eq!(expires, Some(Duration::from_secs(3)));
    }

    #[test]
    fn missing_record_is_idle() {
        let (effective, expires) =
            effective_typing(None, "u2", Duration::from_secs(5), timestamp_now());
        assert_eq!(effective.user_id, "u2");
        assert!(!effective.is_typing);
        assert!(expires.is_none());
    }
}
