//! Reads and writes against the local cache only.
//!
//! Reads are live: each subscription re-reads its projection whenever the
//! cache broadcasts a relevant change, so offline writers see their own
//! writes immediately.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

use courier_shared::{timestamp_now, Chat, ChatPreview, ChatWrite, Message, TypingStatus};
use courier_store::{keys, CacheEvent, LocalCache};

use super::{effective_typing, ChatSource};
use crate::error::{Result, SyncError};
use crate::subscription::Subscription;

#[derive(Clone)]
pub struct LocalChatSource {
    cache: LocalCache,
    typing_ttl: Duration,
}

impl LocalChatSource {
    pub fn new(cache: LocalCache, typing_ttl: Duration) -> Self {
        Self { cache, typing_ttl }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }
}

/// Wait for the next event `relevant` accepts.  A lagged receiver counts as
/// relevant since events were missed; `false` means the channel is gone.
async fn next_change(
    events: &mut broadcast::Receiver<CacheEvent>,
    relevant: impl Fn(&CacheEvent) -> bool,
) -> bool {
    loop {
        match events.recv().await {
            Ok(event) if relevant(&event) => return true,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => return true,
            Err(RecvError::Closed) => return false,
        }
    }
}

fn live<T, R, F, Fut>(cache: &LocalCache, relevant: R, read: F) -> Subscription<Result<T>>
where
    T: Send + 'static,
    R: Fn(&CacheEvent) -> bool + Send + Sync + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send,
{
    // Subscribe before the first read so no write slips in between.
    let mut events = cache.subscribe();
    Subscription::spawn(move |tx| async move {
        loop {
            if tx.send(read().await).is_err() {
                return;
            }
            if !next_change(&mut events, &relevant).await {
                return;
            }
        }
    })
}

#[async_trait]
impl ChatSource for LocalChatSource {
    fn chat_list(&self, user_id: &str) -> Subscription<Result<Vec<ChatPreview>>> {
        let owner = user_id.to_string();
        let cache = self.cache.clone();
        live(
            &self.cache,
            {
                let owner = owner.clone();
                move |event| event.touches_previews(&owner)
            },
            move || {
                let cache = cache.clone();
                let owner = owner.clone();
                async move { cache.get_cached_chat_previews(&owner).await.map_err(SyncError::from) }
            },
        )
    }

    fn messages(&self, chat_id: &str) -> Subscription<Result<Vec<Message>>> {
        let chat_id = chat_id.to_string();
        let cache = self.cache.clone();
        live(
            &self.cache,
            {
                let chat_id = chat_id.clone();
                move |event| event.touches_messages(&chat_id)
            },
            move || {
                let cache = cache.clone();
                let chat_id = chat_id.clone();
                async move { cache.get_cached_messages(&chat_id).await.map_err(SyncError::from) }
            },
        )
    }

    fn typing_status(&self, chat_id: &str, user_id: &str) -> Subscription<Result<TypingStatus>> {
        let key = keys::typing(chat_id, user_id);
        let user_id = user_id.to_string();
        let cache = self.cache.clone();
        let ttl = self.typing_ttl;
        let mut events = cache.subscribe();

        Subscription::spawn(move |tx| async move {
            loop {
                let (item, expires_in): (Result<TypingStatus>, Option<Duration>) =
                    match cache.get_object::<TypingStatus>(&key).await {
                        Ok(stored) => {
                            let (status, left) =
                                effective_typing(stored, &user_id, ttl, timestamp_now());
                            (Ok(status), left)
                        }
                        Err(e) => (Err(e.into()), None),
                    };
                if tx.send(item).is_err() {
                    return;
                }

                let changed = next_change(&mut events, |event| event.touches_entry(&key));
                match expires_in {
                    Some(left) => {
                        tokio::select! {
                            open = changed => if !open { return },
                            _ = tokio::time::sleep(left) => {}
                        }
                    }
                    None => {
                        if !changed.await {
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn search_chats(&self, user_id: &str, query: &str) -> Result<Vec<ChatPreview>> {
        let previews = self.cache.get_cached_chat_previews(user_id).await?;
        Ok(previews.into_iter().filter(|p| p.matches(query)).collect())
    }

    async fn find_chat(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        Ok(self.cache.find_chat_between(a, b).await?)
    }

    async fn apply(&self, write: &ChatWrite) -> Result<()> {
        match write {
            ChatWrite::SendMessage { chat_id, message } => {
                self.cache.insert_message(chat_id, message.clone()).await?;
            }
            ChatWrite::MarkRead {
                chat_id,
                message_id,
                reader_id,
            } => {
                self.cache
                    .mark_message_read(chat_id, message_id, reader_id)
                    .await?;
            }
            ChatWrite::MarkAllRead { chat_id, reader_id } => {
                self.cache.mark_chat_read(chat_id, reader_id).await?;
            }
            ChatWrite::SetTyping { chat_id, status } => {
                let key = keys::typing(chat_id, &status.user_id);
                if status.is_typing {
                    let ttl = chrono::Duration::milliseconds(self.typing_ttl.as_millis() as i64);
                    self.cache
                        .put_object(&key, status, Some(status.timestamp + ttl))
                        .await?;
                } else {
                    self.cache.remove(&key).await?;
                }
            }
            ChatWrite::CreateChat { chat } => {
                self.cache.register_chat(chat.clone()).await?;
            }
            ChatWrite::UpdateProfile {
                user_id,
                display_name,
            } => {
                let profile = json!({ "userId": user_id, "displayName": display_name });
                self.cache
                    .put_object(&keys::profile(user_id), &profile, None)
                    .await?;
            }
        }
        Ok(())
    }
}
