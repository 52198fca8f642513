//! Chat-domain operations with per-call source selection.
//!
//! Every call reads the connectivity state once and sticks with the source
//! it picked: a read started offline stays local until the caller asks
//! again.  Writes always land locally first and additionally go to the
//! remote store when online.

use std::sync::Arc;

use tracing::{debug, warn};

use courier_shared::{
    sort_messages, Chat, ChatPreview, ChatWrite, Message, OperationType, Participant,
    PendingOperation, TypingStatus,
};
use courier_store::LocalCache;

use crate::error::Result;
use crate::offline_first::{OfflineFirstRepository, WriteOutcome};
use crate::source::{ChatSource, LocalChatSource, RemoteChatSource};
use crate::subscription::Subscription;

#[derive(Clone)]
pub struct RealtimeChatRepository {
    local: Arc<LocalChatSource>,
    remote: Arc<RemoteChatSource>,
    store: OfflineFirstRepository,
}

impl RealtimeChatRepository {
    pub fn new(local: LocalChatSource, remote: RemoteChatSource, store: OfflineFirstRepository) -> Self {
        Self {
            local: Arc::new(local),
            remote: Arc::new(remote),
            store,
        }
    }

    fn is_online(&self) -> bool {
        self.store.connectivity().is_online()
    }

    fn cache(&self) -> &LocalCache {
        self.store.cache()
    }

    fn source(&self) -> Arc<dyn ChatSource> {
        if self.is_online() {
            self.remote.clone()
        } else {
            self.local.clone()
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Live chat list of `user_id`.  Online, each remote update is also
    /// written to the local projection.
    pub fn get_chat_list(&self, user_id: &str) -> Subscription<Result<Vec<ChatPreview>>> {
        if !self.is_online() {
            return self.local.chat_list(user_id);
        }

        let cache = self.cache().clone();
        let owner = user_id.to_string();
        self.remote.chat_list(user_id).pipe(move |mut upstream, tx| async move {
            while let Some(item) = upstream.recv().await {
                if let Ok(previews) = &item {
                    if let Err(e) = cache.cache_chat_previews(&owner, previews.clone()).await {
                        warn!(owner_id = %owner, error = %e, "failed to cache chat list");
                    }
                }
                if tx.send(item).is_err() {
                    return;
                }
            }
        })
    }

    /// Live messages of a chat, oldest first.  Online, each remote update is
    /// merged with sends still waiting in the queue and written to the local
    /// projection.
    pub fn get_messages(&self, chat_id: &str) -> Subscription<Result<Vec<Message>>> {
        if !self.is_online() {
            return self.local.messages(chat_id);
        }

        let cache = self.cache().clone();
        let chat_id = chat_id.to_string();
        self.remote.messages(&chat_id).pipe(move |mut upstream, tx| async move {
            while let Some(item) = upstream.recv().await {
                let item = match item {
                    Ok(remote) => {
                        let merged = with_pending_sends(&cache, &chat_id, remote).await;
                        if let Err(e) = cache.cache_messages(&chat_id, merged.clone()).await {
                            warn!(chat_id = %chat_id, error = %e, "failed to cache messages");
                        }
                        Ok(merged)
                    }
                    Err(e) => Err(e),
                };
                if tx.send(item).is_err() {
                    return;
                }
            }
        })
    }

    pub fn get_typing_status(&self, chat_id: &str, user_id: &str) -> Subscription<Result<TypingStatus>> {
        self.source().typing_status(chat_id, user_id)
    }

    pub async fn search_chats(&self, user_id: &str, query: &str) -> Result<Vec<ChatPreview>> {
        self.source().search_chats(user_id, query).await
    }

    /// Id of the chat between `a` and `b`.  Online this asks the remote
    /// store only and remembers a hit locally; offline it asks the local
    /// registry only.  A miss is never remembered.
    pub async fn get_chat_id(&self, a: &str, b: &str) -> Result<Option<String>> {
        if !self.is_online() {
            return Ok(self.local.find_chat(a, b).await?.map(|chat| chat.id));
        }
        let found = self.remote.find_chat(a, b).await?;
        if let Some(chat) = &found {
            self.remember_chat(chat).await;
        }
        Ok(found.map(|chat| chat.id))
    }

    async fn remember_chat(&self, chat: &Chat) {
        if let Err(e) = self.cache().register_chat(chat.clone()).await {
            warn!(chat_id = %chat.id, error = %e, "failed to register chat locally");
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    async fn write(&self, write: ChatWrite) -> Result<WriteOutcome> {
        let operation = PendingOperation::from_write(&write)?;
        let local = &self.local;
        let remote = &self.remote;
        self.store
            .perform_write_operation(operation, || local.apply(&write), || remote.apply(&write))
            .await
    }

    /// Send a text message from `sender_id`.
    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<(Message, WriteOutcome)> {
        let message = Message::text(sender_id, content);
        let outcome = self.send_message_with(chat_id, message.clone()).await?;
        Ok((message, outcome))
    }

    /// Send a message built by the caller.  Re-sending a message with the
    /// same id is a no-op everywhere.
    pub async fn send_message_with(&self, chat_id: &str, message: Message) -> Result<WriteOutcome> {
        self.write(ChatWrite::SendMessage {
            chat_id: chat_id.to_string(),
            message,
        })
        .await
    }

    pub async fn mark_as_read(&self, chat_id: &str, message_id: &str, reader_id: &str) -> Result<WriteOutcome> {
        self.write(ChatWrite::MarkRead {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            reader_id: reader_id.to_string(),
        })
        .await
    }

    pub async fn mark_all_as_read(&self, chat_id: &str, reader_id: &str) -> Result<WriteOutcome> {
        self.write(ChatWrite::MarkAllRead {
            chat_id: chat_id.to_string(),
            reader_id: reader_id.to_string(),
        })
        .await
    }

    pub async fn set_typing_status(&self, chat_id: &str, user_id: &str, is_typing: bool) -> Result<WriteOutcome> {
        self.write(ChatWrite::SetTyping {
            chat_id: chat_id.to_string(),
            status: TypingStatus::new(user_id, is_typing),
        })
        .await
    }

    /// Return the chat between `me` and `other`, creating it if neither the
    /// remote store (online) nor the local registry (offline) knows one.
    ///
    /// For an existing chat the outcome says where it was found: `Synced`
    /// for the remote store, `LocalOnly` for the local registry.
    pub async fn create_chat(&self, me: &Participant, other: &Participant) -> Result<(Chat, WriteOutcome)> {
        if self.is_online() {
            match self.remote.find_chat(&me.id, &other.id).await {
                Ok(Some(chat)) => {
                    self.remember_chat(&chat).await;
                    return Ok((chat, WriteOutcome::Synced));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "remote chat lookup failed, checking local registry");
                    if let Some(chat) = self.local.find_chat(&me.id, &other.id).await? {
                        return Ok((chat, WriteOutcome::LocalOnly));
                    }
                }
            }
        } else if let Some(chat) = self.local.find_chat(&me.id, &other.id).await? {
            return Ok((chat, WriteOutcome::LocalOnly));
        }

        let chat = Chat::between(me, other);
        debug!(chat_id = %chat.id, "creating chat");
        let outcome = self.write(ChatWrite::CreateChat { chat: chat.clone() }).await?;
        Ok((chat, outcome))
    }

    pub async fn update_profile(&self, user_id: &str, display_name: &str) -> Result<WriteOutcome> {
        self.write(ChatWrite::UpdateProfile {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
        .await
    }

    /// Publish presence when online; offline this does nothing.
    pub async fn set_presence(&self, user_id: &str, online: bool) -> Result<()> {
        if !self.is_online() {
            debug!(user_id, "offline, presence not published");
            return Ok(());
        }
        self.remote.set_presence(user_id, online).await
    }
}

/// Add messages of this chat that are still queued for sending, so a
/// full-replace of the projection does not drop them.
async fn with_pending_sends(cache: &LocalCache, chat_id: &str, mut messages: Vec<Message>) -> Vec<Message> {
    let pending = match cache.pending_operations().await {
        Ok(ops) => ops,
        Err(e) => {
            warn!(chat_id, error = %e, "could not read pending queue");
            return messages;
        }
    };

    for op in pending.iter().filter(|op| op.op_type == OperationType::SendMessage) {
        let Ok(ChatWrite::SendMessage { chat_id: target, message }) = op.to_write() else {
            continue;
        };
        if target == chat_id && !messages.iter().any(|m| m.id == message.id) {
            messages.push(message);
        }
    }
    sort_messages(&mut messages);
    messages
}
