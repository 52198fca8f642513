//! Async facade over the shared [`Database`].
//!
//! Every call runs on tokio's blocking pool behind a single mutex, so writes
//! to the same key never interleave: each one replaces the whole row.  After
//! a write lands, a [`CacheEvent`] is broadcast to local subscribers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use courier_shared::{timestamp_now, Chat, ChatPreview, Message, MessageStatus, PendingOperation};

use crate::database::Database;
use crate::entries::Lookup;
use crate::error::{Result, StoreError};

/// Capacity of the change-notification channel.  Slow subscribers that fall
/// further behind receive `Lagged` and simply re-read.
const EVENT_CAPACITY: usize = 256;

/// What changed in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A key/value entry was written or removed.
    Entry(String),
    /// The message list of a chat changed.
    Messages(String),
    /// The chat-preview list of an owner changed.
    Previews(String),
    /// Everything was cleared.
    Cleared,
}

impl CacheEvent {
    pub fn touches_entry(&self, key: &str) -> bool {
        matches!(self, Self::Cleared) || matches!(self, Self::Entry(k) if k == key)
    }

    pub fn touches_messages(&self, chat_id: &str) -> bool {
        matches!(self, Self::Cleared) || matches!(self, Self::Messages(c) if c == chat_id)
    }

    pub fn touches_previews(&self, owner_id: &str) -> bool {
        matches!(self, Self::Cleared) || matches!(self, Self::Previews(o) if o == owner_id)
    }
}

/// Process-wide local cache handle.  Cheap to clone; all clones share the
/// same database and event channel.
#[derive(Clone)]
pub struct LocalCache {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<CacheEvent>,
}

impl LocalCache {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Receive a [`CacheEvent`] for every write made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    async fn run<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }

    fn notify(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Key/value entries
    // ------------------------------------------------------------------

    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let k = key.to_string();
        self.run(move |db| db.put_entry(&k, &value, expires_at, timestamp_now()))
            .await?;
        self.notify(CacheEvent::Entry(key.to_string()));
        Ok(())
    }

    pub async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = timestamp_now() + to_chrono(ttl);
        self.put(key, value, Some(expires_at)).await
    }

    /// Read an entry.  Missing and expired entries both read as `None`.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let k = key.to_string();
        let lookup = self.run(move |db| db.get_entry(&k, timestamp_now())).await?;
        if lookup == Lookup::Expired {
            self.notify(CacheEvent::Entry(key.to_string()));
        }
        Ok(lookup.into_value())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let k = key.to_string();
        self.run(move |db| db.remove_entry(&k)).await?;
        self.notify(CacheEvent::Entry(key.to_string()));
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.run(|db| db.clear_all()).await?;
        tracing::info!("local cache cleared");
        self.notify(CacheEvent::Cleared);
        Ok(())
    }

    /// Delete every expired entry now instead of waiting for a read to find
    /// it.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.run(|db| db.purge_expired(timestamp_now())).await?;
        if removed > 0 {
            tracing::debug!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    pub async fn put_object<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes, expires_at).await
    }

    /// Read and decode an object.  Bytes that no longer decode (for example
    /// after a schema change) read as `None` instead of failing.
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached object failed to decode, treating as miss");
                Ok(None)
            }
        }
    }

    /// Whether the data under `key` was last written more than `max_age`
    /// ago.  Never fails: if the timestamp cannot be read the data is
    /// considered stale.
    pub async fn is_data_stale(&self, key: &str, max_age: Duration) -> bool {
        let k = key.to_string();
        let max_age = to_chrono(max_age);
        match self
            .run(move |db| db.is_data_stale(&k, max_age, timestamp_now()))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(key, error = %e, "staleness check failed, assuming stale");
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    /// Replace the full message list of a chat.
    pub async fn cache_messages(&self, chat_id: &str, messages: Vec<Message>) -> Result<()> {
        let c = chat_id.to_string();
        self.run(move |db| db.replace_messages(&c, &messages, timestamp_now()))
            .await?;
        self.notify(CacheEvent::Messages(chat_id.to_string()));
        Ok(())
    }

    pub async fn get_cached_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let c = chat_id.to_string();
        self.run(move |db| db.cached_messages(&c)).await
    }

    /// Replace the full chat-preview list of an owner.
    pub async fn cache_chat_previews(
        &self,
        owner_id: &str,
        previews: Vec<ChatPreview>,
    ) -> Result<()> {
        let o = owner_id.to_string();
        self.run(move |db| db.replace_chat_previews(&o, &previews, timestamp_now()))
            .await?;
        self.notify(CacheEvent::Previews(owner_id.to_string()));
        Ok(())
    }

    pub async fn get_cached_chat_previews(&self, owner_id: &str) -> Result<Vec<ChatPreview>> {
        let o = owner_id.to_string();
        self.run(move |db| db.cached_chat_previews(&o)).await
    }

    /// Store one message and move the chat's previews forward.  Returns
    /// `false` when a message with this id was already stored, in which case
    /// nothing changes.
    pub async fn insert_message(&self, chat_id: &str, message: Message) -> Result<bool> {
        let c = chat_id.to_string();
        let (inserted, owners) = self
            .run(move |db| {
                if !db.insert_message(&c, &message)? {
                    return Ok((false, Vec::new()));
                }
                let owners = db.apply_message_to_previews(&c, &message)?;
                Ok((true, owners))
            })
            .await?;

        if inserted {
            self.notify(CacheEvent::Messages(chat_id.to_string()));
        }
        for owner in owners {
            self.notify(CacheEvent::Previews(owner));
        }
        Ok(inserted)
    }

    /// Mark one message read by `reader_id` and refresh the reader's unread
    /// count.
    pub async fn mark_message_read(
        &self,
        chat_id: &str,
        message_id: &str,
        reader_id: &str,
    ) -> Result<bool> {
        let (c, m, r) = (chat_id.to_string(), message_id.to_string(), reader_id.to_string());
        let changed = self
            .run(move |db| {
                let changed = db.set_message_status(&c, &m, MessageStatus::Read)?;
                let unread = db.unread_count(&c, &r)?;
                db.set_preview_unread(&r, &c, unread)?;
                Ok(changed)
            })
            .await?;
        self.notify(CacheEvent::Messages(chat_id.to_string()));
        self.notify(CacheEvent::Previews(reader_id.to_string()));
        Ok(changed)
    }

    /// Mark everything other parties sent in the chat as read by
    /// `reader_id`.
    pub async fn mark_chat_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        let (c, r) = (chat_id.to_string(), reader_id.to_string());
        let changed = self
            .run(move |db| {
                let changed = db.mark_chat_read(&c, &r)?;
                db.set_preview_unread(&r, &c, 0)?;
                Ok(changed)
            })
            .await?;
        self.notify(CacheEvent::Messages(chat_id.to_string()));
        self.notify(CacheEvent::Previews(reader_id.to_string()));
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Chat registry
    // ------------------------------------------------------------------

    /// Register a chat and give every participant an empty preview row.
    /// Returns `false` if the chat, or a chat between the same parties,
    /// already exists.
    pub async fn register_chat(&self, chat: Chat) -> Result<bool> {
        let owners: Vec<String> = chat.participants.iter().map(|p| p.id.clone()).collect();
        let inserted = self
            .run(move |db| {
                if !db.insert_chat(&chat)? {
                    return Ok(false);
                }
                for p in &chat.participants {
                    // A preview written through from the remote side wins.
                    let known = db.cached_chat_previews(&p.id)?;
                    if known.iter().any(|existing| existing.chat_id == chat.id) {
                        continue;
                    }
                    if let Some(preview) = ChatPreview::for_new_chat(&chat, &p.id) {
                        db.upsert_chat_preview(&p.id, &preview)?;
                    }
                }
                Ok(true)
            })
            .await?;

        if inserted {
            for owner in owners {
                self.notify(CacheEvent::Previews(owner));
            }
        }
        Ok(inserted)
    }

    pub async fn find_chat_between(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        let (a, b) = (a.to_string(), b.to_string());
        self.run(move |db| db.find_chat_between(&a, &b)).await
    }

    /// Move a locally created chat, its projections and its queued
    /// operations onto the chat `into` that already exists for the same
    /// pair.
    pub async fn merge_chat(&self, from: &str, into: Chat) -> Result<()> {
        let f = from.to_string();
        let into_id = into.id.clone();
        let owners = self.run(move |db| db.merge_chat(&f, &into)).await?;

        self.notify(CacheEvent::Messages(from.to_string()));
        self.notify(CacheEvent::Messages(into_id));
        for owner in owners {
            self.notify(CacheEvent::Previews(owner));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending operations
    // ------------------------------------------------------------------

    pub async fn enqueue_operation(&self, op: PendingOperation) -> Result<bool> {
        self.run(move |db| db.enqueue_operation(&op)).await
    }

    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.run(|db| db.pending_operations()).await
    }

    pub async fn head_operation(&self) -> Result<Option<PendingOperation>> {
        self.run(|db| db.head_operation()).await
    }

    pub async fn remove_operation(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |db| db.remove_operation(&id)).await
    }

    pub async fn record_failed_attempt(&self, id: &str, error: &str) -> Result<u32> {
        let (id, error) = (id.to_string(), error.to_string());
        self.run(move |db| db.record_failed_attempt(&id, &error)).await
    }

    pub async fn pending_operation_count(&self) -> Result<usize> {
        self.run(|db| db.pending_operation_count()).await
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use courier_shared::Participant;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    #[tokio::test]
    async fn object_round_trip() {
        let cache = LocalCache::open_in_memory().unwrap();
        let settings = Settings {
            theme: "dark".to_string(),
            font_size: 14,
        };
        cache.put_object("settings", &settings, None).await.unwrap();

        let loaded: Option<Settings> = cache.get_object("settings").await.unwrap();
        assert_eq!(loaded, Some(settings));
    }

    #[tokio::test]
    async fn undecodable_object_reads_as_miss() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .put("settings", br#"{"colour":"blue"}"#.to_vec(), None)
            .await
            .unwrap();

        let loaded: Option<Settings> = cache.get_object("settings").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .put_with_ttl("k", b"v".to_vec(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_in_the_past_is_absent() {
        let cache = LocalCache::open_in_memory().unwrap();
        let past = timestamp_now() - chrono::Duration::seconds(1);
        cache.put("k", b"v".to_vec(), Some(past)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_read_announces_the_eviction() {
        let cache = LocalCache::open_in_memory().unwrap();
        let past = timestamp_now() - chrono::Duration::seconds(1);
        cache.put("k", b"v".to_vec(), Some(past)).await.unwrap();
        let mut events = cache.subscribe();

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(events.try_recv().unwrap(), CacheEvent::Entry("k".to_string()));

        // A plain miss changes nothing and says nothing.
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(events.try_recv().is_err());
        assert!(cache.is_data_stale("k", Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn never_written_key_is_stale() {
        let cache = LocalCache::open_in_memory().unwrap();
        assert!(cache.is_data_stale("unknown", Duration::from_secs(3600)).await);

        cache.cache_messages("c1", Vec::new()).await.unwrap();
        assert!(
            !cache
                .is_data_stale(&crate::keys::messages("c1"), Duration::from_secs(3600))
                .await
        );
    }

    #[tokio::test]
    async fn writes_are_broadcast() {
        let cache = LocalCache::open_in_memory().unwrap();
        let mut events = cache.subscribe();

        cache.put("k", b"v".to_vec(), None).await.unwrap();
        cache.cache_messages("c1", Vec::new()).await.unwrap();
        cache.clear_all().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), CacheEvent::Entry("k".to_string()));
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Messages("c1".to_string()));
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Cleared);
    }

    #[tokio::test]
    async fn registered_chat_gets_previews_for_both_parties() {
        let cache = LocalCache::open_in_memory().unwrap();
        let chat = Chat::between(&Participant::new("u1", "Al"), &Participant::new("u2", "Bo"));
        assert!(cache.register_chat(chat.clone()).await.unwrap());
        assert!(!cache.register_chat(chat.clone()).await.unwrap());

        let al = cache.get_cached_chat_previews("u1").await.unwrap();
        assert_eq!(al.len(), 1);
        assert_eq!(al[0].other_party_name, "Bo");

        cache
            .insert_message(&chat.id, Message::text("u2", "hello"))
            .await
            .unwrap();
        let al = cache.get_cached_chat_previews("u1").await.unwrap();
        assert_eq!(al[0].unread_count, 1);

        cache.mark_chat_read(&chat.id, "u1").await.unwrap();
        let al = cache.get_cached_chat_previews("u1").await.unwrap();
        assert_eq!(al[0].unread_count, 0);
    }
}
