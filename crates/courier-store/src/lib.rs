//! # courier-store
//!
//! Local persistence for the Courier sync core, backed by SQLite.
//!
//! [`Database`] is the synchronous handle over a `rusqlite::Connection` with
//! typed helpers for every table: key/value entries with optional expiry, the
//! two list projections (`messages_by_chat`, `chat_previews_by_owner`), the
//! chat registry and the ordered `pending_operations` queue.
//!
//! [`LocalCache`] wraps a shared `Database` for async callers, runs every
//! query on the blocking pool and broadcasts a [`CacheEvent`] after each
//! write so local read paths can be live streams.

pub mod cache;
pub mod chats;
pub mod database;
pub mod entries;
pub mod keys;
pub mod migrations;
pub mod pending;
pub mod projections;

mod error;

pub use cache::{CacheEvent, LocalCache};
pub use database::Database;
pub use error::{Result, StoreError};
