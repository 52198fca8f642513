//! Key/value entries with optional expiry.
//!
//! An entry whose `expires_at` lies in the past is treated as absent and is
//! deleted by the read that finds it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{datetime_from_millis, Database};
use crate::error::Result;

/// Result of reading one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Vec<u8>),
    /// The entry had expired and was deleted by this read.
    Expired,
    Missing,
}

impl Lookup {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Expired | Self::Missing => None,
        }
    }
}

impl Database {
    /// Insert or overwrite an entry and record the write time for `key`, in
    /// one transaction.
    pub fn put_entry(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at.map(|t| t.timestamp_millis())],
        )?;
        touch_key(&tx, key, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Read an entry, evicting it if it has expired.
    pub fn get_entry(&self, key: &str, now: DateTime<Utc>) -> Result<Lookup> {
        let row: Option<(Vec<u8>, Option<i64>)> = self
            .conn()
            .query_row(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= now.timestamp_millis() => {
                tracing::debug!(key, "evicting expired cache entry");
                self.remove_entry(key)?;
                Ok(Lookup::Expired)
            }
            Some((value, _)) => Ok(Lookup::Hit(value)),
            None => Ok(Lookup::Missing),
        }
    }

    /// Delete an entry and its write time. Removing a missing key is not an
    /// error.
    pub fn remove_entry(&self, key: &str) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        tx.execute("DELETE FROM cache_timestamps WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every expired entry. Returns the number removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Drop all cached data: entries, write timestamps and both projections.
    ///
    /// The pending-operation queue and the chat registry are not cache and
    /// are left untouched.
    pub fn clear_all(&mut self) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute_batch(
            "DELETE FROM cache_entries;
             DELETE FROM cache_timestamps;
             DELETE FROM messages_by_chat;
             DELETE FROM chat_previews_by_owner;",
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn last_written_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn()
            .query_row(
                "SELECT written_at FROM cache_timestamps WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match millis {
            Some(ms) => Ok(Some(datetime_from_millis(0, ms)?)),
            None => Ok(None),
        }
    }

    /// Whether the data under `key` is older than `max_age`.  A key that was
    /// never written is stale.
    pub fn is_data_stale(
        &self,
        key: &str,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(match self.last_written_at(key)? {
            Some(written_at) => now - written_at > max_age,
            None => true,
        })
    }
}

/// Record `now` as the last write time for `key`.  Takes the connection
/// (or open transaction) the data itself was written through.
pub(crate) fn touch_key(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO cache_timestamps (key, written_at) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET written_at = excluded.written_at",
        params![key, now.timestamp_millis()],
    )?;
    Ok(())
}
