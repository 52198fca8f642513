//! Generic "cached value with network refresh" orchestration, plus the
//! write path shared by every mutating operation.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use courier_shared::PendingOperation;
use courier_store::LocalCache;

use crate::connectivity::Connectivity;
use crate::error::{Result, SyncError};
use crate::retry::with_timeout;
use crate::subscription::Subscription;
use crate::sync_manager::SyncManager;

/// When a cached value should be refreshed from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Always fetch when online.
    #[default]
    AlwaysRefresh,
    /// Skip the fetch while the cached value is younger than the given age.
    RefreshIfStale(Duration),
}

/// How far a write got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied locally while offline; queued for replay on reconnect.
    LocalOnly,
    /// Applied locally and confirmed by the remote store.
    Synced,
    /// Applied locally, the remote write failed; queued for retry.
    QueuedForRetry { operation_id: String, reason: String },
}

impl WriteOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// For callers that want a failed remote write as an error.  The write
    /// is still saved locally and queued either way.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::QueuedForRetry {
                operation_id,
                reason,
            } => Err(SyncError::RemoteWrite {
                operation_id,
                reason,
            }),
            other => Ok(other),
        }
    }
}

#[derive(Clone)]
pub struct OfflineFirstRepository {
    cache: LocalCache,
    connectivity: Connectivity,
    sync: SyncManager,
    network_timeout: Duration,
}

impl OfflineFirstRepository {
    pub fn new(
        cache: LocalCache,
        connectivity: Connectivity,
        sync: SyncManager,
        network_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            connectivity,
            sync,
            network_timeout,
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Emit the cached value (if any), then the fetched one (if online and
    /// the fetch succeeds).  A fetch failure is only emitted when nothing
    /// cached was emitted first; offline with an empty cache emits
    /// [`SyncError::Offline`].  The stream ends after at most two items.
    pub fn get_data_offline_first<T, N, NF, S, SF, R, RF>(
        &self,
        cache_key: &str,
        network_fetch: N,
        cache_store: S,
        cache_retrieve: R,
    ) -> Subscription<Result<T>>
    where
        T: Clone + Send + 'static,
        N: FnOnce() -> NF + Send + 'static,
        NF: Future<Output = Result<T>> + Send,
        S: FnOnce(T) -> SF + Send + 'static,
        SF: Future<Output = Result<()>> + Send,
        R: FnOnce() -> RF + Send + 'static,
        RF: Future<Output = Result<Option<T>>> + Send,
    {
        self.get_data_offline_first_with(
            cache_key,
            FetchPolicy::AlwaysRefresh,
            network_fetch,
            cache_store,
            cache_retrieve,
        )
    }

    pub fn get_data_offline_first_with<T, N, NF, S, SF, R, RF>(
        &self,
        cache_key: &str,
        policy: FetchPolicy,
        network_fetch: N,
        cache_store: S,
        cache_retrieve: R,
    ) -> Subscription<Result<T>>
    where
        T: Clone + Send + 'static,
        N: FnOnce() -> NF + Send + 'static,
        NF: Future<Output = Result<T>> + Send,
        S: FnOnce(T) -> SF + Send + 'static,
        SF: Future<Output = Result<()>> + Send,
        R: FnOnce() -> RF + Send + 'static,
        RF: Future<Output = Result<Option<T>>> + Send,
    {
        let key = cache_key.to_string();
        let cache = self.cache.clone();
        let connectivity = self.connectivity.clone();
        let timeout = self.network_timeout;

        Subscription::spawn(move |tx| async move {
            let mut emitted = false;
            let mut cache_error = None;

            match cache_retrieve().await {
                Ok(Some(value)) => {
                    emitted = true;
                    if tx.send(Ok(value)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "cache read failed");
                    cache_error = Some(e);
                }
            }

            if let FetchPolicy::RefreshIfStale(max_age) = policy {
                if emitted && !cache.is_data_stale(&key, max_age).await {
                    debug!(key = %key, "cached value is fresh, skipping fetch");
                    return;
                }
            }

            if !connectivity.is_online() {
                if !emitted {
                    let _ = tx.send(Err(cache_error.unwrap_or(SyncError::Offline)));
                }
                return;
            }

            match with_timeout(timeout, network_fetch()).await {
                Ok(value) => {
                    if let Err(e) = cache_store(value.clone()).await {
                        warn!(key = %key, error = %e, "failed to cache fetched value");
                    }
                    let _ = tx.send(Ok(value));
                }
                Err(e) if emitted => {
                    debug!(key = %key, error = %e, "refresh failed, keeping cached value");
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        })
    }

    /// Apply `local_update`, then `network_update` when online.
    ///
    /// The local update is authoritative: if it fails its error is returned
    /// and nothing else happens.  Offline, the operation is queued without
    /// touching the network.  Online, a failed or timed-out network update
    /// queues the operation for retry, and so does any write to a chat that
    /// still has queued operations.
    pub async fn perform_write_operation<L, LF, N, NF>(
        &self,
        operation: PendingOperation,
        local_update: L,
        network_update: N,
    ) -> Result<WriteOutcome>
    where
        L: FnOnce() -> LF,
        LF: Future<Output = Result<()>>,
        N: FnOnce() -> NF,
        NF: Future<Output = Result<()>>,
    {
        local_update().await?;

        if !self.connectivity.is_online() {
            self.sync.queue_operation(operation).await?;
            return Ok(WriteOutcome::LocalOnly);
        }

        // Earlier writes to the same chat are still queued: going straight
        // to the network would overtake them.
        let chat_id = operation
            .to_write()
            .ok()
            .and_then(|write| write.chat_id().map(str::to_string));
        if let Some(chat_id) = chat_id {
            if self.sync.has_pending_for_chat(&chat_id).await? {
                debug!(
                    operation_id = %operation.id,
                    chat_id = %chat_id,
                    "chat has queued writes, queueing behind them"
                );
                let operation_id = operation.id.clone();
                self.sync.queue_operation(operation).await?;
                return Ok(WriteOutcome::QueuedForRetry {
                    operation_id,
                    reason: format!("waiting for queued writes to chat {chat_id}"),
                });
            }
        }

        match with_timeout(self.network_timeout, network_update()).await {
            Ok(()) => Ok(WriteOutcome::Synced),
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    operation_id = %operation.id,
                    op_type = %operation.op_type,
                    error = %reason,
                    "remote write failed, queued for retry"
                );
                let operation_id = operation.id.clone();
                self.sync.queue_operation(operation).await?;
                Ok(WriteOutcome::QueuedForRetry {
                    operation_id,
                    reason,
                })
            }
        }
    }
}
