//! Pending-operation queue and its replay.
//!
//! Operations are replayed strictly in enqueue order.  A head failing on the
//! network stays at the head, waiting out the backoff delay, until it
//! succeeds or reaches the attempt ceiling; only then does the next
//! operation get a turn.  Any other failure can never succeed on retry and
//! abandons the operation at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_shared::{ChatWrite, PendingOperation};
use courier_store::LocalCache;

use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::{Result, SyncError};
use crate::retry::{with_timeout, RetryPolicy};

/// Sends a queued write to the remote side.  Must be the same path a live
/// write takes so replay and foreground writes behave identically.
#[async_trait]
pub trait OperationReplayer: Send + Sync {
    async fn replay(&self, write: &ChatWrite) -> Result<()>;
}

/// Terminal failure of a queued operation, reported once.
#[derive(Debug, Clone)]
pub struct AbandonedOperation {
    pub operation: PendingOperation,
    pub attempts: u32,
    pub reason: String,
}

impl AbandonedOperation {
    pub fn to_error(&self) -> SyncError {
        SyncError::Abandoned {
            operation_id: self.operation.id.clone(),
            attempts: self.attempts,
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one drain of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Operations confirmed by the remote side and removed.
    pub replayed: usize,
    /// Operations dropped after reaching the attempt ceiling.
    pub abandoned: usize,
    /// Operations still queued when the drain stopped.
    pub remaining: usize,
    /// The drain stopped early because connectivity was lost.
    pub interrupted: bool,
}

struct Inner {
    cache: LocalCache,
    replayer: Arc<dyn OperationReplayer>,
    connectivity: Connectivity,
    policy: RetryPolicy,
    network_timeout: Duration,
    drain: Mutex<()>,
    abandoned: broadcast::Sender<AbandonedOperation>,
}

/// Owns the durable queue of writes awaiting remote confirmation.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(
        cache: LocalCache,
        replayer: Arc<dyn OperationReplayer>,
        connectivity: Connectivity,
        policy: RetryPolicy,
        network_timeout: Duration,
    ) -> Self {
        let (abandoned, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                cache,
                replayer,
                connectivity,
                policy,
                network_timeout,
                drain: Mutex::new(()),
                abandoned,
            }),
        }
    }

    /// Durably append an operation.  An id already in the queue is a no-op
    /// and returns `false`.
    pub async fn queue_operation(&self, op: PendingOperation) -> Result<bool> {
        let id = op.id.clone();
        let op_type = op.op_type;
        let added = self.inner.cache.enqueue_operation(op).await?;
        if added {
            info!(operation_id = %id, op_type = %op_type, "operation queued");
        } else {
            debug!(operation_id = %id, "operation already queued");
        }
        Ok(added)
    }

    pub async fn has_pending_operations(&self) -> Result<bool> {
        Ok(self.pending_operation_count().await? > 0)
    }

    pub async fn pending_operation_count(&self) -> Result<usize> {
        Ok(self.inner.cache.pending_operation_count().await?)
    }

    /// Queued operations in replay order.
    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.inner.cache.pending_operations().await?)
    }

    /// Whether any queued operation targets `chat_id`.  Writes to such a
    /// chat must queue behind them instead of overtaking them.
    pub async fn has_pending_for_chat(&self, chat_id: &str) -> Result<bool> {
        Ok(self
            .pending_operations()
            .await?
            .iter()
            .any(|op| match op.to_write() {
                Ok(write) => write.chat_id() == Some(chat_id),
                Err(_) => false,
            }))
    }

    /// Every abandoned operation is sent here exactly once.
    pub fn subscribe_abandoned(&self) -> broadcast::Receiver<AbandonedOperation> {
        self.inner.abandoned.subscribe()
    }

    /// Drain the queue now.  Concurrent calls wait for each other; the
    /// drain stops as soon as connectivity is lost.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let _drain = self.inner.drain.lock().await;
        let mut report = SyncReport::default();

        loop {
            if !self.inner.connectivity.is_online() {
                report.interrupted = true;
                break;
            }
            let Some(op) = self.inner.cache.head_operation().await? else {
                break;
            };

            let write = match op.to_write() {
                Ok(write) => write,
                Err(e) => {
                    // An undecodable payload can never succeed.
                    let attempts = op.attempts;
                    self.abandon(op, attempts, e.to_string()).await?;
                    report.abandoned += 1;
                    continue;
                }
            };

            debug!(operation_id = %op.id, attempt = op.attempts + 1, "replaying operation");
            let result = with_timeout(
                self.inner.network_timeout,
                self.inner.replayer.replay(&write),
            )
            .await;

            match result {
                Ok(()) => {
                    self.inner.cache.remove_operation(&op.id).await?;
                    report.replayed += 1;
                    debug!(operation_id = %op.id, "operation replayed");
                }
                Err(SyncError::ChatExists { chat_id, existing }) => {
                    // The pair already has a chat: adopt it and move this
                    // chat's queued writes over before they replay.
                    info!(
                        operation_id = %op.id,
                        chat_id = %chat_id,
                        existing = %existing.id,
                        "chat exists remotely, merging"
                    );
                    self.inner.cache.merge_chat(&chat_id, *existing).await?;
                    self.inner.cache.remove_operation(&op.id).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    let reason = e.to_string();
                    let attempts = self
                        .inner
                        .cache
                        .record_failed_attempt(&op.id, &reason)
                        .await?;

                    if !e.is_network() || self.inner.policy.exhausted(attempts) {
                        self.abandon(op, attempts, reason).await?;
                        report.abandoned += 1;
                        continue;
                    }

                    let delay = self.inner.policy.delay_for(attempts);
                    warn!(
                        operation_id = %op.id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "replay failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report.remaining = self.pending_operation_count().await?;
        report.interrupted = report.interrupted && report.remaining > 0;
        Ok(report)
    }

    async fn abandon(&self, operation: PendingOperation, attempts: u32, reason: String) -> Result<()> {
        self.inner.cache.remove_operation(&operation.id).await?;
        error!(
            operation_id = %operation.id,
            op_type = %operation.op_type,
            attempts,
            error = %reason,
            "operation abandoned"
        );
        let _ = self.inner.abandoned.send(AbandonedOperation {
            operation,
            attempts,
            reason,
        });
        Ok(())
    }

    /// Spawn the replay worker: drains the queue at start when online and on
    /// every offline to online transition after that.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut online = self.inner.connectivity.observe_online();
        tokio::spawn(async move {
            let mut was_online = false;
            while let Some(is_online) = online.recv().await {
                if is_online && !was_online {
                    match manager.sync_now().await {
                        Ok(report) => info!(
                            replayed = report.replayed,
                            abandoned = report.abandoned,
                            remaining = report.remaining,
                            "replay finished"
                        ),
                        Err(e) => error!(error = %e, "replay failed"),
                    }
                }
                was_online = is_online;
            }
            debug!("replay worker stopped");
        })
    }
}
