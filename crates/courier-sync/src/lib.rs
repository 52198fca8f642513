//! # courier-sync
//!
//! Offline-first synchronization core of the Courier chat client.
//!
//! - [`connectivity`]: process-wide online state, one writer, many readers.
//! - [`remote`]: the realtime backend interface and an in-memory backend.
//! - [`sync_manager`]: durable pending-operation queue with FIFO replay.
//! - [`offline_first`]: cache-then-network reads and the shared write path.
//! - [`repository`]: chat operations routed to the local or remote source.
//! - [`runtime`]: wiring for all of the above.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod offline_first;
pub mod remote;
pub mod repository;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod subscription;
pub mod sync_manager;
pub mod telemetry;

pub use config::SyncConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivityPublisher};
pub use error::{RemoteError, Result, SyncError};
pub use offline_first::{FetchPolicy, OfflineFirstRepository, WriteOutcome};
pub use remote::{Filter, MemoryRemoteStore, RemoteStore, Snapshot};
pub use repository::RealtimeChatRepository;
pub use retry::RetryPolicy;
pub use runtime::ChatRuntime;
pub use subscription::Subscription;
pub use sync_manager::{AbandonedOperation, OperationReplayer, SyncManager, SyncReport};
