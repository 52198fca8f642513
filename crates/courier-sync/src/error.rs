use std::time::Duration;

use courier_shared::{Chat, SharedError};
use courier_store::StoreError;
use thiserror::Error;

/// Failures reported by a [`RemoteStore`](crate::remote::RemoteStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend could not be reached.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but refused the request.
    #[error("Remote store rejected {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error("Invalid remote path: {0:?}")]
    InvalidPath(String),
}

/// Errors produced by the sync layer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local storage failed.
    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    /// Nothing cached and no connectivity.
    #[error("Offline and no cached data available")]
    Offline,

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The write was applied locally but the remote write failed; the
    /// operation is waiting in the pending queue.
    #[error("Saved locally, not yet synced ({operation_id}): {reason}")]
    RemoteWrite { operation_id: String, reason: String },

    /// A network call exceeded the configured timeout.
    #[error("Network operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write addressed a chat the remote store does not have.
    #[error("Chat {0} does not exist remotely")]
    MissingChat(String),

    /// A chat created locally turned out to exist remotely under another id.
    #[error("Chat {chat_id} already exists remotely as {existing}")]
    ChatExists { chat_id: String, existing: Box<Chat> },

    /// A queued operation hit its attempt ceiling and was dropped.
    #[error("Operation {operation_id} abandoned after {attempts} attempts: {reason}")]
    Abandoned {
        operation_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Model error: {0}")]
    Shared(#[from] SharedError),
}

impl SyncError {
    /// Whether this is a transient network failure worth retrying.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Remote(RemoteError::Unavailable(_)) | Self::RemoteWrite { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_failures() {
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_network());
        assert!(SyncError::from(RemoteError::Unavailable("down".into())).is_network());
        assert!(!SyncError::from(RemoteError::InvalidPath("".into())).is_network());
        assert!(!SyncError::Offline.is_network());
        assert!(!SyncError::from(StoreError::NotFound).is_network());
        assert!(!SyncError::MissingChat("c1".into()).is_network());
        assert!(!SyncError::from(RemoteError::Rejected {
            path: "chats/c1".into(),
            reason: "denied".into(),
        })
        .is_network());
    }
}
