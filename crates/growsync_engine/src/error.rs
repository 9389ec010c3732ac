//! Error types for the sync engine.

use growsync_protocol::{EntityKind, ProtocolError};
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for replica operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server refused the caller's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server refused the request as invalid.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Server-side failure.
    #[error("server error: {0}")]
    ServerError(String),

    /// The server answered a push with `success = false`.
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// Local replica failure.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another cycle is already running on this engine.
    #[error("a sync cycle is already in progress")]
    SyncInProgress,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Errors raised by a local replica.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// No live row with this id.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity.
        entity: EntityKind,
        /// Row id.
        id: Uuid,
    },

    /// A live row with this id already exists.
    #[error("{entity} {id} already exists")]
    AlreadyExists {
        /// Entity.
        entity: EntityKind,
        /// Row id.
        id: Uuid,
    },

    /// The entity has no tombstones, so deletions cannot be synced.
    #[error("{0} rows cannot be deleted")]
    NotDeletable(EntityKind),

    /// Stored data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for ReplicaError {
    fn from(err: ProtocolError) -> Self {
        ReplicaError::Codec(err.to_string())
    }
}
