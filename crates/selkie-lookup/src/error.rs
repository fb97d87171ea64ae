//! Lookup error types
//!
//! TigerStyle: Explicit error variants with context.

use selkie_cluster::ClientError;
use thiserror::Error;

/// Storage-backed lookup errors
#[derive(Error, Debug, Clone)]
pub enum LookupError {
    /// Lock vanished or was superseded by a newer holder
    #[error("spawn lock for {identity} not found or superseded")]
    LockNotFound { identity: String },

    /// Storage backend failed
    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    /// No member hosts the requested kind
    #[error("no activator available for kind {kind}")]
    NoActivatorAvailable { kind: String },

    /// The worker pool is shutting down
    #[error("lookup worker pool is shutting down")]
    ShuttingDown,

    /// Cross-member call failed
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl LookupError {
    /// Create a lock-not-found error
    pub fn lock_not_found(identity: impl Into<String>) -> Self {
        Self::LockNotFound {
            identity: identity.into(),
        }
    }

    /// Create a storage unavailable error
    pub fn storage_unavailable(reason: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StorageUnavailable { .. } => true,
            Self::Client(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Result type for lookup operations
pub type LookupResult<T> = std::result::Result<T, LookupError>;
