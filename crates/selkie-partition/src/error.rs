//! Partition error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! Duplicate activations are deliberately absent: they are resolved
//! automatically by stopping the older instance, never surfaced as an
//! error.

use selkie_cluster::ClientError;
use thiserror::Error;

/// Partition-specific errors
#[derive(Error, Debug, Clone)]
pub enum PartitionError {
    /// Message carried a topology fingerprint the owner no longer serves
    #[error("stale topology: message keyed to {actual}, local is {expected}")]
    StaleTopology { expected: u64, actual: u64 },

    /// No members in the topology yet
    #[error("cluster has no members")]
    ClusterEmpty,

    /// No member hosts the requested kind
    #[error("no activator available for kind {kind}")]
    NoActivatorAvailable { kind: String },

    /// The activator rejected the identity
    #[error("identity {identity} rejected as invalid")]
    InvalidIdentity { identity: String },

    /// Activation request did not complete before the deadline
    #[error("spawn of {identity} timed out after {timeout_ms}ms")]
    SpawnTimeout { identity: String, timeout_ms: u64 },

    /// Activation request failed
    #[error("spawn of {identity} failed: {reason}")]
    SpawnFailed { identity: String, reason: String },

    /// The member a request targeted left the topology
    #[error("member {member_id} left before the request completed")]
    MemberLeft { member_id: String },

    /// The owner's mailbox is closed
    #[error("partition owner is shutting down")]
    ShuttingDown,

    /// Cross-member call failed
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl PartitionError {
    /// Create a spawn failed error
    pub fn spawn_failed(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StaleTopology { .. }
            | Self::SpawnTimeout { .. }
            | Self::MemberLeft { .. } => true,
            Self::Client(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Result type for partition operations
pub type PartitionResult<T> = std::result::Result<T, PartitionError>;
