//! Cluster error types
//!
//! TigerStyle: Explicit error variants with context.

use selkie_core::MemberId;
use thiserror::Error;

/// Topology tracking errors
#[derive(Error, Debug)]
pub enum TopologyError {
    /// The local member was removed or blocked by the new topology.
    ///
    /// The process no longer trusts its own membership and must shut down.
    #[error("local member {member_id} was evicted from the topology")]
    SelfEvicted { member_id: String },

    /// Member list exceeds the cluster size limit
    #[error("member count {count} exceeds limit {limit}")]
    TooManyMembers { count: usize, limit: usize },
}

impl TopologyError {
    /// Create a self-evicted error
    pub fn self_evicted(member_id: &MemberId) -> Self {
        Self::SelfEvicted {
            member_id: member_id.to_string(),
        }
    }
}

/// Errors from cross-member calls
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Target member not reachable
    #[error("member {member_id} not reachable: {reason}")]
    Unreachable { member_id: String, reason: String },

    /// Call did not complete before the deadline
    #[error("call to {member_id} timed out after {timeout_ms}ms")]
    Timeout { member_id: String, timeout_ms: u64 },

    /// Remote side reported failure
    #[error("call to {member_id} failed: {reason}")]
    Failed { member_id: String, reason: String },

    /// Remote side rejected the identity as invalid
    #[error("member {member_id} rejected identity {identity} as invalid")]
    InvalidIdentity { member_id: String, identity: String },
}

impl ClientError {
    /// Create an unreachable error
    pub fn unreachable(member_id: &MemberId, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            member_id: member_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(member_id: &MemberId, timeout_ms: u64) -> Self {
        Self::Timeout {
            member_id: member_id.to_string(),
            timeout_ms,
        }
    }

    /// Create a failed error
    pub fn failed(member_id: &MemberId, reason: impl Into<String>) -> Self {
        Self::Failed {
            member_id: member_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

/// Result type for cluster operations
pub type ClusterResult<T> = std::result::Result<T, TopologyError>;
