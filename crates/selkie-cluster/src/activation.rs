//! Activation records
//!
//! TigerStyle: Explicit placement records with value semantics.

use selkie_core::{ClusterIdentity, MemberId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concrete location of one live actor process
///
/// A PID names a single spawned instance: the endpoint address of the
/// hosting process plus a per-process sequence number. Two spawns of the
/// same identity always produce different PIDs, which is what lets
/// conflict resolution tell "exactly the instance I knew about" apart
/// from a newer replacement.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pid {
    /// Endpoint address of the hosting process ("host:port")
    pub address: String,
    /// Per-process spawn sequence number
    pub sequence: u64,
}

impl Pid {
    /// Create a new PID
    pub fn new(address: impl Into<String>, sequence: u64) -> Self {
        let address = address.into();
        debug_assert!(!address.is_empty(), "pid address must not be empty");
        Self { address, sequence }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.sequence)
    }
}

/// The live mapping from one identity to its running instance
///
/// Created when a spawn succeeds; removed on termination, eviction, or
/// when the hosting member leaves the topology. Owned exclusively by the
/// partition owner whose ring computation currently selects the identity,
/// or recorded in external storage for the storage-backed variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    /// The identity this activation serves
    pub identity: ClusterIdentity,
    /// Where the instance runs
    pub pid: Pid,
    /// The member hosting the instance
    pub hosted_on: MemberId,
}

impl Activation {
    /// Create a new activation record
    pub fn new(identity: ClusterIdentity, pid: Pid, hosted_on: MemberId) -> Self {
        Self {
            identity,
            pid,
            hosted_on,
        }
    }

    /// Check whether this activation runs on the given member
    pub fn is_hosted_on(&self, member_id: &MemberId) -> bool {
        &self.hosted_on == member_id
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} on {}", self.identity, self.pid, self.hosted_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> ClusterIdentity {
        ClusterIdentity::new("order", "42").unwrap()
    }

    #[test]
    fn test_pid_equality() {
        let a = Pid::new("127.0.0.1:8001", 1);
        let b = Pid::new("127.0.0.1:8001", 1);
        let c = Pid::new("127.0.0.1:8001", 2);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pid_display() {
        let pid = Pid::new("127.0.0.1:8001", 7);
        assert_eq!(format!("{}", pid), "127.0.0.1:8001#7");
    }

    #[test]
    fn test_activation_hosted_on() {
        let member = MemberId::new("member-1").unwrap();
        let other = MemberId::new("member-2").unwrap();
        let activation = Activation::new(test_identity(), Pid::new("127.0.0.1:8001", 1), member.clone());

        assert!(activation.is_hosted_on(&member));
        assert!(!activation.is_hosted_on(&other));
    }

    #[test]
    fn test_activation_serde_round_trip() {
        let activation = Activation::new(
            test_identity(),
            Pid::new("127.0.0.1:8001", 1),
            MemberId::new("member-1").unwrap(),
        );
        let json = serde_json::to_string(&activation).unwrap();
        let back: Activation = serde_json::from_str(&json).unwrap();
        assert_eq!(activation, back);
    }
}
