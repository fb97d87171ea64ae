//! Member types and identification
//!
//! TigerStyle: Validated identifiers, immutable member snapshots.

use crate::constants::{CLUSTER_MEMBERS_COUNT_MAX, MEMBER_ID_LENGTH_BYTES_MAX};
use crate::error::{Error, Result};
use crate::io::{RngProvider, StdRngProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a cluster member
///
/// Member IDs identify one incarnation of a process. A restarted process
/// must join with a fresh ID: members that left the topology are blocked
/// by ID and never re-admitted.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a new MemberId with validation
    ///
    /// # Errors
    /// Returns error if id is empty, too long, or contains invalid characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::invalid_member_id(id, "member ID cannot be empty"));
        }

        if id.len() > MEMBER_ID_LENGTH_BYTES_MAX {
            return Err(Error::invalid_member_id(
                id.clone(),
                format!(
                    "member ID length {} exceeds limit {}",
                    id.len(),
                    MEMBER_ID_LENGTH_BYTES_MAX
                ),
            ));
        }

        let valid = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid {
            return Err(Error::invalid_member_id(
                id,
                "member ID contains invalid characters",
            ));
        }

        Ok(Self(id))
    }

    /// Create a MemberId without validation (for internal use)
    ///
    /// # Safety
    /// Caller must ensure the ID is valid.
    #[doc(hidden)]
    pub fn new_unchecked(id: String) -> Self {
        debug_assert!(!id.is_empty());
        debug_assert!(id.len() <= MEMBER_ID_LENGTH_BYTES_MAX);
        Self(id)
    }

    /// Get the member ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a unique member ID based on hostname and random suffix
    ///
    /// Uses production RNG. For deterministic tests, use `generate_with_rng`.
    pub fn generate() -> Self {
        Self::generate_with_rng(&StdRngProvider::new())
    }

    /// Generate a unique member ID with injected RNG
    pub fn generate_with_rng(rng: &dyn RngProvider) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let suffix: u32 = rng.next_u64() as u32;
        let id = format!("{}-{:08x}", hostname, suffix);

        // Truncate if too long
        let truncated = if id.len() > MEMBER_ID_LENGTH_BYTES_MAX {
            id[..MEMBER_ID_LENGTH_BYTES_MAX].to_string()
        } else {
            id
        };

        Self::new_unchecked(truncated)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MemberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Immutable snapshot of one cluster member
///
/// Carries everything placement needs to know about a node: where to reach
/// it and which actor kinds it can host. Members are never mutated; a
/// topology change publishes a fresh set of snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member identifier
    pub id: MemberId,
    /// Host the member's endpoint is reachable at
    pub host: String,
    /// Port the member's endpoint listens on
    pub port: u16,
    /// Actor kinds this member can activate
    pub kinds: BTreeSet<String>,
}

impl Member {
    /// Create a new member snapshot
    pub fn new(
        id: MemberId,
        host: impl Into<String>,
        port: u16,
        kinds: impl IntoIterator<Item = String>,
    ) -> Self {
        let host = host.into();
        debug_assert!(!host.is_empty(), "member host must not be empty");

        Self {
            id,
            host,
            port,
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Get the member's address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether this member can host the given actor kind
    pub fn hosts_kind(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address())
    }
}

/// Compile-time assertion for cluster limit
const _: () = {
    assert!(CLUSTER_MEMBERS_COUNT_MAX >= 1);
    assert!(CLUSTER_MEMBERS_COUNT_MAX <= 10_000);
};
