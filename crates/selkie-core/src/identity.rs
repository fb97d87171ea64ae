//! Cluster identity
//!
//! TigerStyle: Explicit types, assertions, validated construction.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Location-independent address of a virtual actor
///
/// A cluster identity is a `(kind, id)` pair. The kind names the actor
/// implementation ("order", "player", ...); the id names the logical
/// instance. Identities are value types: equality and hashing are by
/// value, and the identity never encodes where the actor currently runs.
///
/// # TigerStyle
/// - Explicit validation on construction
/// - Immutable after creation
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    kind: String,
    id: String,
}

impl ClusterIdentity {
    /// Create a new ClusterIdentity with validation
    ///
    /// # Errors
    /// Returns error if kind or id is empty, exceeds length limits, or
    /// contains invalid characters.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let kind = kind.into();
        let id = id.into();

        if kind.is_empty() {
            return Err(Error::invalid_identity(
                format!("{}/{}", kind, id),
                "kind must not be empty",
            ));
        }

        if id.is_empty() {
            return Err(Error::invalid_identity(
                format!("{}/{}", kind, id),
                "id must not be empty",
            ));
        }

        if kind.len() > IDENTITY_KIND_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identity(
                format!("{}/{}", kind, id),
                format!(
                    "kind length {} exceeds limit {}",
                    kind.len(),
                    IDENTITY_KIND_LENGTH_BYTES_MAX
                ),
            ));
        }

        if id.len() > IDENTITY_ID_LENGTH_BYTES_MAX {
            return Err(Error::IdentityIdTooLong {
                length: id.len(),
                limit: IDENTITY_ID_LENGTH_BYTES_MAX,
            });
        }

        // Validate characters (alphanumeric, dash, underscore, dot)
        let valid_chars = |s: &str| {
            s.chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        };

        if !valid_chars(&kind) {
            return Err(Error::invalid_identity(
                format!("{}/{}", kind, id),
                "kind contains invalid characters",
            ));
        }

        if !valid_chars(&id) {
            return Err(Error::invalid_identity(
                format!("{}/{}", kind, id),
                "id contains invalid characters",
            ));
        }

        Ok(Self { kind, id })
    }

    /// Create a ClusterIdentity without validation (for internal use only)
    ///
    /// # Safety
    /// Caller must ensure kind and id are valid.
    #[doc(hidden)]
    pub fn new_unchecked(kind: String, id: String) -> Self {
        debug_assert!(!kind.is_empty());
        debug_assert!(kind.len() <= IDENTITY_KIND_LENGTH_BYTES_MAX);
        debug_assert!(id.len() <= IDENTITY_ID_LENGTH_BYTES_MAX);
        Self { kind, id }
    }

    /// Get the kind
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Get the id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the full qualified name (kind/id)
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }

    /// Convert to bytes for storage keys and hashing
    pub fn to_key_bytes(&self) -> Vec<u8> {
        let qualified = self.qualified_name();
        debug_assert!(
            qualified.len() <= IDENTITY_KIND_LENGTH_BYTES_MAX + IDENTITY_ID_LENGTH_BYTES_MAX + 1
        );
        qualified.into_bytes()
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
