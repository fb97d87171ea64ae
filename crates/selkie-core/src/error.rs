//! Error types for Selkie core
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid cluster identity: {identity}, reason: {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("identity id too long: {length} bytes exceeds limit of {limit} bytes")]
    IdentityIdTooLong { length: usize, limit: usize },

    #[error("invalid member ID: {id}, reason: {reason}")]
    InvalidMemberId { id: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create an invalid identity error
    pub fn invalid_identity(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid member ID error
    pub fn invalid_member_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMemberId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
