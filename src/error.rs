//! Error taxonomy shared by every security component.
//!
//! Deny outcomes from the MAC engine, packet filter and sandbox are ordinary
//! return values ([`crate::types::Decision`], [`crate::netfilter::Verdict`]),
//! not errors. [`SecurityError`] covers malformed input, exhausted tables,
//! store lookups and internal failures.

use thiserror::Error;

/// Errors returned by the security framework.
///
/// Messages never carry key material, rule contents, or raw addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// Malformed or missing input. Always checked before any state changes.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A bounded table (rules, keys, arena slots) has no room left.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// Lookup of a key, rule or allocation that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Insert of an id that is already present. The existing entry is kept.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Algorithm or operation not implemented by this framework.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Operation refused by policy.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Integrity check failed (authentication tag, heap metadata, audit seal).
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    /// The key exists but is past its expiry time.
    #[error("key expired: {0}")]
    KeyExpired(String),
    /// A component lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SecurityError>;

impl SecurityError {
    /// Build a [`SecurityError::LockPoisoned`] naming the component whose lock failed.
    pub(crate) fn poisoned(component: &str, err: impl std::fmt::Display) -> Self {
        Self::LockPoisoned(format!("{component} lock poisoned: {err}"))
    }
}
