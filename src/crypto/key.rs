//! Key handles.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::arena::{SecureArena, SlotId};
use crate::error::{Result, SecurityError};

/// Supported and recognised key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// AES-GCM, 128 or 256 bits.
    Aes,
    /// ChaCha20-Poly1305, 256 bits.
    ChaCha20,
    /// HMAC-SHA256, 128..=512 bits.
    Hmac,
    /// Ed25519 signatures.
    Ed25519,
    /// Recognised but not implemented.
    Rsa,
    /// Recognised but not implemented.
    Ecdsa,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Aes => "aes",
            Algorithm::ChaCha20 => "chacha20",
            Algorithm::Hmac => "hmac-sha256",
            Algorithm::Ed25519 => "ed25519",
            Algorithm::Rsa => "rsa",
            Algorithm::Ecdsa => "ecdsa",
        };
        f.write_str(name)
    }
}

/// Role of the key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Secret key shared by both ends.
    Symmetric,
    /// Public half of a key pair.
    AsymmetricPublic,
    /// Private half of a key pair.
    AsymmetricPrivate,
}

/// Shared key handle. The handle count is the key's reference count.
pub type Key = Arc<CryptoKey>;

/// A key whose material lives in a [`SecureArena`] slot.
///
/// Dropping the last handle zeroes the slot.
pub struct CryptoKey {
    pub(crate) id: String,
    pub(crate) algorithm: Algorithm,
    pub(crate) key_type: KeyType,
    pub(crate) bits: u32,
    pub(crate) len: usize,
    pub(crate) slot: SlotId,
    pub(crate) arena: Arc<SecureArena>,
    pub(crate) created: u64,
    pub(crate) expires: Option<u64>,
}

impl CryptoKey {
    /// Unique key id (32 hex characters).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Key type.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key length in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Creation time, microseconds.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Expiry time, microseconds.
    pub fn expires(&self) -> Option<u64> {
        self.expires
    }

    /// Whether the key is past its expiry at `now` (microseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|e| now >= e)
    }

    /// Arena slot holding the material.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Number of live handles, including `key` itself.
    pub fn ref_count(key: &Key) -> usize {
        Arc::strong_count(key)
    }

    /// Run `f` over the key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the arena lock is poisoned.
    pub fn with_material<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.arena.read(self.slot, self.len, f)
    }

    pub(crate) fn require_type(&self, expected: KeyType, operation: &str) -> Result<()> {
        if self.key_type != expected {
            return Err(SecurityError::InvalidParameter(format!(
                "{operation} requires a {expected:?} key"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("key_type", &self.key_type)
            .field("bits", &self.bits)
            .field("material", &"__REDACTED__")
            .finish()
    }
}

impl Drop for CryptoKey {
    fn drop(&mut self) {
        self.arena.release(self.slot);
        tracing::debug!(key_id = %self.id, "key material destroyed");
    }
}
