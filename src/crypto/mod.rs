//! Cryptographic key service.
//!
//! Generates, derives, stores and uses keys. Material lives in a
//! [`SecureArena`] slot owned by the key handle; dropping the last handle
//! zeroes the slot. Primitive math comes from the RustCrypto and dalek
//! crates, this module only orchestrates them.

pub mod arena;
pub mod entropy;
pub mod key;
pub mod ops;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Builder;
use zeroize::Zeroize;

pub use arena::{SecureArena, SlotId, SLOT_SIZE};
pub use entropy::SecureRandom;
pub use key::{Algorithm, CryptoKey, Key, KeyType};
pub use ops::HashAlgorithm;
pub use store::{KeyEntryInfo, KeyStore, StoreRejected};

use crate::audit::AuditLog;
use crate::error::{Result, SecurityError};
use crate::types::{Clock, EventKind, SecurityEvent, Severity, MICROS_PER_SEC};

/// Store id of the default AES-256 master key.
pub const SYSTEM_MASTER_KEY: &str = "system_master_key";

/// Store id of the default Ed25519 signing key.
pub const SYSTEM_SIGNING_KEY: &str = "system_signing_key";

const CRYPTO_EVENT_SEVERITY: Severity = Severity::clamped(2);

/// Read-only counters for the key service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyServiceStats {
    /// Keys generated, derived or extracted.
    pub keys_generated: u64,
    /// Keys currently in the store.
    pub keys_stored: usize,
    /// Arena slots holding material.
    pub slots_in_use: usize,
    /// Arena size.
    pub slots_total: usize,
    /// Keys whose material has been zeroed and released.
    pub keys_destroyed: u64,
    /// Whether a hardware RNG is mixed in.
    pub hardware_rng: bool,
}

/// Key generation, storage and use.
pub struct KeyService {
    random: Arc<SecureRandom>,
    arena: Arc<SecureArena>,
    store: KeyStore,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLog>>,
    generated: AtomicU64,
}

impl std::fmt::Debug for KeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyService")
            .field("keys_stored", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl KeyService {
    /// Build a service with an arena of `arena_slots` slots and a store of
    /// the same capacity.
    pub fn new(random: Arc<SecureRandom>, arena_slots: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            random,
            arena: Arc::new(SecureArena::new(arena_slots)),
            store: KeyStore::new(arena_slots),
            clock,
            audit: None,
            generated: AtomicU64::new(0),
        }
    }

    /// Emit key lifecycle events into `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The arena backing every key from this service.
    pub fn arena(&self) -> &Arc<SecureArena> {
        &self.arena
    }

    /// Generate a fresh key.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for `bits == 0` or a malformed HMAC size.
    /// - [`SecurityError::NotSupported`] for RSA, ECDSA and unsupported sizes.
    /// - [`SecurityError::OutOfMemory`] when the arena is full.
    pub fn generate_key(&self, algorithm: Algorithm, bits: u32) -> Result<Key> {
        self.generate_inner(algorithm, bits, None)
    }

    /// Generate a key that expires `ttl_secs` seconds from now.
    ///
    /// # Errors
    ///
    /// Same as [`KeyService::generate_key`].
    pub fn generate_key_with_expiry(
        &self,
        algorithm: Algorithm,
        bits: u32,
        ttl_secs: u64,
    ) -> Result<Key> {
        let expires = self
            .clock
            .now_micros()
            .saturating_add(ttl_secs.saturating_mul(MICROS_PER_SEC));
        self.generate_inner(algorithm, bits, Some(expires))
    }

    fn generate_inner(&self, algorithm: Algorithm, bits: u32, expires: Option<u64>) -> Result<Key> {
        let key_type = key_type_for(algorithm, bits)?;
        let len = byte_len(bits)?;
        let mut material = vec![0u8; len];
        self.random.fill(&mut material)?;
        let built = self.build_key(algorithm, key_type, bits, &material, expires);
        material.zeroize();
        let key = built?;
        info!(key_id = %key.id(), %algorithm, bits, "key generated");
        self.audit_event(format!("key generated: algorithm={algorithm}, bits={bits}"), key.id(), "generate");
        Ok(key)
    }

    fn build_key(
        &self,
        algorithm: Algorithm,
        key_type: KeyType,
        bits: u32,
        material: &[u8],
        expires: Option<u64>,
    ) -> Result<Key> {
        let mut id_bytes = [0u8; 16];
        self.random.fill(&mut id_bytes)?;
        let id = Builder::from_random_bytes(id_bytes)
            .into_uuid()
            .simple()
            .to_string();
        let slot = self.arena.allocate(material)?;
        self.generated.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(CryptoKey {
            id,
            algorithm,
            key_type,
            bits,
            len: material.len(),
            slot,
            arena: Arc::clone(&self.arena),
            created: self.clock.now_micros(),
            expires,
        }))
    }

    /// Derive a key from `master` with HKDF-SHA256.
    ///
    /// The derived material is a pure function of the master material and
    /// `info`; the derived key gets a fresh id.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for non-symmetric masters or empty `info`.
    pub fn derive_key(&self, master: &Key, info: &[u8]) -> Result<Key> {
        if info.is_empty() {
            return Err(SecurityError::InvalidParameter(
                "derivation info is empty".to_owned(),
            ));
        }
        let len = byte_len(master.bits())?;
        let material = ops::derive(master, info, len)?;
        let key = self.build_key(
            master.algorithm(),
            KeyType::Symmetric,
            master.bits(),
            &material,
            master.expires(),
        )?;
        debug!(key_id = %key.id(), master_id = %master.id(), "key derived");
        Ok(key)
    }

    /// Extract the public half of an Ed25519 private key.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotSupported`] for other algorithms and
    /// [`SecurityError::InvalidParameter`] for public keys.
    pub fn public_key(&self, private: &Key) -> Result<Key> {
        let public = ops::ed25519_public(private)?;
        self.build_key(
            Algorithm::Ed25519,
            KeyType::AsymmetricPublic,
            private.bits(),
            &public,
            private.expires(),
        )
    }

    /// Encrypt with AES-GCM or ChaCha20-Poly1305. Output is `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotSupported`] for non-AEAD algorithms.
    /// - [`SecurityError::KeyExpired`] for an expired key.
    pub fn encrypt(&self, key: &Key, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_expiry(key)?;
        let mut nonce = [0u8; ops::NONCE_LEN];
        self.random.fill(&mut nonce)?;
        ops::encrypt(key, nonce, plaintext)
    }

    /// Decrypt output of [`KeyService::encrypt`].
    ///
    /// # Errors
    ///
    /// - [`SecurityError::IntegrityFailure`] when authentication fails.
    /// - [`SecurityError::NotSupported`] for non-AEAD algorithms.
    pub fn decrypt(&self, key: &Key, ciphertext: &[u8]) -> Result<Vec<u8>> {
        ops::decrypt(key, ciphertext)
    }

    /// Sign `data` with an Ed25519 private key or an HMAC key.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for the wrong key type.
    /// - [`SecurityError::NotSupported`] for other algorithms.
    pub fn sign(&self, key: &Key, data: &[u8]) -> Result<Vec<u8>> {
        self.check_expiry(key)?;
        ops::sign(key, data)
    }

    /// Verify a signature with an Ed25519 public key or an HMAC key.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for the wrong key type.
    /// - [`SecurityError::NotSupported`] for other algorithms.
    pub fn verify(&self, key: &Key, data: &[u8], signature: &[u8]) -> Result<bool> {
        ops::verify(key, data, signature)
    }

    /// Move `key` into the store under `id`.
    ///
    /// # Errors
    ///
    /// A refused store hands `key` back in [`StoreRejected`], carrying:
    /// - [`SecurityError::AlreadyExists`] if `id` is taken.
    /// - [`SecurityError::InvalidParameter`] for an empty id.
    /// - [`SecurityError::OutOfMemory`] when the store is full.
    pub fn store(&self, key: Key, id: &str) -> std::result::Result<(), StoreRejected> {
        let key_id = key.id().to_owned();
        self.store.store(id, key, self.clock.now_micros())?;
        debug!(store_id = id, key_id = %key_id, "key stored");
        self.audit_event(format!("key stored: id={id}"), &key_id, "store");
        Ok(())
    }

    /// Look up a stored key, handing out a new handle.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotFound`] for an unknown id.
    /// - [`SecurityError::KeyExpired`] if the key is past its expiry.
    pub fn retrieve(&self, id: &str) -> Result<Key> {
        let key = self.store.retrieve(id, self.clock.now_micros())?;
        self.check_expiry(&key)?;
        Ok(key)
    }

    /// Remove `id` from the store. The material is zeroed once no other
    /// handle remains.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for an unknown id.
    pub fn delete(&self, id: &str) -> Result<()> {
        let key = self.store.remove(id)?;
        let key_id = key.id().to_owned();
        let remaining = CryptoKey::ref_count(&key).saturating_sub(1);
        drop(key);
        debug!(store_id = id, key_id = %key_id, remaining, "key deleted");
        self.audit_event(format!("key deleted: id={id}"), &key_id, "delete");
        Ok(())
    }

    /// Store bookkeeping for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for an unknown id.
    pub fn key_info(&self, id: &str) -> Result<KeyEntryInfo> {
        self.store.info(id)
    }

    /// Stored ids, sorted.
    pub fn key_ids(&self) -> Vec<String> {
        self.store.ids()
    }

    /// Fill `buf` with secure random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for an empty buffer.
    pub fn random(&self, buf: &mut [u8]) -> Result<()> {
        self.random.fill(buf)
    }

    /// Digest `data`.
    pub fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
        ops::hash(data, algorithm)
    }

    /// Create and store the system master and signing keys if absent.
    ///
    /// # Errors
    ///
    /// Propagates generation and store errors.
    pub fn create_default_keys(&self) -> Result<()> {
        if self.store.info(SYSTEM_MASTER_KEY).is_err() {
            let master = self.generate_key(Algorithm::Aes, 256)?;
            self.store(master, SYSTEM_MASTER_KEY)?;
        }
        if self.store.info(SYSTEM_SIGNING_KEY).is_err() {
            let signing = self.generate_key(Algorithm::Ed25519, 256)?;
            self.store(signing, SYSTEM_SIGNING_KEY)?;
        }
        Ok(())
    }

    /// Snapshot counters.
    pub fn stats(&self) -> KeyServiceStats {
        KeyServiceStats {
            keys_generated: self.generated.load(Ordering::Relaxed),
            keys_stored: self.store.len(),
            slots_in_use: self.arena.in_use(),
            slots_total: self.arena.capacity(),
            keys_destroyed: self.arena.released(),
            hardware_rng: self.random.has_hardware(),
        }
    }

    fn check_expiry(&self, key: &Key) -> Result<()> {
        if key.is_expired(self.clock.now_micros()) {
            return Err(SecurityError::KeyExpired(format!("key {}", key.id())));
        }
        Ok(())
    }

    fn audit_event(&self, description: String, object: &str, action: &str) {
        if let Some(audit) = &self.audit {
            audit.emit(
                SecurityEvent::new(EventKind::CryptoOp, CRYPTO_EVENT_SEVERITY, description)
                    .target("key_service", object, action),
            );
        }
    }
}

fn key_type_for(algorithm: Algorithm, bits: u32) -> Result<KeyType> {
    if bits == 0 {
        return Err(SecurityError::InvalidParameter("key size is zero".to_owned()));
    }
    match algorithm {
        Algorithm::Aes if bits == 128 || bits == 256 => Ok(KeyType::Symmetric),
        Algorithm::ChaCha20 if bits == 256 => Ok(KeyType::Symmetric),
        Algorithm::Hmac if (128..=512).contains(&bits) && bits % 8 == 0 => Ok(KeyType::Symmetric),
        Algorithm::Hmac => Err(SecurityError::InvalidParameter(format!(
            "hmac key size {bits} must be a multiple of 8 in 128..=512"
        ))),
        Algorithm::Ed25519 if bits == 256 => Ok(KeyType::AsymmetricPrivate),
        other => Err(SecurityError::NotSupported(format!("{other} with {bits} bits"))),
    }
}

fn byte_len(bits: u32) -> Result<usize> {
    let bytes = bits.div_ceil(8);
    usize::try_from(bytes)
        .map_err(|_| SecurityError::InvalidParameter("key size overflow".to_owned()))
}
