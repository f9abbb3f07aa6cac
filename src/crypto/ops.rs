//! Orchestration over the vetted primitive crates.
//!
//! Each function borrows material from the arena for the duration of the
//! call only. Transient copies are wrapped in [`Zeroizing`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use super::key::{Algorithm, CryptoKey, KeyType};
use crate::error::{Result, SecurityError};

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AEAD tag length in bytes.
pub const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Digest algorithms offered by [`super::KeyService::hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

/// Digest `data`.
pub fn hash(data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

fn aead_error(_: aes_gcm::aead::Error) -> SecurityError {
    SecurityError::IntegrityFailure("authenticated decryption failed".to_owned())
}

/// AEAD algorithms only; anything else is unsupported before type checks.
fn require_aead(key: &CryptoKey, operation: &str) -> Result<()> {
    match key.algorithm() {
        Algorithm::Aes | Algorithm::ChaCha20 => key.require_type(KeyType::Symmetric, operation),
        other => Err(SecurityError::NotSupported(format!("{operation} with {other}"))),
    }
}

fn bad_key_length<E>(_: E) -> SecurityError {
    SecurityError::InvalidParameter("key material has the wrong length".to_owned())
}

/// Encrypt `plaintext` under `key`, prefixing the output with `nonce`.
pub(crate) fn encrypt(key: &CryptoKey, nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    require_aead(key, "encrypt")?;
    let algorithm = key.algorithm();
    let body = key.with_material(|material| -> Result<Vec<u8>> {
        match (algorithm, material.len()) {
            (Algorithm::Aes, 16) => Aes128Gcm::new_from_slice(material)
                .map_err(bad_key_length)?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(aead_error),
            (Algorithm::Aes, 32) => Aes256Gcm::new_from_slice(material)
                .map_err(bad_key_length)?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(aead_error),
            (Algorithm::ChaCha20, _) => ChaCha20Poly1305::new_from_slice(material)
                .map_err(bad_key_length)?
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(aead_error),
            _ => Err(SecurityError::NotSupported(format!(
                "encryption with {algorithm}"
            ))),
        }
    })??;
    let mut out = Vec::with_capacity(NONCE_LEN.saturating_add(body.len()));
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reverse of [`encrypt`].
pub(crate) fn decrypt(key: &CryptoKey, data: &[u8]) -> Result<Vec<u8>> {
    require_aead(key, "decrypt")?;
    if data.len() < NONCE_LEN.saturating_add(TAG_LEN) {
        return Err(SecurityError::InvalidParameter(
            "ciphertext shorter than nonce and tag".to_owned(),
        ));
    }
    let (nonce, body) = data.split_at(NONCE_LEN);
    let algorithm = key.algorithm();
    key.with_material(|material| -> Result<Vec<u8>> {
        match (algorithm, material.len()) {
            (Algorithm::Aes, 16) => Aes128Gcm::new_from_slice(material)
                .map_err(bad_key_length)?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), body)
                .map_err(aead_error),
            (Algorithm::Aes, 32) => Aes256Gcm::new_from_slice(material)
                .map_err(bad_key_length)?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), body)
                .map_err(aead_error),
            (Algorithm::ChaCha20, _) => ChaCha20Poly1305::new_from_slice(material)
                .map_err(bad_key_length)?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), body)
                .map_err(aead_error),
            _ => Err(SecurityError::NotSupported(format!(
                "decryption with {algorithm}"
            ))),
        }
    })?
}

fn signing_key(material: &[u8]) -> Result<SigningKey> {
    let mut seed = Zeroizing::new([0u8; 32]);
    if material.len() != seed.len() {
        return Err(bad_key_length(()));
    }
    seed.copy_from_slice(material);
    Ok(SigningKey::from_bytes(&seed))
}

/// Sign `data`. Ed25519 needs a private key; HMAC keys sign symmetrically.
pub(crate) fn sign(key: &CryptoKey, data: &[u8]) -> Result<Vec<u8>> {
    match key.algorithm() {
        Algorithm::Ed25519 => {
            key.require_type(KeyType::AsymmetricPrivate, "sign")?;
            key.with_material(|material| -> Result<Vec<u8>> {
                Ok(signing_key(material)?.sign(data).to_bytes().to_vec())
            })?
        }
        Algorithm::Hmac => key.with_material(|material| -> Result<Vec<u8>> {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(material).map_err(bad_key_length)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        })?,
        other => Err(SecurityError::NotSupported(format!("signing with {other}"))),
    }
}

/// Check `signature` over `data`. Ed25519 needs a public key.
pub(crate) fn verify(key: &CryptoKey, data: &[u8], signature: &[u8]) -> Result<bool> {
    match key.algorithm() {
        Algorithm::Ed25519 => {
            key.require_type(KeyType::AsymmetricPublic, "verify")?;
            let Ok(signature) = Signature::from_slice(signature) else {
                return Ok(false);
            };
            key.with_material(|material| -> Result<bool> {
                let bytes: [u8; 32] = material.try_into().map_err(bad_key_length)?;
                let verifying = VerifyingKey::from_bytes(&bytes).map_err(|_| {
                    SecurityError::InvalidParameter("malformed public key".to_owned())
                })?;
                Ok(verifying.verify(data, &signature).is_ok())
            })?
        }
        Algorithm::Hmac => key.with_material(|material| -> Result<bool> {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(material).map_err(bad_key_length)?;
            mac.update(data);
            Ok(mac.verify_slice(signature).is_ok())
        })?,
        other => Err(SecurityError::NotSupported(format!(
            "verification with {other}"
        ))),
    }
}

/// HKDF-SHA256 expansion of the key's material.
pub(crate) fn derive(master: &CryptoKey, info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    master.require_type(KeyType::Symmetric, "derive")?;
    master.with_material(|ikm| -> Result<Zeroizing<Vec<u8>>> {
        let hk = Hkdf::<Sha256>::new(None, ikm);
        let mut okm = Zeroizing::new(vec![0u8; len]);
        hk.expand(info, &mut okm)
            .map_err(|_| SecurityError::InvalidParameter("derived length too long".to_owned()))?;
        Ok(okm)
    })?
}

/// Public half of an Ed25519 private key.
pub(crate) fn ed25519_public(private: &CryptoKey) -> Result<[u8; 32]> {
    if private.algorithm() != Algorithm::Ed25519 {
        return Err(SecurityError::NotSupported(format!(
            "public key extraction for {}",
            private.algorithm()
        )));
    }
    private.require_type(KeyType::AsymmetricPrivate, "public key extraction")?;
    private.with_material(|material| -> Result<[u8; 32]> {
        Ok(signing_key(material)?.verifying_key().to_bytes())
    })?
}
