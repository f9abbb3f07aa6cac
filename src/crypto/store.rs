//! Key store: caller-chosen string ids mapped to shared key handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;

use super::key::{CryptoKey, Key};
use crate::error::{Result, SecurityError};

/// A refused store. The caller's handle comes back untouched.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StoreRejected {
    /// Why the store was refused.
    pub error: SecurityError,
    /// The handle that was passed in.
    pub key: Key,
}

impl From<StoreRejected> for SecurityError {
    fn from(rejected: StoreRejected) -> Self {
        rejected.error
    }
}

struct StoreEntry {
    key: Key,
    access_count: AtomicU64,
    last_access: AtomicU64,
}

/// Access bookkeeping for one stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyEntryInfo {
    /// Store id.
    pub id: String,
    /// Underlying key id.
    pub key_id: String,
    /// Successful retrievals.
    pub access_count: u64,
    /// Time of the last retrieval, microseconds.
    pub last_access: u64,
    /// Live handles to the key, including the store's own.
    pub ref_count: usize,
}

/// Key store. Lookups share a read lock; store and delete take the write lock.
pub struct KeyStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
    capacity: usize,
}

impl KeyStore {
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Move `key` into the store under `id`.
    ///
    /// # Errors
    ///
    /// Every refusal returns `key` inside [`StoreRejected`]:
    /// - [`SecurityError::InvalidParameter`] for an empty id.
    /// - [`SecurityError::AlreadyExists`] if `id` is taken; the stored key is untouched.
    /// - [`SecurityError::OutOfMemory`] when the store is full.
    pub fn store(&self, id: &str, key: Key, now: u64) -> std::result::Result<(), StoreRejected> {
        if id.is_empty() {
            return Err(StoreRejected {
                error: SecurityError::InvalidParameter("key id is empty".to_owned()),
                key,
            });
        }
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(e) => {
                return Err(StoreRejected {
                    error: SecurityError::poisoned("key store", e),
                    key,
                })
            }
        };
        if entries.contains_key(id) {
            return Err(StoreRejected {
                error: SecurityError::AlreadyExists(format!("key id {id}")),
                key,
            });
        }
        if entries.len() >= self.capacity {
            return Err(StoreRejected {
                error: SecurityError::OutOfMemory("key store full".to_owned()),
                key,
            });
        }
        entries.insert(
            id.to_owned(),
            StoreEntry {
                key,
                access_count: AtomicU64::new(0),
                last_access: AtomicU64::new(now),
            },
        );
        Ok(())
    }

    /// Hand out a new handle to the key stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for an unknown id.
    pub fn retrieve(&self, id: &str, now: u64) -> Result<Key> {
        let entries = self
            .entries
            .read()
            .map_err(|e| SecurityError::poisoned("key store", e))?;
        let entry = entries
            .get(id)
            .ok_or_else(|| SecurityError::NotFound(format!("key id {id}")))?;
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        entry.last_access.store(now, Ordering::Relaxed);
        Ok(Key::clone(&entry.key))
    }

    /// Remove `id` and return the store's handle.
    ///
    /// The caller drops it outside the store lock.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for an unknown id.
    pub fn remove(&self, id: &str) -> Result<Key> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| SecurityError::poisoned("key store", e))?;
        entries
            .remove(id)
            .map(|entry| entry.key)
            .ok_or_else(|| SecurityError::NotFound(format!("key id {id}")))
    }

    /// Bookkeeping for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for an unknown id.
    pub fn info(&self, id: &str) -> Result<KeyEntryInfo> {
        let entries = self
            .entries
            .read()
            .map_err(|e| SecurityError::poisoned("key store", e))?;
        let entry = entries
            .get(id)
            .ok_or_else(|| SecurityError::NotFound(format!("key id {id}")))?;
        Ok(KeyEntryInfo {
            id: id.to_owned(),
            key_id: entry.key.id().to_owned(),
            access_count: entry.access_count.load(Ordering::Relaxed),
            last_access: entry.last_access.load(Ordering::Relaxed),
            ref_count: CryptoKey::ref_count(&entry.key),
        })
    }

    /// Stored ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.entries.read() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
