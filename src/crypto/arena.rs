//! Fixed-size arena holding all live key material.
//!
//! Material never lives on the general heap for longer than a call: keys
//! hold a slot index and read through a closure. Releasing a slot zeroes it
//! before it becomes available again, and [`SecureArena::dump`] lets an
//! operator (or a test) inspect a slot after release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use zeroize::Zeroize;

use crate::error::{Result, SecurityError};

/// Bytes per slot. Large enough for 512-bit symmetric keys and Ed25519 seeds.
pub const SLOT_SIZE: usize = 64;

/// Index of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Raw slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

struct ArenaInner {
    bytes: Vec<u8>,
    used: Vec<bool>,
}

impl ArenaInner {
    fn range(&self, slot: SlotId) -> Result<std::ops::Range<usize>> {
        if slot.0 >= self.used.len() {
            return Err(SecurityError::InvalidParameter(format!(
                "slot {} outside arena",
                slot.0
            )));
        }
        let start = slot
            .0
            .checked_mul(SLOT_SIZE)
            .ok_or_else(|| SecurityError::InvalidParameter("slot offset overflow".to_owned()))?;
        let end = start.saturating_add(SLOT_SIZE);
        Ok(start..end)
    }
}

/// Slot allocator for key material.
pub struct SecureArena {
    inner: Mutex<ArenaInner>,
    released: AtomicU64,
}

impl std::fmt::Debug for SecureArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureArena")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl SecureArena {
    /// Create an arena with `slots` slots.
    pub fn new(slots: usize) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                bytes: vec![0u8; slots.saturating_mul(SLOT_SIZE)],
                used: vec![false; slots],
            }),
            released: AtomicU64::new(0),
        }
    }

    /// Copy `material` into a free slot.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] if `material` is empty or longer than [`SLOT_SIZE`].
    /// - [`SecurityError::OutOfMemory`] when every slot is taken.
    pub fn allocate(&self, material: &[u8]) -> Result<SlotId> {
        if material.is_empty() || material.len() > SLOT_SIZE {
            return Err(SecurityError::InvalidParameter(format!(
                "key material must be 1..={SLOT_SIZE} bytes"
            )));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| SecurityError::poisoned("key arena", e))?;
        let index = inner
            .used
            .iter()
            .position(|used| !used)
            .ok_or_else(|| SecurityError::OutOfMemory("key arena exhausted".to_owned()))?;
        let slot = SlotId(index);
        let range = inner.range(slot)?;
        let start = range.start;
        let region = &mut inner.bytes[range];
        region.zeroize();
        region[..material.len()].copy_from_slice(material);
        inner.used[index] = true;
        tracing::trace!(slot = index, offset = start, "arena slot allocated");
        Ok(slot)
    }

    /// Run `f` over the first `len` bytes of a live slot.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] for a released slot.
    pub fn read<R>(&self, slot: SlotId, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| SecurityError::poisoned("key arena", e))?;
        if !inner.used.get(slot.0).copied().unwrap_or(false) {
            return Err(SecurityError::NotFound(format!("arena slot {}", slot.0)));
        }
        let range = inner.range(slot)?;
        let end = range.start.saturating_add(len.min(SLOT_SIZE));
        Ok(f(&inner.bytes[range.start..end]))
    }

    /// Zero a slot and mark it free.
    ///
    /// Runs even on a poisoned lock so material is never left behind.
    pub fn release(&self, slot: SlotId) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Ok(range) = inner.range(slot) else {
            return;
        };
        inner.bytes[range].zeroize();
        if let Some(used) = inner.used.get_mut(slot.0) {
            *used = false;
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of a slot's raw bytes, live or released.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for an index outside the arena.
    pub fn dump(&self, slot: SlotId) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| SecurityError::poisoned("key arena", e))?;
        let range = inner.range(slot)?;
        Ok(inner.bytes[range].to_vec())
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.used.len(),
            Err(poisoned) => poisoned.into_inner().used.len(),
        }
    }

    /// Slots currently holding material.
    pub fn in_use(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.used.iter().filter(|u| **u).count(),
            Err(poisoned) => poisoned.into_inner().used.iter().filter(|u| **u).count(),
        }
    }

    /// Slots released since creation.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}
