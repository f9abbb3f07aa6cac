//! Memory protection monitor.
//!
//! Address-space randomization, stack canaries, a guarded heap and
//! control-flow checks. Detected corruption is reported to the audit log as
//! `Suspicious` events whose object names the class of attack
//! (`stack_corruption`, `heap_manipulation`, `cfi_violation`, `rop_gadgets`).

pub mod heap;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use heap::{GuardedPtr, HeapStats};

use self::heap::GuardedHeap;
use crate::audit::AuditLog;
use crate::crypto::SecureRandom;
use crate::error::{Result, SecurityError};
use crate::hardware::HardwareFeatures;
use crate::types::{EventKind, SecurityEvent, Severity};

/// Largest single guarded-heap request, 16 MiB.
pub const DEFAULT_MAX_ALLOCATION: usize = 16 * 1024 * 1024;

/// Guarded blocks allowed before falling back to plain blocks.
pub const DEFAULT_MAX_GUARDED_BLOCKS: usize = 4096;

/// Page size used for base alignment.
pub const PAGE_SIZE: u64 = 4096;

/// Random page offsets are drawn below this bound.
const ASLR_PAGE_MASK: u64 = (1 << 28) - 1;

/// How stack canaries are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryDerivation {
    /// One global secret XOR the pid.
    XorPid,
    /// Independent random value per pid, cached until released.
    #[default]
    PerProcess,
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Randomize region bases.
    pub aslr: bool,
    /// Verify stack canaries.
    pub stack_protection: bool,
    /// Apply guards to heap blocks.
    pub heap_protection: bool,
    /// Check indirect branch targets.
    pub cfi: bool,
    /// Canary derivation scheme.
    pub canary_derivation: CanaryDerivation,
    /// Largest allowed allocation in bytes.
    pub max_allocation: usize,
    /// Guard budget.
    pub max_guarded_blocks: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            aslr: true,
            stack_protection: true,
            heap_protection: true,
            cfi: true,
            canary_derivation: CanaryDerivation::default(),
            max_allocation: DEFAULT_MAX_ALLOCATION,
            max_guarded_blocks: DEFAULT_MAX_GUARDED_BLOCKS,
        }
    }
}

/// Randomizable address-space region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AslrRegion {
    /// Thread stacks.
    Stack,
    /// Heap.
    Heap,
    /// Anonymous and file mappings.
    Mmap,
    /// Program image.
    Executable,
}

impl AslrRegion {
    /// Unrandomized base address.
    pub fn base(self) -> u64 {
        match self {
            AslrRegion::Stack => 0x7F00_0000_0000,
            AslrRegion::Heap => 0x6000_0000_0000,
            AslrRegion::Mmap => 0x7000_0000_0000,
            AslrRegion::Executable => 0x4000_0000_0000,
        }
    }
}

/// Snapshot of monitor state and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryProtectionStats {
    /// ASLR on.
    pub aslr_enabled: bool,
    /// Stack canaries verified.
    pub stack_protection_enabled: bool,
    /// Heap guards applied.
    pub heap_protection_enabled: bool,
    /// CFI checks active.
    pub cfi_enabled: bool,
    /// Supervisor-mode access prevention.
    pub smap_enabled: bool,
    /// Supervisor-mode execution prevention.
    pub smep_enabled: bool,
    /// Control-flow enforcement technology.
    pub cet_enabled: bool,
    /// Memory tagging.
    pub mte_enabled: bool,
    /// Canaries handed out.
    pub canaries_issued: u64,
    /// Canaries currently cached.
    pub canaries_active: usize,
    /// Canary mismatches caught.
    pub stack_overflows_prevented: u64,
    /// Corrupted frees caught.
    pub heap_corruptions_detected: u64,
    /// Blocks allocated with guards.
    pub guarded_allocations: u64,
    /// Blocks allocated without guards.
    pub fallback_allocations: u64,
    /// Blocks currently live.
    pub live_allocations: usize,
    /// Data bytes currently live.
    pub bytes_live: usize,
    /// CFI mismatches caught.
    pub cfi_violations_detected: u64,
    /// Code regions flagged for gadget density.
    pub rop_regions_flagged: u64,
    /// Bases randomized.
    pub aslr_randomizations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    canaries_issued: AtomicU64,
    stack_overflows_prevented: AtomicU64,
    heap_corruptions_detected: AtomicU64,
    guarded_allocations: AtomicU64,
    fallback_allocations: AtomicU64,
    cfi_violations_detected: AtomicU64,
    rop_regions_flagged: AtomicU64,
    aslr_randomizations: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct HardwareProtections {
    smap: bool,
    smep: bool,
    cet: bool,
    mte: bool,
}

/// The memory protection monitor.
pub struct MemoryProtectionMonitor {
    aslr: AtomicBool,
    stack_protection: AtomicBool,
    heap_protection: AtomicBool,
    cfi: AtomicBool,
    hardware: HardwareProtections,
    derivation: CanaryDerivation,
    canary_secret: u32,
    max_allocation: usize,
    canaries: Mutex<HashMap<u32, u32>>,
    heap: Mutex<GuardedHeap>,
    random: Arc<SecureRandom>,
    audit: Arc<AuditLog>,
    counters: Counters,
}

impl std::fmt::Debug for MemoryProtectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProtectionMonitor")
            .field("derivation", &self.derivation)
            .field("max_allocation", &self.max_allocation)
            .finish_non_exhaustive()
    }
}

impl MemoryProtectionMonitor {
    /// Build the monitor. Hardware protections follow `features`.
    ///
    /// # Errors
    ///
    /// Propagates random-source failures while drawing the canary secret or
    /// the heap base.
    pub fn new(
        settings: MemorySettings,
        features: &HardwareFeatures,
        random: Arc<SecureRandom>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let hardware = HardwareProtections {
            smap: features.smap,
            smep: features.smep,
            cet: features.cet,
            mte: features.mte,
        };
        let canary_secret = random.next_u32()?;
        let heap_base = if settings.aslr {
            randomized(AslrRegion::Heap, &random)?
        } else {
            AslrRegion::Heap.base()
        };
        info!(
            aslr = settings.aslr,
            smap = hardware.smap,
            smep = hardware.smep,
            cet = hardware.cet,
            mte = hardware.mte,
            derivation = ?settings.canary_derivation,
            "Memory protection initialized"
        );
        Ok(Self {
            aslr: AtomicBool::new(settings.aslr),
            stack_protection: AtomicBool::new(settings.stack_protection),
            heap_protection: AtomicBool::new(settings.heap_protection),
            cfi: AtomicBool::new(settings.cfi),
            hardware,
            derivation: settings.canary_derivation,
            canary_secret,
            max_allocation: settings.max_allocation,
            canaries: Mutex::new(HashMap::new()),
            heap: Mutex::new(GuardedHeap::new(heap_base, settings.max_guarded_blocks)),
            random,
            audit,
            counters: Counters::default(),
        })
    }

    /// Turn ASLR on.
    pub fn enable_aslr(&self) {
        if !self.aslr.swap(true, Ordering::SeqCst) {
            info!("ASLR enabled");
        }
    }

    /// Turn CFI on.
    pub fn enable_cfi(&self) {
        if !self.cfi.swap(true, Ordering::SeqCst) {
            info!("CFI enabled");
        }
    }

    /// Toggle canary verification.
    pub fn set_stack_protection(&self, enabled: bool) {
        self.stack_protection.store(enabled, Ordering::SeqCst);
        info!(enabled, "Stack protection changed");
    }

    /// Toggle heap guards for future allocations.
    pub fn set_heap_protection(&self, enabled: bool) {
        self.heap_protection.store(enabled, Ordering::SeqCst);
        info!(enabled, "Heap protection changed");
    }

    /// Page-aligned base for `region`, randomized when ASLR is on.
    ///
    /// # Errors
    ///
    /// Propagates random-source failures.
    pub fn randomize_base(&self, region: AslrRegion) -> Result<u64> {
        if !self.aslr.load(Ordering::SeqCst) {
            return Ok(region.base());
        }
        let base = randomized(region, &self.random)?;
        self.counters
            .aslr_randomizations
            .fetch_add(1, Ordering::Relaxed);
        debug!(?region, base = format_args!("{base:#x}"), "Base randomized");
        Ok(base)
    }

    /// Canary for `pid`. Repeated calls return the same value until
    /// [`Self::release_canary`].
    ///
    /// # Errors
    ///
    /// - [`SecurityError::LockPoisoned`] if the canary table is poisoned.
    /// - Random-source failures under per-process derivation.
    pub fn issue_stack_canary(&self, pid: u32) -> Result<u32> {
        let mut canaries = self
            .canaries
            .lock()
            .map_err(|e| SecurityError::poisoned("canary table", e))?;
        if let Some(&existing) = canaries.get(&pid) {
            return Ok(existing);
        }
        let value = match self.derivation {
            CanaryDerivation::XorPid => self.canary_secret ^ pid,
            CanaryDerivation::PerProcess => self.random.next_u32()?,
        };
        canaries.insert(pid, value);
        self.counters.canaries_issued.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Forget the canary of an exited process.
    ///
    /// # Errors
    ///
    /// [`SecurityError::LockPoisoned`] if the canary table is poisoned.
    pub fn release_canary(&self, pid: u32) -> Result<()> {
        self.canaries
            .lock()
            .map_err(|e| SecurityError::poisoned("canary table", e))?
            .remove(&pid);
        Ok(())
    }

    /// Verify the canary `value` found on the stack of `pid`.
    ///
    /// A pid with no issued canary fails, unless derivation is `xor_pid`.
    pub fn check_stack_canary(&self, pid: u32, value: u32) -> bool {
        if !self.stack_protection.load(Ordering::SeqCst) {
            return true;
        }
        let expected = match self.canaries.lock() {
            Ok(canaries) => canaries.get(&pid).copied(),
            Err(_) => None,
        };
        let expected = match (expected, self.derivation) {
            (Some(v), _) => Some(v),
            (None, CanaryDerivation::XorPid) => Some(self.canary_secret ^ pid),
            (None, CanaryDerivation::PerProcess) => None,
        };
        if expected == Some(value) {
            return true;
        }
        self.counters
            .stack_overflows_prevented
            .fetch_add(1, Ordering::Relaxed);
        warn!(pid, "Stack canary mismatch");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::Suspicious,
                Severity::MAX,
                format!("stack canary mismatch in pid {pid}"),
            )
            .process(pid, 0)
            .target("memory", "stack_corruption", "canary_check")
            .blocked(true),
        );
        false
    }

    /// Allocate `size` bytes, guarded when protection is on and the budget
    /// allows.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for `size == 0`.
    /// - [`SecurityError::OutOfMemory`] above the allocation limit.
    pub fn alloc_guarded(&self, size: usize) -> Result<GuardedPtr> {
        if size == 0 {
            return Err(SecurityError::InvalidParameter(
                "allocation size is zero".to_owned(),
            ));
        }
        if size > self.max_allocation {
            return Err(SecurityError::OutOfMemory(format!(
                "allocation of {size} bytes exceeds limit of {}",
                self.max_allocation
            )));
        }
        let canary = self.random.next_u32()?;
        let protect = self.heap_protection.load(Ordering::SeqCst);
        let (ptr, guarded) = self
            .heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .alloc(size, canary, protect)?;
        if guarded {
            self.counters
                .guarded_allocations
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .fallback_allocations
                .fetch_add(1, Ordering::Relaxed);
            if protect {
                debug!(size, "Guard budget exhausted, plain allocation");
            }
        }
        Ok(ptr)
    }

    /// Validate and release a block.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for an unknown pointer.
    /// - [`SecurityError::IntegrityFailure`] when guards or header are
    ///   damaged (the block stays allocated) or on a double free.
    pub fn free_guarded(&self, ptr: GuardedPtr) -> Result<()> {
        let outcome = self
            .heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .free(ptr);
        if let Err(SecurityError::IntegrityFailure(reason)) = &outcome {
            self.counters
                .heap_corruptions_detected
                .fetch_add(1, Ordering::Relaxed);
            warn!(%ptr, "Heap corruption detected");
            self.audit.emit(
                SecurityEvent::new(EventKind::Suspicious, Severity::CRITICAL, reason.clone())
                    .target("memory", "heap_manipulation", "free")
                    .blocked(true),
            );
        }
        outcome
    }

    /// Read `len` bytes at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`SecurityError::InvalidParameter`] for an unknown pointer or an
    /// out-of-bounds range, [`SecurityError::IntegrityFailure`] for a freed
    /// block.
    pub fn read(&self, ptr: GuardedPtr, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .read(ptr, offset, len)
    }

    /// Write `data` at `offset` within the block.
    ///
    /// # Errors
    ///
    /// [`SecurityError::InvalidParameter`] for an unknown pointer or an
    /// out-of-bounds range.
    pub fn write(&self, ptr: GuardedPtr, offset: usize, data: &[u8]) -> Result<()> {
        self.heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .write(ptr, offset, data)
    }

    /// Store `data` relative to the data start without bounds checking, as
    /// a buggy caller would. Returns how many bytes landed in the block.
    ///
    /// # Errors
    ///
    /// [`SecurityError::InvalidParameter`] for an unknown pointer.
    pub fn write_unchecked(&self, ptr: GuardedPtr, offset: i64, data: &[u8]) -> Result<usize> {
        self.heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .write_unchecked(ptr, offset, data)
    }

    /// Verify an indirect branch from `pid` lands on `expected`.
    pub fn check_cfi(&self, pid: u32, target: u64, expected: u64) -> bool {
        if !self.cfi.load(Ordering::SeqCst) || target == expected {
            return true;
        }
        self.counters
            .cfi_violations_detected
            .fetch_add(1, Ordering::Relaxed);
        warn!(pid, target = format_args!("{target:#x}"), "CFI violation");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::Suspicious,
                Severity::MAX,
                format!("indirect branch to {target:#x}, expected {expected:#x}"),
            )
            .process(pid, 0)
            .target("memory", "cfi_violation", "indirect_branch")
            .blocked(true),
        );
        false
    }

    /// Flag `code` when its gadget density exceeds one per hundred bytes.
    pub fn scan_for_rop(&self, code: &[u8]) -> bool {
        let gadgets = count_gadgets(code);
        let limit = code.len() / 100;
        if gadgets <= limit {
            return false;
        }
        self.counters
            .rop_regions_flagged
            .fetch_add(1, Ordering::Relaxed);
        debug!(gadgets, len = code.len(), "ROP gadget density exceeded");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::Suspicious,
                Severity::clamped(7),
                format!("{gadgets} gadgets in {} bytes", code.len()),
            )
            .target("memory", "rop_gadgets", "scan"),
        );
        true
    }

    /// Current state and counters.
    ///
    /// # Errors
    ///
    /// [`SecurityError::LockPoisoned`] if a table lock is poisoned.
    pub fn stats(&self) -> Result<MemoryProtectionStats> {
        let canaries_active = self
            .canaries
            .lock()
            .map_err(|e| SecurityError::poisoned("canary table", e))?
            .len();
        let heap = self
            .heap
            .lock()
            .map_err(|e| SecurityError::poisoned("guarded heap", e))?
            .stats();
        let c = &self.counters;
        Ok(MemoryProtectionStats {
            aslr_enabled: self.aslr.load(Ordering::SeqCst),
            stack_protection_enabled: self.stack_protection.load(Ordering::SeqCst),
            heap_protection_enabled: self.heap_protection.load(Ordering::SeqCst),
            cfi_enabled: self.cfi.load(Ordering::SeqCst),
            smap_enabled: self.hardware.smap,
            smep_enabled: self.hardware.smep,
            cet_enabled: self.hardware.cet,
            mte_enabled: self.hardware.mte,
            canaries_issued: c.canaries_issued.load(Ordering::Relaxed),
            canaries_active,
            stack_overflows_prevented: c.stack_overflows_prevented.load(Ordering::Relaxed),
            heap_corruptions_detected: c.heap_corruptions_detected.load(Ordering::Relaxed),
            guarded_allocations: c.guarded_allocations.load(Ordering::Relaxed),
            fallback_allocations: c.fallback_allocations.load(Ordering::Relaxed),
            live_allocations: heap.live_blocks,
            bytes_live: heap.bytes_live,
            cfi_violations_detected: c.cfi_violations_detected.load(Ordering::Relaxed),
            rop_regions_flagged: c.rop_regions_flagged.load(Ordering::Relaxed),
            aslr_randomizations: c.aslr_randomizations.load(Ordering::Relaxed),
        })
    }
}

fn randomized(region: AslrRegion, random: &SecureRandom) -> Result<u64> {
    let pages = random.next_u64()? & ASLR_PAGE_MASK;
    Ok(region.base().saturating_add(pages.saturating_mul(PAGE_SIZE)))
}

/// `ret` plus `jmp`/`call` through a register.
fn count_gadgets(code: &[u8]) -> usize {
    let rets = code.iter().filter(|&&b| b == 0xC3).count();
    let indirect = code
        .windows(2)
        .filter(|w| w[0] == 0xFF && matches!(w[1], 0xE0..=0xE7 | 0xD0..=0xD7))
        .count();
    rets.saturating_add(indirect)
}
