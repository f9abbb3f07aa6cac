//! Guarded heap.
//!
//! Each guarded block is laid out as
//! `[front guard 0xAA][header][data][rear guard 0xBB]` inside one owned
//! buffer. Blocks are addressed by [`GuardedPtr`] handles in the heap
//! address range so callers never hold references into the buffer.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::error::{Result, SecurityError};

/// Bytes in each guard.
pub const GUARD_SIZE: usize = 16;

/// Bytes in the serialized header.
pub const HEADER_SIZE: usize = 24;

/// Front guard fill.
pub const FRONT_GUARD_BYTE: u8 = 0xAA;

/// Rear guard fill.
pub const REAR_GUARD_BYTE: u8 = 0xBB;

/// Fill applied to freed data.
pub const FREED_FILL_BYTE: u8 = 0xDD;

/// Header magic of a live block.
pub const LIVE_MAGIC: u32 = 0xFEED_FACE;

/// Header magic written on free.
pub const FREED_MAGIC: u32 = 0xDEAD_C0DE;

const ALIGN: u64 = 16;

/// Freed blocks kept poisoned so a second free or a stale access is caught.
pub const QUARANTINE_BLOCKS: usize = 256;

/// Handle to a heap block: the address of its first data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GuardedPtr(u64);

impl GuardedPtr {
    /// Numeric address.
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for GuardedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// [`LIVE_MAGIC`] or [`FREED_MAGIC`].
    pub magic: u32,
    /// Data length.
    pub size: u64,
    /// Allocated flag.
    pub allocated: bool,
    /// Per-block canary.
    pub canary: u32,
}

impl BlockHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&u32::from(self.allocated).to_le_bytes());
        out[16..20].copy_from_slice(&self.canary.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let word = |range: std::ops::Range<usize>| -> Option<u32> {
            Some(u32::from_le_bytes(bytes.get(range)?.try_into().ok()?))
        };
        let size = u64::from_le_bytes(bytes.get(4..12)?.try_into().ok()?);
        Some(Self {
            magic: word(0..4)?,
            size,
            allocated: word(12..16)? == 1,
            canary: word(16..20)?,
        })
    }
}

#[derive(Debug)]
struct Block {
    guarded: bool,
    size: usize,
    canary: u32,
    bytes: Vec<u8>,
}

impl Block {
    fn data_start(&self) -> usize {
        if self.guarded {
            GUARD_SIZE.saturating_add(HEADER_SIZE)
        } else {
            0
        }
    }

    /// First integrity problem, if any.
    fn check(&self) -> Option<&'static str> {
        if !self.guarded {
            return None;
        }
        let front = self.bytes.get(..GUARD_SIZE)?;
        if front.iter().any(|&b| b != FRONT_GUARD_BYTE) {
            return Some("front guard overwritten");
        }
        let header = self
            .bytes
            .get(GUARD_SIZE..GUARD_SIZE.saturating_add(HEADER_SIZE))
            .and_then(BlockHeader::decode);
        let Some(header) = header else {
            return Some("header unreadable");
        };
        if header.magic != LIVE_MAGIC {
            return Some("bad magic");
        }
        if header.canary != self.canary {
            return Some("header canary mismatch");
        }
        if !header.allocated {
            return Some("block not marked allocated");
        }
        if usize::try_from(header.size).ok() != Some(self.size) {
            return Some("size field corrupted");
        }
        let rear_start = self.data_start().saturating_add(self.size);
        let rear = self.bytes.get(rear_start..)?;
        if rear.len() != GUARD_SIZE || rear.iter().any(|&b| b != REAR_GUARD_BYTE) {
            return Some("rear guard overwritten");
        }
        None
    }
}

/// Heap counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeapStats {
    /// Blocks currently live.
    pub live_blocks: usize,
    /// Live blocks that carry guards.
    pub guarded_blocks: usize,
    /// Data bytes currently live.
    pub bytes_live: usize,
    /// Freed blocks still held poisoned.
    pub quarantined_blocks: usize,
}

/// Owned-block heap with guard and header checks.
#[derive(Debug)]
pub(crate) struct GuardedHeap {
    blocks: HashMap<GuardedPtr, Block>,
    quarantine: HashMap<GuardedPtr, Block>,
    quarantine_order: VecDeque<GuardedPtr>,
    next_addr: u64,
    max_guarded: usize,
}

impl GuardedHeap {
    pub(crate) fn new(base: u64, max_guarded: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            quarantine: HashMap::new(),
            quarantine_order: VecDeque::new(),
            next_addr: base,
            max_guarded,
        }
    }

    fn guarded_count(&self) -> usize {
        self.blocks.values().filter(|b| b.guarded).count()
    }

    /// Allocate `size` bytes. Returns the handle and whether guards were applied.
    pub(crate) fn alloc(&mut self, size: usize, canary: u32, protect: bool) -> Result<(GuardedPtr, bool)> {
        let guarded = protect && self.guarded_count() < self.max_guarded;
        let bytes = if guarded {
            let total = size
                .checked_add(GUARD_SIZE.saturating_mul(2))
                .and_then(|n| n.checked_add(HEADER_SIZE))
                .ok_or_else(|| SecurityError::OutOfMemory("allocation size overflow".to_owned()))?;
            let mut bytes = Vec::with_capacity(total);
            bytes.resize(GUARD_SIZE, FRONT_GUARD_BYTE);
            let header = BlockHeader {
                magic: LIVE_MAGIC,
                size: u64::try_from(size).unwrap_or(u64::MAX),
                allocated: true,
                canary,
            };
            bytes.extend_from_slice(&header.encode());
            bytes.resize(total.saturating_sub(GUARD_SIZE), 0);
            bytes.resize(total, REAR_GUARD_BYTE);
            bytes
        } else {
            vec![0u8; size]
        };

        let block = Block {
            guarded,
            size,
            canary,
            bytes,
        };
        let data_offset = u64::try_from(block.data_start()).unwrap_or(0);
        let ptr = GuardedPtr(self.next_addr.saturating_add(data_offset));
        let footprint = u64::try_from(block.bytes.len()).unwrap_or(u64::MAX);
        let advance = footprint
            .checked_next_multiple_of(ALIGN)
            .unwrap_or(footprint)
            .max(ALIGN);
        self.next_addr = self.next_addr.saturating_add(advance);
        self.blocks.insert(ptr, block);
        Ok((ptr, guarded))
    }

    fn missing(&self, ptr: GuardedPtr) -> SecurityError {
        if self.quarantine.contains_key(&ptr) {
            SecurityError::IntegrityFailure(format!("heap block {ptr}: use after free"))
        } else {
            SecurityError::InvalidParameter(format!("unknown heap pointer {ptr}"))
        }
    }

    fn block(&self, ptr: GuardedPtr) -> Result<&Block> {
        match self.blocks.get(&ptr) {
            Some(block) => Ok(block),
            None => Err(self.missing(ptr)),
        }
    }

    fn block_mut(&mut self, ptr: GuardedPtr) -> Result<&mut Block> {
        if !self.blocks.contains_key(&ptr) {
            return Err(self.missing(ptr));
        }
        self.blocks
            .get_mut(&ptr)
            .ok_or_else(|| SecurityError::InvalidParameter(format!("unknown heap pointer {ptr}")))
    }

    /// Validate and release a block.
    ///
    /// A corrupted block stays allocated. A released block is poisoned and
    /// quarantined; freeing it again is reported as corruption.
    pub(crate) fn free(&mut self, ptr: GuardedPtr) -> Result<()> {
        if self.quarantine.contains_key(&ptr) {
            return Err(SecurityError::IntegrityFailure(format!(
                "heap block {ptr}: double free"
            )));
        }
        let block = self.block_mut(ptr)?;
        if let Some(problem) = block.check() {
            return Err(SecurityError::IntegrityFailure(format!(
                "heap block {ptr}: {problem}"
            )));
        }
        let start = block.data_start();
        let end = start.saturating_add(block.size);
        if let Some(data) = block.bytes.get_mut(start..end) {
            data.fill(FREED_FILL_BYTE);
        }
        if block.guarded {
            let header = BlockHeader {
                magic: FREED_MAGIC,
                size: u64::try_from(block.size).unwrap_or(u64::MAX),
                allocated: false,
                canary: block.canary,
            };
            let header_range = GUARD_SIZE..GUARD_SIZE.saturating_add(HEADER_SIZE);
            if let Some(slot) = block.bytes.get_mut(header_range) {
                slot.copy_from_slice(&header.encode());
            }
        }
        if let Some(block) = self.blocks.remove(&ptr) {
            self.quarantine.insert(ptr, block);
            self.quarantine_order.push_back(ptr);
        }
        while self.quarantine_order.len() > QUARANTINE_BLOCKS {
            if let Some(oldest) = self.quarantine_order.pop_front() {
                self.quarantine.remove(&oldest);
            }
        }
        Ok(())
    }

    /// Copy `len` data bytes starting at `offset`.
    pub(crate) fn read(&self, ptr: GuardedPtr, offset: usize, len: usize) -> Result<Vec<u8>> {
        let block = self.block(ptr)?;
        let range = data_range(block, offset, len)?;
        Ok(block.bytes.get(range).map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Bounds-checked store into the data area.
    pub(crate) fn write(&mut self, ptr: GuardedPtr, offset: usize, data: &[u8]) -> Result<()> {
        let block = self.block_mut(ptr)?;
        let range = data_range(block, offset, data.len())?;
        if let Some(slot) = block.bytes.get_mut(range) {
            slot.copy_from_slice(data);
        }
        Ok(())
    }

    /// Store relative to the data start without checking the data bounds.
    ///
    /// Negative offsets reach the header and front guard; writes past the
    /// data reach the rear guard. Bytes falling outside the block are
    /// discarded. Returns how many bytes landed.
    pub(crate) fn write_unchecked(&mut self, ptr: GuardedPtr, offset: i64, data: &[u8]) -> Result<usize> {
        let block = self.block_mut(ptr)?;
        let start = i64::try_from(block.data_start())
            .unwrap_or(i64::MAX)
            .saturating_add(offset);
        let mut written = 0usize;
        for (i, &byte) in data.iter().enumerate() {
            let pos = i64::try_from(i).map(|i| start.saturating_add(i)).unwrap_or(-1);
            let Ok(pos) = usize::try_from(pos) else {
                continue;
            };
            if let Some(slot) = block.bytes.get_mut(pos) {
                *slot = byte;
                written = written.saturating_add(1);
            }
        }
        Ok(written)
    }

    pub(crate) fn stats(&self) -> HeapStats {
        HeapStats {
            live_blocks: self.blocks.len(),
            guarded_blocks: self.guarded_count(),
            bytes_live: self.blocks.values().map(|b| b.size).sum(),
            quarantined_blocks: self.quarantine.len(),
        }
    }
}

fn data_range(block: &Block, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= block.size)
        .ok_or_else(|| {
            SecurityError::InvalidParameter(format!(
                "access {offset}+{len} outside block of {} bytes",
                block.size
            ))
        })?;
    let base = block.data_start();
    Ok(base.saturating_add(offset)..base.saturating_add(end))
}
