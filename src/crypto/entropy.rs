//! Secure random generation.
//!
//! A 256-word software pool seeded from the clock and stirred with its own
//! output, whitened through SHA-256 in counter mode. When the capability
//! table reports a hardware RNG its output is XORed over the pool stream,
//! so neither source is trusted alone.

use std::fmt;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Result, SecurityError};
use crate::hardware::HardwareRng;
use crate::types::Clock;

/// Number of 32-bit words in the software pool.
pub const POOL_WORDS: usize = 256;

/// Largest single request served by [`SecureRandom::fill`].
pub const MAX_REQUEST: usize = 64 * 1024;

const SEED_STRIDE: u32 = 0x1234_5678;

/// Software entropy pool.
struct EntropyPool {
    words: [u32; POOL_WORDS],
    counter: u64,
}

impl EntropyPool {
    fn seeded(time_micros: u64) -> Self {
        let mut words = [0u32; POOL_WORDS];
        let low = low_word(time_micros);
        let high = low_word(time_micros >> 32);
        let mut stride = 0u32;
        for word in &mut words {
            *word = low ^ stride ^ high.rotate_left(7);
            stride = stride.wrapping_add(SEED_STRIDE);
        }
        let mut pool = Self { words, counter: 0 };
        pool.stir(time_micros);
        pool
    }

    /// One full feedback pass: `w[i] ^= w[i+1] + t`, then rotate.
    fn stir(&mut self, time_micros: u64) {
        let t = low_word(time_micros);
        for i in 0..POOL_WORDS {
            let next = self.words[i.wrapping_add(1) % POOL_WORDS];
            self.words[i] = (self.words[i] ^ next.wrapping_add(t)).rotate_left(13);
        }
    }

    /// Fold external bytes into the pool.
    fn absorb(&mut self, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            let slot = i % POOL_WORDS;
            self.words[slot] ^= u32::from_le_bytes(word);
        }
    }

    /// Produce `out.len()` whitened bytes and feed each block back into the pool.
    fn generate(&mut self, out: &mut [u8]) {
        for chunk in out.chunks_mut(32) {
            let mut hasher = Sha256::new();
            for word in &self.words {
                hasher.update(word.to_le_bytes());
            }
            hasher.update(self.counter.to_le_bytes());
            let mut block = hasher.finalize();
            chunk.copy_from_slice(&block[..chunk.len()]);
            self.counter = self.counter.wrapping_add(1);
            self.absorb(&block);
            block.as_mut_slice().zeroize();
        }
    }
}

impl Drop for EntropyPool {
    fn drop(&mut self) {
        self.words.zeroize();
    }
}

fn low_word(value: u64) -> u32 {
    u32::try_from(value & u64::from(u32::MAX)).unwrap_or_default()
}

/// Random source shared by the key service and the memory monitor.
pub struct SecureRandom {
    pool: Mutex<EntropyPool>,
    hardware: Option<Arc<dyn HardwareRng>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SecureRandom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureRandom")
            .field("hardware", &self.hardware.is_some())
            .finish_non_exhaustive()
    }
}

impl SecureRandom {
    /// Build a random source. Pass `hardware` only when the capability table
    /// reports a hardware RNG.
    ///
    /// # Errors
    ///
    /// Returns an error if the hardware source fails while seeding.
    pub fn new(clock: Arc<dyn Clock>, hardware: Option<Arc<dyn HardwareRng>>) -> Result<Self> {
        let mut pool = EntropyPool::seeded(clock.now_micros());
        if let Some(hw) = &hardware {
            let mut seed = [0u8; 64];
            hw.fill(&mut seed)?;
            pool.absorb(&seed);
            seed.zeroize();
            pool.stir(clock.now_micros());
        }
        Ok(Self {
            pool: Mutex::new(pool),
            hardware,
            clock,
        })
    }

    /// Whether a hardware source is mixed into every request.
    pub fn has_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    /// Fill `buf` with random bytes.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for an empty or oversized buffer.
    /// - The hardware source's error when it is present but fails.
    pub fn fill(&self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(SecurityError::InvalidParameter(
                "random buffer is empty".to_owned(),
            ));
        }
        if buf.len() > MAX_REQUEST {
            return Err(SecurityError::InvalidParameter(format!(
                "random request exceeds {MAX_REQUEST} bytes"
            )));
        }
        {
            let mut pool = self
                .pool
                .lock()
                .map_err(|e| SecurityError::poisoned("entropy pool", e))?;
            pool.stir(self.clock.now_micros());
            pool.generate(buf);
        }
        if let Some(hw) = &self.hardware {
            let mut extra = vec![0u8; buf.len()];
            hw.fill(&mut extra)?;
            for (out, h) in buf.iter_mut().zip(extra.iter()) {
                *out ^= *h;
            }
            extra.zeroize();
        }
        Ok(())
    }

    /// Random `u32`.
    ///
    /// # Errors
    ///
    /// Propagates [`SecureRandom::fill`] errors.
    pub fn next_u32(&self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Random `u64`.
    ///
    /// # Errors
    ///
    /// Propagates [`SecureRandom::fill`] errors.
    pub fn next_u64(&self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.fill(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}
