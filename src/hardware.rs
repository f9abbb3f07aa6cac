//! Hardware capability table and RNG seam.
//!
//! Feature flags are read once at framework construction to pick code
//! paths. Detection only inspects what the host CPU exposes to userspace;
//! anything else comes from configuration.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Boolean capability flags consumed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareFeatures {
    /// Hardware random number generator (RDRAND or platform equivalent).
    pub rng: bool,
    /// AES instruction acceleration.
    pub aes_ni: bool,
    /// Trusted platform module.
    pub tpm: bool,
    /// Supervisor mode access prevention.
    pub smap: bool,
    /// Supervisor mode execution prevention.
    pub smep: bool,
    /// Control-flow enforcement technology.
    pub cet: bool,
    /// Memory tagging extension.
    pub mte: bool,
    /// Pointer authentication.
    pub pointer_auth: bool,
}

impl HardwareFeatures {
    /// Inspect the host CPU for the flags visible from userspace.
    pub fn detect() -> Self {
        let mut features = Self::default();
        #[cfg(target_arch = "x86_64")]
        {
            features.rng = std::arch::is_x86_feature_detected!("rdrand");
            features.aes_ni = std::arch::is_x86_feature_detected!("aes");
        }
        #[cfg(target_arch = "aarch64")]
        {
            features.rng = std::arch::is_aarch64_feature_detected!("rand");
            features.aes_ni = std::arch::is_aarch64_feature_detected!("aes");
            features.mte = std::arch::is_aarch64_feature_detected!("mte");
            features.pointer_auth = std::arch::is_aarch64_feature_detected!("paca");
        }
        features
    }
}

/// Source of hardware randomness.
pub trait HardwareRng: Send + Sync {
    /// Fill `buf` with hardware random bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the device fails to produce output.
    fn fill(&self, buf: &mut [u8]) -> Result<(), SecurityError>;
}

/// Platform entropy device exposed by the host OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsHardwareRng;

impl HardwareRng for OsHardwareRng {
    fn fill(&self, buf: &mut [u8]) -> Result<(), SecurityError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| SecurityError::NotSupported(format!("hardware rng unavailable: {e}")))
    }
}
