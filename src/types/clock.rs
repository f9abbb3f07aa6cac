//! Time source injected into every component.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Timelike, Utc};

/// Microseconds per second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Wall-clock source in microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> u64;

    /// Current time in whole seconds.
    fn now_secs(&self) -> u64 {
        self.now_micros() / MICROS_PER_SEC
    }

    /// Hour of day in UTC (0..=23).
    fn hour_utc(&self) -> u32 {
        let micros = i64::try_from(self.now_micros()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_micros(micros)
            .map(|t| t.hour())
            .unwrap_or_default()
    }
}

/// Host system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default()
    }
}

/// Manually advanced clock for tests and replay harnesses.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Start at `secs` seconds after the epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self {
            micros: AtomicU64::new(secs.saturating_mul(MICROS_PER_SEC)),
        }
    }

    /// Jump to an absolute time in seconds.
    pub fn set_secs(&self, secs: u64) {
        self.micros
            .store(secs.saturating_mul(MICROS_PER_SEC), Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds.
    pub fn advance_secs(&self, secs: u64) {
        let delta = secs.saturating_mul(MICROS_PER_SEC);
        let _ = self
            .micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
                Some(m.saturating_add(delta))
            });
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Format a microsecond timestamp as RFC 3339.
pub fn to_rfc3339(micros: u64) -> String {
    let micros = i64::try_from(micros).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_default()
        .to_rfc3339()
}
