//! Per-process behavior tracking.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{EventDetail, EventKind, SecurityEvent};

/// Buckets in the syscall histogram.
pub const SYSCALL_BUCKETS: usize = 64;

/// Default number of tracked processes.
pub const DEFAULT_MAX_BEHAVIORS: usize = 1024;

/// Inactivity after which a process's score is forgotten, in seconds.
pub const INACTIVITY_RESET_SECS: u64 = 3600;

/// Highest anomaly or threat score.
pub const MAX_SCORE: u32 = 100;

/// Behavior counters for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessBehavior {
    /// Process id.
    pub pid: u32,
    /// Seconds timestamp of the latest event.
    pub last_activity: u64,
    /// Syscalls seen per bucket (`number % 64`).
    pub syscall_histogram: Vec<u64>,
    /// Total syscalls seen.
    pub syscall_total: u64,
    /// File access events.
    pub file_access_count: u64,
    /// Network access events.
    pub network_access_count: u64,
    /// Privilege escalation events.
    pub privilege_escalations: u64,
    /// Current anomaly score, 0..=100.
    pub anomaly_score: u32,
    /// Flagged by a rule or a response.
    pub suspicious: bool,
}

impl ProcessBehavior {
    fn new(pid: u32, now: u64) -> Self {
        Self {
            pid,
            last_activity: now,
            syscall_histogram: vec![0; SYSCALL_BUCKETS],
            syscall_total: 0,
            file_access_count: 0,
            network_access_count: 0,
            privilege_escalations: 0,
            anomaly_score: 0,
            suspicious: false,
        }
    }

    /// Fold `event` into the counters.
    pub fn record(&mut self, event: &SecurityEvent) {
        match event.kind {
            EventKind::SyscallTrace => {
                self.syscall_total = self.syscall_total.saturating_add(1);
                if let EventDetail::Syscall(number) = event.detail {
                    let bucket = usize::try_from(number)
                        .unwrap_or(0)
                        .checked_rem(SYSCALL_BUCKETS)
                        .unwrap_or(0);
                    if let Some(slot) = self.syscall_histogram.get_mut(bucket) {
                        *slot = slot.saturating_add(1);
                    }
                }
            }
            EventKind::FileAccess => {
                self.file_access_count = self.file_access_count.saturating_add(1);
            }
            EventKind::NetworkAccess => {
                self.network_access_count = self.network_access_count.saturating_add(1);
            }
            EventKind::PrivilegeEscalation => {
                self.privilege_escalations = self.privilege_escalations.saturating_add(1);
            }
            _ => {}
        }
    }

    /// Raise the score for every anomalous condition that currently holds.
    ///
    /// Repeated privilege escalation also marks the process suspicious.
    pub fn rescore(&mut self) {
        let mut bump = 0u32;
        if self.privilege_escalations > 3 {
            bump = bump.saturating_add(20);
            self.suspicious = true;
        }
        if self.syscall_total > 1000 {
            bump = bump.saturating_add(15);
        }
        if self.file_access_count > 100 {
            bump = bump.saturating_add(10);
        }
        if self.network_access_count > 50 {
            bump = bump.saturating_add(10);
        }
        self.add_score(bump);
    }

    /// Add to the score, capped at [`MAX_SCORE`].
    pub fn add_score(&mut self, points: u32) {
        self.anomaly_score = self.anomaly_score.saturating_add(points).min(MAX_SCORE);
    }
}

/// Fixed-size table of tracked processes with LRU reuse.
#[derive(Debug)]
pub(crate) struct BehaviorTable {
    entries: HashMap<u32, ProcessBehavior>,
    capacity: usize,
    pub(crate) evictions: u64,
}

impl BehaviorTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            evictions: 0,
        }
    }

    /// Entry for `pid` with its activity stamped at `now`.
    ///
    /// A process idle for an hour starts over with a clean score. At
    /// capacity the least recently active entry is replaced.
    pub(crate) fn touch(&mut self, pid: u32, now: u64) -> &mut ProcessBehavior {
        if !self.entries.contains_key(&pid) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|b| b.last_activity)
                .map(|b| b.pid);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.evictions = self.evictions.saturating_add(1);
            }
        }
        let entry = self
            .entries
            .entry(pid)
            .or_insert_with(|| ProcessBehavior::new(pid, now));
        if now.saturating_sub(entry.last_activity) >= INACTIVITY_RESET_SECS {
            entry.anomaly_score = 0;
            entry.suspicious = false;
        }
        entry.last_activity = entry.last_activity.max(now);
        entry
    }

    pub(crate) fn get(&self, pid: u32) -> Option<&ProcessBehavior> {
        self.entries.get(&pid)
    }

    pub(crate) fn get_mut(&mut self, pid: u32) -> Option<&mut ProcessBehavior> {
        self.entries.get_mut(&pid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
