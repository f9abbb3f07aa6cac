//! Connection tracking.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::Serialize;

use super::rules::Direction;
use crate::types::FlowKey;

/// Default table capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8192;

/// Idle time after which an entry expires, in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;

bitflags! {
    /// TCP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// No more data from sender.
        const FIN = 0x01;
        /// Synchronize sequence numbers.
        const SYN = 0x02;
        /// Reset the connection.
        const RST = 0x04;
        /// Push.
        const PSH = 0x08;
        /// Acknowledgement.
        const ACK = 0x10;
        /// Urgent.
        const URG = 0x20;
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    /// First packet seen.
    New,
    /// Traffic flowing.
    Established,
    /// FIN seen.
    Closing,
    /// RST seen, or closed by a response.
    Closed,
}

/// One tracked flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEntry {
    /// Flow key.
    pub flow: FlowKey,
    /// Lifecycle state.
    pub state: ConnState,
    /// Seconds timestamp of the first packet.
    pub created: u64,
    /// Seconds timestamp of the latest packet.
    pub last_activity: u64,
    /// Packets received.
    pub packets_in: u64,
    /// Packets sent.
    pub packets_out: u64,
    /// Bytes received.
    pub bytes_in: u64,
    /// Bytes sent.
    pub bytes_out: u64,
    /// Flagged by IPS or a response; further packets are blocked.
    pub suspicious: bool,
    /// Highest IPS score seen.
    pub threat_score: u32,
    /// Local process owning the socket, 0 if unknown.
    pub owner_pid: u32,
}

impl ConnectionEntry {
    fn new(flow: FlowKey, owner_pid: u32, now: u64) -> Self {
        Self {
            flow,
            state: ConnState::New,
            created: now,
            last_activity: now,
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            suspicious: false,
            threat_score: 0,
            owner_pid,
        }
    }

    fn account(&mut self, direction: Direction, len: usize) {
        let len = u64::try_from(len).unwrap_or(u64::MAX);
        match direction {
            Direction::Outbound => {
                self.packets_out = self.packets_out.saturating_add(1);
                self.bytes_out = self.bytes_out.saturating_add(len);
            }
            Direction::Inbound | Direction::Forwarded => {
                self.packets_in = self.packets_in.saturating_add(1);
                self.bytes_in = self.bytes_in.saturating_add(len);
            }
        }
    }
}

/// Flow table with timeout and oldest-first eviction.
#[derive(Debug)]
pub(crate) struct ConnectionTable {
    entries: HashMap<FlowKey, ConnectionEntry>,
    capacity: usize,
    timeout_secs: u64,
    pub(crate) evicted: u64,
}

impl ConnectionTable {
    pub(crate) fn new(capacity: usize, timeout_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            timeout_secs,
            evicted: 0,
        }
    }

    /// Create or advance the entry for `flow`.
    pub(crate) fn track(
        &mut self,
        flow: FlowKey,
        flags: TcpFlags,
        direction: Direction,
        len: usize,
        owner_pid: u32,
        now: u64,
    ) -> &mut ConnectionEntry {
        self.make_room(&flow, now);
        let is_new = !self.entries.contains_key(&flow);
        let entry = self
            .entries
            .entry(flow)
            .or_insert_with(|| ConnectionEntry::new(flow, owner_pid, now));
        if !is_new {
            entry.state = if flags.contains(TcpFlags::RST) {
                ConnState::Closed
            } else if flags.contains(TcpFlags::FIN) {
                ConnState::Closing
            } else if flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK) {
                ConnState::New
            } else if entry.state == ConnState::New {
                ConnState::Established
            } else {
                entry.state
            };
        }
        if entry.owner_pid == 0 {
            entry.owner_pid = owner_pid;
        }
        entry.last_activity = now;
        entry.account(direction, len);
        entry
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|e| e.last_activity)
            .map(|e| e.flow);
        if let Some(flow) = oldest {
            self.entries.remove(&flow);
            self.evicted = self.evicted.saturating_add(1);
        }
    }

    /// Drop entries idle for the timeout. Returns how many were removed.
    pub(crate) fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout_secs;
        self.entries
            .retain(|_, e| now.saturating_sub(e.last_activity) < timeout);
        let removed = before.saturating_sub(self.entries.len());
        self.evicted = self
            .evicted
            .saturating_add(u64::try_from(removed).unwrap_or(u64::MAX));
        removed
    }

    pub(crate) fn get(&self, flow: &FlowKey) -> Option<&ConnectionEntry> {
        self.entries.get(flow)
    }

    pub(crate) fn get_mut(&mut self, flow: &FlowKey) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(flow)
    }

    /// Flag every connection owned by `pid`. Returns how many were touched.
    pub(crate) fn flag_owner(&mut self, pid: u32, close: bool) -> usize {
        let mut touched = 0usize;
        for entry in self.entries.values_mut().filter(|e| e.owner_pid == pid) {
            entry.suspicious = true;
            if close {
                entry.state = ConnState::Closed;
            }
            touched = touched.saturating_add(1);
        }
        touched
    }

    /// Flag one flow, creating a closed placeholder if it is unknown so later
    /// packets stay blocked.
    pub(crate) fn flag_flow(&mut self, flow: FlowKey, now: u64) {
        self.make_room(&flow, now);
        let entry = self
            .entries
            .entry(flow)
            .or_insert_with(|| ConnectionEntry::new(flow, 0, now));
        entry.suspicious = true;
        entry.state = ConnState::Closed;
    }

    /// Free one slot for an unknown `flow` when the table is full.
    fn make_room(&mut self, flow: &FlowKey, now: u64) {
        if self.entries.contains_key(flow) || self.entries.len() < self.capacity {
            return;
        }
        self.expire(now);
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
