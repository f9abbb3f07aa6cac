//! Network packet filter.
//!
//! Stateless rule chains decide first; allowed packets are then tracked per
//! flow and their payload scored by the IPS. A flow flagged suspicious stays
//! blocked regardless of the rules.

pub mod conntrack;
pub mod ips;
pub mod rules;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use conntrack::{
    ConnState, ConnectionEntry, TcpFlags, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
};
pub use ips::{IpsEngine, IpsVerdict, IPS_BLOCK_SCORE};
pub use rules::{
    default_inbound, default_outbound, AddrMatch, Direction, FirewallRule, PortRange, RuleAction,
};

use self::conntrack::ConnectionTable;
use crate::audit::AuditLog;
use crate::error::{Result, SecurityError};
use crate::ids::{ResponseCommand, ThreatResponder};
use crate::types::{Clock, EventDetail, EventKind, FlowKey, SecurityEvent, Severity};

/// Default cap on rules per chain.
pub const DEFAULT_MAX_RULES_PER_CHAIN: usize = 1024;

/// Per-packet decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Forward the packet.
    Allow,
    /// Discard the packet.
    Block,
}

/// Header fields the network stack hands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// IP protocol number.
    pub protocol: u8,
    /// TCP flags, empty for other protocols.
    pub tcp_flags: TcpFlags,
    /// Local process owning the socket, 0 if unknown.
    pub owner_pid: u32,
}

impl PacketHeader {
    /// Flow key for this packet.
    pub fn flow(&self) -> FlowKey {
        FlowKey {
            src: self.src,
            dst: self.dst,
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }
}

/// Filter sizing and switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetfilterSettings {
    /// Run payload inspection.
    pub ips_enabled: bool,
    /// Connection table capacity.
    pub max_connections: usize,
    /// Connection idle timeout in seconds.
    pub connection_timeout_secs: u64,
    /// Rule cap per chain.
    pub max_rules_per_chain: usize,
}

impl Default for NetfilterSettings {
    fn default() -> Self {
        Self {
            ips_enabled: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_rules_per_chain: DEFAULT_MAX_RULES_PER_CHAIN,
        }
    }
}

/// An installed rule with its counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    /// Rule id.
    pub id: u32,
    /// Chain.
    pub direction: Direction,
    /// Definition.
    pub rule: FirewallRule,
    /// Packets matched.
    pub match_count: u64,
    /// Seconds timestamp of the latest match.
    pub last_match: u64,
}

/// Read-only filter counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetfilterStats {
    /// Packets seen.
    pub packets_processed: u64,
    /// Packets allowed.
    pub packets_allowed: u64,
    /// Packets blocked for any reason.
    pub packets_blocked: u64,
    /// Flows currently tracked.
    pub connections_tracked: usize,
    /// Flows removed by timeout or pressure.
    pub connections_evicted: u64,
    /// Payloads blocked by the IPS.
    pub ips_alerts: u64,
    /// Payloads scanned.
    pub ips_inspections: u64,
    /// Responses applied.
    pub responses_applied: u64,
    /// Inbound rules.
    pub rules_inbound: usize,
    /// Outbound rules.
    pub rules_outbound: usize,
    /// Forwarded rules.
    pub rules_forwarded: usize,
}

struct InstalledRule {
    id: u32,
    rule: FirewallRule,
    match_count: AtomicU64,
    last_match: AtomicU64,
}

impl InstalledRule {
    fn info(&self, direction: Direction) -> RuleInfo {
        RuleInfo {
            id: self.id,
            direction,
            rule: self.rule.clone(),
            match_count: self.match_count.load(Ordering::Relaxed),
            last_match: self.last_match.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Chains {
    inbound: Vec<InstalledRule>,
    outbound: Vec<InstalledRule>,
    forwarded: Vec<InstalledRule>,
}

impl Chains {
    fn chain(&self, direction: Direction) -> &Vec<InstalledRule> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
            Direction::Forwarded => &self.forwarded,
        }
    }

    fn chain_mut(&mut self, direction: Direction) -> &mut Vec<InstalledRule> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
            Direction::Forwarded => &mut self.forwarded,
        }
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    ips_alerts: AtomicU64,
    ips_inspections: AtomicU64,
    responses_applied: AtomicU64,
}

/// Why a packet was blocked.
enum BlockReason {
    Rule(String),
    NoRule,
    Suspicious,
    Ips(IpsVerdict),
    Internal,
}

/// The packet filter.
pub struct PacketFilter {
    chains: RwLock<Chains>,
    connections: Mutex<ConnectionTable>,
    ips: IpsEngine,
    settings: NetfilterSettings,
    next_rule_id: AtomicU32,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl std::fmt::Debug for PacketFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFilter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PacketFilter {
    /// Filter with empty chains: inbound and forwarded traffic is denied,
    /// outbound allowed.
    pub fn new(settings: NetfilterSettings, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            chains: RwLock::new(Chains::default()),
            connections: Mutex::new(ConnectionTable::new(
                settings.max_connections,
                settings.connection_timeout_secs,
            )),
            ips: IpsEngine::new(),
            settings,
            next_rule_id: AtomicU32::new(1),
            audit,
            clock,
            counters: Counters::default(),
        }
    }

    /// Append the built-in inbound and outbound chains.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::append_rule`] failures.
    pub fn load_default_rules(&self) -> Result<()> {
        for rule in default_inbound() {
            self.append_rule(Direction::Inbound, rule)?;
        }
        for rule in default_outbound() {
            self.append_rule(Direction::Outbound, rule)?;
        }
        info!("default firewall rules loaded");
        Ok(())
    }

    /// Append `rule` to a chain, returning its id.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::OutOfMemory`] when the chain is full.
    /// - [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn append_rule(&self, direction: Direction, rule: FirewallRule) -> Result<u32> {
        self.install(direction, None, rule)
    }

    /// Insert `rule` at `index` in a chain, returning its id.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] if `index` is past the end.
    /// - [`SecurityError::OutOfMemory`] when the chain is full.
    /// - [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn insert_rule(&self, direction: Direction, index: usize, rule: FirewallRule) -> Result<u32> {
        self.install(direction, Some(index), rule)
    }

    fn install(&self, direction: Direction, index: Option<usize>, rule: FirewallRule) -> Result<u32> {
        let mut chains = self
            .chains
            .write()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?;
        let chain = chains.chain_mut(direction);
        if chain.len() >= self.settings.max_rules_per_chain {
            return Err(SecurityError::OutOfMemory(format!(
                "{} chain holds the maximum of {} rules",
                direction.as_str(),
                self.settings.max_rules_per_chain
            )));
        }
        let index = index.unwrap_or(chain.len());
        if index > chain.len() {
            return Err(SecurityError::InvalidParameter(format!(
                "index {index} past end of {} chain",
                direction.as_str()
            )));
        }
        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = %rule.name, chain = direction.as_str(), index, "firewall rule installed");
        chain.insert(
            index,
            InstalledRule {
                id,
                rule,
                match_count: AtomicU64::new(0),
                last_match: AtomicU64::new(0),
            },
        );
        Ok(id)
    }

    /// Remove the rule with `id` from whichever chain holds it.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotFound`] if no rule has that id.
    /// - [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn remove_rule(&self, id: u32) -> Result<()> {
        let mut chains = self
            .chains
            .write()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?;
        for direction in [Direction::Inbound, Direction::Outbound, Direction::Forwarded] {
            let chain = chains.chain_mut(direction);
            if let Some(pos) = chain.iter().position(|r| r.id == id) {
                chain.remove(pos);
                debug!(id, chain = direction.as_str(), "firewall rule removed");
                return Ok(());
            }
        }
        Err(SecurityError::NotFound(format!("firewall rule {id}")))
    }

    /// Rules of one chain with their counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn rules(&self, direction: Direction) -> Result<Vec<RuleInfo>> {
        let chains = self
            .chains
            .read()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?;
        Ok(chains
            .chain(direction)
            .iter()
            .map(|r| r.info(direction))
            .collect())
    }

    /// Decide one packet.
    ///
    /// Never fails: internal errors block the packet.
    pub fn process_packet(&self, header: &PacketHeader, payload: &[u8], direction: Direction) -> Verdict {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_secs();
        match self.decide(header, payload, direction, now) {
            Ok(logged) => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                if let Some(rule) = logged {
                    self.audit.emit(self.packet_event(
                        header,
                        direction,
                        EventKind::NetworkAccess,
                        Severity::clamped(1),
                        format!("Packet allowed by rule {rule}"),
                        false,
                    ));
                }
                Verdict::Allow
            }
            Err(reason) => {
                self.block(header, direction, reason);
                Verdict::Block
            }
        }
    }

    /// Ok means allow and carries the name of a logging rule; Err carries
    /// the block reason. Locks are released before returning.
    fn decide(
        &self,
        header: &PacketHeader,
        payload: &[u8],
        direction: Direction,
        now: u64,
    ) -> std::result::Result<Option<String>, BlockReason> {
        let (action, rule_name, log) = {
            let chains = self.chains.read().map_err(|e| {
                warn!(error = %e, "netfilter rule lock poisoned, blocking");
                BlockReason::Internal
            })?;
            let matched = chains.chain(direction).iter().find(|r| {
                r.rule.enabled
                    && r.rule.matches(
                        header.src,
                        header.dst,
                        header.src_port,
                        header.dst_port,
                        header.protocol,
                    )
            });
            match matched {
                Some(r) => {
                    r.match_count.fetch_add(1, Ordering::Relaxed);
                    r.last_match.store(now, Ordering::Relaxed);
                    (r.rule.action, Some(r.rule.name.clone()), r.rule.log)
                }
                None => (default_action(direction), None, false),
            }
        };
        if !action.is_allow() {
            return Err(match rule_name {
                Some(name) => BlockReason::Rule(name),
                None => BlockReason::NoRule,
            });
        }

        let flow = header.flow();
        {
            let mut table = self.connections.lock().map_err(|e| {
                warn!(error = %e, "netfilter connection lock poisoned, blocking");
                BlockReason::Internal
            })?;
            let entry = table.track(
                flow,
                header.tcp_flags,
                direction,
                payload.len(),
                header.owner_pid,
                now,
            );
            if entry.suspicious {
                return Err(BlockReason::Suspicious);
            }
        }

        if self.settings.ips_enabled && !payload.is_empty() {
            self.counters.ips_inspections.fetch_add(1, Ordering::Relaxed);
            let verdict = self.ips.analyze(payload);
            if verdict.score > 0 {
                let mut table = self.connections.lock().map_err(|_| BlockReason::Internal)?;
                if let Some(entry) = table.get_mut(&flow) {
                    entry.threat_score = entry.threat_score.max(verdict.score);
                    if verdict.is_hostile() {
                        entry.suspicious = true;
                    }
                }
            }
            if verdict.is_hostile() {
                return Err(BlockReason::Ips(verdict));
            }
        }
        Ok(rule_name.filter(|_| log))
    }

    fn block(&self, header: &PacketHeader, direction: Direction, reason: BlockReason) {
        self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        let (kind, severity, description) = match reason {
            BlockReason::Rule(name) => (
                EventKind::AccessDenied,
                Severity::clamped(4),
                format!("Packet blocked by rule {name}"),
            ),
            BlockReason::NoRule => (
                EventKind::AccessDenied,
                Severity::clamped(4),
                format!("Packet blocked by {} default policy", direction.as_str()),
            ),
            BlockReason::Suspicious => (
                EventKind::AccessDenied,
                Severity::clamped(6),
                "Packet blocked on suspicious connection".to_owned(),
            ),
            BlockReason::Ips(verdict) => {
                self.counters.ips_alerts.fetch_add(1, Ordering::Relaxed);
                (
                    EventKind::Suspicious,
                    Severity::clamped(7),
                    format!(
                        "IPS blocked payload: score {}, signatures [{}]",
                        verdict.score,
                        verdict.matched.join(", ")
                    ),
                )
            }
            BlockReason::Internal => (
                EventKind::AccessDenied,
                Severity::clamped(6),
                "Packet blocked: filter state unavailable".to_owned(),
            ),
        };
        debug!(flow = %header.flow(), %description, "packet blocked");
        self.audit
            .emit(self.packet_event(header, direction, kind, severity, description, true));
    }

    fn packet_event(
        &self,
        header: &PacketHeader,
        direction: Direction,
        kind: EventKind,
        severity: Severity,
        description: String,
        blocked: bool,
    ) -> SecurityEvent {
        let flow = header.flow();
        SecurityEvent::new(kind, severity, description)
            .process(header.owner_pid, 0)
            .target("netfilter", flow.to_string(), direction.as_str())
            .blocked(blocked)
            .detail(EventDetail::Network(flow))
    }

    /// Snapshot of one tracked flow.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the connection lock is poisoned.
    pub fn connection(&self, flow: &FlowKey) -> Result<Option<ConnectionEntry>> {
        let table = self
            .connections
            .lock()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?;
        Ok(table.get(flow).cloned())
    }

    /// Drop flows idle past the timeout at `now` (seconds).
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the connection lock is poisoned.
    pub fn expire_connections(&self, now: u64) -> Result<usize> {
        let removed = self
            .connections
            .lock()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?
            .expire(now);
        if removed > 0 {
            debug!(removed, "expired idle connections");
        }
        Ok(removed)
    }

    /// Snapshot counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if a filter lock is poisoned.
    pub fn stats(&self) -> Result<NetfilterStats> {
        let (connections_tracked, connections_evicted) = {
            let table = self
                .connections
                .lock()
                .map_err(|e| SecurityError::poisoned("netfilter", e))?;
            (table.len(), table.evicted)
        };
        let chains = self
            .chains
            .read()
            .map_err(|e| SecurityError::poisoned("netfilter", e))?;
        let c = &self.counters;
        Ok(NetfilterStats {
            packets_processed: c.processed.load(Ordering::Relaxed),
            packets_allowed: c.allowed.load(Ordering::Relaxed),
            packets_blocked: c.blocked.load(Ordering::Relaxed),
            connections_tracked,
            connections_evicted,
            ips_alerts: c.ips_alerts.load(Ordering::Relaxed),
            ips_inspections: c.ips_inspections.load(Ordering::Relaxed),
            responses_applied: c.responses_applied.load(Ordering::Relaxed),
            rules_inbound: chains.inbound.len(),
            rules_outbound: chains.outbound.len(),
            rules_forwarded: chains.forwarded.len(),
        })
    }
}

/// No-match default per chain.
fn default_action(direction: Direction) -> RuleAction {
    match direction {
        Direction::Outbound => RuleAction::Allow,
        Direction::Inbound | Direction::Forwarded => RuleAction::Deny,
    }
}

impl ThreatResponder for PacketFilter {
    fn respond(&self, command: &ResponseCommand) {
        let now = self.clock.now_secs();
        let mut table = match self.connections.lock() {
            Ok(table) => table,
            Err(poisoned) => {
                warn!("netfilter connection lock poisoned, applying response anyway");
                poisoned.into_inner()
            }
        };
        match *command {
            ResponseCommand::Terminate { pid, score } => {
                let n = table.flag_owner(pid, true);
                info!(pid, score, connections = n, "closed connections of terminated process");
            }
            ResponseCommand::Quarantine { pid, score } => {
                let n = table.flag_owner(pid, false);
                info!(pid, score, connections = n, "quarantined process connections");
            }
            ResponseCommand::DropConnection { flow } => {
                table.flag_flow(flow, now);
                info!(%flow, "connection dropped");
            }
        }
        drop(table);
        self.counters.responses_applied.fetch_add(1, Ordering::Relaxed);
    }
}
