//! Firewall rules, address and port matchers, and the default chains.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::types::protocol;

/// Which chain a packet traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Addressed to this host.
    Inbound,
    /// Originating on this host.
    Outbound,
    /// Routed through this host.
    Forwarded,
}

impl Direction {
    /// Map the classic `outbound` flag.
    pub fn from_outbound(outbound: bool) -> Self {
        if outbound {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Forwarded => "forwarded",
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Let the packet through.
    Allow,
    /// Refuse the packet.
    Deny,
    /// Discard silently.
    Drop,
    /// Refuse and notify the sender.
    Reject,
}

impl RuleAction {
    /// `true` only for [`RuleAction::Allow`].
    pub fn is_allow(self) -> bool {
        matches!(self, RuleAction::Allow)
    }
}

/// Address with mask. `0.0.0.0` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrMatch {
    /// Network address.
    pub addr: Ipv4Addr,
    /// Network mask.
    pub mask: Ipv4Addr,
}

impl AddrMatch {
    /// Matches every address.
    pub const ANY: AddrMatch = AddrMatch {
        addr: Ipv4Addr::UNSPECIFIED,
        mask: Ipv4Addr::UNSPECIFIED,
    };

    /// Exactly `addr`.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self::net(addr, 32)
    }

    /// `addr/prefix`. Prefixes above 32 are treated as 32.
    pub fn net(addr: Ipv4Addr, prefix: u8) -> Self {
        let prefix = u32::from(prefix.min(32));
        let mask = u32::MAX.checked_shl(32u32.saturating_sub(prefix)).unwrap_or(0);
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            mask: Ipv4Addr::from(mask),
        }
    }

    /// Whether `ip` falls in this range.
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        if self.addr.is_unspecified() {
            return true;
        }
        u32::from(ip) & u32::from(self.mask) == u32::from(self.addr)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// Every port.
    pub const ANY: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };

    /// A single port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// `start..=end`.
    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Whether `port` is in range.
    pub fn matches(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// A firewall rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Short name used in logs.
    pub name: String,
    /// Disabled rules are skipped.
    pub enabled: bool,
    /// Source range.
    pub src: AddrMatch,
    /// Destination range.
    pub dst: AddrMatch,
    /// Source ports.
    pub src_ports: PortRange,
    /// Destination ports.
    pub dst_ports: PortRange,
    /// IP protocol, `0` for any.
    pub protocol: u8,
    /// Outcome on match.
    pub action: RuleAction,
    /// Record allowed packets.
    pub log: bool,
}

impl FirewallRule {
    /// Rule matching every packet.
    pub fn new(name: &str, action: RuleAction) -> Self {
        Self {
            name: name.to_owned(),
            enabled: true,
            src: AddrMatch::ANY,
            dst: AddrMatch::ANY,
            src_ports: PortRange::ANY,
            dst_ports: PortRange::ANY,
            protocol: protocol::ANY,
            action,
            log: false,
        }
    }

    /// Restrict to one protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restrict the source range.
    #[must_use]
    pub fn src(mut self, src: AddrMatch) -> Self {
        self.src = src;
        self
    }

    /// Restrict the destination range.
    #[must_use]
    pub fn dst(mut self, dst: AddrMatch) -> Self {
        self.dst = dst;
        self
    }

    /// Restrict source ports.
    #[must_use]
    pub fn src_ports(mut self, ports: PortRange) -> Self {
        self.src_ports = ports;
        self
    }

    /// Restrict destination ports.
    #[must_use]
    pub fn dst_ports(mut self, ports: PortRange) -> Self {
        self.dst_ports = ports;
        self
    }

    /// Record packets this rule allows.
    #[must_use]
    pub fn logged(mut self) -> Self {
        self.log = true;
        self
    }

    /// Whether the 5-tuple falls under this rule. Ignores `enabled`.
    pub fn matches(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        proto: u8,
    ) -> bool {
        (self.protocol == protocol::ANY || self.protocol == proto)
            && self.src.matches(src)
            && self.dst.matches(dst)
            && self.src_ports.matches(src_port)
            && self.dst_ports.matches(dst_port)
    }
}

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Built-in inbound chain. Ends in a catch-all drop.
pub fn default_inbound() -> Vec<FirewallRule> {
    vec![
        FirewallRule::new("loopback", RuleAction::Allow).src(AddrMatch::host(LOOPBACK)),
        FirewallRule::new("ssh", RuleAction::Allow)
            .protocol(protocol::TCP)
            .dst_ports(PortRange::single(22))
            .logged(),
        FirewallRule::new("http", RuleAction::Allow)
            .protocol(protocol::TCP)
            .dst_ports(PortRange::single(80)),
        FirewallRule::new("https", RuleAction::Allow)
            .protocol(protocol::TCP)
            .dst_ports(PortRange::single(443)),
        FirewallRule::new("netbios", RuleAction::Drop)
            .dst_ports(PortRange::range(137, 139))
            .logged(),
        FirewallRule::new("smb", RuleAction::Drop)
            .protocol(protocol::TCP)
            .dst_ports(PortRange::single(445))
            .logged(),
        FirewallRule::new("default-drop", RuleAction::Drop),
    ]
}

/// Built-in outbound chain. Ends in a catch-all allow.
pub fn default_outbound() -> Vec<FirewallRule> {
    vec![
        FirewallRule::new("loopback", RuleAction::Allow).dst(AddrMatch::host(LOOPBACK)),
        FirewallRule::new("dns-tcp", RuleAction::Allow)
            .protocol(protocol::TCP)
            .dst_ports(PortRange::single(53)),
        FirewallRule::new("dns-udp", RuleAction::Allow)
            .protocol(protocol::UDP)
            .dst_ports(PortRange::single(53)),
        FirewallRule::new("default-allow", RuleAction::Allow),
    ]
}
