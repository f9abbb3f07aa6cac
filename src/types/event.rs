//! Security events: the unit every component emits and the audit log stores.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An access check returned deny.
    AccessDenied,
    /// Policy was changed or violated.
    PolicyViolation,
    /// Privileges were granted, used or revoked.
    PrivilegeEscalation,
    /// Suspicious activity (corruption, intrusion, IPS hit).
    Suspicious,
    /// Cryptographic key lifecycle operation.
    CryptoOp,
    /// Authentication attempt.
    LoginAttempt,
    /// System call trace, including process creation.
    SyscallTrace,
    /// Filesystem access.
    FileAccess,
    /// Network access.
    NetworkAccess,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::AccessDenied,
        EventKind::PolicyViolation,
        EventKind::PrivilegeEscalation,
        EventKind::Suspicious,
        EventKind::CryptoOp,
        EventKind::LoginAttempt,
        EventKind::SyscallTrace,
        EventKind::FileAccess,
        EventKind::NetworkAccess,
    ];

    /// The single policy bit for this kind.
    pub fn mask(self) -> EventMask {
        match self {
            EventKind::AccessDenied => EventMask::ACCESS_DENIED,
            EventKind::PolicyViolation => EventMask::POLICY_VIOLATION,
            EventKind::PrivilegeEscalation => EventMask::PRIVILEGE_ESCALATION,
            EventKind::Suspicious => EventMask::SUSPICIOUS,
            EventKind::CryptoOp => EventMask::CRYPTO_OP,
            EventKind::LoginAttempt => EventMask::LOGIN_ATTEMPT,
            EventKind::SyscallTrace => EventMask::SYSCALL_TRACE,
            EventKind::FileAccess => EventMask::FILE_ACCESS,
            EventKind::NetworkAccess => EventMask::NETWORK_ACCESS,
        }
    }

    /// Stable snake_case name, as written to the persistent log.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AccessDenied => "access_denied",
            EventKind::PolicyViolation => "policy_violation",
            EventKind::PrivilegeEscalation => "privilege_escalation",
            EventKind::Suspicious => "suspicious",
            EventKind::CryptoOp => "crypto_op",
            EventKind::LoginAttempt => "login_attempt",
            EventKind::SyscallTrace => "syscall_trace",
            EventKind::FileAccess => "file_access",
            EventKind::NetworkAccess => "network_access",
        }
    }

    /// Position of this kind in [`EventKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            EventKind::AccessDenied => 0,
            EventKind::PolicyViolation => 1,
            EventKind::PrivilegeEscalation => 2,
            EventKind::Suspicious => 3,
            EventKind::CryptoOp => 4,
            EventKind::LoginAttempt => 5,
            EventKind::SyscallTrace => 6,
            EventKind::FileAccess => 7,
            EventKind::NetworkAccess => 8,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SecurityError::InvalidParameter(format!("unknown event kind: {s}")))
    }
}

bitflags! {
    /// Set of event kinds, used by the audit policy and IDS rule filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// [`EventKind::AccessDenied`]
        const ACCESS_DENIED = 1 << 0;
        /// [`EventKind::PolicyViolation`]
        const POLICY_VIOLATION = 1 << 1;
        /// [`EventKind::PrivilegeEscalation`]
        const PRIVILEGE_ESCALATION = 1 << 2;
        /// [`EventKind::Suspicious`]
        const SUSPICIOUS = 1 << 3;
        /// [`EventKind::CryptoOp`]
        const CRYPTO_OP = 1 << 4;
        /// [`EventKind::LoginAttempt`]
        const LOGIN_ATTEMPT = 1 << 5;
        /// [`EventKind::SyscallTrace`]
        const SYSCALL_TRACE = 1 << 6;
        /// [`EventKind::FileAccess`]
        const FILE_ACCESS = 1 << 7;
        /// [`EventKind::NetworkAccess`]
        const NETWORK_ACCESS = 1 << 8;
    }
}

impl EventMask {
    /// Whether `kind` is in this set.
    pub fn includes(self, kind: EventKind) -> bool {
        self.contains(kind.mask())
    }
}

/// Event severity on a 0..=9 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Severity(u8);

impl Severity {
    /// Highest severity.
    pub const MAX: Severity = Severity(9);
    /// Critical events trigger the operator alert path.
    pub const CRITICAL: Severity = Severity(8);
    /// Warning threshold used for statistics.
    pub const WARNING: Severity = Severity(5);
    /// Informational threshold used for statistics.
    pub const INFO: Severity = Severity(3);

    /// Validate a raw severity.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] above 9.
    pub fn new(level: u8) -> Result<Self, SecurityError> {
        if level > 9 {
            return Err(SecurityError::InvalidParameter(format!(
                "severity {level} out of range 0..=9"
            )));
        }
        Ok(Self(level))
    }

    /// Build a severity, clamping anything above 9.
    pub const fn clamped(level: u8) -> Self {
        if level > 9 {
            Self(9)
        } else {
            Self(level)
        }
    }

    /// Raw level.
    pub fn level(self) -> u8 {
        self.0
    }

    /// At or above [`Severity::CRITICAL`].
    pub fn is_critical(self) -> bool {
        self >= Self::CRITICAL
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known IP protocol numbers. `ANY` matches every protocol in filter rules.
pub mod protocol {
    /// Wildcard.
    pub const ANY: u8 = 0;
    /// ICMP.
    pub const ICMP: u8 = 1;
    /// TCP.
    pub const TCP: u8 = 6;
    /// UDP.
    pub const UDP: u8 = 17;
}

/// A network flow: 4-tuple plus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
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
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src, self.src_port, self.dst, self.dst_port, self.protocol
        )
    }
}

/// Kind-specific payload attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDetail {
    /// No extra data.
    #[default]
    None,
    /// The flow a network event refers to.
    Network(FlowKey),
    /// The system call number a trace event refers to.
    Syscall(u32),
}

/// A single security event.
///
/// Built by the component that made the decision, then copied into the audit
/// log which assigns `event_id`. A zero `timestamp` is stamped by the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Monotonic sequence number assigned by the audit log (0 until logged).
    pub event_id: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Process the event concerns (0 for the kernel).
    pub pid: u32,
    /// User id of that process.
    pub uid: u32,
    /// Classification.
    pub kind: EventKind,
    /// Severity 0..=9.
    pub severity: Severity,
    /// Whether the operation was blocked.
    pub blocked: bool,
    /// Human-readable description.
    pub description: String,
    /// Subject label or name.
    pub subject: String,
    /// Object label, path or address.
    pub object: String,
    /// Requested action.
    pub action: String,
    /// Kind-specific detail.
    #[serde(default)]
    pub detail: EventDetail,
}

impl SecurityEvent {
    /// Start a new event with empty subject, object and action.
    pub fn new(kind: EventKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            event_id: 0,
            timestamp: 0,
            pid: 0,
            uid: 0,
            kind,
            severity,
            blocked: false,
            description: description.into(),
            subject: String::new(),
            object: String::new(),
            action: String::new(),
            detail: EventDetail::None,
        }
    }

    /// Set the originating process.
    #[must_use]
    pub fn process(mut self, pid: u32, uid: u32) -> Self {
        self.pid = pid;
        self.uid = uid;
        self
    }

    /// Set subject, object and action labels.
    #[must_use]
    pub fn target(
        mut self,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.subject = subject.into();
        self.object = object.into();
        self.action = action.into();
        self
    }

    /// Mark the operation as blocked or allowed.
    #[must_use]
    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    /// Set the timestamp in microseconds.
    #[must_use]
    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach kind-specific detail.
    #[must_use]
    pub fn detail(mut self, detail: EventDetail) -> Self {
        self.detail = detail;
        self
    }
}
