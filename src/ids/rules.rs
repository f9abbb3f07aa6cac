//! Detection rules and their sliding-window counters.
//!
//! Rules are written as
//! `name:event_type[:threshold=N][:window=N][:pattern=P][:action=A][:failed][:external]`.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::error::{Result, SecurityError};
use crate::types::{EventKind, EventMask, SecurityEvent};

/// Threshold used when a spec gives none.
pub const DEFAULT_THRESHOLD: u32 = 5;

/// Window used when a spec gives none, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Built-in rule set.
pub const DEFAULT_RULE_SPECS: [&str; 14] = [
    "rapid_process_creation:process_create:threshold=10:window=60",
    "privilege_escalation_attempts:capability_use:threshold=5:window=30",
    "suspicious_syscall_pattern:system_call:threshold=100:window=10",
    "rapid_file_access:file_access:threshold=50:window=5",
    "system_file_modification:file_access:pattern=/etc/*:action=write",
    "tmp_executable_creation:file_access:pattern=/tmp/*:action=execute",
    "port_scanning:network_access:threshold=20:window=10",
    "suspicious_outbound_connections:network_access:pattern=*:external",
    "dns_tunneling:network_access:pattern=dns",
    "brute_force_login:login_attempt:threshold=10:window=60:failed",
    "unusual_login_time:login_attempt:pattern=off_hours",
    "buffer_overflow_attempt:suspicious_activity:pattern=stack_corruption",
    "heap_spray_attempt:suspicious_activity:pattern=heap_manipulation",
    "rop_chain_detected:suspicious_activity:pattern=rop_gadgets",
];

/// Invoked synchronously when a rule reaches its threshold.
pub trait RuleCallback: Send + Sync {
    /// `rule` fired on `event`. The return value of the hook is ignored.
    fn on_trigger(&self, rule: &str, event: &SecurityEvent);
}

/// Map an event-type token to the kinds it covers.
pub fn kinds_for_token(token: &str) -> Option<EventMask> {
    let mask = match token {
        "process_create" | "system_call" => EventKind::SyscallTrace.mask(),
        "capability_use" => EventKind::PrivilegeEscalation.mask(),
        "file_access" => EventKind::FileAccess.mask(),
        "network_access" => EventKind::NetworkAccess.mask(),
        "login_attempt" => EventKind::LoginAttempt.mask(),
        "suspicious_activity" => EventKind::Suspicious.mask(),
        "any" => EventMask::all(),
        _ => return None,
    };
    Some(mask)
}

static RULE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").ok());

fn valid_rule_name(name: &str) -> bool {
    RULE_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Anchored matcher for a `*` glob.
fn compile_glob(glob: &str) -> Result<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| SecurityError::InvalidParameter(format!("bad pattern: {e}")))
}

/// A parsed rule specification.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    /// Rule name.
    pub name: String,
    /// Kinds the rule looks at.
    pub kinds: EventMask,
    /// Matches needed within the window.
    pub threshold: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Glob over the event object or description.
    pub pattern: Option<String>,
    /// Required event action.
    pub action: Option<String>,
    /// Only blocked events count.
    pub require_failed: bool,
    /// Only events described as external count.
    pub require_external: bool,
}

impl RuleSpec {
    /// Parse a rule string.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for a bad name, unknown
    /// event type or option, or a zero threshold or window.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(':');
        let name = parts.next().unwrap_or_default();
        if !valid_rule_name(name) {
            return Err(SecurityError::InvalidParameter(format!(
                "invalid rule name in '{spec}'"
            )));
        }
        let token = parts.next().unwrap_or_default();
        let kinds = kinds_for_token(token).ok_or_else(|| {
            SecurityError::InvalidParameter(format!("unknown event type '{token}'"))
        })?;

        let mut parsed = RuleSpec {
            name: name.to_owned(),
            kinds,
            threshold: DEFAULT_THRESHOLD,
            window_secs: DEFAULT_WINDOW_SECS,
            pattern: None,
            action: None,
            require_failed: false,
            require_external: false,
        };
        for option in parts {
            match option.split_once('=') {
                Some(("threshold", v)) => parsed.threshold = parse_positive(v, "threshold")?,
                Some(("window", v)) => parsed.window_secs = u64::from(parse_positive(v, "window")?),
                Some(("pattern", v)) if !v.is_empty() => parsed.pattern = Some(v.to_owned()),
                Some(("action", v)) if !v.is_empty() => parsed.action = Some(v.to_owned()),
                None if option == "failed" => parsed.require_failed = true,
                None if option == "external" => parsed.require_external = true,
                _ => {
                    return Err(SecurityError::InvalidParameter(format!(
                        "unknown rule option '{option}'"
                    )))
                }
            }
        }
        Ok(parsed)
    }
}

fn parse_positive(value: &str, what: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SecurityError::InvalidParameter(format!(
            "{what} must be a positive integer"
        ))),
    }
}

/// Counters exposed for one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdsRuleInfo {
    /// Rule id.
    pub id: u32,
    /// Rule name.
    pub name: String,
    /// Threshold.
    pub threshold: u32,
    /// Window in seconds.
    pub window_secs: u64,
    /// Total matching events.
    pub matches: u64,
    /// Times the threshold was reached.
    pub triggers: u64,
    /// Seconds timestamp of the latest match.
    pub last_match: u64,
}

/// A registered rule with its window state.
pub struct IdsRule {
    pub(crate) id: u32,
    spec: RuleSpec,
    pattern: Option<Regex>,
    hits: VecDeque<u64>,
    matches: u64,
    triggers: u64,
    last_match: u64,
    pub(crate) callback: Option<Arc<dyn RuleCallback>>,
}

impl std::fmt::Debug for IdsRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdsRule")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .finish_non_exhaustive()
    }
}

impl IdsRule {
    /// Build a rule from a parsed spec.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] if the pattern does not compile.
    pub fn new(id: u32, spec: RuleSpec, callback: Option<Arc<dyn RuleCallback>>) -> Result<Self> {
        let pattern = spec.pattern.as_deref().map(compile_glob).transpose()?;
        Ok(Self {
            id,
            spec,
            pattern,
            hits: VecDeque::new(),
            matches: 0,
            triggers: 0,
            last_match: 0,
            callback,
        })
    }

    /// Rule name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Whether `event` is the kind of event this rule counts.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if !self.spec.kinds.includes(event.kind) {
            return false;
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&event.object) && !pattern.is_match(&event.description) {
                return false;
            }
        }
        if let Some(action) = &self.spec.action {
            if event.action != *action {
                return false;
            }
        }
        if self.spec.require_failed && !event.blocked {
            return false;
        }
        if self.spec.require_external && !event.description.contains("external") {
            return false;
        }
        true
    }

    /// Count a match at `now` (seconds). Returns `true` when the window
    /// holds `threshold` matches; the window then starts over.
    pub fn record(&mut self, now: u64) -> bool {
        let window = self.spec.window_secs;
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_sub(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.matches = self.matches.saturating_add(1);
        self.last_match = now;

        let threshold = usize::try_from(self.spec.threshold).unwrap_or(usize::MAX);
        if self.hits.len() >= threshold {
            self.hits.clear();
            self.triggers = self.triggers.saturating_add(1);
            true
        } else {
            false
        }
    }

    /// Snapshot.
    pub fn info(&self) -> IdsRuleInfo {
        IdsRuleInfo {
            id: self.id,
            name: self.spec.name.clone(),
            threshold: self.spec.threshold,
            window_secs: self.spec.window_secs,
            matches: self.matches,
            triggers: self.triggers,
            last_match: self.last_match,
        }
    }
}
