//! Mandatory access control.
//!
//! An ordered rule list decides whether a subject type may perform an
//! action on an object type. The first matching rule wins; with no match
//! the engine denies in enforcing mode and allows in permissive mode.

pub mod rules;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

pub use rules::{default_rules, pattern_matches, MacConditions, MacRule, PolicyFile};

use crate::audit::AuditLog;
use crate::error::{Result, SecurityError};
use crate::types::context::validate_label;
use crate::types::{AccessMask, Clock, Decision, EventKind, SecurityContext, SecurityEvent, Severity};

/// Default cap on installed rules.
pub const DEFAULT_MAX_RULES: usize = 4096;

/// Name of the built-in policy.
pub const DEFAULT_POLICY_NAME: &str = "default";

/// Policy summary and decision counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacStats {
    /// Active policy name.
    pub policy_name: String,
    /// Installed rules.
    pub rule_count: usize,
    /// Rule cap.
    pub max_rules: usize,
    /// Whether no-match denies.
    pub enforcing: bool,
    /// Checks evaluated.
    pub checks: u64,
    /// Checks allowed.
    pub allowed: u64,
    /// Checks denied.
    pub denied: u64,
    /// Checks decided by the no-match default.
    pub default_decisions: u64,
}

struct Policy {
    name: String,
    rules: Vec<MacRule>,
    enforcing: bool,
}

/// The MAC policy engine.
pub struct MacEngine {
    policy: RwLock<Policy>,
    max_rules: usize,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    default_decisions: AtomicU64,
}

impl std::fmt::Debug for MacEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacEngine")
            .field("max_rules", &self.max_rules)
            .finish_non_exhaustive()
    }
}

impl MacEngine {
    /// Engine with the built-in policy loaded.
    pub fn new(enforcing: bool, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self::with_rules(DEFAULT_POLICY_NAME, default_rules(), enforcing, audit, clock)
    }

    /// Engine with an explicit rule list.
    pub fn with_rules(
        name: &str,
        rules: Vec<MacRule>,
        enforcing: bool,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: RwLock::new(Policy {
                name: name.to_owned(),
                rules,
                enforcing,
            }),
            max_rules: DEFAULT_MAX_RULES,
            audit,
            clock,
            checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            default_decisions: AtomicU64::new(0),
        }
    }

    /// Override the rule cap.
    #[must_use]
    pub fn with_max_rules(mut self, max_rules: usize) -> Self {
        self.max_rules = max_rules;
        self
    }

    /// Decide whether `subject` may perform `action` on `object`.
    ///
    /// Every deny is recorded as one `AccessDenied` event.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for an empty action.
    /// - [`SecurityError::LockPoisoned`] if the policy lock is poisoned.
    pub fn check_permission(
        &self,
        subject: &SecurityContext,
        object: &SecurityContext,
        action: &str,
        requested: AccessMask,
    ) -> Result<Decision> {
        self.check_for_process(0, subject, object, action, requested)
    }

    /// [`Self::check_permission`] on behalf of `pid`, which is stamped on
    /// the deny event.
    ///
    /// # Errors
    ///
    /// Same as [`Self::check_permission`].
    pub fn check_for_process(
        &self,
        pid: u32,
        subject: &SecurityContext,
        object: &SecurityContext,
        action: &str,
        requested: AccessMask,
    ) -> Result<Decision> {
        if action.is_empty() {
            return Err(SecurityError::InvalidParameter("action is empty".to_owned()));
        }
        let subject_type = subject.type_field();
        let object_type = object.type_field();

        let (decision, matched) = {
            let policy = self
                .policy
                .read()
                .map_err(|e| SecurityError::poisoned("mac", e))?;
            let matched = policy.rules.iter().position(|rule| {
                rule.covers(subject_type, object_type, action)
                    && self.conditions_hold(rule.conditions, subject, object)
            });
            let decision = match matched.and_then(|i| policy.rules.get(i)) {
                Some(rule) if rule.allow => Decision::Allow,
                Some(_) => Decision::Deny,
                None if policy.enforcing => Decision::Deny,
                None => Decision::Allow,
            };
            (decision, matched)
        };

        self.checks.fetch_add(1, Ordering::Relaxed);
        if matched.is_none() {
            self.default_decisions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            subject = subject_type,
            object = object_type,
            action,
            rule = ?matched,
            ?decision,
            "mac decision"
        );

        match decision {
            Decision::Allow => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Deny => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                let reason = if matched.is_some() { "rule" } else { "default" };
                self.audit.emit(
                    SecurityEvent::new(
                        EventKind::AccessDenied,
                        Severity::WARNING,
                        format!(
                            "MAC denied {action} (access 0x{:x}) by {reason}",
                            requested.bits()
                        ),
                    )
                    .process(pid, subject.subject_id())
                    .target(subject.label(), object.path().unwrap_or(object.label()), action)
                    .blocked(true),
                );
            }
        }
        Ok(decision)
    }

    fn conditions_hold(
        &self,
        conditions: MacConditions,
        subject: &SecurityContext,
        object: &SecurityContext,
    ) -> bool {
        if conditions.contains(MacConditions::NOT_OWNER)
            && subject.subject_id() == object.subject_id()
        {
            return false;
        }
        if conditions.contains(MacConditions::SYSTEM_PATH) && !is_system_path(object.path()) {
            return false;
        }
        if conditions.contains(MacConditions::BUSINESS_HOURS) {
            let hour = self.clock.hour_utc();
            if !(8..18).contains(&hour) {
                return false;
            }
        }
        true
    }

    /// Switch between enforcing and permissive. Always audited.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the policy lock is poisoned.
    pub fn set_enforcing(&self, enforcing: bool) -> Result<()> {
        {
            let mut policy = self
                .policy
                .write()
                .map_err(|e| SecurityError::poisoned("mac", e))?;
            policy.enforcing = enforcing;
        }
        info!(enforcing, "mac mode changed");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::PolicyViolation,
                Severity::WARNING,
                format!(
                    "MAC mode set to {}",
                    if enforcing { "enforcing" } else { "permissive" }
                ),
            )
            .target("mac", "policy", "set_enforcing"),
        );
        Ok(())
    }

    /// Whether no-match denies.
    pub fn is_enforcing(&self) -> bool {
        self.policy.read().map(|p| p.enforcing).unwrap_or(true)
    }

    /// Append a rule after all existing ones.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for empty rule fields.
    /// - [`SecurityError::OutOfMemory`] at the rule cap.
    /// - [`SecurityError::LockPoisoned`] if the policy lock is poisoned.
    pub fn add_rule(&self, rule: MacRule) -> Result<()> {
        rule.validate()?;
        let mut policy = self
            .policy
            .write()
            .map_err(|e| SecurityError::poisoned("mac", e))?;
        if policy.rules.len() >= self.max_rules {
            return Err(SecurityError::OutOfMemory(format!(
                "mac policy holds the maximum of {} rules",
                self.max_rules
            )));
        }
        policy.rules.push(rule);
        debug!(rules = policy.rules.len(), "mac rule appended");
        Ok(())
    }

    /// Replace the whole policy with the contents of a TOML document.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for malformed policies.
    /// - [`SecurityError::OutOfMemory`] if the policy exceeds the rule cap.
    /// - [`SecurityError::LockPoisoned`] if the policy lock is poisoned.
    pub fn load_policy_toml(&self, toml_str: &str) -> Result<()> {
        let file = PolicyFile::from_toml(toml_str)?;
        let name = file.name.clone();
        let enforcing = file.enforcing;
        let rules = file.into_rules()?;
        if rules.len() > self.max_rules {
            return Err(SecurityError::OutOfMemory(format!(
                "policy has {} rules, limit is {}",
                rules.len(),
                self.max_rules
            )));
        }
        let count = rules.len();
        {
            let mut policy = self
                .policy
                .write()
                .map_err(|e| SecurityError::poisoned("mac", e))?;
            policy.name = name.clone();
            policy.rules = rules;
        }
        info!(policy = %name, rules = count, "mac policy loaded");
        if let Some(enforcing) = enforcing {
            self.set_enforcing(enforcing)?;
        }
        Ok(())
    }

    /// [`Self::load_policy_toml`] from a file.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NotFound`] when the file cannot be read, and
    /// otherwise the errors of [`Self::load_policy_toml`].
    pub fn load_policy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::NotFound(format!("policy file {}: {e}", path.display()))
        })?;
        self.load_policy_toml(&contents)
    }

    /// Check a label without building a context.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for malformed labels.
    pub fn validate_context(&self, label: &str) -> Result<()> {
        validate_label(label)
    }

    /// Policy summary and counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the policy lock is poisoned.
    pub fn policy_info(&self) -> Result<MacStats> {
        let policy = self
            .policy
            .read()
            .map_err(|e| SecurityError::poisoned("mac", e))?;
        Ok(MacStats {
            policy_name: policy.name.clone(),
            rule_count: policy.rules.len(),
            max_rules: self.max_rules,
            enforcing: policy.enforcing,
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            default_decisions: self.default_decisions.load(Ordering::Relaxed),
        })
    }
}

fn is_system_path(path: Option<&str>) -> bool {
    let Some(path) = path else {
        return false;
    };
    rules::SYSTEM_PATH_PREFIXES.iter().any(|prefix| {
        path.starts_with(prefix) || path == prefix.trim_end_matches('/')
    })
}
