//! MAC rules, conditions and the built-in policy.

use bitflags::bitflags;
use serde::Deserialize;

use crate::error::{Result, SecurityError};

bitflags! {
    /// Extra predicates a rule requires before it matches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MacConditions: u32 {
        /// Subject and object owners differ.
        const NOT_OWNER = 1 << 0;
        /// Object path is under a system directory.
        const SYSTEM_PATH = 1 << 1;
        /// Clock is within 08:00-18:00 UTC.
        const BUSINESS_HOURS = 1 << 2;
    }
}

/// Path prefixes treated as system locations by [`MacConditions::SYSTEM_PATH`].
pub const SYSTEM_PATH_PREFIXES: [&str; 7] =
    ["/bin/", "/sbin/", "/lib/", "/lib64/", "/usr/", "/etc/", "/boot/"];

/// One access rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacRule {
    /// Pattern over the subject type.
    pub subject_type: String,
    /// Pattern over the object type.
    pub object_type: String,
    /// Pattern over the action name.
    pub action: String,
    /// Outcome when the rule matches.
    pub allow: bool,
    /// Predicates that must all hold.
    pub conditions: MacConditions,
}

impl MacRule {
    /// Unconditional allow rule.
    pub fn allow(subject_type: &str, object_type: &str, action: &str) -> Self {
        Self::new(subject_type, object_type, action, true)
    }

    /// Unconditional deny rule.
    pub fn deny(subject_type: &str, object_type: &str, action: &str) -> Self {
        Self::new(subject_type, object_type, action, false)
    }

    fn new(subject_type: &str, object_type: &str, action: &str, allow: bool) -> Self {
        Self {
            subject_type: subject_type.to_owned(),
            object_type: object_type.to_owned(),
            action: action.to_owned(),
            allow,
            conditions: MacConditions::empty(),
        }
    }

    /// Require `conditions` in addition to the patterns.
    #[must_use]
    pub fn when(mut self, conditions: MacConditions) -> Self {
        self.conditions |= conditions;
        self
    }

    /// Reject rules with empty fields.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] naming the empty field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("subject type", &self.subject_type),
            ("object type", &self.object_type),
            ("action", &self.action),
        ] {
            if value.is_empty() {
                return Err(SecurityError::InvalidParameter(format!(
                    "rule {name} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Whether the rule's patterns cover this request.
    pub fn covers(&self, subject_type: &str, object_type: &str, action: &str) -> bool {
        pattern_matches(&self.subject_type, subject_type)
            && pattern_matches(&self.object_type, object_type)
            && pattern_matches(&self.action, action)
    }
}

/// `*` matches anything; `abc*` matches by prefix; otherwise exact.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, _)) => value.starts_with(prefix),
        None => pattern == value,
    }
}

const ALL_ACTIONS: [&str; 5] = ["read", "write", "execute", "create", "delete"];

/// The built-in policy, in evaluation order.
///
/// Broad kernel allows come first, then per-domain allows and the user
/// deny exceptions, then admin and system domains.
pub fn default_rules() -> Vec<MacRule> {
    let mut rules = Vec::new();
    for action in ALL_ACTIONS {
        rules.push(MacRule::allow("kernel_t", "*", action));
    }

    rules.push(MacRule::allow("init_t", "file_t", "read"));
    rules.push(MacRule::allow("init_t", "file_t", "write"));
    rules.push(MacRule::allow("init_t", "file_t", "execute"));
    rules.push(MacRule::allow("init_t", "device_t", "read"));
    rules.push(MacRule::allow("init_t", "device_t", "write"));

    for object in ["home_t", "tmp_t"] {
        for action in ["read", "write", "create"] {
            rules.push(MacRule::allow("user_t", object, action));
        }
    }
    rules.push(MacRule::allow("user_t", "bin_t", "execute"));
    rules.push(MacRule::allow("user_t", "lib_t", "read"));
    rules.push(MacRule::deny("user_t", "etc_t", "write"));
    rules.push(MacRule::deny("user_t", "device_t", "write"));
    rules.push(MacRule::deny("user_t", "proc_t", "write").when(MacConditions::NOT_OWNER));

    for action in ALL_ACTIONS {
        rules.push(MacRule::allow("admin_t", "*", action));
    }

    rules.push(MacRule::allow("system_t", "file_t", "read"));
    rules.push(MacRule::allow("system_t", "file_t", "write").when(MacConditions::SYSTEM_PATH));
    rules.push(MacRule::allow("system_t", "device_t", "read"));
    rules.push(MacRule::allow("system_t", "proc_t", "read"));
    rules
}

/// Condition names accepted in policy files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionName {
    /// [`MacConditions::NOT_OWNER`]
    NotOwner,
    /// [`MacConditions::SYSTEM_PATH`]
    SystemPath,
    /// [`MacConditions::BUSINESS_HOURS`]
    BusinessHours,
}

impl From<ConditionName> for MacConditions {
    fn from(name: ConditionName) -> Self {
        match name {
            ConditionName::NotOwner => MacConditions::NOT_OWNER,
            ConditionName::SystemPath => MacConditions::SYSTEM_PATH,
            ConditionName::BusinessHours => MacConditions::BUSINESS_HOURS,
        }
    }
}

/// A rule as written in a policy file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    /// Subject type pattern.
    pub subject: String,
    /// Object type pattern.
    pub object: String,
    /// Action pattern.
    pub action: String,
    /// Allow (`true`) or deny.
    pub allow: bool,
    /// Extra predicates.
    #[serde(default)]
    pub conditions: Vec<ConditionName>,
}

impl From<RuleSpec> for MacRule {
    fn from(spec: RuleSpec) -> Self {
        let conditions = spec
            .conditions
            .into_iter()
            .fold(MacConditions::empty(), |acc, c| acc | MacConditions::from(c));
        MacRule {
            subject_type: spec.subject,
            object_type: spec.object,
            action: spec.action,
            allow: spec.allow,
            conditions,
        }
    }
}

/// A complete policy loaded from TOML.
///
/// ```toml
/// name = "site"
/// enforcing = true
/// append_defaults = true
///
/// [[rules]]
/// subject = "user_t"
/// object = "secret_t"
/// action = "*"
/// allow = false
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyFile {
    /// Policy name.
    #[serde(default = "default_policy_name")]
    pub name: String,
    /// Mode to switch to, if given.
    #[serde(default)]
    pub enforcing: Option<bool>,
    /// Append the built-in rules after the file's rules.
    #[serde(default)]
    pub append_defaults: bool,
    /// Rules, in evaluation order.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_policy_name() -> String {
    "custom".to_owned()
}

impl PolicyFile {
    /// Parse a policy file.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for malformed TOML or empty rule fields.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let policy: PolicyFile = toml::from_str(toml_str)
            .map_err(|e| SecurityError::InvalidParameter(format!("policy parse error: {e}")))?;
        Ok(policy)
    }

    /// Rules in evaluation order, defaults included when requested.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for rules with empty fields.
    pub fn into_rules(self) -> Result<Vec<MacRule>> {
        let mut rules: Vec<MacRule> = self.rules.into_iter().map(MacRule::from).collect();
        for rule in &rules {
            rule.validate()?;
        }
        if self.append_defaults {
            rules.extend(default_rules());
        }
        Ok(rules)
    }
}
