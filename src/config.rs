//! Configuration loading.
//!
//! Loads `./bastion.toml` (or `$BASTION_CONFIG_PATH`). Environment
//! variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditSettings, DEFAULT_CAPACITY, DEFAULT_CRITICAL_CAPACITY};
use crate::hardware::HardwareFeatures;
use crate::ids::{IdsSettings, RuleSpec, DEFAULT_MAX_BEHAVIORS, DEFAULT_MAX_RULES as IDS_MAX_RULES};
use crate::mac::{PolicyFile, DEFAULT_MAX_RULES as MAC_MAX_RULES};
use crate::memory::MemorySettings;
use crate::netfilter::{
    NetfilterSettings, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_RULES_PER_CHAIN,
};
use crate::types::{EventKind, EventMask};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BastionConfig {
    /// `[audit]`
    pub audit: AuditConfig,
    /// `[mac]`
    pub mac: MacConfig,
    /// `[crypto]`
    pub crypto: CryptoConfig,
    /// `[memory]`
    pub memory: MemorySettings,
    /// `[netfilter]`
    pub netfilter: NetfilterConfig,
    /// `[ids]`
    pub ids: IdsConfig,
    /// `[hardware]`
    pub hardware: HardwareConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
}

impl BastionConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("BASTION_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bastion.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("BASTION_AUDIT_LOG") {
            self.audit.log_path = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = env("BASTION_AUDIT_CAPACITY") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.audit.capacity = n,
                _ => invalid_override("BASTION_AUDIT_CAPACITY", &v),
            }
        }
        if let Some(v) = env("BASTION_MAC_ENFORCING") {
            match parse_bool(&v) {
                Some(b) => self.mac.enforcing = b,
                None => invalid_override("BASTION_MAC_ENFORCING", &v),
            }
        }
        if let Some(v) = env("BASTION_IDS_THRESHOLD") {
            match v.parse::<u32>() {
                Ok(n) if n <= 100 => self.ids.threshold = n,
                _ => invalid_override("BASTION_IDS_THRESHOLD", &v),
            }
        }
        if let Some(v) = env("BASTION_IDS_LEARNING") {
            match parse_bool(&v) {
                Some(b) => self.ids.learning_mode = b,
                None => invalid_override("BASTION_IDS_LEARNING", &v),
            }
        }
        if let Some(v) = env("BASTION_LOG_LEVEL") {
            match crate::logging::check_directives(&v) {
                Ok(()) => self.logging.level = v,
                Err(_) => invalid_override("BASTION_LOG_LEVEL", &v),
            }
        }
        if let Some(v) = env("BASTION_LOG_DIR") {
            self.logging.dir = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML or unknown field types.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: BastionConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.audit.capacity == 0 {
            anyhow::bail!("audit.capacity must be positive");
        }
        self.audit.event_mask()?;
        if self.audit.seal && self.audit.log_path.is_none() {
            anyhow::bail!("audit.seal requires audit.log_path");
        }
        if self.crypto.arena_slots == 0 {
            anyhow::bail!("crypto.arena_slots must be positive");
        }
        if self.ids.threshold > 100 {
            anyhow::bail!("ids.threshold must be at most 100");
        }
        for spec in &self.ids.rules {
            RuleSpec::parse(spec).map_err(|e| anyhow::anyhow!("ids.rules: {e}"))?;
        }
        if let Some(path) = &self.mac.policy_file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read mac.policy_file {}", path.display()))?;
            PolicyFile::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("mac.policy_file {}: {e}", path.display()))?;
        }
        if self.memory.max_allocation == 0 {
            anyhow::bail!("memory.max_allocation must be positive");
        }
        crate::logging::check_directives(&self.logging.level)
            .map_err(|e| anyhow::anyhow!("logging.level: {e:#}"))?;
        if self.logging.audit_file && self.logging.dir.is_none() {
            anyhow::bail!("logging.audit_file requires logging.dir");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid_override(var: &str, value: &str) {
    tracing::warn!(var, value, "ignoring invalid env override");
}

// ── Audit ───────────────────────────────────────────────────────

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Main ring capacity.
    pub capacity: usize,
    /// Critical reserve capacity.
    pub critical_capacity: usize,
    /// Whether logging starts enabled.
    pub enabled: bool,
    /// Enabled event kinds by name; empty enables all.
    pub policy: Vec<String>,
    /// JSON-lines sink; none keeps events in memory only.
    pub log_path: Option<PathBuf>,
    /// Flush to disk after every record.
    pub fsync: bool,
    /// HMAC-chain every persisted record.
    pub seal: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            critical_capacity: DEFAULT_CRITICAL_CAPACITY,
            enabled: true,
            policy: Vec::new(),
            log_path: None,
            fsync: false,
            seal: false,
        }
    }
}

impl AuditConfig {
    /// Enabled kinds as a mask.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unknown kind.
    pub fn event_mask(&self) -> Result<EventMask> {
        if self.policy.is_empty() {
            return Ok(EventMask::all());
        }
        self.policy.iter().try_fold(EventMask::empty(), |mask, name| {
            let kind: EventKind = name
                .parse()
                .map_err(|e| anyhow::anyhow!("audit.policy: {e}"))?;
            Ok(mask | kind.mask())
        })
    }

    /// Runtime settings.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown kind in `policy`.
    pub fn settings(&self) -> Result<AuditSettings> {
        Ok(AuditSettings {
            capacity: self.capacity,
            critical_capacity: self.critical_capacity,
            policy: self.event_mask()?,
            enabled: self.enabled,
        })
    }
}

// ── Logging ─────────────────────────────────────────────────────

/// Diagnostic logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directives; `RUST_LOG` takes precedence.
    pub level: String,
    /// Directory for rotated log files; none logs to stderr only.
    pub dir: Option<PathBuf>,
    /// Mirror recorded audit events into their own rotated file.
    pub audit_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::DEFAULT_LEVEL.to_owned(),
            dir: None,
            audit_file: false,
        }
    }
}

// ── MAC ─────────────────────────────────────────────────────────

/// MAC engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Deny on no match.
    pub enforcing: bool,
    /// Policy TOML to load on top of the built-in rules.
    pub policy_file: Option<PathBuf>,
    /// Rule cap.
    pub max_rules: usize,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            enforcing: true,
            policy_file: None,
            max_rules: MAC_MAX_RULES,
        }
    }
}

// ── Crypto ──────────────────────────────────────────────────────

/// Key service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Secure arena slots, which also bounds the key store.
    pub arena_slots: usize,
    /// Mix the hardware RNG into every request when present.
    pub hardware_rng: bool,
    /// Create the system master and signing keys at startup.
    pub create_default_keys: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            arena_slots: 256,
            hardware_rng: true,
            create_default_keys: true,
        }
    }
}

// ── Netfilter ───────────────────────────────────────────────────

/// Packet filter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetfilterConfig {
    /// Install the built-in chains.
    pub default_rules: bool,
    /// Run payload inspection.
    pub ips_enabled: bool,
    /// Connection table capacity.
    pub max_connections: usize,
    /// Connection idle timeout in seconds.
    pub connection_timeout_secs: u64,
    /// Rule cap per chain.
    pub max_rules_per_chain: usize,
}

impl Default for NetfilterConfig {
    fn default() -> Self {
        Self {
            default_rules: true,
            ips_enabled: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            max_rules_per_chain: DEFAULT_MAX_RULES_PER_CHAIN,
        }
    }
}

impl NetfilterConfig {
    /// Runtime settings.
    pub fn settings(&self) -> NetfilterSettings {
        NetfilterSettings {
            ips_enabled: self.ips_enabled,
            max_connections: self.max_connections,
            connection_timeout_secs: self.connection_timeout_secs,
            max_rules_per_chain: self.max_rules_per_chain,
        }
    }
}

// ── IDS ─────────────────────────────────────────────────────────

/// Intrusion detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdsConfig {
    /// Threat threshold, 0..=100.
    pub threshold: u32,
    /// Detect without responding.
    pub learning_mode: bool,
    /// Load the built-in rule set.
    pub default_rules: bool,
    /// Extra rule specification strings.
    pub rules: Vec<String>,
    /// Rule cap.
    pub max_rules: usize,
    /// Behavior table size.
    pub max_behaviors: usize,
}

impl Default for IdsConfig {
    fn default() -> Self {
        let defaults = IdsSettings::default();
        Self {
            threshold: defaults.threshold,
            learning_mode: defaults.learning_mode,
            default_rules: true,
            rules: Vec::new(),
            max_rules: IDS_MAX_RULES,
            max_behaviors: DEFAULT_MAX_BEHAVIORS,
        }
    }
}

impl IdsConfig {
    /// Runtime settings.
    pub fn settings(&self) -> IdsSettings {
        IdsSettings {
            threshold: self.threshold,
            learning_mode: self.learning_mode,
            max_rules: self.max_rules,
            max_behaviors: self.max_behaviors,
        }
    }
}

// ── Hardware ────────────────────────────────────────────────────

/// Hardware capability source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Inspect the host CPU. When false, `features` is used as given.
    pub detect: bool,
    /// Explicit capability table.
    pub features: HardwareFeatures,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            detect: true,
            features: HardwareFeatures::default(),
        }
    }
}

impl HardwareConfig {
    /// The capability table to build the framework with.
    pub fn resolve(&self) -> HardwareFeatures {
        if self.detect {
            HardwareFeatures::detect()
        } else {
            self.features
        }
    }
}

/// Resolve the per-user state directory (`~/.bastion/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".bastion"))
}
