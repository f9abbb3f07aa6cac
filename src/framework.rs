//! Framework context.
//!
//! [`SecurityFramework`] owns every component and the wiring between them:
//! the audit log forwards events to the intrusion detector, the detector
//! dispatches responses to the packet filter, and the key service seals the
//! persistent audit sink. There are no globals; callers hold the framework
//! (or individual components in tests) explicitly.

use std::sync::{Arc, RwLock, Weak};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{AuditLog, AuditStatistics, EventObserver, JsonLineSink};
use crate::config::BastionConfig;
use crate::crypto::{Algorithm, Key, KeyService, KeyServiceStats, SecureRandom};
use crate::error::{Result, SecurityError};
use crate::hardware::{HardwareFeatures, HardwareRng, OsHardwareRng};
use crate::ids::{IdsStatistics, IntrusionDetector, ThreatResponder};
use crate::mac::{MacEngine, MacStats};
use crate::memory::{MemoryProtectionMonitor, MemoryProtectionStats};
use crate::netfilter::{NetfilterStats, PacketFilter};
use crate::sandbox::{Sandbox, SandboxStats};
use crate::types::{
    AccessMask, Capabilities, Clock, Decision, EventKind, ProcessCredentials, SecurityContext,
    SecurityEvent, Severity,
};

/// Store id of the HMAC key sealing the persistent audit log.
pub const AUDIT_SEAL_KEY: &str = "audit_seal_key";

/// Coarse protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Everything permissive.
    None,
    /// Permissive MAC.
    Basic,
    /// Permissive MAC, ASLR and CFI forced on.
    Enhanced,
    /// Enforcing MAC.
    High,
    /// Enforcing MAC, stack and heap protection forced on.
    Maximum,
}

impl SecurityLevel {
    /// Whether MAC denies on no match at this level.
    pub fn enforcing(self) -> bool {
        self >= SecurityLevel::High
    }
}

/// Every component's snapshot in one document.
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkStatistics {
    /// Current level.
    pub security_level: SecurityLevel,
    /// Audit log.
    pub audit: AuditStatistics,
    /// MAC engine.
    pub mac: MacStats,
    /// Key service.
    pub crypto: KeyServiceStats,
    /// Memory monitor.
    pub memory: MemoryProtectionStats,
    /// Packet filter.
    pub netfilter: NetfilterStats,
    /// Intrusion detector.
    pub ids: IdsStatistics,
    /// Sandbox.
    pub sandbox: SandboxStats,
}

/// All components, wired together.
pub struct SecurityFramework {
    hardware: HardwareFeatures,
    level: RwLock<SecurityLevel>,
    audit: Arc<AuditLog>,
    mac: MacEngine,
    keys: Arc<KeyService>,
    memory: MemoryProtectionMonitor,
    netfilter: Arc<PacketFilter>,
    ids: Arc<IntrusionDetector>,
    sandbox: Sandbox,
}

impl std::fmt::Debug for SecurityFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityFramework")
            .field("hardware", &self.hardware)
            .field("level", &self.security_level())
            .finish_non_exhaustive()
    }
}

impl SecurityFramework {
    /// Build and wire every component.
    ///
    /// # Errors
    ///
    /// Returns an error if the random source cannot be seeded, a rule or
    /// policy fails to load, or the audit sink cannot be opened.
    pub fn new(
        config: &BastionConfig,
        hardware: HardwareFeatures,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let hw_rng: Option<Arc<dyn HardwareRng>> = if hardware.rng && config.crypto.hardware_rng {
            Some(Arc::new(OsHardwareRng))
        } else {
            None
        };
        let random = Arc::new(
            SecureRandom::new(clock.clone(), hw_rng).context("failed to seed random source")?,
        );

        let ids = Arc::new(IntrusionDetector::new(config.ids.settings(), clock.clone()));
        if config.ids.default_rules {
            ids.load_default_rules()?;
        }
        for spec in &config.ids.rules {
            ids.register_rule(spec, None)
                .with_context(|| format!("failed to register ids rule {spec:?}"))?;
        }

        let keys = KeyService::new(random.clone(), config.crypto.arena_slots, clock.clone());
        if config.crypto.create_default_keys {
            keys.create_default_keys()?;
        }

        let observer: Arc<dyn EventObserver> = ids.clone();
        let mut audit = AuditLog::new(config.audit.settings()?, clock.clone()).with_observer(observer);
        if let Some(path) = &config.audit.log_path {
            let mut sink = JsonLineSink::open(path, config.audit.fsync)?;
            if config.audit.seal {
                let seal = keys.generate_key(Algorithm::Hmac, 256)?;
                keys.store(seal.clone(), AUDIT_SEAL_KEY)?;
                sink = sink.with_seal(seal)?;
            }
            audit = audit.with_sink(sink);
            info!(path = %path.display(), sealed = config.audit.seal, "audit sink attached");
        }
        let audit = Arc::new(audit);
        let keys = Arc::new(keys.with_audit(audit.clone()));

        let mac = MacEngine::new(config.mac.enforcing, audit.clone(), clock.clone())
            .with_max_rules(config.mac.max_rules);
        if let Some(path) = &config.mac.policy_file {
            mac.load_policy_file(path)
                .with_context(|| format!("failed to load mac policy {}", path.display()))?;
        }

        let memory =
            MemoryProtectionMonitor::new(config.memory.clone(), &hardware, random, audit.clone())?;
        let sandbox = Sandbox::new(audit.clone());

        let netfilter = Arc::new(PacketFilter::new(
            config.netfilter.settings(),
            audit.clone(),
            clock,
        ));
        if config.netfilter.default_rules {
            netfilter.load_default_rules()?;
        }
        let responder: Arc<dyn ThreatResponder> = netfilter.clone();
        ids.register_responder(Arc::downgrade(&responder));

        let level = if config.mac.enforcing {
            SecurityLevel::High
        } else {
            SecurityLevel::Basic
        };
        info!(?level, ?hardware, "security framework initialized");
        Ok(Self {
            hardware,
            level: RwLock::new(level),
            audit,
            mac,
            keys,
            memory,
            netfilter,
            ids,
            sandbox,
        })
    }

    /// Capability table the framework was built with.
    pub fn hardware(&self) -> HardwareFeatures {
        self.hardware
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// MAC engine.
    pub fn mac(&self) -> &MacEngine {
        &self.mac
    }

    /// Key service.
    pub fn keys(&self) -> &Arc<KeyService> {
        &self.keys
    }

    /// Memory monitor.
    pub fn memory(&self) -> &MemoryProtectionMonitor {
        &self.memory
    }

    /// Packet filter.
    pub fn netfilter(&self) -> &Arc<PacketFilter> {
        &self.netfilter
    }

    /// Intrusion detector.
    pub fn ids(&self) -> &Arc<IntrusionDetector> {
        &self.ids
    }

    /// Sandbox.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// The persistent audit seal key, when sealing is configured.
    ///
    /// # Errors
    ///
    /// [`SecurityError::NotFound`] when the log is not sealed.
    pub fn audit_seal_key(&self) -> Result<Key> {
        self.keys.retrieve(AUDIT_SEAL_KEY)
    }

    /// Also deliver IDS responses to `responder`, typically the process
    /// lifecycle manager.
    pub fn register_responder(&self, responder: Weak<dyn ThreatResponder>) {
        self.ids.register_responder(responder);
    }

    /// Decide whether the process behind `creds` may perform `action` on
    /// `object`.
    ///
    /// MAC is consulted first, then the capability the action requires,
    /// then the process sandbox for objects that carry a path.
    ///
    /// # Errors
    ///
    /// Propagates MAC errors (empty action, poisoned policy).
    pub fn check_access(
        &self,
        creds: &ProcessCredentials,
        object: &SecurityContext,
        action: &str,
        access: AccessMask,
    ) -> Result<Decision> {
        let decision = self
            .mac
            .check_for_process(creds.pid, &creds.context, object, action, access)?;
        if !decision.is_allowed() {
            return Ok(Decision::Deny);
        }

        if let Some(required) = Capabilities::required_for(action) {
            if !creds.capabilities.contains(required) {
                debug!(pid = creds.pid, action, ?required, "missing capability");
                self.audit.emit(
                    SecurityEvent::new(
                        EventKind::AccessDenied,
                        Severity::clamped(4),
                        format!("{action} requires {required:?}"),
                    )
                    .process(creds.pid, creds.uid)
                    .target(creds.context.label(), object_name(object), action)
                    .blocked(true),
                );
                return Ok(Decision::Deny);
            }
        }

        if let Some(path) = object.path() {
            if !self.sandbox.check_sandbox_access(creds.pid, path, action) {
                return Ok(Decision::Deny);
            }
        }
        Ok(Decision::Allow)
    }

    /// Add `capability` to `creds`.
    pub fn grant_capability(&self, creds: &mut ProcessCredentials, capability: Capabilities) {
        creds.capabilities.insert(capability);
        info!(pid = creds.pid, ?capability, "capability granted");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::PrivilegeEscalation,
                Severity::clamped(6),
                format!("granted {capability:?}"),
            )
            .process(creds.pid, creds.uid)
            .target("framework", creds.context.label(), "grant_capability"),
        );
    }

    /// Remove `capability` from `creds`.
    pub fn revoke_capability(&self, creds: &mut ProcessCredentials, capability: Capabilities) {
        creds.capabilities.remove(capability);
        info!(pid = creds.pid, ?capability, "capability revoked");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::PrivilegeEscalation,
                Severity::clamped(4),
                format!("revoked {capability:?}"),
            )
            .process(creds.pid, creds.uid)
            .target("framework", creds.context.label(), "revoke_capability"),
        );
    }

    /// Forget per-process state once `pid` has exited.
    ///
    /// # Errors
    ///
    /// [`SecurityError::LockPoisoned`] if a table lock is poisoned.
    pub fn release_process(&self, pid: u32) -> Result<()> {
        self.sandbox.release(pid)?;
        self.memory.release_canary(pid)?;
        Ok(())
    }

    /// Current level.
    pub fn security_level(&self) -> SecurityLevel {
        match self.level.read() {
            Ok(level) => *level,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Switch protection level. MAC enforces from `High` upwards.
    ///
    /// # Errors
    ///
    /// [`SecurityError::LockPoisoned`] if the level or policy lock is poisoned.
    pub fn set_security_level(&self, level: SecurityLevel) -> Result<()> {
        let previous = {
            let mut current = self
                .level
                .write()
                .map_err(|e| SecurityError::poisoned("security level", e))?;
            std::mem::replace(&mut *current, level)
        };
        self.mac.set_enforcing(level.enforcing())?;
        if level >= SecurityLevel::Enhanced {
            self.memory.enable_aslr();
            self.memory.enable_cfi();
        }
        if level == SecurityLevel::Maximum {
            self.memory.set_stack_protection(true);
            self.memory.set_heap_protection(true);
        }
        info!(?previous, ?level, "security level changed");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::PolicyViolation,
                Severity::CRITICAL,
                format!("security level changed from {previous:?} to {level:?}"),
            )
            .target("framework", "security_level", "set"),
        );
        Ok(())
    }

    /// Snapshot of every component.
    ///
    /// # Errors
    ///
    /// [`SecurityError::LockPoisoned`] if any component lock is poisoned.
    pub fn stats(&self) -> Result<FrameworkStatistics> {
        Ok(FrameworkStatistics {
            security_level: self.security_level(),
            audit: self.audit.stats()?,
            mac: self.mac.policy_info()?,
            crypto: self.keys.stats(),
            memory: self.memory.stats()?,
            netfilter: self.netfilter.stats()?,
            ids: self.ids.stats()?,
            sandbox: self.sandbox.stats()?,
        })
    }
}

fn object_name(object: &SecurityContext) -> &str {
    object.path().unwrap_or_else(|| object.label())
}
