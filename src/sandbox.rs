//! Sandbox profiles.
//!
//! A profile bounds what a process may reach: filesystem prefixes, network
//! tiers and ports, and hardware classes. Processes without an assigned
//! profile run under `default`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::error::{Result, SecurityError};
use crate::types::{EventKind, SecurityEvent, Severity};

/// Profile used for processes with no assignment.
pub const DEFAULT_PROFILE: &str = "default";

/// Network allowances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Master switch.
    pub allow_network: bool,
    /// 127.0.0.0/8.
    pub allow_localhost: bool,
    /// Private and link-local ranges.
    pub allow_lan: bool,
    /// Everything else.
    pub allow_internet: bool,
    /// Permitted destination ports; empty permits all.
    pub allowed_ports: Vec<u16>,
}

/// Hardware allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwarePolicy {
    /// GPU.
    pub gpu: bool,
    /// Audio devices.
    pub audio: bool,
    /// Cameras.
    pub camera: bool,
    /// Microphones.
    pub microphone: bool,
    /// USB devices.
    pub usb: bool,
}

/// A named sandbox profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Profile name.
    pub name: String,
    /// Permitted path prefixes; empty permits every path not denied.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Forbidden path prefixes, checked first.
    #[serde(default)]
    pub denied_paths: Vec<String>,
    /// Access under `/dev/`.
    #[serde(default)]
    pub allow_device_files: bool,
    /// Network allowances.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Hardware allowances.
    #[serde(default)]
    pub hardware: HardwarePolicy,
}

impl SandboxProfile {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            allow_device_files: false,
            network: NetworkPolicy::default(),
            hardware: HardwarePolicy::default(),
        }
    }

    /// The five built-in profiles, most restrictive first.
    pub fn builtin() -> Vec<SandboxProfile> {
        let open_network = NetworkPolicy {
            allow_network: true,
            allow_localhost: true,
            allow_lan: true,
            allow_internet: true,
            allowed_ports: Vec::new(),
        };
        let all_hardware = HardwarePolicy {
            gpu: true,
            audio: true,
            camera: true,
            microphone: true,
            usb: true,
        };

        let strict = SandboxProfile {
            allowed_paths: vec!["/tmp/".to_owned(), "/usr/lib/".to_owned(), "/lib/".to_owned()],
            denied_paths: vec!["/etc/shadow".to_owned(), "/proc/kcore".to_owned()],
            ..Self::named("strict")
        };
        let default = SandboxProfile {
            denied_paths: vec![
                "/etc/shadow".to_owned(),
                "/boot/".to_owned(),
                "/proc/kcore".to_owned(),
            ],
            network: open_network.clone(),
            hardware: HardwarePolicy {
                audio: true,
                ..HardwarePolicy::default()
            },
            ..Self::named(DEFAULT_PROFILE)
        };
        let permissive = SandboxProfile {
            denied_paths: vec!["/etc/shadow".to_owned()],
            network: open_network.clone(),
            hardware: HardwarePolicy {
                usb: false,
                ..all_hardware
            },
            ..Self::named("permissive")
        };
        let developer = SandboxProfile {
            allow_device_files: true,
            network: open_network.clone(),
            hardware: all_hardware,
            ..Self::named("developer")
        };
        let system = SandboxProfile {
            allow_device_files: true,
            network: open_network,
            hardware: all_hardware,
            ..Self::named("system")
        };
        vec![strict, default, permissive, developer, system]
    }

    /// Whether `path` is reachable under this profile.
    pub fn path_allowed(&self, path: &str) -> bool {
        if self.denied_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return false;
        }
        if !self.allowed_paths.is_empty()
            && !self.allowed_paths.iter().any(|p| path.starts_with(p.as_str()))
        {
            return false;
        }
        if path.starts_with("/dev/") && !self.allow_device_files {
            return false;
        }
        true
    }

    /// Whether a connection to `addr:port` is permitted.
    pub fn network_allowed(&self, addr: Ipv4Addr, port: u16) -> bool {
        let net = &self.network;
        if !net.allow_network {
            return false;
        }
        let tier_ok = match AddressTier::of(addr) {
            AddressTier::Loopback => net.allow_localhost,
            AddressTier::Lan => net.allow_lan,
            AddressTier::Internet => net.allow_internet,
        };
        tier_ok && (net.allowed_ports.is_empty() || net.allowed_ports.contains(&port))
    }

    /// Whether a `dev:` hardware class is permitted.
    pub fn device_allowed(&self, class: &str) -> bool {
        let hw = &self.hardware;
        match class {
            "gpu" => hw.gpu,
            "audio" => hw.audio,
            "camera" => hw.camera,
            "microphone" => hw.microphone,
            "usb" => hw.usb,
            _ => false,
        }
    }
}

/// Reachability class of an IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTier {
    /// 127.0.0.0/8.
    Loopback,
    /// 10/8, 172.16/12, 192.168/16, 169.254/16.
    Lan,
    /// Anything else.
    Internet,
}

impl AddressTier {
    /// Classify `addr`.
    pub fn of(addr: Ipv4Addr) -> Self {
        let octets = addr.octets();
        if octets[0] == 127 {
            AddressTier::Loopback
        } else if octets[0] == 10
            || (octets[0] == 172 && (octets[1] & 0xF0) == 16)
            || (octets[0] == 192 && octets[1] == 168)
            || (octets[0] == 169 && octets[1] == 254)
        {
            AddressTier::Lan
        } else {
            AddressTier::Internet
        }
    }
}

/// Sandbox decision counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    /// Registered profiles.
    pub profiles: usize,
    /// Processes with an explicit assignment.
    pub assigned_processes: usize,
    /// Checks allowed.
    pub allowed: u64,
    /// Checks denied.
    pub denied: u64,
}

/// Profile registry and per-process assignments.
pub struct Sandbox {
    profiles: RwLock<HashMap<String, Arc<SandboxProfile>>>,
    assignments: RwLock<HashMap<u32, Arc<SandboxProfile>>>,
    audit: Arc<AuditLog>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Registry holding the built-in profiles.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        let profiles = SandboxProfile::builtin()
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        Self {
            profiles: RwLock::new(profiles),
            assignments: RwLock::new(HashMap::new()),
            audit,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Add or replace a profile. Existing assignments keep the old version.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for an empty name.
    /// - [`SecurityError::LockPoisoned`] if the registry lock is poisoned.
    pub fn register_profile(&self, profile: SandboxProfile) -> Result<()> {
        if profile.name.is_empty() {
            return Err(SecurityError::InvalidParameter(
                "profile name is empty".to_owned(),
            ));
        }
        let name = profile.name.clone();
        self.profiles
            .write()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .insert(name.clone(), Arc::new(profile));
        info!(profile = %name, "sandbox profile registered");
        Ok(())
    }

    /// Run `pid` under the profile called `name`.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotFound`] for an unknown profile.
    /// - [`SecurityError::LockPoisoned`] if a registry lock is poisoned.
    pub fn assign_profile(&self, pid: u32, name: &str) -> Result<()> {
        let profile = self
            .profiles
            .read()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .get(name)
            .cloned()
            .ok_or_else(|| SecurityError::NotFound(format!("sandbox profile {name}")))?;
        self.assignments
            .write()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .insert(pid, profile);
        debug!(pid, profile = name, "sandbox profile assigned");
        Ok(())
    }

    /// Forget the assignment of an exited process.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the assignment lock is poisoned.
    pub fn release(&self, pid: u32) -> Result<()> {
        self.assignments
            .write()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .remove(&pid);
        Ok(())
    }

    /// Name of the profile `pid` runs under.
    pub fn profile_name(&self, pid: u32) -> Option<String> {
        self.profile_for(pid).map(|p| p.name.clone())
    }

    fn profile_for(&self, pid: u32) -> Option<Arc<SandboxProfile>> {
        let assigned = match self.assignments.read() {
            Ok(map) => map.get(&pid).cloned(),
            Err(e) => {
                warn!(error = %e, "sandbox assignment lock poisoned");
                return None;
            }
        };
        assigned.or_else(|| {
            self.profiles
                .read()
                .ok()
                .and_then(|map| map.get(DEFAULT_PROFILE).cloned())
        })
    }

    /// Whether `pid` may open a socket to `addr:port`.
    ///
    /// Allowed connections are recorded as `NetworkAccess`, refusals as
    /// `AccessDenied`.
    pub fn check_network_access(&self, pid: u32, addr: Ipv4Addr, port: u16, protocol: u8) -> bool {
        let (allowed, profile) = match self.profile_for(pid) {
            Some(p) => (p.network_allowed(addr, port), p.name.clone()),
            None => (false, String::from("<unavailable>")),
        };
        let object = format!("{addr}:{port}/{protocol}");
        let event = if allowed {
            SecurityEvent::new(
                EventKind::NetworkAccess,
                Severity::INFO,
                format!("Network access to {object} allowed by profile {profile}"),
            )
        } else {
            SecurityEvent::new(
                EventKind::AccessDenied,
                Severity::clamped(4),
                format!("Network access to {object} denied by profile {profile}"),
            )
            .blocked(true)
        };
        self.count(allowed);
        debug!(pid, %object, profile = %profile, allowed, "sandbox network check");
        self.audit
            .emit(event.process(pid, 0).target(profile, object, "connect"));
        allowed
    }

    /// Whether `pid` may perform `access` on `resource`.
    ///
    /// Resources are a filesystem path, `net:<anything>` or
    /// `dev:<gpu|audio|camera|microphone|usb>`. Anything else is refused.
    pub fn check_sandbox_access(&self, pid: u32, resource: &str, access: &str) -> bool {
        let Some(profile) = self.profile_for(pid) else {
            self.deny(pid, "<unavailable>", resource, access);
            return false;
        };
        let allowed = if resource.starts_with('/') {
            profile.path_allowed(resource)
        } else if resource.starts_with("net:") {
            profile.network.allow_network
        } else if let Some(class) = resource.strip_prefix("dev:") {
            profile.device_allowed(class)
        } else {
            false
        };
        if allowed {
            self.count(true);
        } else {
            self.deny(pid, &profile.name, resource, access);
        }
        allowed
    }

    fn deny(&self, pid: u32, profile: &str, resource: &str, access: &str) {
        self.count(false);
        debug!(pid, resource, access, profile, "sandbox access denied");
        self.audit.emit(
            SecurityEvent::new(
                EventKind::AccessDenied,
                Severity::clamped(4),
                format!("Sandbox profile {profile} denied {access} on {resource}"),
            )
            .process(pid, 0)
            .target(profile, resource, access)
            .blocked(true),
        );
    }

    fn count(&self, allowed: bool) {
        let counter = if allowed { &self.allowed } else { &self.denied };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if a registry lock is poisoned.
    pub fn stats(&self) -> Result<SandboxStats> {
        let profiles = self
            .profiles
            .read()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .len();
        let assigned_processes = self
            .assignments
            .read()
            .map_err(|e| SecurityError::poisoned("sandbox", e))?
            .len();
        Ok(SandboxStats {
            profiles,
            assigned_processes,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        })
    }
}
