//! Built-in profiles, custom profiles and assignment lifecycle.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bastion::audit::{AuditLog, AuditSettings};
use bastion::sandbox::{NetworkPolicy, Sandbox, SandboxProfile, DEFAULT_PROFILE};
use bastion::types::{protocol, Clock, EventKind, ManualClock};
use bastion::SecurityError;

fn sandbox() -> (Sandbox, Arc<AuditLog>) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    let audit = Arc::new(AuditLog::new(AuditSettings::default(), clock));
    (Sandbox::new(audit.clone()), audit)
}

#[test]
fn builtin_profiles_are_registered() {
    let (sandbox, _) = sandbox();
    let names: Vec<String> = SandboxProfile::builtin().into_iter().map(|p| p.name).collect();
    assert_eq!(names, ["strict", "default", "permissive", "developer", "system"]);
    assert_eq!(sandbox.stats().expect("stats").profiles, 5);
    assert_eq!(sandbox.profile_name(4242).as_deref(), Some(DEFAULT_PROFILE));
}

#[test]
fn strict_confines_filesystem_and_network() {
    let (sandbox, audit) = sandbox();
    sandbox.assign_profile(10, "strict").expect("assign");

    assert!(sandbox.check_sandbox_access(10, "/tmp/work/out.txt", "write"));
    assert!(sandbox.check_sandbox_access(10, "/usr/lib/libc.so.6", "read"));
    assert!(!sandbox.check_sandbox_access(10, "/home/alice/.ssh/id_ed25519", "read"));
    assert!(!sandbox.check_sandbox_access(10, "net:any", "connect"));
    assert!(!sandbox.check_network_access(
        10,
        Ipv4Addr::LOCALHOST,
        8080,
        protocol::TCP
    ));

    let denied = audit
        .get_events(0, Some(EventKind::AccessDenied))
        .expect("events");
    assert_eq!(denied.len(), 3);
    assert!(denied.iter().all(|e| e.pid == 10 && e.blocked && e.subject == "strict"));
    assert_eq!(denied[0].object, "/home/alice/.ssh/id_ed25519");

    let stats = sandbox.stats().expect("stats");
    assert_eq!(stats.allowed, 2);
    assert_eq!(stats.denied, 3);
}

#[test]
fn default_profile_denies_sensitive_paths() {
    let (sandbox, _) = sandbox();
    assert!(!sandbox.check_sandbox_access(1, "/etc/shadow", "read"));
    assert!(!sandbox.check_sandbox_access(1, "/boot/vmlinuz", "read"));
    assert!(!sandbox.check_sandbox_access(1, "/dev/sda", "read"));
    assert!(sandbox.check_sandbox_access(1, "/etc/hosts", "read"));
    assert!(sandbox.check_sandbox_access(1, "dev:audio", "open"));
    assert!(!sandbox.check_sandbox_access(1, "dev:camera", "open"));
    assert!(!sandbox.check_sandbox_access(1, "registry:HKLM", "read"));
}

#[test]
fn developer_and_system_reach_devices() {
    let (sandbox, _) = sandbox();
    sandbox.assign_profile(20, "developer").expect("assign");
    sandbox.assign_profile(21, "permissive").expect("assign");
    assert!(sandbox.check_sandbox_access(20, "/dev/ttyUSB0", "write"));
    assert!(sandbox.check_sandbox_access(20, "dev:usb", "open"));
    assert!(!sandbox.check_sandbox_access(21, "dev:usb", "open"));
    assert!(sandbox.check_sandbox_access(21, "dev:camera", "open"));
}

#[test]
fn network_checks_are_audited() {
    let (sandbox, audit) = sandbox();
    assert!(sandbox.check_network_access(
        5,
        Ipv4Addr::new(93, 184, 216, 34),
        443,
        protocol::TCP
    ));
    let allowed = audit
        .get_events(0, Some(EventKind::NetworkAccess))
        .expect("events");
    assert_eq!(allowed.len(), 1);
    assert_eq!(allowed[0].object, "93.184.216.34:443/6");
    assert_eq!(allowed[0].action, "connect");
    assert!(!allowed[0].blocked);
}

#[test]
fn custom_profile_with_port_allow_list() {
    let (sandbox, _) = sandbox();
    let profile = SandboxProfile {
        name: "lan-web".to_owned(),
        allowed_paths: vec!["/srv/www/".to_owned()],
        denied_paths: vec!["/srv/www/private/".to_owned()],
        allow_device_files: false,
        network: NetworkPolicy {
            allow_network: true,
            allow_localhost: true,
            allow_lan: true,
            allow_internet: false,
            allowed_ports: vec![80, 443],
        },
        hardware: Default::default(),
    };
    sandbox.register_profile(profile).expect("register");
    sandbox.assign_profile(30, "lan-web").expect("assign");

    assert!(sandbox.check_sandbox_access(30, "/srv/www/index.html", "read"));
    assert!(!sandbox.check_sandbox_access(30, "/srv/www/private/key.pem", "read"));
    let lan = Ipv4Addr::new(192, 168, 1, 20);
    assert!(sandbox.check_network_access(30, lan, 443, protocol::TCP));
    assert!(!sandbox.check_network_access(30, lan, 22, protocol::TCP));
    assert!(!sandbox.check_network_access(
        30,
        Ipv4Addr::new(8, 8, 8, 8),
        443,
        protocol::TCP
    ));
}

#[test]
fn replacing_a_profile_keeps_existing_assignments() {
    let (sandbox, _) = sandbox();
    sandbox
        .register_profile(SandboxProfile {
            name: "jail".to_owned(),
            allowed_paths: vec!["/jail/".to_owned()],
            ..SandboxProfile::builtin().remove(0)
        })
        .expect("register");
    sandbox.assign_profile(40, "jail").expect("assign");

    sandbox
        .register_profile(SandboxProfile {
            name: "jail".to_owned(),
            allowed_paths: vec!["/other/".to_owned()],
            ..SandboxProfile::builtin().remove(0)
        })
        .expect("replace");

    assert!(sandbox.check_sandbox_access(40, "/jail/file", "read"));
    sandbox.assign_profile(41, "jail").expect("assign");
    assert!(!sandbox.check_sandbox_access(41, "/jail/file", "read"));
}

#[test]
fn release_reverts_to_default() {
    let (sandbox, _) = sandbox();
    sandbox.assign_profile(50, "strict").expect("assign");
    assert_eq!(sandbox.stats().expect("stats").assigned_processes, 1);
    sandbox.release(50).expect("release");
    assert_eq!(sandbox.profile_name(50).as_deref(), Some(DEFAULT_PROFILE));
    assert_eq!(sandbox.stats().expect("stats").assigned_processes, 0);
}

#[test]
fn registration_errors() {
    let (sandbox, _) = sandbox();
    assert!(matches!(
        sandbox.assign_profile(1, "nope"),
        Err(SecurityError::NotFound(_))
    ));
    let mut unnamed = SandboxProfile::builtin().remove(0);
    unnamed.name.clear();
    assert!(matches!(
        sandbox.register_profile(unnamed),
        Err(SecurityError::InvalidParameter(_))
    ));
}
