//! Cross-component flows: audit to detector to packet filter, sealed logs
//! and security levels.

use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::sync::Arc;

use bastion::audit::verify_sealed_log;
use bastion::config::BastionConfig;
use bastion::framework::{SecurityLevel, AUDIT_SEAL_KEY};
use bastion::hardware::HardwareFeatures;
use bastion::netfilter::{Direction, PacketHeader, TcpFlags, Verdict};
use bastion::types::{
    protocol, Capabilities, Clock, EventKind, ManualClock, ProcessCredentials, SecurityContext,
    SecurityEvent, Severity,
};
use bastion::SecurityFramework;

fn build(config: &BastionConfig) -> SecurityFramework {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    SecurityFramework::new(config, HardwareFeatures::default(), clock)
        .expect("framework should build")
}

fn creds(pid: u32) -> ProcessCredentials {
    ProcessCredentials {
        pid,
        uid: 1000,
        capabilities: Capabilities::empty(),
        context: SecurityContext::new(1000, "user_u:user_r:user_t:s0").expect("label"),
    }
}

fn outbound(owner_pid: u32, src_port: u16) -> PacketHeader {
    PacketHeader {
        src: Ipv4Addr::new(10, 0, 0, 5),
        dst: Ipv4Addr::new(198, 51, 100, 20),
        src_port,
        dst_port: 4444,
        protocol: protocol::TCP,
        tcp_flags: TcpFlags::SYN,
        owner_pid,
    }
}

#[test]
fn escalation_burst_quarantines_network_flows() {
    let fw = build(&BastionConfig::default());
    let packet = outbound(77, 51_000);
    assert_eq!(
        fw.netfilter().process_packet(&packet, &[], Direction::Outbound),
        Verdict::Allow
    );

    let mut process = creds(77);
    for bit in [
        Capabilities::CHOWN,
        Capabilities::KILL,
        Capabilities::SETUID,
        Capabilities::SETGID,
        Capabilities::NET_RAW,
    ] {
        fw.grant_capability(&mut process, bit);
    }
    // fifth grant: rule trigger plus behavior reaches the threshold, log only
    let alerts = fw
        .audit()
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].pid, 77);
    assert!(!alerts[0].blocked);
    assert_eq!(fw.netfilter().stats().expect("stats").responses_applied, 0);

    fw.grant_capability(&mut process, Capabilities::SYS_PTRACE);
    assert_eq!(fw.netfilter().stats().expect("stats").responses_applied, 1);
    assert_eq!(fw.ids().stats().expect("stats").connections_blocked, 1);
    let alerts = fw
        .audit()
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events");
    assert_eq!(alerts.len(), 2);
    assert!(alerts[1].blocked);
    assert!(alerts[1].description.contains("Quarantine"));

    assert_eq!(
        fw.netfilter().process_packet(&packet, &[], Direction::Outbound),
        Verdict::Block
    );
    assert_eq!(
        fw.netfilter().process_packet(&outbound(78, 51_001), &[], Direction::Outbound),
        Verdict::Allow
    );
}

#[test]
fn canary_failures_feed_overflow_rule() {
    let fw = build(&BastionConfig::default());
    for _ in 0..5 {
        assert!(!fw.memory().check_stack_canary(99, 0x4141_4141));
    }
    let rule = fw
        .ids()
        .rules()
        .expect("rules")
        .into_iter()
        .find(|r| r.name == "buffer_overflow_attempt")
        .expect("default rule");
    assert_eq!(rule.matches, 5);
    assert_eq!(rule.triggers, 1);
    assert!(fw.ids().behavior(99).expect("lookup").expect("tracked").suspicious);
}

#[test]
fn failed_logins_trigger_brute_force_rule() {
    let fw = build(&BastionConfig::default());
    for n in 0..10 {
        let outcome = fw
            .audit()
            .log_event(
                SecurityEvent::new(EventKind::LoginAttempt, Severity::WARNING, "bad password")
                    .process(31_337, 1000)
                    .target("sshd", "root", "login")
                    .blocked(true),
            )
            .expect("log");
        assert!(matches!(outcome, bastion::audit::LogOutcome::Recorded(_)), "login {n}");
    }
    assert_eq!(fw.ids().stats().expect("stats").rules_triggered, 1);
    assert_eq!(fw.ids().stats().expect("stats").events_analyzed, 10);
}

#[test]
fn filtered_events_do_not_reach_detector() {
    let mut config = BastionConfig::default();
    config.audit.policy = vec!["suspicious".to_owned(), "policy_violation".to_owned()];
    let fw = build(&config);
    fw.audit().emit(
        SecurityEvent::new(EventKind::LoginAttempt, Severity::WARNING, "bad password")
            .process(5, 0)
            .blocked(true),
    );
    assert_eq!(fw.ids().stats().expect("stats").events_analyzed, 0);
    assert_eq!(fw.audit().stats().expect("stats").events_filtered, 1);
}

#[test]
fn sealed_log_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit").join("bastion.jsonl");
    let mut config = BastionConfig::default();
    config.audit.log_path = Some(path.clone());
    config.audit.seal = true;
    config.validate().expect("valid config");

    let fw = build(&config);
    let user = creds(500);
    let etc = SecurityContext::new(0, "system_u:object_r:etc_t:s0")
        .expect("label")
        .with_path("/etc/passwd");
    fw.check_access(&user, &etc, "write", bastion::types::AccessMask::WRITE)
        .expect("check");
    fw.set_security_level(SecurityLevel::Maximum).expect("level");
    fw.memory().check_stack_canary(500, 1);

    let key = fw.audit_seal_key().expect("seal key stored");
    assert!(fw.keys().key_ids().iter().any(|id| id == AUDIT_SEAL_KEY));

    let verified = verify_sealed_log(BufReader::new(File::open(&path).expect("open")), &key)
        .expect("chain should verify");
    let logged = fw.audit().stats().expect("stats").events_logged;
    assert_eq!(u64::try_from(verified).expect("fits"), logged);
    assert!(verified >= 3);
}

#[test]
fn security_levels_drive_components() {
    let mut config = BastionConfig::default();
    config.mac.enforcing = false;
    config.memory.aslr = false;
    config.memory.cfi = false;
    let fw = build(&config);
    assert_eq!(fw.security_level(), SecurityLevel::Basic);
    assert!(!fw.mac().is_enforcing());

    fw.set_security_level(SecurityLevel::Enhanced).expect("level");
    let memory = fw.memory().stats().expect("stats");
    assert!(memory.aslr_enabled);
    assert!(memory.cfi_enabled);
    assert!(!fw.mac().is_enforcing());

    fw.memory().set_heap_protection(false);
    fw.memory().set_stack_protection(false);
    fw.set_security_level(SecurityLevel::Maximum).expect("level");
    let memory = fw.memory().stats().expect("stats");
    assert!(memory.heap_protection_enabled);
    assert!(memory.stack_protection_enabled);
    assert!(fw.mac().is_enforcing());

    let changes: Vec<_> = fw
        .audit()
        .get_events(0, Some(EventKind::PolicyViolation))
        .expect("events")
        .into_iter()
        .filter(|e| e.object == "security_level")
        .collect();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].severity, Severity::CRITICAL);
    assert!(changes[1].description.contains("Enhanced to Maximum"));

    let stats = fw.stats().expect("stats");
    assert_eq!(stats.security_level, SecurityLevel::Maximum);
    assert!(stats.mac.enforcing);
}

#[test]
fn optional_defaults_can_be_skipped() {
    let mut config = BastionConfig::default();
    config.ids.default_rules = false;
    config.ids.rules = vec!["custom_burst:file_access:threshold=3".to_owned()];
    config.netfilter.default_rules = false;
    config.crypto.create_default_keys = false;
    let fw = build(&config);

    let stats = fw.stats().expect("stats");
    assert_eq!(stats.ids.rules_registered, 1);
    assert_eq!(stats.netfilter.rules_inbound, 0);
    assert_eq!(stats.crypto.keys_stored, 0);
}

#[test]
fn bad_extra_rule_fails_construction() {
    let mut config = BastionConfig::default();
    config.ids.rules = vec!["broken rule".to_owned()];
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1));
    let err = SecurityFramework::new(&config, HardwareFeatures::default(), clock)
        .expect_err("should reject rule");
    assert!(format!("{err:#}").contains("broken rule"));
}
