//! Layered access checks: MAC, capabilities, then sandbox.

use std::sync::Arc;

use bastion::config::BastionConfig;
use bastion::framework::SecurityLevel;
use bastion::hardware::HardwareFeatures;
use bastion::types::{
    AccessMask, Capabilities, Clock, Decision, EventKind, ManualClock, ProcessCredentials,
    SecurityContext,
};
use bastion::{SecurityError, SecurityFramework};

fn framework() -> SecurityFramework {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    SecurityFramework::new(&BastionConfig::default(), HardwareFeatures::default(), clock)
        .expect("framework should build")
}

fn user(pid: u32, capabilities: Capabilities) -> ProcessCredentials {
    ProcessCredentials {
        pid,
        uid: 1000,
        capabilities,
        context: SecurityContext::new(1000, "user_u:user_r:user_t:s0").expect("label"),
    }
}

fn object(label: &str, path: Option<&str>) -> SecurityContext {
    let ctx = SecurityContext::new(1000, label).expect("label");
    match path {
        Some(path) => ctx.with_path(path),
        None => ctx,
    }
}

fn denials(fw: &SecurityFramework) -> Vec<bastion::types::SecurityEvent> {
    fw.audit()
        .get_events(0, Some(EventKind::AccessDenied))
        .expect("events")
}

#[test]
fn capability_is_required_after_mac_allows() {
    let fw = framework();
    let notes = object("user_u:object_r:home_t:s0", None);

    let bare = user(2000, Capabilities::empty());
    assert_eq!(
        fw.check_access(&bare, &notes, "read", AccessMask::READ).expect("check"),
        Decision::Deny
    );
    let events = denials(&fw);
    assert_eq!(events.len(), 1);
    assert!(events[0].description.contains("DAC_READ_SEARCH"));
    assert_eq!(events[0].pid, 2000);

    let reader = user(2000, Capabilities::DAC_READ_SEARCH);
    assert_eq!(
        fw.check_access(&reader, &notes, "read", AccessMask::READ).expect("check"),
        Decision::Allow
    );
}

#[test]
fn mac_deny_wins_over_capabilities() {
    let fw = framework();
    let root_like = user(2001, Capabilities::all());
    let etc = SecurityContext::new(0, "system_u:object_r:etc_t:s0")
        .expect("label")
        .with_path("/etc/passwd");
    assert_eq!(
        fw.check_access(&root_like, &etc, "write", AccessMask::WRITE).expect("check"),
        Decision::Deny
    );
    let events = denials(&fw);
    assert_eq!(events.len(), 1);
    assert!(events[0].description.starts_with("MAC denied"));
}

#[test]
fn sandbox_applies_to_path_objects() {
    let fw = framework();
    let process = user(2002, Capabilities::DAC_READ_SEARCH | Capabilities::DAC_OVERRIDE);
    let home_file = object("user_u:object_r:home_t:s0", Some("/home/u/notes.txt"));
    let tmp_file = object("user_u:object_r:tmp_t:s0", Some("/tmp/scratch"));

    assert!(fw
        .check_access(&process, &home_file, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());

    fw.sandbox().assign_profile(2002, "strict").expect("assign");
    assert!(!fw
        .check_access(&process, &home_file, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());
    assert!(fw
        .check_access(&process, &tmp_file, "write", AccessMask::WRITE)
        .expect("check")
        .is_allowed());
    let events = denials(&fw);
    assert_eq!(events.last().map(|e| e.subject.as_str()), Some("strict"));
}

#[test]
fn grant_and_revoke_are_audited() {
    let fw = framework();
    let mut process = user(2003, Capabilities::empty());
    let notes = object("user_u:object_r:home_t:s0", None);

    fw.grant_capability(&mut process, Capabilities::DAC_READ_SEARCH);
    assert!(process.capabilities.contains(Capabilities::DAC_READ_SEARCH));
    assert!(fw
        .check_access(&process, &notes, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());

    fw.revoke_capability(&mut process, Capabilities::DAC_READ_SEARCH);
    assert!(process.capabilities.is_empty());
    assert!(!fw
        .check_access(&process, &notes, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());

    let changes = fw
        .audit()
        .get_events(0, Some(EventKind::PrivilegeEscalation))
        .expect("events");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].severity.level(), 6);
    assert_eq!(changes[1].severity.level(), 4);
    assert_eq!(changes[1].action, "revoke_capability");
}

#[test]
fn permissive_level_allows_unknown_types() {
    let fw = framework();
    let process = user(2004, Capabilities::DAC_READ_SEARCH);
    let odd = object("system_u:object_r:mystery_t:s0", None);

    assert!(!fw
        .check_access(&process, &odd, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());
    fw.set_security_level(SecurityLevel::Basic).expect("level");
    assert!(fw
        .check_access(&process, &odd, "read", AccessMask::READ)
        .expect("check")
        .is_allowed());
}

#[test]
fn actions_without_capability_requirement() {
    let fw = framework();
    fw.set_security_level(SecurityLevel::None).expect("level");
    let process = user(2005, Capabilities::empty());
    let socket = object("system_u:object_r:socket_t:s0", None);
    assert!(fw
        .check_access(&process, &socket, "listen", AccessMask::empty())
        .expect("check")
        .is_allowed());
    assert!(!fw
        .check_access(&process, &socket, "mount", AccessMask::empty())
        .expect("check")
        .is_allowed());
}

#[test]
fn empty_action_is_an_error() {
    let fw = framework();
    let process = user(2006, Capabilities::all());
    let notes = object("user_u:object_r:home_t:s0", None);
    assert!(matches!(
        fw.check_access(&process, &notes, "", AccessMask::READ),
        Err(SecurityError::InvalidParameter(_))
    ));
}

#[test]
fn release_process_clears_per_process_state() {
    let fw = framework();
    fw.sandbox().assign_profile(2007, "developer").expect("assign");
    let canary = fw.memory().issue_stack_canary(2007).expect("canary");
    assert!(fw.memory().check_stack_canary(2007, canary));

    fw.release_process(2007).expect("release");

    assert_eq!(fw.sandbox().profile_name(2007).as_deref(), Some("default"));
    assert_eq!(fw.memory().stats().expect("stats").canaries_active, 0);
    assert!(!fw.memory().check_stack_canary(2007, canary));
}
