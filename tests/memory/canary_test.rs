//! Stack canary issue, verification and derivation schemes.

use std::sync::Arc;

use bastion::audit::{AuditLog, AuditSettings};
use bastion::crypto::SecureRandom;
use bastion::hardware::HardwareFeatures;
use bastion::memory::{CanaryDerivation, MemoryProtectionMonitor, MemorySettings};
use bastion::types::{Clock, EventKind, ManualClock, Severity};

fn monitor(derivation: CanaryDerivation) -> (MemoryProtectionMonitor, Arc<AuditLog>) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    let audit = Arc::new(AuditLog::new(AuditSettings::default(), clock.clone()));
    let random = Arc::new(SecureRandom::new(clock, None).expect("should seed"));
    let settings = MemorySettings {
        canary_derivation: derivation,
        ..MemorySettings::default()
    };
    let monitor = MemoryProtectionMonitor::new(
        settings,
        &HardwareFeatures::default(),
        random,
        audit.clone(),
    )
    .expect("should build monitor");
    (monitor, audit)
}

#[test]
fn issued_canary_is_stable_and_verifies() {
    let (memory, audit) = monitor(CanaryDerivation::PerProcess);
    let canary = memory.issue_stack_canary(1234).expect("issue");
    assert_eq!(memory.issue_stack_canary(1234).expect("issue"), canary);
    assert!(memory.check_stack_canary(1234, canary));

    let stats = memory.stats().expect("stats");
    assert_eq!(stats.canaries_issued, 1);
    assert_eq!(stats.canaries_active, 1);
    assert_eq!(stats.stack_overflows_prevented, 0);
    assert!(audit.get_events(0, Some(EventKind::Suspicious)).expect("events").is_empty());
}

#[test]
fn mismatch_is_reported_at_max_severity() {
    let (memory, audit) = monitor(CanaryDerivation::PerProcess);
    let canary = memory.issue_stack_canary(1234).expect("issue");

    assert!(!memory.check_stack_canary(1234, canary ^ 0xFF));

    let events = audit
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events");
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.severity, Severity::MAX);
    assert_eq!(event.pid, 1234);
    assert_eq!(event.object, "stack_corruption");
    assert!(event.blocked);
    assert_eq!(memory.stats().expect("stats").stack_overflows_prevented, 1);
}

#[test]
fn unknown_pid_fails_closed_per_process() {
    let (memory, _) = monitor(CanaryDerivation::PerProcess);
    assert!(!memory.check_stack_canary(77, 0));

    let canary = memory.issue_stack_canary(77).expect("issue");
    memory.release_canary(77).expect("release");
    assert!(!memory.check_stack_canary(77, canary));
    assert_eq!(memory.stats().expect("stats").canaries_active, 0);
}

#[test]
fn xor_pid_derives_from_shared_secret() {
    let (memory, _) = monitor(CanaryDerivation::XorPid);
    let canary = memory.issue_stack_canary(10).expect("issue");
    let secret = canary ^ 10;
    assert!(memory.check_stack_canary(11, secret ^ 11));
    assert!(!memory.check_stack_canary(11, secret ^ 12));
    assert_eq!(memory.issue_stack_canary(500).expect("issue"), secret ^ 500);
}

#[test]
fn disabled_stack_protection_accepts_anything() {
    let (memory, audit) = monitor(CanaryDerivation::PerProcess);
    memory.set_stack_protection(false);
    assert!(memory.check_stack_canary(1, 0xDEAD));
    assert!(!memory.stats().expect("stats").stack_protection_enabled);
    assert!(audit.get_events(0, Some(EventKind::Suspicious)).expect("events").is_empty());
}
