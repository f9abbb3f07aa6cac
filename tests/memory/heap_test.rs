//! Guarded allocation, overflow detection and the guard budget.

use std::sync::Arc;

use bastion::audit::{AuditLog, AuditSettings};
use bastion::crypto::SecureRandom;
use bastion::hardware::HardwareFeatures;
use bastion::memory::{MemoryProtectionMonitor, MemorySettings};
use bastion::types::{Clock, EventKind, ManualClock, Severity};
use bastion::SecurityError;

fn monitor(settings: MemorySettings) -> (MemoryProtectionMonitor, Arc<AuditLog>) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    let audit = Arc::new(AuditLog::new(AuditSettings::default(), clock.clone()));
    let random = Arc::new(SecureRandom::new(clock, None).expect("should seed"));
    let monitor =
        MemoryProtectionMonitor::new(settings, &HardwareFeatures::default(), random, audit.clone())
            .expect("should build monitor");
    (monitor, audit)
}

fn heap_events(audit: &AuditLog) -> Vec<bastion::types::SecurityEvent> {
    audit
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events")
        .into_iter()
        .filter(|e| e.object == "heap_manipulation")
        .collect()
}

#[test]
fn clean_block_round_trips_and_frees() {
    let (memory, audit) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(64).expect("alloc");
    memory.write(ptr, 8, b"payload").expect("write");
    assert_eq!(memory.read(ptr, 8, 7).expect("read"), b"payload");
    assert_eq!(memory.read(ptr, 0, 4).expect("read"), vec![0; 4]);

    let stats = memory.stats().expect("stats");
    assert_eq!(stats.live_allocations, 1);
    assert_eq!(stats.bytes_live, 64);
    assert_eq!(stats.guarded_allocations, 1);

    memory.free_guarded(ptr).expect("free");
    assert_eq!(memory.stats().expect("stats").live_allocations, 0);
    assert!(heap_events(&audit).is_empty());
}

#[test]
fn bounds_checked_access() {
    let (memory, _) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(16).expect("alloc");
    assert!(matches!(
        memory.write(ptr, 10, &[0; 8]),
        Err(SecurityError::InvalidParameter(_))
    ));
    assert!(matches!(
        memory.read(ptr, 16, 1),
        Err(SecurityError::InvalidParameter(_))
    ));
    memory.write(ptr, 0, &[1; 16]).expect("exact fit");
}

#[test]
fn overflow_into_rear_guard_is_caught() {
    let (memory, audit) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(64).expect("alloc");
    assert_eq!(memory.write_unchecked(ptr, 60, &[0x41; 8]).expect("write"), 8);

    match memory.free_guarded(ptr) {
        Err(SecurityError::IntegrityFailure(reason)) => {
            assert!(reason.contains("rear guard overwritten"), "{reason}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }

    let events = heap_events(&audit);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::CRITICAL);
    assert!(events[0].blocked);

    let stats = memory.stats().expect("stats");
    assert_eq!(stats.heap_corruptions_detected, 1);
    // the damaged block is not released
    assert_eq!(stats.live_allocations, 1);
}

#[test]
fn underflow_into_front_guard_is_caught() {
    let (memory, _) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(32).expect("alloc");
    memory.write_unchecked(ptr, -30, &[0]).expect("write");
    match memory.free_guarded(ptr) {
        Err(SecurityError::IntegrityFailure(reason)) => {
            assert!(reason.contains("front guard overwritten"), "{reason}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
}

#[test]
fn header_smash_is_caught() {
    let (memory, _) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(32).expect("alloc");
    // first header byte sits right after the front guard
    memory.write_unchecked(ptr, -24, &[0; 4]).expect("write");
    match memory.free_guarded(ptr) {
        Err(SecurityError::IntegrityFailure(reason)) => {
            assert!(reason.contains("bad magic"), "{reason}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
}

#[test]
fn double_free_is_reported_as_corruption() {
    let (memory, audit) = monitor(MemorySettings::default());
    let ptr = memory.alloc_guarded(8).expect("alloc");
    memory.free_guarded(ptr).expect("free");
    match memory.free_guarded(ptr) {
        Err(SecurityError::IntegrityFailure(reason)) => {
            assert!(reason.contains("double free"), "{reason}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
    assert!(matches!(
        memory.read(ptr, 0, 1),
        Err(SecurityError::IntegrityFailure(_))
    ));
    assert!(matches!(
        memory.write(ptr, 0, &[1]),
        Err(SecurityError::IntegrityFailure(_))
    ));

    let events = heap_events(&audit);
    assert_eq!(events.len(), 1);
    assert!(events[0].description.contains("double free"));
    assert_eq!(memory.stats().expect("stats").heap_corruptions_detected, 1);
}

#[test]
fn freeing_one_block_leaves_neighbours_live() {
    let (memory, audit) = monitor(MemorySettings::default());
    let kept = memory.alloc_guarded(8).expect("alloc");
    let freed = memory.alloc_guarded(8).expect("alloc");
    memory.write(kept, 0, b"keep").expect("write");
    memory.free_guarded(freed).expect("free");
    assert_eq!(memory.read(kept, 0, 4).expect("read"), b"keep");
    memory.free_guarded(kept).expect("free");
    assert!(heap_events(&audit).is_empty());
}

#[test]
fn size_limits() {
    let (memory, _) = monitor(MemorySettings {
        max_allocation: 1024,
        ..MemorySettings::default()
    });
    assert!(matches!(
        memory.alloc_guarded(0),
        Err(SecurityError::InvalidParameter(_))
    ));
    assert!(matches!(
        memory.alloc_guarded(1025),
        Err(SecurityError::OutOfMemory(_))
    ));
    memory.alloc_guarded(1024).expect("at limit");
}

#[test]
fn guard_budget_falls_back_to_plain_blocks() {
    let (memory, _) = monitor(MemorySettings {
        max_guarded_blocks: 2,
        ..MemorySettings::default()
    });
    let a = memory.alloc_guarded(32).expect("alloc");
    let b = memory.alloc_guarded(32).expect("alloc");
    let plain = memory.alloc_guarded(32).expect("alloc");
    assert!(a != b && b != plain);

    let stats = memory.stats().expect("stats");
    assert_eq!(stats.guarded_allocations, 2);
    assert_eq!(stats.fallback_allocations, 1);

    // plain blocks have nothing beyond their data to damage
    assert_eq!(memory.write_unchecked(plain, 32, &[0xFF; 4]).expect("write"), 0);
    memory.free_guarded(plain).expect("free plain");

    memory.free_guarded(a).expect("free");
    memory.alloc_guarded(32).expect("alloc");
    assert_eq!(memory.stats().expect("stats").guarded_allocations, 3);
}

#[test]
fn heap_protection_off_uses_plain_blocks() {
    let (memory, _) = monitor(MemorySettings {
        heap_protection: false,
        ..MemorySettings::default()
    });
    let ptr = memory.alloc_guarded(16).expect("alloc");
    memory.write_unchecked(ptr, 16, &[0; 16]).expect("write");
    memory.free_guarded(ptr).expect("no guards to check");

    memory.set_heap_protection(true);
    memory.alloc_guarded(16).expect("alloc");
    let stats = memory.stats().expect("stats");
    assert_eq!(stats.fallback_allocations, 1);
    assert_eq!(stats.guarded_allocations, 1);
}
