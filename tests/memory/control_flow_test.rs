//! ASLR bases, CFI checks, ROP scanning and hardware flags.

use std::sync::Arc;

use bastion::audit::{AuditLog, AuditSettings};
use bastion::crypto::SecureRandom;
use bastion::hardware::HardwareFeatures;
use bastion::memory::{AslrRegion, MemoryProtectionMonitor, MemorySettings, PAGE_SIZE};
use bastion::types::{Clock, EventKind, ManualClock, Severity};

fn monitor(
    settings: MemorySettings,
    features: HardwareFeatures,
) -> (MemoryProtectionMonitor, Arc<AuditLog>) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1_700_000_000));
    let audit = Arc::new(AuditLog::new(AuditSettings::default(), clock.clone()));
    let random = Arc::new(SecureRandom::new(clock, None).expect("should seed"));
    let monitor = MemoryProtectionMonitor::new(settings, &features, random, audit.clone())
        .expect("should build monitor");
    (monitor, audit)
}

#[test]
fn aslr_off_returns_fixed_bases() {
    let (memory, _) = monitor(
        MemorySettings {
            aslr: false,
            ..MemorySettings::default()
        },
        HardwareFeatures::default(),
    );
    for region in [
        AslrRegion::Stack,
        AslrRegion::Heap,
        AslrRegion::Mmap,
        AslrRegion::Executable,
    ] {
        assert_eq!(memory.randomize_base(region).expect("base"), region.base());
    }
    assert_eq!(memory.stats().expect("stats").aslr_randomizations, 0);

    memory.enable_aslr();
    memory.randomize_base(AslrRegion::Stack).expect("base");
    let stats = memory.stats().expect("stats");
    assert!(stats.aslr_enabled);
    assert_eq!(stats.aslr_randomizations, 1);
}

#[test]
fn randomized_bases_are_page_aligned_and_bounded() {
    let (memory, _) = monitor(MemorySettings::default(), HardwareFeatures::default());
    let span = (1u64 << 28).saturating_mul(PAGE_SIZE);
    let mut distinct = std::collections::HashSet::new();
    for _ in 0..32 {
        let base = memory.randomize_base(AslrRegion::Mmap).expect("base");
        let offset = base
            .checked_sub(AslrRegion::Mmap.base())
            .expect("base should not sit below the region start");
        assert!(offset < span);
        assert_eq!(offset.checked_rem(PAGE_SIZE), Some(0));
        distinct.insert(base);
    }
    assert!(distinct.len() > 1);
}

#[test]
fn cfi_mismatch_is_blocked_and_logged() {
    let (memory, audit) = monitor(MemorySettings::default(), HardwareFeatures::default());
    assert!(memory.check_cfi(300, 0x4000_1000, 0x4000_1000));
    assert!(!memory.check_cfi(300, 0x4141_4141, 0x4000_1000));

    let events = audit
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].object, "cfi_violation");
    assert_eq!(events[0].severity, Severity::MAX);
    assert_eq!(events[0].pid, 300);
    assert!(events[0].description.contains("0x41414141"));
    assert_eq!(memory.stats().expect("stats").cfi_violations_detected, 1);
}

#[test]
fn cfi_disabled_allows_any_target() {
    let (memory, _) = monitor(
        MemorySettings {
            cfi: false,
            ..MemorySettings::default()
        },
        HardwareFeatures::default(),
    );
    assert!(memory.check_cfi(1, 0xBAD, 0x600D));
    memory.enable_cfi();
    assert!(!memory.check_cfi(1, 0xBAD, 0x600D));
}

#[test]
fn rop_density_threshold() {
    let (memory, audit) = monitor(MemorySettings::default(), HardwareFeatures::default());

    let mut sparse = vec![0x90u8; 200];
    sparse[50] = 0xC3;
    sparse[150] = 0xC3;
    assert!(!memory.scan_for_rop(&sparse));

    let mut dense = sparse.clone();
    dense[100] = 0xFF;
    dense[101] = 0xE0;
    assert!(memory.scan_for_rop(&dense));

    let events = audit
        .get_events(0, Some(EventKind::Suspicious))
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].object, "rop_gadgets");
    assert_eq!(events[0].severity.level(), 7);
    assert!(!events[0].blocked);
    assert_eq!(memory.stats().expect("stats").rop_regions_flagged, 1);
}

#[test]
fn tiny_regions_flag_any_gadget() {
    let (memory, _) = monitor(MemorySettings::default(), HardwareFeatures::default());
    assert!(memory.scan_for_rop(&[0xC3]));
    assert!(!memory.scan_for_rop(&[]));
}

#[test]
fn hardware_flags_are_reported() {
    let features = HardwareFeatures {
        smep: true,
        mte: true,
        ..HardwareFeatures::default()
    };
    let (memory, _) = monitor(MemorySettings::default(), features);
    let stats = memory.stats().expect("stats");
    assert!(stats.smep_enabled);
    assert!(stats.mte_enabled);
    assert!(!stats.smap_enabled);
    assert!(!stats.cet_enabled);
}
