//! Graded responses, learning mode and responder dispatch.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

use bastion::ids::{IdsSettings, IntrusionDetector, ResponseAction, ResponseCommand, ThreatResponder};
use bastion::types::{
    protocol, Clock, EventDetail, EventKind, FlowKey, ManualClock, SecurityEvent, Severity,
};
use bastion::SecurityError;

#[derive(Default)]
struct Recorder(Mutex<Vec<ResponseCommand>>);

impl Recorder {
    fn commands(&self) -> Vec<ResponseCommand> {
        self.0.lock().expect("test lock").clone()
    }
}

impl ThreatResponder for Recorder {
    fn respond(&self, command: &ResponseCommand) {
        self.0.lock().expect("test lock").push(*command);
    }
}

fn setup(learning_mode: bool) -> (IntrusionDetector, Arc<ManualClock>, Arc<Recorder>) {
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let ids = IntrusionDetector::new(
        IdsSettings {
            learning_mode,
            ..IdsSettings::default()
        },
        dyn_clock,
    );
    let recorder = Arc::new(Recorder::default());
    let as_responder: Arc<dyn ThreatResponder> = recorder.clone();
    ids.register_responder(Arc::downgrade(&as_responder));
    (ids, clock, recorder)
}

fn escalation(pid: u32) -> SecurityEvent {
    SecurityEvent::new(EventKind::PrivilegeEscalation, Severity::clamped(6), "setuid")
        .process(pid, 1000)
        .target("user_t", "capability", "setuid")
}

#[test]
fn escalating_behavior_quarantines_then_terminates() {
    let (ids, _, recorder) = setup(false);

    // the fourth escalation starts scoring, twenty points per event
    let scores: Vec<u32> = (0..5)
        .map(|_| ids.analyze_event(&escalation(500)).expect("analyze").score)
        .collect();
    assert_eq!(scores, vec![0, 0, 0, 20, 40]);
    assert!(recorder.commands().is_empty());

    let sixth = ids.analyze_event(&escalation(500)).expect("analyze");
    assert_eq!(sixth.score, 60);
    assert_eq!(sixth.action, ResponseAction::Quarantine);
    let alert = sixth.alert.expect("threat alert");
    assert_eq!(alert.kind, EventKind::Suspicious);
    assert_eq!(alert.severity, Severity::MAX);
    assert_eq!(alert.pid, 500);
    assert!(alert.blocked);
    assert_eq!(
        recorder.commands(),
        vec![ResponseCommand::Quarantine { pid: 500, score: 60 }]
    );
    // quarantine adds its own penalty
    assert_eq!(
        ids.behavior(500).expect("lookup").expect("tracked").anomaly_score,
        70
    );

    let seventh = ids.analyze_event(&escalation(500)).expect("analyze");
    assert_eq!(seventh.score, 90);
    assert_eq!(seventh.action, ResponseAction::Terminate);
    assert_eq!(
        recorder.commands().last(),
        Some(&ResponseCommand::Terminate { pid: 500, score: 90 })
    );

    let stats = ids.stats().expect("stats");
    assert_eq!(stats.threats_detected, 2);
    assert_eq!(stats.connections_blocked, 1);
    assert_eq!(stats.processes_terminated, 1);
}

#[test]
fn learning_mode_detects_without_responding() {
    let (ids, _, recorder) = setup(true);
    let mut last = None;
    for _ in 0..7 {
        last = Some(ids.analyze_event(&escalation(600)).expect("analyze"));
    }
    let last = last.expect("assessment");
    assert!(last.is_threat());
    assert_eq!(last.action, ResponseAction::LogOnly);
    assert!(!last.alert.expect("alert").blocked);
    assert!(recorder.commands().is_empty());
    assert_eq!(ids.stats().expect("stats").threats_detected, 2);
}

#[test]
fn network_threat_drops_its_flow() {
    let (ids, _, recorder) = setup(false);
    for n in 0..6 {
        ids.register_rule(&format!("scan{n}:network_access:threshold=1"), None)
            .expect("register");
    }
    let flow = FlowKey {
        src: Ipv4Addr::new(203, 0, 113, 9),
        dst: Ipv4Addr::new(10, 0, 0, 1),
        src_port: 5555,
        dst_port: 23,
        protocol: protocol::TCP,
    };
    let event = SecurityEvent::new(EventKind::NetworkAccess, Severity::clamped(4), "port scan")
        .process(0, 0)
        .detail(EventDetail::Network(flow));

    let assessment = ids.analyze_event(&event).expect("analyze");
    assert_eq!(assessment.score, 60);
    assert_eq!(assessment.action, ResponseAction::Quarantine);
    // kernel-owned traffic gets no process response, only the flow drop
    assert_eq!(
        recorder.commands(),
        vec![ResponseCommand::DropConnection { flow }]
    );
}

#[test]
fn dropped_responders_are_skipped() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(1));
    let ids = IntrusionDetector::new(IdsSettings::default(), clock);
    let gone: Weak<dyn ThreatResponder> = {
        let recorder: Arc<dyn ThreatResponder> = Arc::new(Recorder::default());
        Arc::downgrade(&recorder)
    };
    ids.register_responder(gone);
    for _ in 0..7 {
        ids.analyze_event(&escalation(700)).expect("analyze");
    }
    assert_eq!(ids.stats().expect("stats").processes_terminated, 1);
}

#[test]
fn false_positive_clears_score() {
    let (ids, _, _) = setup(true);
    for _ in 0..6 {
        ids.analyze_event(&escalation(800)).expect("analyze");
    }
    ids.report_false_positive(800).expect("report");
    let behavior = ids.behavior(800).expect("lookup").expect("tracked");
    assert_eq!(behavior.anomaly_score, 0);
    assert!(!behavior.suspicious);
    assert_eq!(ids.stats().expect("stats").false_positives, 1);
    assert!(matches!(
        ids.report_false_positive(801),
        Err(SecurityError::NotFound(_))
    ));
}

#[test]
fn idle_process_starts_over() {
    let (ids, clock, _) = setup(true);
    for _ in 0..5 {
        ids.analyze_event(&escalation(900)).expect("analyze");
    }
    assert_eq!(ids.behavior(900).expect("lookup").expect("tracked").anomaly_score, 40);

    clock.advance_secs(3_600);
    let after = ids.analyze_event(&escalation(900)).expect("analyze");
    // the escalation count persists, so the condition still holds once
    assert_eq!(after.score, 20);
}

#[test]
fn threshold_bounds() {
    let (ids, _, _) = setup(false);
    assert!(matches!(
        ids.set_parameters(101, false),
        Err(SecurityError::InvalidParameter(_))
    ));
    ids.set_parameters(100, true).expect("max threshold");
    let stats = ids.stats().expect("stats");
    assert_eq!(stats.threshold, 100);
    assert!(stats.learning_mode);
}
