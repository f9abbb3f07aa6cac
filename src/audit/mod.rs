//! Audit log.
//!
//! Fixed-capacity ring buffers of [`SecurityEvent`]. Overflow drops the
//! oldest event and counts it; the caller is never blocked. Critical events
//! (severity >= 8) live in their own reserve ring so a flood of routine
//! events cannot push them out.
//!
//! Every recorded event is appended to the optional persistent sink,
//! raised through the alert path when critical, then handed to the
//! attached [`EventObserver`]. Events the observer returns are recorded
//! but not forwarded again.

pub mod sink;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use sink::{verify_sealed_log, AuditRecord, JsonLineSink};

use crate::error::{Result, SecurityError};
use crate::logging::AUDIT_TARGET;
use crate::types::{Clock, EventKind, EventMask, SecurityEvent, Severity};

/// Default capacity of the main ring.
pub const DEFAULT_CAPACITY: usize = 16_384;

/// Default capacity of the critical reserve.
pub const DEFAULT_CRITICAL_CAPACITY: usize = 256;

/// Receives every recorded event synchronously.
pub trait EventObserver: Send + Sync {
    /// Inspect `event`. Returned events are recorded without being observed.
    fn observe(&self, event: &SecurityEvent) -> Vec<SecurityEvent>;
}

/// Operator-visible alert path for critical events.
pub trait AlertSink: Send + Sync {
    /// Raise an alert for `event`.
    fn raise(&self, event: &SecurityEvent);
}

/// Alerts through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, event: &SecurityEvent) {
        error!(
            event_id = event.event_id,
            pid = event.pid,
            kind = %event.kind,
            severity = event.severity.level(),
            description = %event.description,
            "SECURITY ALERT"
        );
    }
}

/// What [`AuditLog::log_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// Recorded under this sequence number.
    Recorded(u64),
    /// Kind not enabled by the policy mask.
    Filtered,
    /// Logging is disabled.
    Disabled,
}

/// Audit log sizing and initial policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditSettings {
    /// Main ring capacity.
    pub capacity: usize,
    /// Critical reserve capacity.
    pub critical_capacity: usize,
    /// Initially enabled kinds.
    pub policy: EventMask,
    /// Whether logging starts enabled.
    pub enabled: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            critical_capacity: DEFAULT_CRITICAL_CAPACITY,
            policy: EventMask::all(),
            enabled: true,
        }
    }
}

/// Read-only audit counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStatistics {
    /// Whether logging is on.
    pub enabled: bool,
    /// Enabled kinds as raw bits.
    pub policy_mask: u32,
    /// Main ring capacity.
    pub capacity: usize,
    /// Critical reserve capacity.
    pub critical_capacity: usize,
    /// Events currently buffered.
    pub buffered: usize,
    /// Events recorded since start.
    pub events_logged: u64,
    /// Events overwritten by drop-oldest.
    pub events_dropped: u64,
    /// Events rejected by the policy mask.
    pub events_filtered: u64,
    /// Last assigned sequence number.
    pub sequence_number: u64,
    /// Same as `events_logged`.
    pub total_events: u64,
    /// Severity >= 8.
    pub critical_events: u64,
    /// Severity >= 5.
    pub warning_events: u64,
    /// Severity >= 3.
    pub info_events: u64,
    /// Recorded events per kind, indexed like [`EventKind::ALL`].
    pub events_by_kind: [u64; 9],
    /// Failed writes to the persistent sink.
    pub persist_failures: u64,
    /// Critical alerts raised.
    pub alerts_raised: u64,
}

struct AuditState {
    enabled: bool,
    policy: EventMask,
    ring: VecDeque<SecurityEvent>,
    capacity: usize,
    critical: VecDeque<SecurityEvent>,
    critical_capacity: usize,
    next_sequence: u64,
    events_logged: u64,
    events_dropped: u64,
    events_filtered: u64,
    critical_events: u64,
    warning_events: u64,
    info_events: u64,
    by_kind: [u64; 9],
}

impl AuditState {
    fn insert(&mut self, event: SecurityEvent) {
        let (ring, capacity) = if event.severity.is_critical() {
            (&mut self.critical, self.critical_capacity)
        } else {
            (&mut self.ring, self.capacity)
        };
        if capacity == 0 {
            self.events_dropped = self.events_dropped.saturating_add(1);
            return;
        }
        if ring.len() >= capacity {
            ring.pop_front();
            self.events_dropped = self.events_dropped.saturating_add(1);
        }
        ring.push_back(event);
    }

    fn count(&mut self, event: &SecurityEvent) {
        self.events_logged = self.events_logged.saturating_add(1);
        if event.severity >= Severity::CRITICAL {
            self.critical_events = self.critical_events.saturating_add(1);
        }
        if event.severity >= Severity::WARNING {
            self.warning_events = self.warning_events.saturating_add(1);
        }
        if event.severity >= Severity::INFO {
            self.info_events = self.info_events.saturating_add(1);
        }
        if let Some(slot) = self.by_kind.get_mut(event.kind.index()) {
            *slot = slot.saturating_add(1);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    Policy,
    Unconditional,
}

/// The audit log.
pub struct AuditLog {
    state: Mutex<AuditState>,
    sink: Option<JsonLineSink>,
    alerts: Arc<dyn AlertSink>,
    observer: RwLock<Option<Arc<dyn EventObserver>>>,
    clock: Arc<dyn Clock>,
    persist_failures: AtomicU64,
    alerts_raised: AtomicU64,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("persistent", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

/// Copy a recorded event onto the audit trail logging target.
fn mirror(event: &SecurityEvent) {
    info!(
        target: AUDIT_TARGET,
        event_id = event.event_id,
        timestamp = event.timestamp,
        kind = %event.kind,
        severity = event.severity.level(),
        pid = event.pid,
        uid = event.uid,
        blocked = event.blocked,
        subject = %event.subject,
        object = %event.object,
        action = %event.action,
        "{}",
        event.description
    );
}

impl AuditLog {
    /// Build an in-memory audit log.
    pub fn new(settings: AuditSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(AuditState {
                enabled: settings.enabled,
                policy: settings.policy,
                ring: VecDeque::with_capacity(settings.capacity.min(DEFAULT_CAPACITY)),
                capacity: settings.capacity,
                critical: VecDeque::new(),
                critical_capacity: settings.critical_capacity,
                next_sequence: 1,
                events_logged: 0,
                events_dropped: 0,
                events_filtered: 0,
                critical_events: 0,
                warning_events: 0,
                info_events: 0,
                by_kind: [0; 9],
            }),
            sink: None,
            alerts: Arc::new(TracingAlertSink),
            observer: RwLock::new(None),
            clock,
            persist_failures: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
        }
    }

    /// Persist every recorded event through `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: JsonLineSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the default tracing alert path.
    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Forward recorded events to `observer`.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn EventObserver>) -> Self {
        match self.observer.write() {
            Ok(mut slot) => *slot = Some(observer),
            Err(poisoned) => *poisoned.into_inner() = Some(observer),
        }
        self
    }

    /// Record an event.
    ///
    /// Never blocks on a full buffer: the oldest event is dropped instead.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the buffer lock is poisoned.
    pub fn log_event(&self, event: SecurityEvent) -> Result<LogOutcome> {
        self.admit(event, Admission::Policy, true)
    }

    /// Record an event, logging (not returning) any failure.
    pub fn emit(&self, event: SecurityEvent) {
        if let Err(err) = self.log_event(event) {
            warn!(error = %err, "audit log rejected event");
        }
    }

    fn admit(&self, event: SecurityEvent, admission: Admission, forward: bool) -> Result<LogOutcome> {
        let recorded = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| SecurityError::poisoned("audit", e))?;
            if admission == Admission::Policy {
                if !state.enabled {
                    return Ok(LogOutcome::Disabled);
                }
                if !state.policy.includes(event.kind) {
                    state.events_filtered = state.events_filtered.saturating_add(1);
                    return Ok(LogOutcome::Filtered);
                }
            }
            let mut event = event;
            if event.timestamp == 0 {
                event.timestamp = self.clock.now_micros();
            }
            event.event_id = state.next_sequence;
            state.next_sequence = state.next_sequence.saturating_add(1);
            state.count(&event);
            state.insert(event.clone());
            event
        };

        self.persist(&recorded);
        mirror(&recorded);
        if recorded.severity.is_critical() {
            self.alerts.raise(&recorded);
            self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        }
        if forward {
            self.forward(&recorded);
        }
        Ok(LogOutcome::Recorded(recorded.event_id))
    }

    fn persist(&self, event: &SecurityEvent) {
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.append(event) {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = event.event_id, error = %err, "audit persistence failed");
            }
        }
    }

    fn forward(&self, event: &SecurityEvent) {
        let observer = match self.observer.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(observer) = observer else {
            return;
        };
        for follow_up in observer.observe(event) {
            if let Err(err) = self.admit(follow_up, Admission::Policy, false) {
                warn!(error = %err, "audit log rejected follow-up event");
            }
        }
    }

    /// Snapshot of buffered events with `timestamp >= since`, optionally of
    /// one kind, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the buffer lock is poisoned.
    pub fn get_events(&self, since: u64, kind: Option<EventKind>) -> Result<Vec<SecurityEvent>> {
        let state = self
            .state
            .lock()
            .map_err(|e| SecurityError::poisoned("audit", e))?;
        let mut events: Vec<SecurityEvent> = state
            .ring
            .iter()
            .chain(state.critical.iter())
            .filter(|e| e.timestamp >= since)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect();
        drop(state);
        events.sort_by_key(|e| e.event_id);
        Ok(events)
    }

    /// Enable or disable the kinds in `mask`. The change itself is recorded
    /// once, regardless of the new policy.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the buffer lock is poisoned.
    pub fn set_policy(&self, mask: EventMask, enable: bool) -> Result<()> {
        let new_policy = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| SecurityError::poisoned("audit", e))?;
            if enable {
                state.policy |= mask;
            } else {
                state.policy &= !mask;
            }
            state.policy
        };
        info!(mask = mask.bits(), enable, policy = new_policy.bits(), "audit policy changed");
        let event = SecurityEvent::new(
            EventKind::PolicyViolation,
            Severity::WARNING,
            format!(
                "Audit policy changed: mask=0x{:x}, enable={enable}",
                mask.bits()
            ),
        )
        .target("audit", "policy", "set_policy");
        self.admit(event, Admission::Unconditional, true)?;
        Ok(())
    }

    /// Turn logging on or off. The change itself is always recorded.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the buffer lock is poisoned.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|e| SecurityError::poisoned("audit", e))?;
            if state.enabled == enabled {
                return Ok(());
            }
            state.enabled = enabled;
        }
        info!(enabled, "audit logging toggled");
        let event = SecurityEvent::new(
            EventKind::PolicyViolation,
            Severity::WARNING,
            format!(
                "Audit logging {}",
                if enabled { "enabled" } else { "disabled" }
            ),
        )
        .target("audit", "state", "set_enabled");
        self.admit(event, Admission::Unconditional, true)?;
        Ok(())
    }

    /// Whether logging is on.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().map(|s| s.enabled).unwrap_or(false)
    }

    /// Snapshot counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the buffer lock is poisoned.
    pub fn stats(&self) -> Result<AuditStatistics> {
        let state = self
            .state
            .lock()
            .map_err(|e| SecurityError::poisoned("audit", e))?;
        let stats = AuditStatistics {
            enabled: state.enabled,
            policy_mask: state.policy.bits(),
            capacity: state.capacity,
            critical_capacity: state.critical_capacity,
            buffered: state.ring.len().saturating_add(state.critical.len()),
            events_logged: state.events_logged,
            events_dropped: state.events_dropped,
            events_filtered: state.events_filtered,
            sequence_number: state.next_sequence.saturating_sub(1),
            total_events: state.events_logged,
            critical_events: state.critical_events,
            warning_events: state.warning_events,
            info_events: state.info_events,
            events_by_kind: state.by_kind,
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
        };
        debug!(buffered = stats.buffered, "audit statistics read");
        Ok(stats)
    }
}
