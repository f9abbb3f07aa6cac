//! Intrusion detection.
//!
//! Every audited event is matched against the registered rules and folded
//! into the behavior of the process it concerns. Rule triggers and the
//! behavior score combine into a threat score; at or above the threshold
//! one critical `Suspicious` event is produced and a graded response is
//! sent to the registered [`ThreatResponder`]s.

pub mod behavior;
pub mod response;
pub mod rules;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use behavior::{ProcessBehavior, DEFAULT_MAX_BEHAVIORS, MAX_SCORE};
pub use response::{ResponseAction, ResponseCommand, ThreatResponder};
pub use rules::{IdsRule, IdsRuleInfo, RuleCallback, RuleSpec, DEFAULT_RULE_SPECS};

use self::behavior::BehaviorTable;
use crate::audit::EventObserver;
use crate::error::{Result, SecurityError};
use crate::types::{Clock, EventDetail, EventKind, SecurityEvent, Severity, MICROS_PER_SEC};

/// Default threat threshold.
pub const DEFAULT_THREAT_THRESHOLD: u32 = 50;

/// Default cap on registered rules.
pub const DEFAULT_MAX_RULES: usize = 512;

/// Score added per triggered rule.
pub const RULE_TRIGGER_SCORE: u32 = 10;

/// Extra score applied when a process is quarantined.
pub const QUARANTINE_PENALTY: u32 = 10;

/// Detector sizing and initial parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdsSettings {
    /// Threat threshold, 0..=100.
    pub threshold: u32,
    /// Record detections without responding.
    pub learning_mode: bool,
    /// Rule cap.
    pub max_rules: usize,
    /// Behavior table size.
    pub max_behaviors: usize,
}

impl Default for IdsSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THREAT_THRESHOLD,
            learning_mode: false,
            max_rules: DEFAULT_MAX_RULES,
            max_behaviors: DEFAULT_MAX_BEHAVIORS,
        }
    }
}

/// Result of analyzing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatAssessment {
    /// Process the event concerns.
    pub pid: u32,
    /// Combined score, 0..=100.
    pub score: u32,
    /// Rules that reached their threshold on this event.
    pub triggered_rules: Vec<String>,
    /// Response taken.
    pub action: ResponseAction,
    /// The critical event produced when the score crossed the threshold.
    pub alert: Option<SecurityEvent>,
}

impl ThreatAssessment {
    /// Whether the score crossed the threshold.
    pub fn is_threat(&self) -> bool {
        self.alert.is_some()
    }
}

/// Read-only detector counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdsStatistics {
    /// Events analyzed.
    pub events_analyzed: u64,
    /// Assessments at or above the threshold.
    pub threats_detected: u64,
    /// Detections reported as false positives.
    pub false_positives: u64,
    /// Rule threshold crossings.
    pub rules_triggered: u64,
    /// Termination requests issued.
    pub processes_terminated: u64,
    /// Quarantines issued.
    pub connections_blocked: u64,
    /// Processes currently tracked.
    pub behaviors_tracked: usize,
    /// Behavior entries evicted.
    pub behaviors_evicted: u64,
    /// Registered rules.
    pub rules_registered: usize,
    /// Current threshold.
    pub threshold: u32,
    /// Whether responses are suppressed.
    pub learning_mode: bool,
}

#[derive(Default)]
struct Counters {
    events_analyzed: AtomicU64,
    threats_detected: AtomicU64,
    false_positives: AtomicU64,
    rules_triggered: AtomicU64,
    processes_terminated: AtomicU64,
    connections_blocked: AtomicU64,
}

/// The intrusion detection engine.
pub struct IntrusionDetector {
    rules: RwLock<Vec<IdsRule>>,
    behaviors: Mutex<BehaviorTable>,
    responders: RwLock<Vec<Weak<dyn ThreatResponder>>>,
    threshold: AtomicU32,
    learning_mode: AtomicBool,
    max_rules: usize,
    next_rule_id: AtomicU32,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl std::fmt::Debug for IntrusionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrusionDetector")
            .field("threshold", &self.threshold.load(Ordering::Relaxed))
            .field("learning_mode", &self.learning_mode.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IntrusionDetector {
    /// Detector with no rules loaded.
    pub fn new(settings: IdsSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            behaviors: Mutex::new(BehaviorTable::new(settings.max_behaviors)),
            responders: RwLock::new(Vec::new()),
            threshold: AtomicU32::new(settings.threshold.min(MAX_SCORE)),
            learning_mode: AtomicBool::new(settings.learning_mode),
            max_rules: settings.max_rules,
            next_rule_id: AtomicU32::new(1),
            clock,
            counters: Counters::default(),
        }
    }

    /// Register the built-in rule set.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::register_rule`] failures.
    pub fn load_default_rules(&self) -> Result<()> {
        for spec in DEFAULT_RULE_SPECS {
            self.register_rule(spec, None)?;
        }
        info!(rules = DEFAULT_RULE_SPECS.len(), "default ids rules loaded");
        Ok(())
    }

    /// Parse and register a rule, returning its id.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::InvalidParameter`] for malformed specs.
    /// - [`SecurityError::AlreadyExists`] if the name is taken.
    /// - [`SecurityError::OutOfMemory`] at the rule cap.
    /// - [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn register_rule(&self, spec: &str, callback: Option<Arc<dyn RuleCallback>>) -> Result<u32> {
        let parsed = RuleSpec::parse(spec)?;
        let mut rules = self
            .rules
            .write()
            .map_err(|e| SecurityError::poisoned("ids", e))?;
        if rules.len() >= self.max_rules {
            return Err(SecurityError::OutOfMemory(format!(
                "ids holds the maximum of {} rules",
                self.max_rules
            )));
        }
        if rules.iter().any(|r| r.name() == parsed.name) {
            return Err(SecurityError::AlreadyExists(format!(
                "ids rule {}",
                parsed.name
            )));
        }
        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        let rule = IdsRule::new(id, parsed, callback)?;
        debug!(id, name = rule.name(), "ids rule registered");
        rules.push(rule);
        Ok(id)
    }

    /// Remove the rule called `name`.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotFound`] if no rule has that name.
    /// - [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn unregister_rule(&self, name: &str) -> Result<()> {
        let mut rules = self
            .rules
            .write()
            .map_err(|e| SecurityError::poisoned("ids", e))?;
        let index = rules
            .iter()
            .position(|r| r.name() == name)
            .ok_or_else(|| SecurityError::NotFound(format!("ids rule {name}")))?;
        rules.remove(index);
        debug!(name, "ids rule removed");
        Ok(())
    }

    /// Snapshot of every rule's counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the rule lock is poisoned.
    pub fn rules(&self) -> Result<Vec<IdsRuleInfo>> {
        let rules = self
            .rules
            .read()
            .map_err(|e| SecurityError::poisoned("ids", e))?;
        Ok(rules.iter().map(IdsRule::info).collect())
    }

    /// Change the threshold and learning mode.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for a threshold above 100.
    pub fn set_parameters(&self, threshold: u32, learning_mode: bool) -> Result<()> {
        if threshold > MAX_SCORE {
            return Err(SecurityError::InvalidParameter(format!(
                "threshold {threshold} exceeds {MAX_SCORE}"
            )));
        }
        self.threshold.store(threshold, Ordering::Relaxed);
        self.learning_mode.store(learning_mode, Ordering::Relaxed);
        info!(threshold, learning_mode, "ids parameters changed");
        Ok(())
    }

    /// Send future responses to `responder` as well.
    pub fn register_responder(&self, responder: Weak<dyn ThreatResponder>) {
        match self.responders.write() {
            Ok(mut list) => list.push(responder),
            Err(poisoned) => poisoned.into_inner().push(responder),
        }
    }

    /// Behavior snapshot for `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if the behavior lock is poisoned.
    pub fn behavior(&self, pid: u32) -> Result<Option<ProcessBehavior>> {
        let table = self
            .behaviors
            .lock()
            .map_err(|e| SecurityError::poisoned("ids", e))?;
        Ok(table.get(pid).cloned())
    }

    /// Record that a detection for `pid` was benign and clear its score.
    ///
    /// # Errors
    ///
    /// - [`SecurityError::NotFound`] if `pid` is not tracked.
    /// - [`SecurityError::LockPoisoned`] if the behavior lock is poisoned.
    pub fn report_false_positive(&self, pid: u32) -> Result<()> {
        {
            let mut table = self
                .behaviors
                .lock()
                .map_err(|e| SecurityError::poisoned("ids", e))?;
            let behavior = table
                .get_mut(pid)
                .ok_or_else(|| SecurityError::NotFound(format!("behavior for pid {pid}")))?;
            behavior.anomaly_score = 0;
            behavior.suspicious = false;
        }
        self.counters.false_positives.fetch_add(1, Ordering::Relaxed);
        info!(pid, "ids false positive reported");
        Ok(())
    }

    /// Analyze one event.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if a detector lock is poisoned.
    pub fn analyze_event(&self, event: &SecurityEvent) -> Result<ThreatAssessment> {
        self.counters.events_analyzed.fetch_add(1, Ordering::Relaxed);
        let now = if event.timestamp == 0 {
            self.clock.now_secs()
        } else {
            event.timestamp / MICROS_PER_SEC
        };

        let mut triggered: Vec<(String, Option<Arc<dyn RuleCallback>>)> = Vec::new();
        {
            let mut rules = self
                .rules
                .write()
                .map_err(|e| SecurityError::poisoned("ids", e))?;
            for rule in rules.iter_mut() {
                if rule.matches(event) && rule.record(now) {
                    triggered.push((rule.name().to_owned(), rule.callback.clone()));
                }
            }
        }
        let trigger_count = u32::try_from(triggered.len()).unwrap_or(u32::MAX);
        self.counters
            .rules_triggered
            .fetch_add(u64::from(trigger_count), Ordering::Relaxed);

        let behavior_score = if event.pid == 0 {
            0
        } else {
            let mut table = self
                .behaviors
                .lock()
                .map_err(|e| SecurityError::poisoned("ids", e))?;
            let behavior = table.touch(event.pid, now);
            behavior.record(event);
            behavior.rescore();
            if trigger_count > 0 {
                behavior.suspicious = true;
            }
            behavior.anomaly_score
        };

        for (name, callback) in &triggered {
            if let Some(callback) = callback {
                callback.on_trigger(name, event);
            }
        }

        let score = trigger_count
            .saturating_mul(RULE_TRIGGER_SCORE)
            .saturating_add(behavior_score)
            .min(MAX_SCORE);
        let triggered_rules: Vec<String> = triggered.into_iter().map(|(name, _)| name).collect();

        let threshold = self.threshold.load(Ordering::Relaxed);
        if score < threshold {
            debug!(pid = event.pid, score, "ids event below threshold");
            return Ok(ThreatAssessment {
                pid: event.pid,
                score,
                triggered_rules,
                action: ResponseAction::LogOnly,
                alert: None,
            });
        }

        self.counters.threats_detected.fetch_add(1, Ordering::Relaxed);
        let action = if self.learning_mode.load(Ordering::Relaxed) {
            ResponseAction::LogOnly
        } else {
            ResponseAction::for_score(score)
        };
        warn!(
            pid = event.pid,
            score,
            rules = ?triggered_rules,
            ?action,
            "ids threat detected"
        );
        self.respond(event, score, action)?;

        let alert = SecurityEvent::new(
            EventKind::Suspicious,
            Severity::MAX,
            format!(
                "Threat detected: score {score}, rules [{}], response {action:?}",
                triggered_rules.join(", ")
            ),
        )
        .process(event.pid, event.uid)
        .target(event.subject.clone(), event.object.clone(), event.action.clone())
        .blocked(action != ResponseAction::LogOnly)
        .detail(event.detail);

        Ok(ThreatAssessment {
            pid: event.pid,
            score,
            triggered_rules,
            action,
            alert: Some(alert),
        })
    }

    fn respond(&self, event: &SecurityEvent, score: u32, action: ResponseAction) -> Result<()> {
        let mut commands = Vec::new();
        match action {
            ResponseAction::LogOnly => return Ok(()),
            ResponseAction::Terminate if event.pid != 0 => {
                self.counters.processes_terminated.fetch_add(1, Ordering::Relaxed);
                commands.push(ResponseCommand::Terminate {
                    pid: event.pid,
                    score,
                });
            }
            ResponseAction::Quarantine if event.pid != 0 => {
                {
                    let mut table = self
                        .behaviors
                        .lock()
                        .map_err(|e| SecurityError::poisoned("ids", e))?;
                    if let Some(behavior) = table.get_mut(event.pid) {
                        behavior.suspicious = true;
                        behavior.add_score(QUARANTINE_PENALTY);
                    }
                }
                self.counters.connections_blocked.fetch_add(1, Ordering::Relaxed);
                commands.push(ResponseCommand::Quarantine {
                    pid: event.pid,
                    score,
                });
            }
            _ => {}
        }
        if let EventDetail::Network(flow) = event.detail {
            commands.push(ResponseCommand::DropConnection { flow });
        }
        self.dispatch(&commands);
        Ok(())
    }

    fn dispatch(&self, commands: &[ResponseCommand]) {
        if commands.is_empty() {
            return;
        }
        let responders: Vec<Arc<dyn ThreatResponder>> = match self.responders.read() {
            Ok(list) => list.iter().filter_map(Weak::upgrade).collect(),
            Err(poisoned) => poisoned.into_inner().iter().filter_map(Weak::upgrade).collect(),
        };
        for responder in &responders {
            for command in commands {
                responder.respond(command);
            }
        }
    }

    /// Snapshot counters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::LockPoisoned`] if a detector lock is poisoned.
    pub fn stats(&self) -> Result<IdsStatistics> {
        let (behaviors_tracked, behaviors_evicted) = {
            let table = self
                .behaviors
                .lock()
                .map_err(|e| SecurityError::poisoned("ids", e))?;
            (table.len(), table.evictions)
        };
        let rules_registered = self
            .rules
            .read()
            .map_err(|e| SecurityError::poisoned("ids", e))?
            .len();
        let c = &self.counters;
        Ok(IdsStatistics {
            events_analyzed: c.events_analyzed.load(Ordering::Relaxed),
            threats_detected: c.threats_detected.load(Ordering::Relaxed),
            false_positives: c.false_positives.load(Ordering::Relaxed),
            rules_triggered: c.rules_triggered.load(Ordering::Relaxed),
            processes_terminated: c.processes_terminated.load(Ordering::Relaxed),
            connections_blocked: c.connections_blocked.load(Ordering::Relaxed),
            behaviors_tracked,
            behaviors_evicted,
            rules_registered,
            threshold: self.threshold.load(Ordering::Relaxed),
            learning_mode: self.learning_mode.load(Ordering::Relaxed),
        })
    }
}

impl EventObserver for IntrusionDetector {
    fn observe(&self, event: &SecurityEvent) -> Vec<SecurityEvent> {
        match self.analyze_event(event) {
            Ok(assessment) => assessment.alert.into_iter().collect(),
            Err(err) => {
                warn!(event_id = event.event_id, error = %err, "ids analysis failed");
                Vec::new()
            }
        }
    }
}
