//! Persistent JSON-lines audit sink.
//!
//! One record per line, append-only. With sealing enabled each record
//! carries `seal = HMAC(key, previous_seal || record)`, so removing or
//! editing a line breaks every seal after it.

use std::fs::File;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::{ops, Algorithm, Key};
use crate::error::SecurityError;
use crate::types::clock::to_rfc3339;
use crate::types::{EventKind, SecurityEvent};

/// One persisted audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Sequence number.
    pub event_id: u64,
    /// Process id.
    pub pid: u32,
    /// User id.
    pub uid: u32,
    /// Event kind.
    pub kind: EventKind,
    /// Severity 0..=9.
    pub severity: u8,
    /// Whether the operation was blocked.
    pub blocked: bool,
    /// Description.
    pub description: String,
    /// Subject.
    pub subject: String,
    /// Object.
    pub object: String,
    /// Action.
    pub action: String,
    /// Base64 chained HMAC, present when sealing is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal: Option<String>,
}

impl AuditRecord {
    /// Build the unsealed record for `event`.
    pub fn from_event(event: &SecurityEvent) -> Self {
        Self {
            timestamp: to_rfc3339(event.timestamp),
            event_id: event.event_id,
            pid: event.pid,
            uid: event.uid,
            kind: event.kind,
            severity: event.severity.level(),
            blocked: event.blocked,
            description: event.description.clone(),
            subject: event.subject.clone(),
            object: event.object.clone(),
            action: event.action.clone(),
            seal: None,
        }
    }
}

enum Target {
    File(File),
    Writer(Box<dyn Write + Send>),
}

impl Target {
    fn write_line(&mut self, line: &str, fsync: bool) -> std::io::Result<()> {
        match self {
            Target::File(file) => {
                writeln!(file, "{line}")?;
                file.flush()?;
                if fsync {
                    file.sync_data()?;
                }
                Ok(())
            }
            Target::Writer(writer) => {
                writeln!(writer, "{line}")?;
                writer.flush()
            }
        }
    }
}

struct Sealer {
    key: Key,
    previous: Vec<u8>,
}

struct SinkState {
    target: Target,
    sealer: Option<Sealer>,
}

/// Append-only JSON-lines writer for audit events.
pub struct JsonLineSink {
    state: Mutex<SinkState>,
    fsync: bool,
}

impl JsonLineSink {
    /// Open (or create) `path` for appending. Parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create audit directory {}: {e}", parent.display())
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open audit log {}: {e}", path.display()))?;
        Ok(Self {
            state: Mutex::new(SinkState {
                target: Target::File(file),
                sealer: None,
            }),
            fsync,
        })
    }

    /// Create a sink over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(SinkState {
                target: Target::Writer(writer),
                sealer: None,
            }),
            fsync: false,
        }
    }

    /// Seal every record with the HMAC key `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] unless `key` is an HMAC key.
    pub fn with_seal(self, key: Key) -> Result<Self, SecurityError> {
        if key.algorithm() != Algorithm::Hmac {
            return Err(SecurityError::InvalidParameter(
                "audit sealing requires an hmac key".to_owned(),
            ));
        }
        let mut state = self
            .state
            .into_inner()
            .map_err(|e| SecurityError::poisoned("audit sink", e))?;
        state.sealer = Some(Sealer {
            key,
            previous: Vec::new(),
        });
        Ok(Self {
            state: Mutex::new(state),
            fsync: self.fsync,
        })
    }

    /// Append one event.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, sealing or the write fails.
    pub fn append(&self, event: &SecurityEvent) -> anyhow::Result<()> {
        let mut record = AuditRecord::from_event(event);
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("audit sink lock poisoned: {e}"))?;
        let SinkState { target, sealer } = &mut *state;
        let line = match sealer {
            Some(sealer) => {
                let body = serde_json::to_string(&record)?;
                let seal = ops::sign(&sealer.key, &chain_input(&sealer.previous, &body))?;
                record.seal = Some(STANDARD.encode(&seal));
                let line = serde_json::to_string(&record)?;
                sealer.previous = seal;
                line
            }
            None => serde_json::to_string(&record)?,
        };
        target.write_line(&line, self.fsync)?;
        Ok(())
    }
}

fn chain_input(previous: &[u8], body: &str) -> Vec<u8> {
    let mut input = Vec::with_capacity(previous.len().saturating_add(body.len()));
    input.extend_from_slice(previous);
    input.extend_from_slice(body.as_bytes());
    input
}

/// Check the seal chain of a persisted log.
///
/// Returns the number of verified records.
///
/// # Errors
///
/// - [`SecurityError::IntegrityFailure`] naming the first line whose seal
///   is missing or wrong.
/// - [`SecurityError::InvalidParameter`] for unreadable or malformed lines.
pub fn verify_sealed_log(reader: impl BufRead, key: &Key) -> Result<usize, SecurityError> {
    let mut previous = Vec::new();
    let mut verified = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index.saturating_add(1);
        let line = line.map_err(|e| {
            SecurityError::InvalidParameter(format!("line {line_no} unreadable: {e}"))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let mut record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
            SecurityError::InvalidParameter(format!("line {line_no} is not an audit record: {e}"))
        })?;
        let seal = record
            .seal
            .take()
            .ok_or_else(|| SecurityError::IntegrityFailure(format!("line {line_no} has no seal")))?;
        let seal = STANDARD.decode(seal.as_bytes()).map_err(|_| {
            SecurityError::IntegrityFailure(format!("line {line_no} seal is not base64"))
        })?;
        let body = serde_json::to_string(&record).map_err(|e| {
            SecurityError::InvalidParameter(format!("line {line_no} re-encode failed: {e}"))
        })?;
        if !ops::verify(key, &chain_input(&previous, &body), &seal)? {
            return Err(SecurityError::IntegrityFailure(format!(
                "line {line_no} seal mismatch"
            )));
        }
        previous = seal;
        verified = verified.saturating_add(1);
    }
    Ok(verified)
}
