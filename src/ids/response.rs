//! Advisory responses the detector hands to other subsystems.

use serde::Serialize;

use crate::types::FlowKey;

/// Graded response chosen for a threat score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Record only.
    LogOnly,
    /// Isolate the process and its connections.
    Quarantine,
    /// Ask for the process to be terminated.
    Terminate,
}

impl ResponseAction {
    /// Score at or above which a process is quarantined.
    pub const QUARANTINE_SCORE: u32 = 60;
    /// Score at or above which termination is requested.
    pub const TERMINATE_SCORE: u32 = 80;

    /// Response for `score`.
    pub fn for_score(score: u32) -> Self {
        if score >= Self::TERMINATE_SCORE {
            ResponseAction::Terminate
        } else if score >= Self::QUARANTINE_SCORE {
            ResponseAction::Quarantine
        } else {
            ResponseAction::LogOnly
        }
    }
}

/// A request sent to a [`ThreatResponder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ResponseCommand {
    /// Terminate `pid`.
    Terminate {
        /// Target process.
        pid: u32,
        /// Score that triggered the request.
        score: u32,
    },
    /// Quarantine `pid`.
    Quarantine {
        /// Target process.
        pid: u32,
        /// Score that triggered the request.
        score: u32,
    },
    /// Drop one connection.
    DropConnection {
        /// Flow to drop.
        flow: FlowKey,
    },
}

/// A subsystem able to act on detector responses.
///
/// Implementations must not call back into the detector synchronously.
pub trait ThreatResponder: Send + Sync {
    /// Act on `command`. Failures are the responder's to log.
    fn respond(&self, command: &ResponseCommand);
}
