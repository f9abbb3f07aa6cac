//! Security contexts, credentials and access masks.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// Longest accepted context label, exclusive.
pub const MAX_LABEL_LEN: usize = 256;

/// Type assigned to two-field labels (`user:role`).
pub const UNCONFINED_TYPE: &str = "unconfined_t";

/// Typed label attached to a process or object.
///
/// Labels have the shape `user:role:type:level`. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityContext {
    subject_id: u32,
    label: String,
    path: Option<String>,
}

impl SecurityContext {
    /// Build a context, validating the label.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidParameter`] for empty, oversized or
    /// control-character labels.
    pub fn new(subject_id: u32, label: impl Into<String>) -> Result<Self, SecurityError> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self {
            subject_id,
            label,
            path: None,
        })
    }

    /// Attach the filesystem path of an object context.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Owner uid for objects, subject uid for processes.
    pub fn subject_id(&self) -> u32 {
        self.subject_id
    }

    /// Raw label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Filesystem path, when the context describes a file.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Type field used for rule matching.
    ///
    /// A label without colons is taken as the type itself; a label with a
    /// single colon has no type component and maps to `unconfined_t`.
    pub fn type_field(&self) -> &str {
        let mut parts = self.label.split(':');
        let first = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (None, _) => first,
            (Some(_), None) => UNCONFINED_TYPE,
            (Some(_), Some(kind)) => kind,
        }
    }

    /// Split the label into its four named fields.
    pub fn fields(&self) -> ContextFields<'_> {
        let mut parts = self.label.splitn(4, ':');
        ContextFields {
            user: parts.next().unwrap_or_default(),
            role: parts.next().unwrap_or_default(),
            kind: parts.next().unwrap_or_default(),
            level: parts.next().unwrap_or_default(),
        }
    }
}

/// Borrowed view of a label's fields. Missing fields are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextFields<'a> {
    /// SELinux-style user.
    pub user: &'a str,
    /// Role.
    pub role: &'a str,
    /// Type (domain for processes).
    pub kind: &'a str,
    /// Sensitivity level.
    pub level: &'a str,
}

/// Check a label string without building a context.
///
/// # Errors
///
/// Returns [`SecurityError::InvalidParameter`] describing the first problem.
pub fn validate_label(label: &str) -> Result<(), SecurityError> {
    if label.is_empty() {
        return Err(SecurityError::InvalidParameter(
            "context label is empty".to_owned(),
        ));
    }
    if label.len() >= MAX_LABEL_LEN {
        return Err(SecurityError::InvalidParameter(format!(
            "context label exceeds {MAX_LABEL_LEN} bytes"
        )));
    }
    if label.chars().any(char::is_control) {
        return Err(SecurityError::InvalidParameter(
            "context label contains control characters".to_owned(),
        ));
    }
    Ok(())
}

bitflags! {
    /// Discrete privileges, numbered as Linux capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u64 {
        /// Change file ownership.
        const CHOWN = 1 << 0;
        /// Bypass file permission checks.
        const DAC_OVERRIDE = 1 << 1;
        /// Bypass read and directory search checks.
        const DAC_READ_SEARCH = 1 << 2;
        /// Bypass owner checks (chmod).
        const FOWNER = 1 << 3;
        /// Signal any process.
        const KILL = 1 << 5;
        /// Change gid.
        const SETGID = 1 << 6;
        /// Change uid.
        const SETUID = 1 << 7;
        /// Bind ports below 1024.
        const NET_BIND_SERVICE = 1 << 10;
        /// Network administration.
        const NET_ADMIN = 1 << 12;
        /// Raw sockets.
        const NET_RAW = 1 << 13;
        /// Load kernel modules.
        const SYS_MODULE = 1 << 16;
        /// Trace other processes.
        const SYS_PTRACE = 1 << 19;
        /// Broad system administration (mount and similar).
        const SYS_ADMIN = 1 << 21;
        /// Reboot.
        const SYS_BOOT = 1 << 22;
        /// Write audit records.
        const AUDIT_WRITE = 1 << 29;
        /// Configure auditing.
        const AUDIT_CONTROL = 1 << 30;
    }
}

impl Capabilities {
    /// Capability an action requires, if any.
    pub fn required_for(action: &str) -> Option<Capabilities> {
        match action {
            "read" => Some(Self::DAC_READ_SEARCH),
            "write" | "execute" | "create" | "delete" => Some(Self::DAC_OVERRIDE),
            "chown" => Some(Self::CHOWN),
            "chmod" => Some(Self::FOWNER),
            "mount" => Some(Self::SYS_ADMIN),
            "module_load" => Some(Self::SYS_MODULE),
            "ptrace" => Some(Self::SYS_PTRACE),
            "network_bind" => Some(Self::NET_BIND_SERVICE),
            "network_raw" => Some(Self::NET_RAW),
            "network_admin" => Some(Self::NET_ADMIN),
            _ => None,
        }
    }
}

bitflags! {
    /// Requested access on an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u32 {
        /// Read.
        const READ = 1 << 0;
        /// Write.
        const WRITE = 1 << 1;
        /// Execute.
        const EXECUTE = 1 << 2;
        /// Create.
        const CREATE = 1 << 3;
        /// Delete.
        const DELETE = 1 << 4;
    }
}

impl AccessMask {
    /// Access bits implied by a MAC action name.
    pub fn for_action(action: &str) -> AccessMask {
        match action {
            "read" => Self::READ,
            "write" => Self::WRITE,
            "execute" => Self::EXECUTE,
            "create" => Self::CREATE,
            "delete" => Self::DELETE,
            _ => Self::empty(),
        }
    }
}

/// Credentials the process subsystem hands in with every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCredentials {
    /// Process id.
    pub pid: u32,
    /// User id.
    pub uid: u32,
    /// Effective capabilities.
    pub capabilities: Capabilities,
    /// Process security context.
    pub context: SecurityContext,
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Access granted.
    Allow,
    /// Access refused.
    Deny,
}

impl Decision {
    /// `true` for [`Decision::Allow`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }
}
