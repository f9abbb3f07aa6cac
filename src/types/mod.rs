//! Data model shared by every component: events, contexts, credentials and time.

pub mod clock;
pub mod context;
pub mod event;

pub use clock::{Clock, ManualClock, SystemClock, MICROS_PER_SEC};
pub use context::{
    validate_label, AccessMask, Capabilities, ContextFields, Decision, ProcessCredentials,
    SecurityContext,
};
pub use event::{
    protocol, EventDetail, EventKind, EventMask, FlowKey, SecurityEvent, Severity,
};
