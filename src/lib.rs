//! Bastion: a kernel security framework.
//!
//! Mandatory access control, a cryptographic key service, memory
//! protection, an audit log, a stateful packet filter with sandbox
//! profiles, and intrusion detection. [`framework::SecurityFramework`]
//! wires the components together.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod hardware;
pub mod types;

pub mod audit;
pub mod crypto;
pub mod ids;
pub mod mac;
pub mod memory;
pub mod netfilter;
pub mod sandbox;

pub mod config;
pub mod framework;
pub mod logging;

pub use error::{Result, SecurityError};
pub use framework::{SecurityFramework, SecurityLevel};
