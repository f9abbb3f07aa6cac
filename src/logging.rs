//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Operational logs and the audit trail are kept apart. Every event the
//! audit log records is mirrored on [`AUDIT_TARGET`]; with a logs directory
//! configured those lines land in their own rotated JSON file while
//! everything else goes to the operational file and stderr.
//!
//! - **Host** ([`init`] with `logging.dir` set): operational JSON file,
//!   audit JSON file, stderr console
//! - **CLI** ([`init_cli`]): console only, audit trail suppressed

use std::path::Path;

use anyhow::Context;
use tracing::Metadata;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::LoggingConfig;

/// Target carrying the mirrored audit trail.
pub const AUDIT_TARGET: &str = "bastion::audit_trail";

/// File name prefix of the rotated operational log.
pub const LOG_FILE_PREFIX: &str = "bastion.log";

/// File name prefix of the rotated audit trail.
pub const AUDIT_FILE_PREFIX: &str = "bastion-audit.log";

/// Level used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_LEVEL: &str = "info";

/// Holds the non-blocking writer guards for file logging.
///
/// Dropping it flushes pending entries and closes the files.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

fn is_audit(meta: &Metadata<'_>) -> bool {
    meta.target() == AUDIT_TARGET
}

fn is_operational(meta: &Metadata<'_>) -> bool {
    !is_audit(meta)
}

/// Filter directives in force: a non-empty `RUST_LOG` wins over `level`.
pub fn filter_directives(rust_log: Option<&str>, level: &str) -> String {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => directives.to_owned(),
        _ => level.to_owned(),
    }
}

/// Reject a level string `tracing-subscriber` cannot parse.
///
/// # Errors
///
/// Returns the parser's complaint.
pub fn check_directives(directives: &str) -> anyhow::Result<()> {
    EnvFilter::try_new(directives)
        .map(|_| ())
        .with_context(|| format!("invalid log filter {directives:?}"))
}

fn build_filter(level: &str, audit_trail: bool) -> anyhow::Result<EnvFilter> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(rust_log.as_deref(), level);
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;
    if !audit_trail {
        return Ok(filter);
    }
    let audit = format!("{AUDIT_TARGET}=info")
        .parse()
        .context("invalid audit trail directive")?;
    Ok(filter.add_directive(audit))
}

/// Install logging as configured.
///
/// Without `logging.dir` this is [`init_cli`] and no guard is returned.
///
/// # Errors
///
/// Returns an error for an unparseable level, an uncreatable logs
/// directory, or an already installed subscriber when files are requested.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<LoggingGuard>> {
    match &config.dir {
        Some(dir) => init_production(dir, config).map(Some),
        None => {
            init_cli(&config.level)?;
            Ok(None)
        }
    }
}

/// Initialise file logging for a long-running host.
///
/// Writes operational JSON lines to `{logs_dir}/bastion.log.YYYY-MM-DD`,
/// the audit trail to `{logs_dir}/bastion-audit.log.YYYY-MM-DD` when
/// `audit_file` is set, and human-readable output to stderr.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created, the level does
/// not parse, or a global subscriber is already installed.
pub fn init_production(logs_dir: &Path, config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (ops_writer, ops_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));
    let mut guards = vec![ops_guard];

    let audit_layer = if config.audit_file {
        let (audit_writer, audit_guard) = tracing_appender::non_blocking(
            tracing_appender::rolling::daily(logs_dir, AUDIT_FILE_PREFIX),
        );
        guards.push(audit_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(audit_writer)
                .with_filter(filter_fn(is_audit)),
        )
    } else {
        None
    };
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(ops_writer)
        .with_filter(filter_fn(is_operational));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(is_operational));

    tracing_subscriber::registry()
        .with(build_filter(&config.level, config.audit_file)?)
        .with(json_layer)
        .with(console_layer)
        .with(audit_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;

    Ok(LoggingGuard { _guards: guards })
}

/// Initialise console-only logging for CLI subcommands.
///
/// A subscriber installed earlier is left in place.
///
/// # Errors
///
/// Returns an error if `level` does not parse.
pub fn init_cli(level: &str) -> anyhow::Result<()> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(is_operational));
    let _ = tracing_subscriber::registry()
        .with(build_filter(level, false)?)
        .with(console)
        .try_init();
    Ok(())
}
