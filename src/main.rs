//! Bastion command-line tool.
//!
//! Validates configuration, exercises a framework instance end to end, and
//! filters persisted audit logs.

use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use bastion::audit::AuditRecord;
use bastion::config::BastionConfig;
use bastion::crypto::{Algorithm, SYSTEM_SIGNING_KEY};
use bastion::netfilter::{Direction, PacketHeader, TcpFlags, Verdict};
use bastion::types::{
    protocol, AccessMask, Capabilities, EventKind, ProcessCredentials, SecurityContext,
    SecurityEvent, Severity, SystemClock,
};
use bastion::{SecurityError, SecurityFramework};

#[derive(Parser, Debug)]
#[command(name = "bastion", version, about = "Kernel security framework tooling")]
struct Cli {
    /// Config file; defaults to `$BASTION_CONFIG_PATH` or `./bastion.toml`.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Build a framework and run one pass through every component.
    Selftest,
    /// Inspect persisted audit logs.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Print matching records from a JSON-lines audit log.
    Show {
        /// Audit log file.
        #[arg(long, value_name = "FILE")]
        path: PathBuf,
        /// Only this event kind, e.g. `suspicious`.
        #[arg(long, value_name = "KIND")]
        kind: Option<String>,
        /// Only records at or above this severity.
        #[arg(long, value_name = "N", default_value_t = 0)]
        min_severity: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig => check_config(cli.config),
        Command::Selftest => selftest(cli.config),
        Command::Audit {
            command:
                AuditCommand::Show {
                    path,
                    kind,
                    min_severity,
                },
        } => {
            bastion::logging::init_cli(bastion::logging::DEFAULT_LEVEL)?;
            audit_show(&path, kind.as_deref(), min_severity)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BastionConfig> {
    match path {
        Some(path) => {
            let mut config = BastionConfig::load_from(&path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => BastionConfig::load().context("failed to load configuration"),
    }
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    config.validate().context("configuration is invalid")?;
    bastion::logging::init_cli(&config.logging.level)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!("{rendered}");
    println!("configuration ok");
    Ok(())
}

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    passed: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct SelftestReport {
    checks: Vec<Check>,
    stats: bastion::framework::FrameworkStatistics,
}

fn selftest(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    config.validate().context("configuration is invalid")?;
    let _logging = bastion::logging::init(&config.logging).context("failed to set up logging")?;
    let framework = SecurityFramework::new(&config, config.hardware.resolve(), Arc::new(SystemClock))
        .context("failed to build framework")?;
    info!("running selftest");

    let checks = vec![
        run_check("crypto_roundtrip", || crypto_roundtrip(&framework)),
        run_check("signature", || signature(&framework)),
        run_check("mac_policy", || mac_policy(&framework)),
        run_check("packet_filter", || packet_filter(&framework)),
        run_check("heap_guard", || heap_guard(&framework)),
        run_check("intrusion_detection", || intrusion_detection(&framework)),
    ];
    let failed = checks.iter().filter(|c| !c.passed).count();
    let report = SelftestReport {
        checks,
        stats: framework.stats()?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if failed > 0 {
        bail!("{failed} selftest check(s) failed");
    }
    Ok(())
}

fn run_check(name: &'static str, check: impl FnOnce() -> Result<String>) -> Check {
    match check() {
        Ok(detail) => Check {
            name,
            passed: true,
            detail,
        },
        Err(e) => {
            warn!(check = name, error = %e, "selftest check failed");
            Check {
                name,
                passed: false,
                detail: format!("{e:#}"),
            }
        }
    }
}

fn crypto_roundtrip(fw: &SecurityFramework) -> Result<String> {
    let keys = fw.keys();
    let key = keys.generate_key(Algorithm::Aes, 256)?;
    let plaintext = b"bastion selftest";
    let ciphertext = keys.encrypt(&key, plaintext)?;
    if keys.decrypt(&key, &ciphertext)? != plaintext {
        bail!("decrypted text differs");
    }
    Ok(STANDARD.encode(&ciphertext))
}

fn signature(fw: &SecurityFramework) -> Result<String> {
    let keys = fw.keys();
    let signing = match keys.retrieve(SYSTEM_SIGNING_KEY) {
        Ok(key) => key,
        Err(SecurityError::NotFound(_)) => keys.generate_key(Algorithm::Ed25519, 256)?,
        Err(e) => return Err(e.into()),
    };
    let public = keys.public_key(&signing)?;
    let signature = keys.sign(&signing, b"bastion")?;
    if !keys.verify(&public, b"bastion", &signature)? {
        bail!("signature did not verify");
    }
    if keys.verify(&public, b"bastian", &signature)? {
        bail!("signature verified for altered data");
    }
    Ok(STANDARD.encode(&signature))
}

fn mac_policy(fw: &SecurityFramework) -> Result<String> {
    let user = SecurityContext::new(1000, "user_u:user_r:user_t:s0")?;
    let etc = SecurityContext::new(0, "system_u:object_r:etc_t:s0")?.with_path("/etc/hosts");
    let home = SecurityContext::new(1000, "user_u:object_r:home_t:s0")?;
    let mac = fw.mac();
    if mac.check_permission(&user, &etc, "write", AccessMask::WRITE)?.is_allowed() {
        bail!("user_t was allowed to write etc_t");
    }
    if !mac.check_permission(&user, &home, "read", AccessMask::READ)?.is_allowed() {
        bail!("user_t was denied reading home_t");
    }
    let creds = ProcessCredentials {
        pid: 1000,
        uid: 1000,
        capabilities: Capabilities::empty(),
        context: user,
    };
    if fw.check_access(&creds, &home, "read", AccessMask::READ)?.is_allowed() {
        bail!("read allowed without DAC_READ_SEARCH");
    }
    Ok("user_t policy enforced".to_owned())
}

fn packet_filter(fw: &SecurityFramework) -> Result<String> {
    let nf = fw.netfilter();
    let header = |dst_port| PacketHeader {
        src: Ipv4Addr::new(203, 0, 113, 7),
        dst: Ipv4Addr::new(10, 0, 0, 1),
        src_port: 40_000,
        dst_port,
        protocol: protocol::TCP,
        tcp_flags: TcpFlags::SYN,
        owner_pid: 0,
    };
    if nf.process_packet(&header(9999), &[], Direction::Inbound) != Verdict::Block {
        bail!("unsolicited inbound packet was allowed");
    }
    if nf.process_packet(&header(443), &[], Direction::Inbound) != Verdict::Allow {
        bail!("https was blocked");
    }
    let mut shellcode = vec![0x90u8; 32];
    shellcode.extend_from_slice(b"/bin/sh");
    if nf.process_packet(&header(443), &shellcode, Direction::Inbound) != Verdict::Block {
        bail!("shellcode payload was allowed");
    }
    Ok("default chains and ips active".to_owned())
}

fn heap_guard(fw: &SecurityFramework) -> Result<String> {
    let memory = fw.memory();
    let ptr = memory.alloc_guarded(64)?;
    memory.write(ptr, 0, &[0x41; 64])?;
    memory.free_guarded(ptr)?;
    let ptr = memory.alloc_guarded(64)?;
    memory.write_unchecked(ptr, 64, &[0x42; 8])?;
    match memory.free_guarded(ptr) {
        Err(SecurityError::IntegrityFailure(_)) => Ok("overflow into rear guard caught".to_owned()),
        Ok(()) => bail!("overflow was not detected"),
        Err(e) => Err(e.into()),
    }
}

fn intrusion_detection(fw: &SecurityFramework) -> Result<String> {
    let pid = 31_337;
    let before = fw.ids().stats()?.rules_triggered;
    for _ in 0..10 {
        fw.audit().emit(
            SecurityEvent::new(EventKind::LoginAttempt, Severity::WARNING, "selftest login failure")
                .process(pid, 1000)
                .target("sshd", "selftest", "login")
                .blocked(true),
        );
    }
    let triggered = fw.ids().stats()?.rules_triggered.saturating_sub(before);
    if triggered == 0 {
        bail!("brute force rule did not trigger");
    }
    Ok(format!("{triggered} rule trigger(s)"))
}

fn audit_show(path: &Path, kind: Option<&str>, min_severity: u8) -> Result<()> {
    let kind = kind.map(str::parse::<EventKind>).transpose()?;
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    let mut shown = 0usize;
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index.saturating_add(1), error = %e, "skipping malformed record");
                continue;
            }
        };
        if kind.is_some_and(|k| k != record.kind) || record.severity < min_severity {
            continue;
        }
        println!("{}", serde_json::to_string(&record)?);
        shown = shown.saturating_add(1);
    }
    info!(shown, "audit records listed");
    Ok(())
}
