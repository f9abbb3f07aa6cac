//! Persistent JSON-lines sink and seal chain verification.

use std::io::{BufReader, Cursor};
use std::sync::Arc;

use bastion::audit::{verify_sealed_log, AuditLog, AuditRecord, AuditSettings, JsonLineSink};
use bastion::crypto::{Algorithm, KeyService, SecureRandom};
use bastion::types::{Clock, EventKind, ManualClock, SecurityEvent, Severity};
use bastion::SecurityError;

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::at_secs(1_700_000_000))
}

fn keys() -> KeyService {
    let clock = clock();
    let random = Arc::new(SecureRandom::new(clock.clone(), None).expect("should seed"));
    KeyService::new(random, 8, clock)
}

fn write_sealed_log(path: &std::path::Path, key: bastion::crypto::Key) {
    let sink = JsonLineSink::open(path, false)
        .expect("should open")
        .with_seal(key)
        .expect("should seal");
    let log = AuditLog::new(AuditSettings::default(), clock()).with_sink(sink);
    for (kind, desc) in [
        (EventKind::LoginAttempt, "login ok"),
        (EventKind::AccessDenied, "write /etc/passwd"),
        (EventKind::Suspicious, "rop gadgets"),
    ] {
        log.emit(SecurityEvent::new(kind, Severity::WARNING, desc).process(7, 1000));
    }
}

#[test]
fn records_are_one_json_object_per_line() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("nested/audit.jsonl");
    let log = AuditLog::new(AuditSettings::default(), clock())
        .with_sink(JsonLineSink::open(&path, true).expect("should open"));
    log.emit(
        SecurityEvent::new(EventKind::FileAccess, Severity::INFO, "read /etc/hosts")
            .target("user_t", "/etc/hosts", "read"),
    );

    let contents = std::fs::read_to_string(&path).expect("read");
    let record: AuditRecord = serde_json::from_str(contents.trim()).expect("json");
    assert_eq!(record.kind, EventKind::FileAccess);
    assert_eq!(record.object, "/etc/hosts");
    assert!(record.timestamp.starts_with("2023-11-14T"));
    assert!(record.seal.is_none());
}

#[test]
fn sealed_log_verifies_and_detects_edits() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.jsonl");
    let keys = keys();
    let key = keys.generate_key(Algorithm::Hmac, 256).expect("generate");
    write_sealed_log(&path, Arc::clone(&key));

    let file = std::fs::File::open(&path).expect("open");
    assert_eq!(verify_sealed_log(BufReader::new(file), &key).expect("verify"), 3);

    let tampered = std::fs::read_to_string(&path)
        .expect("read")
        .replace("write /etc/passwd", "write /etc/motd");
    let result = verify_sealed_log(Cursor::new(tampered), &key);
    assert!(matches!(result, Err(SecurityError::IntegrityFailure(_))));
}

#[test]
fn dropped_line_breaks_chain() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.jsonl");
    let keys = keys();
    let key = keys.generate_key(Algorithm::Hmac, 256).expect("generate");
    write_sealed_log(&path, Arc::clone(&key));

    let contents = std::fs::read_to_string(&path).expect("read");
    let without_first: String = contents.lines().skip(1).map(|l| format!("{l}\n")).collect();
    assert!(verify_sealed_log(Cursor::new(without_first), &key).is_err());
}

#[test]
fn sealing_requires_hmac_key() {
    let keys = keys();
    let aes = keys.generate_key(Algorithm::Aes, 256).expect("generate");
    let sink = JsonLineSink::from_writer(Box::new(std::io::sink()));
    assert!(matches!(
        sink.with_seal(aes),
        Err(SecurityError::InvalidParameter(_))
    ));
}
