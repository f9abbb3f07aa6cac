//! Coverage for config parsing, overrides and validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bastion::config::{config_dir, BastionConfig};
use bastion::memory::CanaryDerivation;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config =
        BastionConfig::load_from(&tmp.path().join("absent.toml")).expect("should fall back");
    assert_eq!(config, BastionConfig::default());
    config.validate().expect("defaults should validate");
}

#[test]
fn sections_parse_from_toml() {
    let config = BastionConfig::from_toml(
        r#"
[audit]
capacity = 128
policy = ["access_denied", "suspicious"]

[mac]
enforcing = false
max_rules = 64

[memory]
canary_derivation = "xor_pid"
max_allocation = 4096

[netfilter]
ips_enabled = false
max_connections = 16

[ids]
threshold = 70
learning_mode = true
rules = ["scan_burst:network_access:threshold=20:window=10"]

[hardware]
detect = false

[hardware.features]
rng = true
"#,
    )
    .expect("should parse");

    assert_eq!(config.audit.capacity, 128);
    assert_eq!(config.audit.policy.len(), 2);
    assert!(!config.mac.enforcing);
    assert_eq!(config.mac.max_rules, 64);
    assert_eq!(config.memory.canary_derivation, CanaryDerivation::XorPid);
    assert_eq!(config.memory.max_allocation, 4096);
    assert!(config.memory.heap_protection);
    assert!(!config.netfilter.ips_enabled);
    assert_eq!(config.netfilter.max_connections, 16);
    assert_eq!(config.ids.threshold, 70);
    assert!(config.ids.learning_mode);
    assert!(config.ids.default_rules);
    assert!(!config.hardware.detect);
    let features = config.hardware.resolve();
    assert!(features.rng);
    assert!(!features.tpm);
    config.validate().expect("should validate");
}

#[test]
fn malformed_toml_is_an_error() {
    assert!(BastionConfig::from_toml("[audit\ncapacity = 1").is_err());
    assert!(BastionConfig::from_toml("[audit]\ncapacity = \"many\"").is_err());
}

#[test]
fn load_from_reads_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("bastion.toml");
    std::fs::write(&path, "[ids]\nthreshold = 40\n").expect("should write config");
    let config = BastionConfig::load_from(&path).expect("should load");
    assert_eq!(config.ids.threshold, 40);
}

#[test]
fn env_overrides_take_precedence() {
    let mut config = BastionConfig::default();
    config.apply_overrides(env_of(&[
        ("BASTION_AUDIT_LOG", "/var/log/bastion/audit.jsonl"),
        ("BASTION_AUDIT_CAPACITY", "2048"),
        ("BASTION_MAC_ENFORCING", "off"),
        ("BASTION_IDS_THRESHOLD", "65"),
        ("BASTION_IDS_LEARNING", "YES"),
    ]));
    assert_eq!(
        config.audit.log_path,
        Some(PathBuf::from("/var/log/bastion/audit.jsonl"))
    );
    assert_eq!(config.audit.capacity, 2048);
    assert!(!config.mac.enforcing);
    assert_eq!(config.ids.threshold, 65);
    assert!(config.ids.learning_mode);

    config.apply_overrides(env_of(&[("BASTION_AUDIT_LOG", "")]));
    assert!(config.audit.log_path.is_none());
}

#[test]
fn invalid_overrides_are_ignored() {
    let mut config = BastionConfig::default();
    config.apply_overrides(env_of(&[
        ("BASTION_AUDIT_CAPACITY", "0"),
        ("BASTION_MAC_ENFORCING", "maybe"),
        ("BASTION_IDS_THRESHOLD", "101"),
        ("BASTION_IDS_LEARNING", ""),
    ]));
    assert_eq!(config, BastionConfig::default());
}

#[test]
fn validate_rejects_bad_values() {
    let mut config = BastionConfig::default();
    config.audit.capacity = 0;
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.audit.policy = vec!["not_a_kind".to_owned()];
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.audit.seal = true;
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.ids.threshold = 101;
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.ids.rules = vec!["bad name:login".to_owned()];
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.crypto.arena_slots = 0;
    assert!(config.validate().is_err());

    let mut config = BastionConfig::default();
    config.memory.max_allocation = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_checks_policy_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let mut config = BastionConfig::default();
    config.mac.policy_file = Some(tmp.path().join("missing.toml"));
    let err = config.validate().expect_err("missing policy should fail");
    assert!(format!("{err:#}").contains("mac.policy_file"));

    let broken = tmp.path().join("broken.toml");
    std::fs::write(&broken, "[[rules]]\nsubject = 1\n").expect("should write policy");
    config.mac.policy_file = Some(broken);
    assert!(config.validate().is_err());

    let good = tmp.path().join("policy.toml");
    std::fs::write(
        &good,
        "name = \"site\"\n[[rules]]\nsubject = \"web_t\"\nobject = \"home_t\"\naction = \"read\"\nallow = true\n",
    )
    .expect("should write policy");
    config.mac.policy_file = Some(good);
    config.validate().expect("readable policy should validate");
}

#[test]
fn config_path_follows_env() {
    assert_eq!(
        BastionConfig::config_path_with(env_of(&[])),
        Path::new("bastion.toml")
    );
    assert_eq!(
        BastionConfig::config_path_with(env_of(&[("BASTION_CONFIG_PATH", "/etc/bastion.toml")])),
        Path::new("/etc/bastion.toml")
    );
}

#[test]
fn config_dir_resolves() {
    let dir = config_dir().expect("should resolve home");
    assert!(dir.ends_with(".bastion"));
}

#[test]
fn rendered_config_parses_back() {
    let config = BastionConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("should render");
    let parsed = BastionConfig::from_toml(&rendered).expect("should parse rendered config");
    assert_eq!(parsed, config);
}

#[test]
fn logging_section_parses_and_validates() {
    let config = BastionConfig::from_toml(
        "[logging]\nlevel = \"warn,bastion::ids=debug\"\ndir = \"/var/log/bastion\"\naudit_file = true\n",
    )
    .expect("should parse");
    assert_eq!(config.logging.level, "warn,bastion::ids=debug");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/bastion")));
    assert!(config.logging.audit_file);
    config.validate().expect("should validate");

    let bad_level = BastionConfig::from_toml("[logging]\nlevel = \"bastion=verbose\"\n")
        .expect("should parse");
    assert!(bad_level.validate().is_err());

    let orphan_audit_file =
        BastionConfig::from_toml("[logging]\naudit_file = true\n").expect("should parse");
    assert!(orphan_audit_file.validate().is_err());
}

#[test]
fn logging_overrides_apply() {
    let mut config = BastionConfig::default();
    config.apply_overrides(env_of(&[
        ("BASTION_LOG_LEVEL", "debug"),
        ("BASTION_LOG_DIR", "/tmp/bastion-logs"),
    ]));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/bastion-logs")));

    config.apply_overrides(env_of(&[
        ("BASTION_LOG_LEVEL", "bastion=verbose"),
        ("BASTION_LOG_DIR", ""),
    ]));
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.dir.is_none());
}
