use runbridge::config::{load_settings, ConfigError, QueueBackend, Settings};
use runbridge::queue::open_queue;
use std::fs;
use tempfile::tempdir;

#[test]
fn config_module_loads_a_full_settings_file() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("queue.db");
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        format!(
            r#"
queue:
  backend: sqlite
  capacity: 16
  sqlite_path: {}
  lock_timeout_seconds: 120
workers:
  count: 2
approval:
  allow_requester: false
  approvers: [ops-lead]
runs:
  timeout_seconds: 3600
jobs:
  nightly-backup:
    command: [/usr/local/bin/backup, --nightly]
"#,
            db_path.display()
        ),
    )
    .expect("write config");

    let settings = load_settings(&path).expect("load settings");
    assert_eq!(settings.queue.backend, QueueBackend::Sqlite);
    assert_eq!(settings.queue.capacity, 16);
    assert_eq!(settings.queue.lock_timeout().as_secs(), 120);
    assert_eq!(settings.queue.reclaim_interval().as_secs(), 30);
    assert_eq!(settings.workers.count, 2);
    assert_eq!(settings.workers.max_poll_ms, 1000);
    assert!(settings.approval.approvers.contains("ops-lead"));
    assert_eq!(settings.runs.timeout().map(|t| t.as_secs()), Some(3600));
    assert_eq!(
        settings.jobs["nightly-backup"].command,
        vec!["/usr/local/bin/backup", "--nightly"]
    );

    let queue = open_queue(&settings.queue).expect("open configured queue");
    assert_eq!(queue.depth().expect("depth").live(), 0);
    assert!(db_path.exists());
}

#[test]
fn config_module_rejects_inconsistent_settings() {
    let dir = tempdir().expect("tempdir");
    let cases = [
        ("queue:\n  capacity: 0\n", "queue.capacity"),
        ("queue:\n  backend: sqlite\n", "queue.sqlite_path"),
        ("workers:\n  min_poll_ms: 500\n  max_poll_ms: 100\n", "workers.min_poll_ms"),
        ("approval:\n  allow_requester: false\n", "approval"),
        ("jobs:\n  backup:\n    command: []\n", "job `backup`"),
    ];
    for (index, (yaml, needle)) in cases.iter().enumerate() {
        let path = dir.path().join(format!("case-{index}.yaml"));
        fs::write(&path, yaml).expect("write case");
        let err = load_settings(&path).expect_err("invalid settings");
        assert!(matches!(err, ConfigError::Settings(_)), "{err}");
        assert!(err.to_string().contains(needle), "{err} should mention {needle}");
    }
}

#[test]
fn config_module_reports_parse_and_read_failures_with_paths() {
    let dir = tempdir().expect("tempdir");
    let bad = dir.path().join("bad.yaml");
    fs::write(&bad, "queue: [not, a, map]\n").expect("write bad yaml");
    let err = Settings::from_path(&bad).expect_err("parse error");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("bad.yaml"));

    let missing = Settings::from_path(&dir.path().join("missing.yaml")).expect_err("read error");
    assert!(matches!(missing, ConfigError::Read { .. }));
}

#[test]
fn config_module_defaults_are_valid() {
    let settings: Settings = serde_yaml::from_str("{}").expect("empty settings");
    settings.validate().expect("defaults validate");
    assert_eq!(settings.queue.backend, QueueBackend::Memory);
    assert_eq!(settings.queue.capacity, 64);
    assert_eq!(settings.workers.count, 4);
}
