use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use openneuro_audit::config::{ConfigLoader, workers_for_cpus};
use openneuro_audit::error::AuditError;

#[test]
fn resolves_file_with_partial_overrides() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("on-audit.json");
    fs::write(
        &path,
        r#"{
            "clone_base_url": "https://example.org/mirror/",
            "batch_size": 10,
            "task_timeout_secs": 60,
            "private_sibling": "s3-PRIVATE"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.clone_base_url, "https://example.org/mirror");
    assert_eq!(resolved.batch_size, 10);
    assert_eq!(resolved.task_timeout, Duration::from_secs(60));
    assert_eq!(resolved.batch_timeout, Duration::from_secs(3600));
    assert_eq!(resolved.endpoint, "https://openneuro.org/crn/graphql");
    assert_eq!(resolved.private_sibling.as_deref(), Some("s3-PRIVATE"));
}

#[test]
fn explicit_missing_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(AuditError::MissingConfig(_))
    );
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, "{ batch_size: ").unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(AuditError::ConfigParse(_))
    );
}

#[test]
fn worker_count_leaves_one_cpu_free() {
    assert_eq!(workers_for_cpus(8), 7);
    assert_eq!(workers_for_cpus(1), 1);
    assert_eq!(workers_for_cpus(0), 1);
}
