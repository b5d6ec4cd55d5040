//! Loading the sync configuration from disk.

use std::io::Write;
use std::time::Duration;

use mvirt_sync::{ConfigError, KeyStrategy, SyncConfig};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"{
            "lock_timeout_secs": 5,
            "key_strategy": "signature",
            "max_name_attempts": 10
        }"#,
    );

    let config = SyncConfig::from_file(file.path()).unwrap();
    assert_eq!(config.lock_timeout(), Duration::from_secs(5));
    assert_eq!(config.key_strategy, KeyStrategy::Signature);
    assert_eq!(config.max_name_attempts, 10);
    // Unset fields keep their defaults
    assert_eq!(config.name_separator, "-");
}

#[test]
fn test_empty_object_is_default() {
    let file = write_config("{}");
    assert_eq!(
        SyncConfig::from_file(file.path()).unwrap(),
        SyncConfig::default()
    );
}

#[test]
fn test_invalid_files() {
    let file = write_config(r#"{"lock_timeout_secs": 0}"#);
    assert!(matches!(
        SyncConfig::from_file(file.path()),
        Err(ConfigError::Invalid(_))
    ));

    let file = write_config("lock_timeout_secs = 5");
    assert!(matches!(
        SyncConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SyncConfig::from_file(dir.path().join("missing.json")),
        Err(ConfigError::Io(_))
    ));
}
