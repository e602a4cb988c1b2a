//! Integration tests for configuration files
//!
//! Tests loading, saving and validating configuration on disk, including:
//! - Full and minimal documents
//! - Save / load round trip
//! - Missing and malformed files

use common::{Config, load_config};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[logging]
level = "debug"

[device]
report_buffer_size = 16
blocking = false
read_transfer_timeout_ms = 5000
control_timeout_ms = 250
write_timeout_ms = 500
event_poll_timeout_ms = 2
detach_kernel_driver = false
"#;

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = Config::load(Some(path)).unwrap();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.device.report_buffer_size, 16);
    assert!(!config.device.blocking);
    assert_eq!(config.device.read_transfer_timeout(), Duration::from_secs(5));
    assert_eq!(config.device.control_timeout(), Duration::from_millis(250));
    assert_eq!(config.device.write_timeout(), Duration::from_millis(500));
    assert_eq!(config.device.event_poll_timeout(), Duration::from_millis(2));
    assert!(!config.device.detach_kernel_driver);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("dir").join("config.toml");

    let mut config = Config::default();
    config.device.report_buffer_size = 7;
    config.save(&path).unwrap();

    assert!(path.exists());
    let loaded = Config::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = Config::load(Some(dir.path().join("absent.toml"))).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_load_malformed_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[device\nreport_buffer_size = ").unwrap();

    let err = Config::load(Some(path.clone())).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Failed to parse config"));
    assert!(msg.contains(&path.display().to_string()));
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[device]\nreport_buffer_size = 0\n").unwrap();

    assert!(Config::load(Some(path)).is_err());
}

#[test]
fn test_load_config_with_plain_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[logging]\nlevel = \"info\"\n").unwrap();

    let config = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.device.report_buffer_size, 32);
}
