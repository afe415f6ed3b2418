//! Integration test for logging initialisation
//!
//! Lives in its own test binary because the subscriber is process-global.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use takstream::config::LoggingConfig;
use takstream::utils::logging::init_logging;
use takstream::ProtocolError;

#[test]
fn test_file_logging_installs_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("takstream.log");
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: Some(path.to_string_lossy().into_owned()),
        json_format: true,
        ..LoggingConfig::default()
    };
    assert!(config.validate().is_empty());
    std::env::remove_var("RUST_LOG");

    init_logging(&config).expect("first initialisation succeeds");
    tracing::info!(marker = "file-logging", "File logging check");

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("file-logging"), "log file missing marker: {contents}");

    let err = init_logging(&config).unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError(_)));
}
