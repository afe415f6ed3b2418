//! # Configuration Management
//!
//! Centralized configuration for the CoT client engine.
//!
//! This module provides structured configuration for the coordinator, the
//! reconnect supervisor, the framer guardrails, health scoring, metrics
//! sampling, certificate enrollment and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`TAKSTREAM_*`)
//!
//! Durations are written as integer milliseconds.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Soft limit for unconsumed framer input before a warning is logged.
pub const FRAMER_WARN_THRESHOLD: usize = 100 * 1024;

/// Hard limit for unconsumed framer input; the buffer is cleared above it.
pub const FRAMER_MAX_BUFFER: usize = 1024 * 1024;

/// Default per-server outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default number of drain retries before a queued message is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default TAK streaming port for TLS connections.
pub const DEFAULT_STREAMING_PORT: u16 = 8089;

/// Default TAK enrollment port.
pub const DEFAULT_ENROLLMENT_PORT: u16 = 8446;

/// Main engine configuration containing all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub framer: FramerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub enrollment: EnrollmentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("TAKSTREAM_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.coordinator.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(capacity) = std::env::var("TAKSTREAM_QUEUE_CAPACITY") {
            if let Ok(val) = capacity.parse::<usize>() {
                config.coordinator.queue_capacity = val;
            }
        }

        if let Ok(retries) = std::env::var("TAKSTREAM_MAX_RETRIES") {
            if let Ok(val) = retries.parse::<u32>() {
                config.coordinator.max_retries = val;
            }
        }

        if let Ok(flag) = std::env::var("TAKSTREAM_AUTO_RECONNECT") {
            if let Ok(val) = flag.parse::<bool>() {
                config.reconnect.enabled = val;
            }
        }

        if let Ok(uid) = std::env::var("TAKSTREAM_CLIENT_UID") {
            config.enrollment.client_uid = uid;
        }

        if let Ok(level) = std::env::var("TAKSTREAM_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid log level: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.coordinator.validate());
        errors.extend(self.reconnect.validate());
        errors.extend(self.framer.validate());
        errors.extend(self.health.validate());
        errors.extend(self.metrics.validate());
        errors.extend(self.enrollment.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Multi-server coordinator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound for `add_connection`
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Period of the background queue drain
    #[serde(with = "duration_serde")]
    pub drain_interval: Duration,

    /// Maximum queued messages per server
    pub queue_capacity: usize,

    /// Failed drain attempts tolerated before a message is dropped
    pub max_retries: u32,

    /// Depth of each channel's outbound writer queue
    pub writer_queue_depth: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            drain_interval: timeout::DRAIN_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_retries: DEFAULT_MAX_RETRIES,
            writer_queue_depth: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.drain_interval.as_millis() < 10 {
            errors.push("Drain interval too short (minimum: 10ms)".to_string());
        } else if self.drain_interval.as_secs() > 60 {
            errors.push("Drain interval too long (maximum: 60s)".to_string());
        }

        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 1_000_000 {
            errors.push(format!(
                "Queue capacity too large: {} (max recommended: 1,000,000)",
                self.queue_capacity
            ));
        }

        if self.writer_queue_depth == 0 {
            errors.push("Writer queue depth must be greater than 0".to_string());
        }

        errors
    }
}

/// Automatic reconnection after an unexpected disconnect
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on connection loss
    pub enabled: bool,

    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,

    /// Delay before the first attempt; doubled on each further attempt
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    /// Ceiling for the backoff delay
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.enabled && self.max_attempts == 0 {
            errors.push(
                "Max reconnect attempts must be greater than 0 when reconnect is enabled"
                    .to_string(),
            );
        }

        if self.initial_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        }

        if self.max_delay < self.initial_delay {
            errors.push("Reconnect max delay cannot be shorter than the initial delay".to_string());
        }

        errors
    }

    /// Backoff before attempt `attempt` (zero-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Framer guardrails
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FramerConfig {
    /// Unconsumed bytes above which a warning is logged
    pub warn_threshold: usize,

    /// Unconsumed bytes above which the buffer is discarded
    pub max_buffer: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            warn_threshold: FRAMER_WARN_THRESHOLD,
            max_buffer: FRAMER_MAX_BUFFER,
        }
    }
}

impl FramerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_buffer < 1024 {
            errors.push("Framer max buffer too small (minimum: 1 KB)".to_string());
        }

        if self.warn_threshold > self.max_buffer {
            errors.push("Framer warn threshold cannot exceed max buffer".to_string());
        }

        errors
    }
}

/// Connection health scoring
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_serde")]
    pub score_interval: Duration,

    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Number of snapshots retained per server
    pub history_len: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            score_interval: timeout::HEALTH_INTERVAL,
            ping_interval: timeout::PING_INTERVAL,
            history_len: 720,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.score_interval.as_millis() < 100 {
            errors.push("Health score interval too short (minimum: 100ms)".to_string());
        }

        if self.ping_interval.as_millis() < 100 {
            errors.push("Ping interval too short (minimum: 100ms)".to_string());
        } else if self.ping_interval.as_secs() > 3600 {
            errors.push("Ping interval too long (maximum: 1 hour)".to_string());
        }

        if self.history_len == 0 {
            errors.push("Health history length must be greater than 0".to_string());
        }

        errors
    }
}

/// Traffic sampling
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(with = "duration_serde")]
    pub sample_interval: Duration,

    /// Trailing window of retained samples
    #[serde(with = "duration_serde")]
    pub window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: timeout::SAMPLE_INTERVAL,
            window: Duration::from_secs(3600),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sample_interval.as_millis() < 100 {
            errors.push("Sample interval too short (minimum: 100ms)".to_string());
        }

        if self.window < self.sample_interval {
            errors.push("Metrics window cannot be shorter than the sample interval".to_string());
        } else if self.window.as_secs() > 24 * 3600 {
            errors.push("Metrics window too long (maximum: 24 hours)".to_string());
        }

        errors
    }
}

/// URL scheme used for enrollment requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentScheme {
    Https,
    Http,
}

impl EnrollmentScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentScheme::Https => "https",
            EnrollmentScheme::Http => "http",
        }
    }
}

/// Certificate enrollment settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub scheme: EnrollmentScheme,

    /// Path of the CA/name configuration endpoint
    pub config_path: String,

    /// Path of the CSR signing endpoint
    pub sign_path: String,

    /// Client UID reported to the signing endpoint
    pub client_uid: String,

    /// Port of the TLS streaming endpoint written into enrolled descriptors
    pub streaming_port: u16,

    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            scheme: EnrollmentScheme::Https,
            config_path: String::from("/Marti/api/tls/config"),
            sign_path: String::from("/Marti/api/tls/signClient/v2"),
            client_uid: String::from("takstream-client"),
            streaming_port: DEFAULT_STREAMING_PORT,
            request_timeout: timeout::ENROLLMENT_TIMEOUT,
        }
    }
}

impl EnrollmentConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, path) in [("config_path", &self.config_path), ("sign_path", &self.sign_path)] {
            if !path.starts_with('/') {
                errors.push(format!("Enrollment {name} must start with '/': '{path}'"));
            }
        }

        if self.client_uid.is_empty() {
            errors.push("Enrollment client UID cannot be empty".to_string());
        }

        if self.streaming_port == 0 {
            errors.push("Streaming port cannot be 0".to_string());
        }

        if self.request_timeout.as_millis() < 100 {
            errors.push("Enrollment request timeout too short (minimum: 100ms)".to_string());
        }

        if self.scheme == EnrollmentScheme::Http {
            errors.push(
                "WARNING: Enrollment over plain HTTP sends credentials in the clear".to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("takstream"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ReconnectConfig {
            enabled: true,
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_millis(1000));
        assert_eq!(config.backoff(40), Duration::from_millis(1000));
    }
}
