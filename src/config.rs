//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration apart from the server URL.

use rand::Rng;
use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, UplinkError};
use crate::position::{Accuracy, SourceConfig};
use crate::protocol::formatter::parse_base_url;
use crate::queue::SqliteQueue;
use crate::transport::HttpMethod;
use crate::uplink::BackoffPolicy;

/// Port used when legacy server settings omit one
pub const DEFAULT_SERVER_PORT: u16 = 5055;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub uplink: UplinkConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceConfig {
    /// Device identifier sent with every report; empty means generate one
    #[serde(default)]
    pub id: String,
}

/// Tracking server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Base URL reports are sent to
    #[serde(default)]
    pub url: String,

    /// Legacy host name, folded into `url` when `url` is empty
    #[serde(default)]
    pub address: Option<String>,

    /// Legacy port
    #[serde(default)]
    pub port: Option<u16>,

    /// Legacy TLS switch
    #[serde(default)]
    pub secure: bool,
}

/// Sampling settings
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_tracking_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_s")]
    pub interval_s: u64,

    #[serde(default)]
    pub distance_m: f64,

    #[serde(default)]
    pub accuracy: Accuracy,

    /// Accept remote commands (position requests, interval changes)
    #[serde(default)]
    pub remote_control: bool,
}

/// Delivery settings
#[derive(Debug, Deserialize, Clone)]
pub struct UplinkConfig {
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub method: HttpMethod,
}

/// Durable queue storage
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

/// Logging settings
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_tracking_enabled() -> bool { true }
fn default_interval_s() -> u64 { 300 }

fn default_retry_base_ms() -> u64 { 5_000 }
fn default_retry_max_ms() -> u64 { 300_000 }
fn default_request_timeout_ms() -> u64 { 15_000 }

fn default_storage_path() -> String { "./data/geo-uplink.db".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: default_tracking_enabled(),
            interval_s: default_interval_s(),
            distance_m: 0.0,
            accuracy: Accuracy::default(),
            remote_control: false,
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            method: HttpMethod::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded, migrated and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use geo_uplink::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.server.migrate_legacy();
        config.validate()?;
        Ok(config)
    }

    /// Sampling configuration for the periodic position source
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            interval: Duration::from_secs(self.tracking.interval_s),
            distance_m: self.tracking.distance_m,
            accuracy: self.tracking.accuracy,
        }
    }

    /// Retry policy for the uplink controller
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.uplink.retry_base_ms),
            Duration::from_millis(self.uplink.retry_max_ms),
        )
    }

    /// Per-attempt HTTP timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink.request_timeout_ms)
    }

    /// Configured device id, or the one persisted in `queue`'s database
    ///
    /// A random six-digit id is generated and stored on first use, so the
    /// id stays stable across restarts.
    ///
    /// # Errors
    ///
    /// Returns error if the settings table cannot be read or written.
    pub fn resolve_device_id(&self, queue: &SqliteQueue) -> Result<String> {
        if !self.device.id.is_empty() {
            return Ok(self.device.id.clone());
        }
        Ok(queue.device_id_or_insert_with(generate_device_id)?)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Validate server URL
        if self.server.url.is_empty() {
            return Err(invalid("server url cannot be empty"));
        }

        if let Err(e) = parse_base_url(&self.server.url) {
            return Err(invalid(e.to_string()));
        }

        // Validate device id
        if self.device.id.chars().any(char::is_whitespace) {
            return Err(invalid("device id cannot contain whitespace"));
        }

        // Validate tracking
        if self.tracking.interval_s == 0 || self.tracking.interval_s > 86_400 {
            return Err(invalid("interval_s must be between 1 and 86400"));
        }

        if !self.tracking.distance_m.is_finite() || self.tracking.distance_m < 0.0 {
            return Err(invalid("distance_m must be a non-negative number"));
        }

        // Validate uplink timing
        if self.uplink.retry_base_ms == 0 || self.uplink.retry_base_ms > 3_600_000 {
            return Err(invalid("retry_base_ms must be between 1 and 3600000"));
        }

        if self.uplink.retry_max_ms < self.uplink.retry_base_ms {
            return Err(invalid("retry_max_ms must not be less than retry_base_ms"));
        }

        if self.uplink.retry_max_ms > 86_400_000 {
            return Err(invalid("retry_max_ms must not exceed 86400000"));
        }

        if self.uplink.request_timeout_ms == 0 || self.uplink.request_timeout_ms > 300_000 {
            return Err(invalid("request_timeout_ms must be between 1 and 300000"));
        }

        // Validate storage
        if self.storage.path.is_empty() {
            return Err(invalid("storage path cannot be empty"));
        }

        // Validate logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        if self.logging.dir.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("log dir cannot be empty when set"));
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Fold legacy `address`/`port`/`secure` into `url` when `url` is unset
    fn migrate_legacy(&mut self) {
        if !self.url.is_empty() {
            return;
        }
        let Some(address) = self.address.as_deref().filter(|a| !a.is_empty()) else {
            return;
        };

        let scheme = if self.secure { "https" } else { "http" };
        let port = self.port.unwrap_or(DEFAULT_SERVER_PORT);
        self.url = format!("{}://{}:{}", scheme, address, port);
    }
}

/// Random six-digit device id
pub fn generate_device_id() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

fn invalid(message: impl std::fmt::Display) -> UplinkError {
    UplinkError::Config(toml::de::Error::custom(message))
}
