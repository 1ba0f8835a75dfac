//! Configuration management for the image receiver.
//!
//! Configuration is loaded from optional TOML files and overridden by
//! environment variables, then validated before any socket or database handle
//! is opened.

use crate::retention::parse_max_size;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the receiver service.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Service-level configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Listening socket configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Which persistence backend receives images
    pub backend: BackendKind,

    /// PostgreSQL configuration (required for the postgres backend)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Filesystem archive configuration (required for the filesystem backend)
    #[serde(default)]
    pub archive: Option<ArchiveConfig>,
}

/// Persistence backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Two related rows per image in PostgreSQL
    Postgres,
    /// Day-bucketed directory tree with a JSON sidecar per image
    Filesystem,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Prometheus exporter port (disabled when absent)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Listening socket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a single frame's length; unbounded when absent
    #[serde(default)]
    pub max_frame_bytes: Option<usize>,

    /// How long shutdown waits for open connections before giving up
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Filesystem archive configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory of the day-bucket tree
    pub root: PathBuf,
    /// Quota such as "500k", "2m" or "1g"
    #[serde(default = "default_max_size")]
    pub max_size: String,
    /// Extension given to archived image files
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// Seconds between periodic quota sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Also sweep after this many archived images
    #[serde(default)]
    pub sweep_every_writes: Option<u64>,
}

// Default value functions
fn default_service_name() -> String {
    "picam-receiver".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_max_size() -> String {
    "1g".to_string()
}
fn default_image_extension() -> String {
    "png".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_frame_bytes: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/receiver.toml`
    /// 2. `/etc/picam/receiver.toml`
    /// 3. Environment variables (e.g. `RECEIVER__LISTENER__PORT` -> listener.port)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/receiver").required(false))
            .add_source(File::with_name("/etc/picam/receiver").required(false))
            .add_source(
                Environment::with_prefix("RECEIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a single explicit file plus environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("RECEIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.listener.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "listener.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        if self.listener.max_frame_bytes == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "listener.max_frame_bytes".to_string(),
                message: "Frame bound must be greater than 0".to_string(),
            });
        }

        match self.backend {
            BackendKind::Postgres => {
                let database = self
                    .database
                    .as_ref()
                    .ok_or_else(|| ConfigValidationError::MissingField("database".to_string()))?;
                if database.url.is_empty() {
                    return Err(ConfigValidationError::MissingField(
                        "database.url".to_string(),
                    ));
                }
            }
            BackendKind::Filesystem => {
                let archive = self
                    .archive
                    .as_ref()
                    .ok_or_else(|| ConfigValidationError::MissingField("archive".to_string()))?;
                if archive.root.as_os_str().is_empty() {
                    return Err(ConfigValidationError::MissingField(
                        "archive.root".to_string(),
                    ));
                }
                parse_max_size(&archive.max_size).map_err(|e| {
                    ConfigValidationError::InvalidValue {
                        field: "archive.max_size".to_string(),
                        message: e.to_string(),
                    }
                })?;
                if archive.image_extension.is_empty()
                    || archive.image_extension.contains(['/', '.'])
                {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "archive.image_extension".to_string(),
                        message: "Extension must be a bare name such as png".to_string(),
                    });
                }
                if archive.sweep_interval_secs == 0 {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "archive.sweep_interval_secs".to_string(),
                        message: "Interval must be greater than 0".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl ListenerConfig {
    /// Address string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get shutdown grace period as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ArchiveConfig {
    /// Get sweep interval as Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_archive_config() -> ReceiverConfig {
        ReceiverConfig {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            listener: ListenerConfig::default(),
            backend: BackendKind::Filesystem,
            database: None,
            archive: Some(ArchiveConfig {
                root: PathBuf::from("/var/lib/picam/archive"),
                max_size: "2m".to_string(),
                image_extension: "png".to_string(),
                sweep_interval_secs: 60,
                sweep_every_writes: Some(100),
            }),
        }
    }

    #[test]
    fn test_valid_archive_config() {
        assert!(create_archive_config().validate().is_ok());
    }

    #[test]
    fn test_postgres_backend_requires_database() {
        let mut config = create_archive_config();
        config.backend = BackendKind::Postgres;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "database"
        ));

        config.database = Some(DatabaseConfig {
            url: "postgres://picam@localhost/picam".to_string(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout_secs: 5,
            idle_timeout_secs: 60,
            run_migrations: true,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_max_size_is_rejected() {
        let mut config = create_archive_config();
        config.archive.as_mut().unwrap().max_size = "100x".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_port_is_rejected() {
        let mut config = create_archive_config();
        config.listener.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let raw = r#"
            backend = "filesystem"

            [listener]
            port = 9100

            [archive]
            root = "/tmp/archive"
            max_size = "500k"
        "#;
        let config: ReceiverConfig = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.backend, BackendKind::Filesystem);
        assert_eq!(config.listener.port, 9100);
        assert_eq!(config.listener.host, "0.0.0.0");
        let archive = config.archive.unwrap();
        assert_eq!(archive.image_extension, "png");
        assert_eq!(archive.sweep_interval_secs, 300);
        assert_eq!(config.listener.bind_addr(), "0.0.0.0:9100");
    }
}
