//! Configuration module for backrun.
//!
//! Two configuration surfaces live here:
//!
//! - [`BackrunSettings`]: how the daemon itself runs (directories, binary location, logging).
//! - [`Config`]: the declarative repos and plans, owned by a [`ConfigStore`] and versioned by
//!   `modno` for optimistic concurrency.

mod model;
mod store;
mod validate;

pub use model::{Config, Hook, HookAction, HookCondition, Plan, Repo, RetentionPolicy};
pub use store::{ConfigStore, JsonFileStore, MemoryStore};
pub use validate::validate_config;

use crate::error::{BackrunError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackrunSettings {
    /// Directory holding the operation log database and command output logs.
    pub data_dir: PathBuf,
    /// Path of the declarative config file.
    pub config_path: PathBuf,
    /// Explicit path of the backup tool binary.
    #[serde(default)]
    pub restic_binary: Option<PathBuf>,
    /// Log store configuration.
    #[serde(default)]
    pub logs: LogStoreConfig,
    /// Maximum time to wait for in-flight work at shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackrunSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/backrun"),
            config_path: PathBuf::from("/etc/backrun/config.json"),
            restic_binary: None,
            logs: LogStoreConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl BackrunSettings {
    /// Load settings from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackrunError::Config(format!("Failed to read settings file: {}", e))
        })?;

        let settings: Self = serde_json::from_str(&content).map_err(|e| {
            BackrunError::Config(format!("Failed to parse settings: {}", e))
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(BackrunError::Config("data_dir must be set".to_string()));
        }
        if self.config_path.as_os_str().is_empty() {
            return Err(BackrunError::Config("config_path must be set".to_string()));
        }
        if self.logs.max_files == 0 {
            return Err(BackrunError::Config(
                "logs.max_files must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings rooted in a scratch directory, for local runs.
    pub fn development() -> Self {
        let root = std::env::temp_dir().join("backrun");
        Self {
            data_dir: root.join("data"),
            config_path: root.join("config.json"),
            restic_binary: None,
            logs: LogStoreConfig { max_files: 100 },
            shutdown_timeout: Duration::from_secs(5),
            observability: ObservabilityConfig {
                metrics_enabled: false,
                log_level: "debug".to_string(),
                ..Default::default()
            },
        }
    }

    /// Location of the operation log database.
    pub fn oplog_path(&self) -> PathBuf {
        self.data_dir.join("oplog.rocksdb")
    }

    /// Location of the command output logs.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Rotating log store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Number of log files retained before the oldest are removed.
    pub max_files: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self { max_files: 1000 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9898".parse().expect("valid socket address"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = BackrunSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.oplog_path(), PathBuf::from("/var/lib/backrun/oplog.rocksdb"));
        assert!(!settings.observability.metrics_enabled);
    }

    #[test]
    fn test_parse_settings_json() {
        let json = r#"{
            "data_dir": "/srv/backrun",
            "config_path": "/srv/backrun/config.json",
            "shutdown_timeout": "10s"
        }"#;
        let settings: BackrunSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(settings.logs.max_files, 1000);
        assert_eq!(settings.log_dir(), PathBuf::from("/srv/backrun/logs"));
    }

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_zero_log_files_rejected() {
        let mut settings = BackrunSettings::development();
        settings.logs.max_files = 0;
        assert!(settings.validate().is_err());
    }
}
