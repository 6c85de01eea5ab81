//! Configuration module for LinkWatch.
//!
//! Loads a JSON configuration file with the monitored host set, then
//! applies environment-variable overrides with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One host to monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Display label; may change between runs, the latest one wins.
    pub name: String,
    /// Stable host identity (IP or hostname).
    pub address: String,
}

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    /// Echo requests per check.
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// Per-packet reply timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Check results older than this are eligible for cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Port for the read-only query API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_ping_count() -> u32 {
    10
}

fn default_timeout_seconds() -> f64 {
    5.0
}

fn default_retention_days() -> i64 {
    90
}

fn default_database_path() -> String {
    "linkwatch.db".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from the file named by `LINKWATCH_CONFIG`
    /// (default: "linkwatch.json"), then apply environment overrides.
    ///
    /// Environment variables:
    /// - `LINKWATCH_CONFIG`: config file path (default: "linkwatch.json")
    /// - `LINKWATCH_DB_PATH`: database file path
    /// - `LINKWATCH_HTTP_PORT`: HTTP port
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("LINKWATCH_CONFIG").unwrap_or_else(|_| "linkwatch.json".to_string());
        let mut cfg = Self::load_from(&path)?;

        if let Ok(db_path) = env::var("LINKWATCH_DB_PATH") {
            cfg.database_path = db_path;
        }
        if let Ok(port_str) = env::var("LINKWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and parse a config file without applying env overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("host list is empty".to_string()));
        }
        for host in &self.hosts {
            if host.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "host '{}' has an empty address",
                    host.name
                )));
            }
        }
        if self.ping_count == 0 {
            return Err(ConfigError::Invalid(
                "ping_count must be positive".to_string(),
            ));
        }
        if self.timeout_seconds <= 0.0 {
            return Err(ConfigError::Invalid(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        if self.retention_days < 1 {
            return Err(ConfigError::Invalid(
                "retention_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-packet timeout as a duration.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(json.as_bytes()).unwrap();
        tmp
    }

    #[test]
    fn test_load_valid_config() {
        let tmp = write_config(
            r#"{
                "hosts": [
                    {"name": "Google DNS", "address": "8.8.8.8"},
                    {"name": "Cloudflare DNS", "address": "1.1.1.1"}
                ],
                "ping_count": 5,
                "timeout_seconds": 2.0,
                "retention_days": 30,
                "database_path": "test_pings.db",
                "http_port": 8501
            }"#,
        );

        let cfg = Config::load_from(tmp.path()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.hosts[0].address, "8.8.8.8");
        assert_eq!(cfg.ping_count, 5);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.http_port, 8501);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let tmp = write_config(r#"{"hosts": [{"name": "gw", "address": "192.168.1.1"}]}"#);
        let cfg = Config::load_from(tmp.path()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.ping_count, 10);
        assert_eq!(cfg.timeout_seconds, 5.0);
        assert_eq!(cfg.retention_days, 90);
        assert_eq!(cfg.database_path, "linkwatch.db");
        assert_eq!(cfg.http_port, 8080);
    }

    #[test]
    fn test_empty_hosts_is_invalid() {
        let tmp = write_config(r#"{"hosts": []}"#);
        let cfg = Config::load_from(tmp.path()).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_ping_count_is_invalid() {
        let tmp = write_config(
            r#"{"hosts": [{"name": "gw", "address": "192.168.1.1"}], "ping_count": 0}"#,
        );
        let cfg = Config::load_from(tmp.path()).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_timeout_is_invalid() {
        let tmp = write_config(
            r#"{"hosts": [{"name": "gw", "address": "192.168.1.1"}], "timeout_seconds": -1.0}"#,
        );
        let cfg = Config::load_from(tmp.path()).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            Config::load_from("/nonexistent/linkwatch.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let tmp = write_config("{hosts: oops");
        assert!(matches!(
            Config::load_from(tmp.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
