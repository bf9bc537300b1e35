//! Service configuration.
//!
//! Configuration is loaded from, in increasing priority:
//! 1. Built-in defaults
//! 2. TOML file (`scanq.toml` in the working directory, or `--config <path>`)
//! 3. Environment variables (with `SCANQ_` prefix)
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [scanq]
//! bind = "0.0.0.0:8000"
//! queue_url = "redis://127.0.0.1:6379"
//! store_url = "redis://127.0.0.1:6379"
//! workers = 8
//! visibility_timeout_secs = 30
//! max_attempts = 3
//! task_time_limit_secs = 3600
//! retention_secs = 86400
//! reap_interval_secs = 5
//! log_format = "json"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scanq_tasks::queue::QueueConfig;
use scanq_tasks::store::StoreConfig;
use scanq_tasks::WorkerConfig;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "scanq.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// The configuration file is not valid TOML for [`ScanqConfig`].
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range or malformed.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid {
                field: "log_format",
                reason: format!("expected `text` or `json`, got `{other}`"),
            }),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanqConfig {
    /// HTTP listen address.
    pub bind: String,
    /// `memory://` or a `redis://` URL.
    pub queue_url: String,
    /// `memory://` or a `redis://` URL.
    pub store_url: String,
    /// Concurrent worker loops in this process. `0` runs the API only.
    pub workers: usize,
    /// Lease length of a delivery without renewal.
    pub visibility_timeout_secs: u64,
    /// Deliveries per task before it fails as `worker_lost`.
    pub max_attempts: u32,
    /// Wall-clock limit for one attempt of one task.
    pub task_time_limit_secs: u64,
    /// How long terminal records stay readable. `0` keeps them forever.
    pub retention_secs: u64,
    /// Period of the lease reaper and record sweeper.
    pub reap_interval_secs: u64,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ScanqConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            queue_url: "memory://".to_string(),
            store_url: "memory://".to_string(),
            workers: 4,
            visibility_timeout_secs: 30,
            max_attempts: 3,
            task_time_limit_secs: 3600,
            retention_secs: 86_400,
            reap_interval_secs: 5,
            log_format: LogFormat::Text,
        }
    }
}

impl ScanqConfig {
    /// Loads `path`, or `scanq.toml` if present, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(contents) => Self::from_toml(&contents)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    /// Parses the `[scanq]` table of a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            scanq: ScanqConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(full.scanq)
    }

    /// Applies `SCANQ_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            field: &'static str,
            raw: String,
        ) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })
        }

        if let Some(v) = lookup("SCANQ_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("SCANQ_QUEUE_URL") {
            self.queue_url = v;
        }
        if let Some(v) = lookup("SCANQ_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = lookup("SCANQ_WORKERS") {
            self.workers = parsed("workers", v)?;
        }
        if let Some(v) = lookup("SCANQ_VISIBILITY_TIMEOUT_SECS") {
            self.visibility_timeout_secs = parsed("visibility_timeout_secs", v)?;
        }
        if let Some(v) = lookup("SCANQ_MAX_ATTEMPTS") {
            self.max_attempts = parsed("max_attempts", v)?;
        }
        if let Some(v) = lookup("SCANQ_TASK_TIME_LIMIT_SECS") {
            self.task_time_limit_secs = parsed("task_time_limit_secs", v)?;
        }
        if let Some(v) = lookup("SCANQ_RETENTION_SECS") {
            self.retention_secs = parsed("retention_secs", v)?;
        }
        if let Some(v) = lookup("SCANQ_REAP_INTERVAL_SECS") {
            self.reap_interval_secs = parsed("reap_interval_secs", v)?;
        }
        if let Some(v) = lookup("SCANQ_LOG_FORMAT") {
            self.log_format = v.parse()?;
        }
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        for (field, secs) in [
            ("visibility_timeout_secs", self.visibility_timeout_secs),
            ("task_time_limit_secs", self.task_time_limit_secs),
            ("reap_interval_secs", self.reap_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// The parsed listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            field: "bind",
            reason: e.to_string(),
        })
    }

    /// Queue settings derived from this configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            max_attempts: self.max_attempts,
        }
    }

    /// Store settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            retention: (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs)),
            ..StoreConfig::default()
        }
    }

    /// Worker pool settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            task_time_limit: Duration::from_secs(self.task_time_limit_secs),
            reap_interval: Duration::from_secs(self.reap_interval_secs),
            ..WorkerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ScanqConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue_config(), QueueConfig::default());
        assert_eq!(
            config.store_config().retention,
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn toml_overrides_defaults_field_by_field() {
        let config = ScanqConfig::from_toml(
            r#"
            [scanq]
            workers = 8
            queue_url = "redis://cache:6379"
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_url, "redis://cache:6379");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.store_url, "memory://");
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn missing_table_means_defaults() {
        let config = ScanqConfig::from_toml("").unwrap();
        assert_eq!(config, ScanqConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = ScanqConfig::from_toml("[scanq]\nworkers = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_beats_file() {
        let mut config = ScanqConfig::from_toml("[scanq]\nworkers = 8").unwrap();
        config
            .apply_env_overrides(env(&[
                ("SCANQ_WORKERS", "2"),
                ("SCANQ_RETENTION_SECS", "0"),
                ("SCANQ_LOG_FORMAT", "JSON"),
            ]))
            .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.store_config().retention, None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn bad_env_value_names_the_field() {
        let mut config = ScanqConfig::default();
        let err = config
            .apply_env_overrides(env(&[("SCANQ_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn validate_rejects_zero_budget_and_bad_bind() {
        let config = ScanqConfig {
            max_attempts: 0,
            ..ScanqConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ScanqConfig {
            bind: "not an address".into(),
            ..ScanqConfig::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Invalid { field: "bind", .. }
        ));
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = ScanqConfig::from_file(Path::new("/nonexistent/scanq.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanq.toml");
        std::fs::write(&path, "[scanq]\nbind = \"0.0.0.0:9000\"\n").unwrap();
        let config = ScanqConfig::from_file(&path).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }
}
