//! Scope Configuration
//!
//! Sizing and timing knobs of a scope. Every field has a default, so a
//! configuration file only needs to name what it changes:
//!
//! ```yaml
//! workers: 64
//! io_threads: 2
//! io_timeout_ms: 5000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a [`ScopeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration of a scope's worker pool and event loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    /// Worker pool threads
    pub workers: usize,
    /// Event loop threads
    pub io_threads: usize,
    /// Deadline of suspended I/O steps that set none themselves
    pub io_timeout_ms: Option<u64>,
    /// Prefix of every thread the scope starts
    pub thread_name: String,
    /// How long an idle worker parks before checking the queues again
    pub park_timeout_us: u64,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            io_threads: 1,
            io_timeout_ms: None,
            thread_name: "corunner".to_string(),
            park_timeout_us: 500,
        }
    }
}

impl ScopeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    /// Sets the default I/O deadline, rounded up to whole milliseconds.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        let ms = (timeout.as_nanos() + 999_999) / 1_000_000;
        self.io_timeout_ms = Some(u64::try_from(ms).unwrap_or(u64::MAX));
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn park_timeout(&self) -> Duration {
        Duration::from_micros(self.park_timeout_us)
    }

    /// Checks the configuration before a scope uses it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(ConfigError::Invalid(
                "io_threads must be at least 1".to_string(),
            ));
        }
        if self.io_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "io_timeout_ms must be positive when set".to_string(),
            ));
        }
        if self.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. `.json` files are read as JSON,
    /// everything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        debug!("Config loaded from {} ({} bytes)", path.display(), content.len());

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScopeConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.io_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = ScopeConfig::new()
            .with_workers(64)
            .with_io_threads(2)
            .with_io_timeout(Duration::from_millis(250))
            .with_thread_name("bench");

        assert_eq!(config.workers, 64);
        assert_eq!(config.io_threads, 2);
        assert_eq!(config.io_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.thread_name, "bench");
    }

    #[test]
    fn test_io_timeout_rounds_up() {
        let config = ScopeConfig::new().with_io_timeout(Duration::from_micros(300));
        assert_eq!(config.io_timeout(), Some(Duration::from_millis(1)));
        assert!(config.validate().is_ok());

        let config = ScopeConfig::new().with_io_timeout(Duration::from_micros(2_500));
        assert_eq!(config.io_timeout_ms, Some(3));

        let config = ScopeConfig::new().with_io_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let err = ScopeConfig::new().with_workers(0).validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = ScopeConfig::new();
        config.io_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_partial() {
        let config = ScopeConfig::from_yaml_str("workers: 8\nio_timeout_ms: 1500\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.io_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_yaml_unknown_field() {
        let err = ScopeConfig::from_yaml_str("worker: 8\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_json() {
        let config = ScopeConfig::from_json_str(r#"{"io_threads": 3}"#).unwrap();
        assert_eq!(config.io_threads, 3);

        let err = ScopeConfig::from_json_str(r#"{"io_threads": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_by_extension() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "workers: 5").unwrap();
        assert_eq!(ScopeConfig::load(yaml.path()).unwrap().workers, 5);

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(json, r#"{{"workers": 6}}"#).unwrap();
        assert_eq!(ScopeConfig::load(json.path()).unwrap().workers, 6);
    }

    #[test]
    fn test_load_missing_file() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        drop(file);

        let err = ScopeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
