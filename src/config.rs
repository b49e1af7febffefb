//! Runtime configuration, loaded from TOML.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Dispatched workers register a per-thread engine context before taking the lock.
    /// When false, a transient context is created for each acquisition.
    pub bind_worker_context: bool,
    /// Bounded wait for worker acquisition. None blocks forever.
    pub acquire_timeout_ms: Option<u64>,
    pub worker_name_prefix: String,
    /// Fallback tracing filter when RUST_LOG is not set.
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            bind_worker_context: true,
            acquire_timeout_ms: None,
            worker_name_prefix: "engine-worker".into(),
            log_filter: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source: source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn parses_fields() {
        let c = RuntimeConfig::from_toml_str(r#"
            bind_worker_context = false
            acquire_timeout_ms = 250
            worker_name_prefix = "w"
        "#).unwrap();
        assert!(!c.bind_worker_context);
        assert_eq!(c.acquire_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(c.worker_name_prefix, "w");
        assert_eq!(c.log_filter, None);
    }

    #[test]
    fn bad_types_fail_to_parse() {
        match RuntimeConfig::from_toml_str("acquire_timeout_ms = \"soon\"") {
            Err(ConfigError::Parse(_)) => (),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RuntimeConfig::load("/nonexistent/enginelock.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/enginelock.toml"));
    }
}
