//! Engine configuration
//!
//! Configuration is read from a TOML file; every key is optional.
//!
//! ```toml
//! poll_timeout_ms = 10000
//! poll_interval_ms = 1
//! reconnect_interval_ms = 100
//! reconnect_attempts = 50
//! connect_under_reset = false
//! family = "stm32g4"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the file
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to load
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse the TOML
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for the flash engine and session handling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound for any single busy-flag poll
    pub poll_timeout_ms: u64,
    /// Sleep between polls of slow operations (erase, option commit)
    pub poll_interval_ms: u32,
    /// Delay between reconnect attempts after a reset
    pub reconnect_interval_ms: u32,
    /// Give up reconnecting after this many attempts (unbounded if unset)
    pub reconnect_attempts: Option<u32>,
    /// Hold the target in reset while reconnecting
    pub connect_under_reset: bool,
    /// Skip identification and use this family
    pub family: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10_000,
            poll_interval_ms: 1,
            reconnect_interval_ms: 100,
            reconnect_attempts: None,
            connect_under_reset: false,
            family: None,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Poll timeout as a Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.reconnect_attempts, None);
    }

    #[test]
    fn test_partial_config() {
        let config = EngineConfig::from_toml(
            r#"
            poll_timeout_ms = 250
            reconnect_attempts = 3
            family = "stm32h7"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_millis(250));
        assert_eq!(config.reconnect_attempts, Some(3));
        assert_eq!(config.family.as_deref(), Some("stm32h7"));
        assert_eq!(config.reconnect_interval_ms, 100);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(EngineConfig::from_toml("poll_timeout = 5").is_err());
    }
}
