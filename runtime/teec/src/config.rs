//! Client configuration
//!
//! Loaded from TOML; every key is optional:
//!
//! ```toml
//! device_name = "kaal-tee"
//! max_shared_memory_size = 1048576
//! cancel_poll_interval_ms = 10
//! # cancel_wait_limit_ms = 5000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

pub type Result<T> = core::result::Result<T, ConfigError>;

/// Largest shared memory block accepted by default (1MB)
pub const DEFAULT_MAX_SHARED_MEMORY_SIZE: usize = 1024 * 1024;

/// Client library configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Name of the TEE this client talks to; `Context` accepts no name or
    /// exactly this one
    pub device_name: String,

    /// Upper bound on registered and allocated shared memory blocks
    pub max_shared_memory_size: usize,

    /// How often a pending cancellation re-checks whether its operation started
    pub cancel_poll_interval_ms: u64,

    /// Give up on a cancellation whose operation never starts
    pub cancel_wait_limit_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "kaal-tee".to_string(),
            max_shared_memory_size: DEFAULT_MAX_SHARED_MEMORY_SIZE,
            cancel_poll_interval_ms: 10,
            cancel_wait_limit_ms: None,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from TOML text
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML, names unknown keys, or
    /// holds out-of-range values
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or does not parse
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("loading client configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `InvalidValue` naming the first offending key
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "device_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cancel_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cancel_poll_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if u32::try_from(self.max_shared_memory_size).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "max_shared_memory_size",
                reason: "must fit in 32 bits".to_string(),
            });
        }
        Ok(())
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn cancel_wait_limit(&self) -> Option<Duration> {
        self.cancel_wait_limit_ms.map(Duration::from_millis)
    }
}
