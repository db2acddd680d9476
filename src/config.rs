//! Engine configuration, persisted as TOML in `$XDG_CONFIG_HOME/vendorfx/config.toml`.
//!
//! Every field has a default, so a missing or partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apply::VerifyPolicy;
use crate::learn::Sampling;
use crate::rules::{DEFAULT_QUORUM, clamp_quorum};

/// Errors from configuration loading and saving.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(vendorfx::config::read),
        help("Ensure the config file is readable, or remove it to use defaults.")
    )]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(vendorfx::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    ConfigParse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(vendorfx::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    ConfigWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Engine tuning and file locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rule file. `None` means the XDG default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
    /// Re-reads after a write before giving up on verification.
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,
    /// Agreeing reads in a row that count as verified.
    #[serde(default = "default_verify_consecutive")]
    pub verify_consecutive: u32,
    /// Snapshots taken per learn capture.
    #[serde(default = "default_learn_samples")]
    pub learn_samples: usize,
    #[serde(default = "default_learn_settle_ms")]
    pub learn_settle_ms: u64,
    /// Quorum threshold for rules that do not set one.
    #[serde(default = "default_quorum")]
    pub default_quorum: f64,
}

fn default_verify_attempts() -> u32 {
    3
}
fn default_verify_interval_ms() -> u64 {
    200
}
fn default_verify_consecutive() -> u32 {
    2
}
fn default_learn_samples() -> usize {
    3
}
fn default_learn_settle_ms() -> u64 {
    150
}
fn default_quorum() -> f64 {
    DEFAULT_QUORUM
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            verify_attempts: default_verify_attempts(),
            verify_interval_ms: default_verify_interval_ms(),
            verify_consecutive: default_verify_consecutive(),
            learn_samples: default_learn_samples(),
            learn_settle_ms: default_learn_settle_ms(),
            default_quorum: default_quorum(),
        }
    }
}

impl EngineConfig {
    /// Defaults with no waiting anywhere (tests and dry runs).
    pub fn immediate() -> Self {
        Self {
            verify_interval_ms: 0,
            learn_samples: 1,
            learn_settle_ms: 0,
            ..Default::default()
        }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            attempts: self.verify_attempts,
            interval: Duration::from_millis(self.verify_interval_ms),
            consecutive: self.verify_consecutive,
        }
    }

    pub fn sampling(&self) -> Sampling {
        Sampling {
            samples: self.learn_samples,
            settle: Duration::from_millis(self.learn_settle_ms),
        }
    }

    pub fn quorum(&self) -> f64 {
        clamp_quorum(self.default_quorum)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ConfigRead {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ConfigWrite {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::ConfigWrite {
            path: path.display().to_string(),
            source: e,
        })
    }
}
