//! XDG-compliant path resolution for vendorfx.
//!
//! Provides `VendorFxPaths`: where the config file, the shared rule file, the
//! JSON store document and saved learn sessions live.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(vendorfx::paths::no_home),
        help("Set the HOME (or USERPROFILE) environment variable, or pass --rules and --store explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(vendorfx::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

const APP: &str = "vendorfx";

/// Global directories for vendorfx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorFxPaths {
    /// `$XDG_CONFIG_HOME/vendorfx/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/vendorfx/`
    pub data_dir: PathBuf,
    /// `$XDG_STATE_HOME/vendorfx/`
    pub state_dir: PathBuf,
}

impl VendorFxPaths {
    /// Resolve from the process environment.
    pub fn resolve() -> PathResult<Self> {
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary variable lookup (empty values count as unset).
    pub fn resolve_with(lookup: impl Fn(&str) -> Option<String>) -> PathResult<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        let home = var("HOME").or_else(|| var("USERPROFILE")).ok_or(PathError::NoHome)?;

        let config_dir = var("XDG_CONFIG_HOME")
            .unwrap_or_else(|| home.join(".config"))
            .join(APP);

        let data_dir = var("XDG_DATA_HOME")
            .or_else(|| var("LOCALAPPDATA"))
            .unwrap_or_else(|| home.join(".local/share"))
            .join(APP);

        let state_dir = var("XDG_STATE_HOME")
            .unwrap_or_else(|| home.join(".local/state"))
            .join(APP);

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
        })
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.sessions_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path to the config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Default rule file.
    pub fn rules_file(&self) -> PathBuf {
        self.data_dir.join("vendor_toggles.ini")
    }

    /// Default JSON store document.
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }
}
