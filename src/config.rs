//! Stackshift configuration
//!
//! One TOML file, one section per subsystem. Every section falls back to its
//! defaults, so an empty or missing file is a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use stackshift_cutover::CutoverConfig;
use stackshift_scheduler::{RetryPolicy, SchedulerConfig};
use std::path::{Path, PathBuf};

/// Names the config file when no explicit path is given.
pub const CONFIG_ENV: &str = "STACKSHIFT_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackshiftConfig {
    /// Worker pool and per-kind limits.
    pub scheduler: SchedulerConfig,
    /// Backoff for retryable executor errors.
    pub retry: RetryPolicy,
    /// Health gate, traffic steps and bake window.
    pub cutover: CutoverConfig,
    /// Where cutover sessions are persisted.
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Sessions live as long as the process.
    Memory,
    /// One JSON document per session under `path`.
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the file store.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
}

// ============================================================
// Defaults
// ============================================================

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: PathBuf::from(".stackshift/sessions"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "stackshift=info".into(),
            json: false,
        }
    }
}

impl StackshiftConfig {
    /// Load from `path`, else from `$STACKSHIFT_CONFIG`, else defaults.
    ///
    /// A missing file yields the defaults. A file that exists but does not
    /// parse or validate is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => {
                    tracing::info!("no config file given, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Current config as TOML (for generating a starter file).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.cutover.validate()?;
        if self.store.backend == StoreBackend::File && self.store.path.as_os_str().is_empty() {
            return Err(Error::Config("store.path must be set for the file backend".into()));
        }
        Ok(())
    }
}
