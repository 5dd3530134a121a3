//! Runtime configuration, loaded from TOML.
//!
//! Every field has a default, so an empty or missing file yields
//! `CoreConfig::default()`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use panebus_core::reducer::DEFAULT_FRAME_MS;
use panebus_core::replay::DEFAULT_REPLAY_CAPACITY;
use panebus_projection::DEFAULT_CHANGE_LOG_CAPACITY;
use panebus_source_fs::batcher::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_MAX_BATCH_PATHS, DEFAULT_MAX_LATENCY_MS,
};
use panebus_source_fs::canonical::default_case_insensitive;
use panebus_source_fs::{BatchPolicy, FsSourceConfig};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PANEBUS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ─── Core ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Broadcast capacity of the shared event bus.
    pub bus_capacity: usize,
    /// Ring size of every per-source replay buffer.
    pub replay_capacity: usize,
    /// Projection changes kept for incremental readers.
    pub projection_change_capacity: usize,
    /// Notification reducer flush cadence.
    pub frame_ms: u64,
    /// Default drain timeout when closing a runtime.
    pub shutdown_timeout_ms: u64,
    pub fs: FsConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            projection_change_capacity: DEFAULT_CHANGE_LOG_CAPACITY,
            frame_ms: DEFAULT_FRAME_MS,
            shutdown_timeout_ms: 2_000,
            fs: FsConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load from `path`. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Resolve from an explicit path, then `PANEBUS_CONFIG`, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(Path::new(&path)),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("bus_capacity", self.bus_capacity == 0),
            ("replay_capacity", self.replay_capacity == 0),
            (
                "projection_change_capacity",
                self.projection_change_capacity == 0,
            ),
            ("frame_ms", self.frame_ms == 0),
            ("fs.max_batch_paths", self.fs.max_batch_paths == 0),
            ("fs.drift_sweep_secs", self.fs.drift_sweep_secs == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        if self.fs.debounce_ms > self.fs.max_latency_ms {
            return Err(ConfigError::Invalid(format!(
                "fs.debounce_ms ({}) exceeds fs.max_latency_ms ({})",
                self.fs.debounce_ms, self.fs.max_latency_ms
            )));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ─── Filesystem ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub debounce_ms: u64,
    pub max_latency_ms: u64,
    pub max_batch_paths: usize,
    pub drift_sweep_secs: u64,
    /// Platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_insensitive: Option<bool>,
    pub ignore_dirs: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            max_batch_paths: DEFAULT_MAX_BATCH_PATHS,
            drift_sweep_secs: 300,
            case_insensitive: None,
            ignore_dirs: vec![".git".to_string()],
        }
    }
}

impl FsConfig {
    pub fn drift_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.drift_sweep_secs)
    }

    pub fn to_source_config(&self) -> FsSourceConfig {
        FsSourceConfig {
            batch: BatchPolicy {
                debounce_ms: self.debounce_ms,
                max_latency_ms: self.max_latency_ms,
                max_batch_paths: self.max_batch_paths,
            },
            case_insensitive: self
                .case_insensitive
                .unwrap_or_else(default_case_insensitive),
            ignore_dirs: self.ignore_dirs.clone(),
        }
    }
}
