//! Service configuration, loaded from an optional TOML file.
//!
//! Every section and every field has a default, so an empty file (or no
//! file) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::cache::{CacheConfig, GraphConfig};
use crate::git::RunnerConfig;
use crate::git::pool::PoolConfig;
use crate::git::retry::RetryPolicy;
use crate::notifier::NotifierConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often idle pool handles and expired cache entries are swept.
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub runner: RunnerConfig,
    pub retry: RetryPolicy,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub graph: GraphConfig,
    pub batch: BatchConfig,
    pub notifier: NotifierConfig,
    pub maintenance: MaintenanceConfig,
}

impl ServiceConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
