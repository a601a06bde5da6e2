//! Engine Configuration
//!
//! Settings are read from a YAML file. Every field has a default, so an
//! empty or partial file is valid.
//!
//! ```yaml
//! instance_id: worker-eu-1
//! retry:
//!   max_attempts: 5
//!   initial_backoff: 500     # milliseconds
//! lock:
//!   stale_after: 60000
//! workers:
//!   threads: 8
//! store:
//!   backend: file
//!   path: /var/lib/procflow
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::execution::{LockSettings, RetryPolicy};
use crate::store::file::DEFAULT_STORE_DIR;
use crate::store::{FileStore, LockStore, MemoryStore, ProcessStore, StoreError};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PROCFLOW_CONFIG";

/// Configuration file used when none is specified.
pub const DEFAULT_CONFIG_FILE: &str = "procflow.yaml";

/// Lazily-resolved path of the configuration file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    debug!("Using configuration path: {}", path.display());
    path
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Failed to open store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Root directory of the file backend
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from(DEFAULT_STORE_DIR),
        }
    }
}

impl StoreSettings {
    /// Opens the configured backend. One store instance serves as both the
    /// process store and the lock store.
    pub fn open(&self) -> Result<(Arc<dyn ProcessStore>, Arc<dyn LockStore>), StoreError> {
        match self.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                let processes: Arc<dyn ProcessStore> = store.clone();
                let locks: Arc<dyn LockStore> = store;
                Ok((processes, locks))
            }
            StoreBackend::File => {
                let store = Arc::new(FileStore::open(&self.path)?);
                let processes: Arc<dyn ProcessStore> = store.clone();
                let locks: Arc<dyn LockStore> = store;
                Ok((processes, locks))
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    pub threads: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
        }
    }
}

/// Complete engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Owner name written into locks; a random id is generated when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub retry: RetryPolicy,
    pub lock: LockSettings,
    pub workers: WorkerSettings,
    pub store: StoreSettings,
}

impl EngineConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses a YAML document. An empty document yields the defaults.
    pub fn parse(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Loads [`CONFIG_PATH`], falling back to defaults when it does not exist.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        if CONFIG_PATH.exists() {
            Self::load(&*CONFIG_PATH)
        } else {
            info!(
                "No configuration at {}, using defaults",
                CONFIG_PATH.display()
            );
            Ok(Self::default())
        }
    }
}
