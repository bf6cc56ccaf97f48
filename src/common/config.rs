//! Configuration for shardmeta
//!
//! Values come from an optional TOML file and `SHARDMETA_*` environment
//! variables (nested keys separated by `__`, e.g.
//! `SHARDMETA_SERVER__BIND_ADDR`). Every field has a default, so an empty
//! source set yields a usable in-process configuration.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Config file looked up when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "shardmeta.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SHARDMETA";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    /// Logging level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            manager: ManagerConfig::default(),
            placement: PlacementConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Which durable store backs the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Rocksdb,
    Memory,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP admin API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub backend: StorageBackend,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./shardmeta-data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            backend: StorageBackend::default(),
        }
    }
}

/// Cluster manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of ids an allocator reserves per durable counter bump
    #[serde(default = "default_id_alloc_step")]
    pub id_alloc_step: u64,

    /// Capacity of each per-node assignment stream
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

fn default_id_alloc_step() -> u64 {
    100
}
fn default_stream_capacity() -> usize {
    64
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id_alloc_step: default_id_alloc_step(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

/// Shard placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Run scatter on the background worker instead of inside registration
    #[serde(default)]
    pub deferred: bool,

    /// Pending scatter requests the worker queue holds
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    128
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            deferred: false,
            queue_depth: default_queue_depth(),
        }
    }
}

impl Config {
    /// Load from `shardmeta.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given file (if present) and the environment.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path, e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.id_alloc_step == 0 {
            return Err(Error::InvalidConfig(
                "manager.id_alloc_step must be > 0".into(),
            ));
        }
        if self.manager.stream_capacity == 0 {
            return Err(Error::InvalidConfig(
                "manager.stream_capacity must be > 0".into(),
            ));
        }
        if self.placement.queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "placement.queue_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}
