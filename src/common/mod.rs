//! Common utilities and types shared across shardmeta

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, ManagerConfig, PlacementConfig, ServerConfig, StorageBackend};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use utils::{timestamp_now, validate_name};
