//! # shardmeta
//!
//! Metadata control plane for a sharded, replicated database:
//! - Cluster registry with durable, crash-safe id allocation
//! - Lazily created schemas and tables, each table owned by one shard
//! - Shard scatter: leaders and followers spread over registered nodes
//! - Per-node assignment streams for storage nodes
//! - HTTP/JSON admin API
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            HTTP admin API                │
//! └───────────┬──────────────────────────────┘
//!             │ Manager trait
//! ┌───────────▼──────────────────────────────┐
//! │  ClusterManager (RwLock registry)        │
//! │   ├─ Cluster db1 (Mutex topology)        │
//! │   │    └─ Coordinator (scatter)          │
//! │   └─ Cluster db2 ...                     │
//! └───────────┬──────────────────────────────┘
//!             │ MetaStorage / IdAllocator
//! ┌───────────▼──────────────────────────────┐
//! │  KvBackend: RocksDB or in-memory         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! shardmeta-server serve --bind 0.0.0.0:7000 --data-dir ./shardmeta-data
//!
//! curl -XPOST localhost:7000/clusters \
//!   -d '{"name":"db1","node_count":3,"replication_factor":2,"shard_total":4}' \
//!   -H 'content-type: application/json'
//! ```

pub mod common;
pub mod meta;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, ErrorKind, Result};
pub use meta::{ClusterManager, Manager, MetaServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
