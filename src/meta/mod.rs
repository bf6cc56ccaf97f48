//! Metadata control plane
//!
//! - [`ClusterManager`]: registry of clusters, entry point for every
//!   administrative operation
//! - [`Cluster`]: one cluster's schemas, tables, shards and nodes
//! - [`Coordinator`]: shard scatter over registered nodes
//! - [`IdAllocator`]: namespaced, crash-safe id allocation
//! - [`HeartbeatStreams`]: per-node assignment notifications
//! - HTTP admin API, background placement worker and the server wiring

pub mod cluster;
pub mod coordinator;
pub mod heartbeat;
pub mod http;
pub mod id;
pub mod manager;
pub mod server;
pub mod worker;

pub use cluster::{Cluster, ClusterTopology, NodeStatus, ShardStatus, ShardTableRecords};
pub use coordinator::{plan_scatter, Coordinator, ScatterReport};
pub use heartbeat::{HeartbeatStreams, ShardAssignment};
pub use http::{create_router, AppState};
pub use id::IdAllocator;
pub use manager::{ClusterManager, Manager, ShardTables, TableInfo};
pub use server::MetaServer;
pub use worker::PlacementWorker;
