//! Persisted metadata records

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Cluster record, immutable after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: u32,
    pub name: String,
    pub min_node_count: u32,
    pub replication_factor: u32,
    pub shard_total: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub id: u32,
    pub name: String,
    pub cluster_id: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: u64,
    pub name: String,
    pub schema_id: u32,
    /// Shard whose leader owns the table for writes
    pub shard_id: u32,
    /// Node the table was allocated from
    pub owner_node: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRole {
    Leader,
    Follower,
}

impl std::fmt::Display for ShardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRole::Leader => write!(f, "leader"),
            ShardRole::Follower => write!(f, "follower"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplica {
    pub node: String,
    pub role: ShardRole,
}

impl ShardReplica {
    pub fn leader(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            role: ShardRole::Leader,
        }
    }

    pub fn follower(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            role: ShardRole::Follower,
        }
    }
}

/// Shard record
///
/// `version` is bumped on every change to `replicas` or `table_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: u32,
    pub version: u64,
    pub replicas: Vec<ShardReplica>,
    pub table_ids: BTreeSet<u64>,
}

impl ShardRecord {
    /// Unassigned shard at version zero
    pub fn new(id: u32) -> Self {
        Self {
            id,
            version: 0,
            replicas: Vec::new(),
            table_ids: BTreeSet::new(),
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.replicas
            .iter()
            .find(|r| r.role == ShardRole::Leader)
            .map(|r| r.node.as_str())
    }

    pub fn role_of(&self, node: &str) -> Option<ShardRole> {
        self.replicas
            .iter()
            .find(|r| r.node == node)
            .map(|r| r.role)
    }

    pub fn hosts(&self, node: &str) -> bool {
        self.replicas.iter().any(|r| r.node == node)
    }
}

/// Registered storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    /// Lease TTL in seconds
    pub lease: u32,
    /// Unix seconds of the last registration
    pub last_seen: u64,
    pub registered_at: u64,
}

impl NodeRecord {
    /// Has the lease run out at `now`? Informational only; expiry policy
    /// lives outside this crate.
    pub fn lease_expired(&self, now: u64) -> bool {
        now > self.last_seen.saturating_add(u64::from(self.lease))
    }
}
