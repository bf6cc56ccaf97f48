//! Per-node shard assignment streams
//!
//! Storage nodes (or the transport acting for them) subscribe per
//! `(cluster, node)` and receive a [`ShardAssignment`] whenever scatter gives
//! them a new replica or changes their role. Assignments are only announced
//! after they are persisted.

use crate::storage::ShardRole;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Assignment pushed to a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub cluster: String,
    pub node: String,
    pub shard_id: u32,
    pub role: ShardRole,
    pub version: u64,
}

type StreamKey = (String, String);

/// Broadcast hub keyed by `(cluster, node)`
#[derive(Clone)]
pub struct HeartbeatStreams {
    streams: Arc<RwLock<HashMap<StreamKey, broadcast::Sender<ShardAssignment>>>>,
    capacity: usize,
}

impl HeartbeatStreams {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to assignments for `node` in `cluster`
    pub fn subscribe(&self, cluster: &str, node: &str) -> broadcast::Receiver<ShardAssignment> {
        let mut streams = self
            .streams
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        streams
            .entry((cluster.to_string(), node.to_string()))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Push an assignment; returns how many subscribers received it.
    /// A node nobody listens for is not an error: it reads its shards back
    /// on its next `GetShards` call.
    pub fn announce(&self, assignment: ShardAssignment) -> usize {
        let streams = self
            .streams
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (assignment.cluster.clone(), assignment.node.clone());
        match streams.get(&key) {
            Some(tx) => {
                let shard_id = assignment.shard_id;
                let delivered = tx.send(assignment).unwrap_or(0);
                debug!(
                    cluster = %key.0,
                    node = %key.1,
                    shard_id,
                    delivered,
                    "Announced shard assignment"
                );
                delivered
            }
            None => 0,
        }
    }
}

impl Default for HeartbeatStreams {
    fn default() -> Self {
        Self::new(64)
    }
}
