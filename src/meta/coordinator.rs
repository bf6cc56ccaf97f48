//! Shard scatter
//!
//! Placement runs in two passes over the registered nodes, sorted by name:
//!
//! 1. Every shard without a leader gets one, on the node with the fewest
//!    leaders that is still below `ceil(shards / max(min_node_count, nodes))`.
//!    Ties go to the node with the fewest replicas, then to the smaller name.
//! 2. Once `min_node_count` nodes are registered, followers are added until
//!    each shard has `min(replication_factor, nodes)` replicas, always on the
//!    least-loaded node not already holding the shard.
//!
//! Existing replicas are never moved. Running scatter again without new
//! nodes changes nothing.

use crate::common::{Error, Result};
use crate::meta::cluster::Cluster;
use crate::meta::heartbeat::ShardAssignment;
use crate::storage::{ClusterRecord, ShardRecord, ShardReplica, ShardRole};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info};

/// Outcome of one scatter pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScatterReport {
    /// Registered nodes considered
    pub nodes: usize,
    /// Shards whose assignment changed, ascending
    pub changed: Vec<u32>,
    /// Assignments delivered to live subscribers
    pub announced: usize,
}

pub struct Coordinator<'a> {
    cluster: &'a Cluster,
}

impl<'a> Coordinator<'a> {
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    /// Assign unplaced shards and missing replicas to registered nodes.
    ///
    /// Shards are persisted one at a time. On a storage failure the shards
    /// persisted so far keep their new assignment and the error comes back
    /// as [`Error::Placement`]; calling scatter again finishes the job.
    pub fn scatter(&self) -> Result<ScatterReport> {
        let cluster = self.cluster;
        let mut topology = cluster.lock()?;

        let nodes: Vec<String> = topology.nodes.keys().cloned().collect();
        let plan = plan_scatter(cluster.meta(), &nodes, &topology.shards);

        let mut report = ScatterReport {
            nodes: nodes.len(),
            ..Default::default()
        };

        if plan.is_empty() {
            debug!(cluster = %cluster.name(), nodes = nodes.len(), "Scatter found nothing to place");
            return Ok(report);
        }

        for shard in plan {
            if let Err(e) = cluster.storage().put_shard(cluster.id(), &shard) {
                error!(
                    cluster = %cluster.name(),
                    shard_id = shard.id,
                    persisted = report.changed.len(),
                    error = %e,
                    "Failed to persist shard assignment"
                );
                return Err(Error::Placement {
                    cluster: cluster.name().to_string(),
                    source: Box::new(e.context(format!(
                        "persist shard {} at version {}",
                        shard.id, shard.version
                    ))),
                });
            }

            let previous = topology.shards.insert(shard.id, shard.clone());
            report.announced += self.announce(previous.as_ref(), &shard);
            report.changed.push(shard.id);
        }

        info!(
            cluster = %cluster.name(),
            nodes = report.nodes,
            changed = ?report.changed,
            "Scattered shards"
        );
        Ok(report)
    }

    /// Announce the replicas of `shard` that are new or changed role
    fn announce(&self, previous: Option<&ShardRecord>, shard: &ShardRecord) -> usize {
        shard
            .replicas
            .iter()
            .filter(|r| previous.and_then(|p| p.role_of(&r.node)) != Some(r.role))
            .map(|r| {
                self.cluster.streams().announce(ShardAssignment {
                    cluster: self.cluster.name().to_string(),
                    node: r.node.clone(),
                    shard_id: shard.id,
                    role: r.role,
                    version: shard.version,
                })
            })
            .sum()
    }
}

/// Compute the shards whose assignment should change, with their versions
/// already bumped. Pure: nothing is read from or written to storage.
pub fn plan_scatter(
    cluster: &ClusterRecord,
    nodes: &[String],
    shards: &BTreeMap<u32, ShardRecord>,
) -> Vec<ShardRecord> {
    let mut nodes: Vec<&str> = nodes.iter().map(String::as_str).collect();
    nodes.sort_unstable();
    nodes.dedup();
    if nodes.is_empty() || shards.is_empty() {
        return Vec::new();
    }

    let min_nodes = (cluster.min_node_count as usize).max(1);
    let leader_cap = shards.len().div_ceil(min_nodes.max(nodes.len()));

    let mut leaders: HashMap<&str, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut load = leaders.clone();
    for replica in shards.values().flat_map(|s| &s.replicas) {
        if let Some(count) = load.get_mut(replica.node.as_str()) {
            *count += 1;
        }
        if replica.role == ShardRole::Leader {
            if let Some(count) = leaders.get_mut(replica.node.as_str()) {
                *count += 1;
            }
        }
    }

    let mut changed: BTreeMap<u32, ShardRecord> = BTreeMap::new();

    for shard in shards.values().filter(|s| s.leader().is_none()) {
        let pick = nodes
            .iter()
            .copied()
            .filter(|n| leaders[n] < leader_cap && !shard.hosts(n))
            .min_by_key(|n| (leaders[n], load[n], *n));
        let Some(node) = pick else {
            continue;
        };

        let mut next = shard.clone();
        next.replicas.insert(0, ShardReplica::leader(node));
        if let Some(count) = leaders.get_mut(node) {
            *count += 1;
        }
        if let Some(count) = load.get_mut(node) {
            *count += 1;
        }
        changed.insert(shard.id, next);
    }

    if nodes.len() >= min_nodes {
        let target = (cluster.replication_factor as usize)
            .max(1)
            .min(nodes.len());

        for shard in shards.values() {
            let mut next = changed
                .get(&shard.id)
                .cloned()
                .unwrap_or_else(|| shard.clone());
            if next.leader().is_none() || next.replicas.len() >= target {
                continue;
            }

            while next.replicas.len() < target {
                let pick = nodes
                    .iter()
                    .copied()
                    .filter(|n| !next.hosts(n))
                    .min_by_key(|n| (load[n], *n));
                let Some(node) = pick else {
                    break;
                };
                next.replicas.push(ShardReplica::follower(node));
                if let Some(count) = load.get_mut(node) {
                    *count += 1;
                }
            }
            changed.insert(shard.id, next);
        }
    }

    changed
        .into_values()
        .map(|mut shard| {
            shard.version += 1;
            shard
        })
        .collect()
}
