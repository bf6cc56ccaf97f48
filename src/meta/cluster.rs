//! One cluster's topology: schemas, tables, shards and nodes
//!
//! All maps sit behind a single mutex. Mutations hold it from lookup through
//! persistence, so operations on the same cluster are totally ordered while
//! different clusters never contend.
//!
//! Table records are the source of truth for shard membership: creation
//! persists the table before its shard, dropping deletes the table before
//! its shard, and [`Cluster::load`] reconciles shard table sets against the
//! stored tables.

use crate::common::{timestamp_now, validate_name, Error, Result, ResultExt};
use crate::meta::coordinator::Coordinator;
use crate::meta::heartbeat::HeartbeatStreams;
use crate::meta::id::{schema_namespace, IdAllocator};
use crate::storage::{
    ClusterRecord, MetaStorage, NodeRecord, SchemaRecord, ShardRecord, ShardReplica, ShardRole,
    TableRecord,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub(crate) struct SchemaEntry {
    pub(crate) record: SchemaRecord,
    /// table name -> table id
    pub(crate) tables: HashMap<String, u64>,
}

/// In-memory cache of everything stored under one cluster
#[derive(Default)]
pub(crate) struct Topology {
    pub(crate) schemas: HashMap<String, SchemaEntry>,
    pub(crate) schema_names: HashMap<u32, String>,
    pub(crate) tables: HashMap<u64, TableRecord>,
    pub(crate) shards: BTreeMap<u32, ShardRecord>,
    pub(crate) nodes: BTreeMap<String, NodeRecord>,
}

impl Topology {
    fn schema_of(&self, table: &TableRecord) -> Option<&SchemaRecord> {
        self.schema_names
            .get(&table.schema_id)
            .and_then(|name| self.schemas.get(name))
            .map(|entry| &entry.record)
    }

    /// Shard a new table from `node` lands on: the shard `node` leads with
    /// the fewest tables, else the emptiest shard of the cluster.
    fn pick_shard_for(&self, node: &str) -> Option<u32> {
        let emptiest = |shard: &&ShardRecord| (shard.table_ids.len(), shard.id);
        self.shards
            .values()
            .filter(|s| s.leader() == Some(node))
            .min_by_key(emptiest)
            .or_else(|| self.shards.values().min_by_key(emptiest))
            .map(|s| s.id)
    }
}

/// Raw records behind a [`ShardTables`](crate::meta::ShardTables) view
#[derive(Debug, Clone)]
pub struct ShardTableRecords {
    pub role: ShardRole,
    pub version: u64,
    pub tables: Vec<(SchemaRecord, TableRecord)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub lease: u32,
    pub last_seen: u64,
    pub lease_expired: bool,
    pub shard_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub id: u32,
    pub version: u64,
    pub replicas: Vec<ShardReplica>,
    pub table_count: usize,
}

/// Read-only snapshot of a cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopology {
    pub cluster: ClusterRecord,
    pub schema_count: usize,
    pub table_count: usize,
    pub nodes: Vec<NodeStatus>,
    pub shards: Vec<ShardStatus>,
}

pub struct Cluster {
    meta: ClusterRecord,
    storage: MetaStorage,
    schema_ids: IdAllocator,
    table_ids: Arc<IdAllocator>,
    streams: HeartbeatStreams,
    topology: Mutex<Topology>,
}

impl Cluster {
    pub fn new(
        meta: ClusterRecord,
        storage: MetaStorage,
        table_ids: Arc<IdAllocator>,
        streams: HeartbeatStreams,
        id_alloc_step: u64,
    ) -> Self {
        let schema_ids =
            IdAllocator::new(storage.clone(), schema_namespace(&meta.name), id_alloc_step);
        Self {
            meta,
            storage,
            schema_ids,
            table_ids,
            streams,
            topology: Mutex::new(Topology::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &ClusterRecord {
        &self.meta
    }

    pub(crate) fn storage(&self) -> &MetaStorage {
        &self.storage
    }

    pub(crate) fn streams(&self) -> &HeartbeatStreams {
        &self.streams
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Topology>> {
        Ok(self.topology.lock()?)
    }

    /// Shard placement engine for this cluster
    pub fn coordinator(&self) -> Coordinator<'_> {
        Coordinator::new(self)
    }

    /// Persist `shard_total` unassigned shards at version zero
    pub fn init(&self) -> Result<()> {
        for shard_id in 0..self.meta.shard_total {
            self.storage
                .put_shard(self.meta.id, &ShardRecord::new(shard_id))
                .with_context(|| format!("cluster {} init shard {}", self.meta.name, shard_id))?;
        }
        info!(
            cluster = %self.meta.name,
            shard_total = self.meta.shard_total,
            "Initialized shards"
        );
        Ok(())
    }

    /// Rebuild the in-memory topology from storage
    pub fn load(&self) -> Result<()> {
        let id = self.meta.id;
        let ctx = || format!("cluster {} load", self.meta.name);
        let schemas = self.storage.list_schemas(id).with_context(ctx)?;
        let tables = self.storage.list_tables(id).with_context(ctx)?;
        let shards = self.storage.list_shards(id).with_context(ctx)?;
        let nodes = self.storage.list_nodes(id).with_context(ctx)?;

        let mut topology = Topology::default();
        let mut repaired = BTreeSet::new();

        for schema in schemas {
            topology.schema_names.insert(schema.id, schema.name.clone());
            topology.schemas.insert(
                schema.name.clone(),
                SchemaEntry {
                    record: schema,
                    tables: HashMap::new(),
                },
            );
        }

        for shard in shards {
            topology.shards.insert(shard.id, shard);
        }

        // Shards missing here come from an init that failed after the
        // cluster record was written.
        for shard_id in 0..self.meta.shard_total {
            if !topology.shards.contains_key(&shard_id) {
                let shard = ShardRecord::new(shard_id);
                self.storage.put_shard(id, &shard).with_context(ctx)?;
                warn!(cluster = %self.meta.name, shard_id, "Recreated missing shard");
                topology.shards.insert(shard_id, shard);
            }
        }

        for table in tables {
            let schema_name = topology.schema_names.get(&table.schema_id).ok_or_else(|| {
                Error::MetadataCorrupted(format!(
                    "table {} references unknown schema {}",
                    table.id, table.schema_id
                ))
            })?;
            if let Some(entry) = topology.schemas.get_mut(schema_name) {
                entry.tables.insert(table.name.clone(), table.id);
            }
            if let Some(shard) = topology.shards.get_mut(&table.shard_id) {
                if shard.table_ids.insert(table.id) {
                    warn!(
                        cluster = %self.meta.name,
                        table_id = table.id,
                        shard_id = table.shard_id,
                        "Restored table missing from its shard"
                    );
                    repaired.insert(table.shard_id);
                }
            }
            topology.tables.insert(table.id, table);
        }

        for shard in topology.shards.values_mut() {
            let tables = &topology.tables;
            let before = shard.table_ids.len();
            shard.table_ids.retain(|table_id| tables.contains_key(table_id));
            if shard.table_ids.len() != before {
                warn!(
                    cluster = %self.meta.name,
                    shard_id = shard.id,
                    dropped = before - shard.table_ids.len(),
                    "Pruned dropped tables from shard"
                );
                repaired.insert(shard.id);
            }
        }

        for shard_id in repaired {
            if let Some(shard) = topology.shards.get_mut(&shard_id) {
                shard.version += 1;
                self.storage.put_shard(id, shard).with_context(|| {
                    format!("cluster {} repair shard {}", self.meta.name, shard_id)
                })?;
            }
        }

        for node in nodes {
            topology.nodes.insert(node.name.clone(), node);
        }

        info!(
            cluster = %self.meta.name,
            schemas = topology.schemas.len(),
            tables = topology.tables.len(),
            shards = topology.shards.len(),
            nodes = topology.nodes.len(),
            "Loaded cluster"
        );

        *self.lock()? = topology;
        Ok(())
    }

    pub fn get_or_create_schema(&self, name: &str) -> Result<SchemaRecord> {
        validate_name("schema", name)?;
        let mut topology = self.lock()?;
        self.get_or_create_schema_locked(&mut topology, name)
            .with_context(|| format!("cluster {} schema {}", self.meta.name, name))
    }

    fn get_or_create_schema_locked(
        &self,
        topology: &mut Topology,
        name: &str,
    ) -> Result<SchemaRecord> {
        if let Some(entry) = topology.schemas.get(name) {
            return Ok(entry.record.clone());
        }

        let record = SchemaRecord {
            id: self.schema_ids.alloc_u32()?,
            name: name.to_string(),
            cluster_id: self.meta.id,
            created_at: timestamp_now(),
        };
        self.storage.put_schema(&record)?;

        topology.schema_names.insert(record.id, name.to_string());
        topology.schemas.insert(
            name.to_string(),
            SchemaEntry {
                record: record.clone(),
                tables: HashMap::new(),
            },
        );

        info!(
            cluster = %self.meta.name,
            schema = name,
            schema_id = record.id,
            "Created schema"
        );
        Ok(record)
    }

    /// Return the table, creating it (and its schema) on first reference
    pub fn get_or_create_table(&self, node: &str, schema: &str, table: &str) -> Result<TableRecord> {
        validate_name("schema", schema)?;
        validate_name("table", table)?;
        validate_name("node", node)?;

        let mut topology = self.lock()?;
        self.get_or_create_table_locked(&mut topology, node, schema, table)
            .with_context(|| {
                format!(
                    "cluster {} table {}.{} node {}",
                    self.meta.name, schema, table, node
                )
            })
    }

    fn get_or_create_table_locked(
        &self,
        topology: &mut Topology,
        node: &str,
        schema: &str,
        table: &str,
    ) -> Result<TableRecord> {
        let schema = self.get_or_create_schema_locked(topology, schema)?;

        let existing = topology
            .schemas
            .get(&schema.name)
            .and_then(|entry| entry.tables.get(table))
            .and_then(|table_id| topology.tables.get(table_id));
        if let Some(existing) = existing.cloned() {
            // a previous attempt may have failed before the shard write
            self.attach_table(topology, &existing)?;
            return Ok(existing);
        }

        let shard_id = topology
            .pick_shard_for(node)
            .ok_or_else(|| Error::NotFound(format!("shards of cluster {}", self.meta.name)))?;

        let record = TableRecord {
            id: self.table_ids.alloc()?,
            name: table.to_string(),
            schema_id: schema.id,
            shard_id,
            owner_node: node.to_string(),
            created_at: timestamp_now(),
        };
        self.storage.put_table(self.meta.id, &record)?;

        topology.tables.insert(record.id, record.clone());
        if let Some(entry) = topology.schemas.get_mut(&schema.name) {
            entry.tables.insert(table.to_string(), record.id);
        }

        self.attach_table(topology, &record)?;

        info!(
            cluster = %self.meta.name,
            schema = %schema.name,
            table,
            table_id = record.id,
            shard_id,
            node,
            "Created table"
        );
        Ok(record)
    }

    /// Add `table` to its shard's table set, bumping the shard version.
    /// The cache only changes once the shard is persisted.
    fn attach_table(&self, topology: &mut Topology, table: &TableRecord) -> Result<()> {
        let Some(shard) = topology.shards.get(&table.shard_id) else {
            return Ok(());
        };
        if shard.table_ids.contains(&table.id) {
            return Ok(());
        }

        let mut next = shard.clone();
        next.table_ids.insert(table.id);
        next.version += 1;
        self.storage
            .put_shard(self.meta.id, &next)
            .with_context(|| format!("add table {} to shard {}", table.id, table.shard_id))?;
        topology.shards.insert(table.shard_id, next);
        Ok(())
    }

    /// Tables of the requested shards that `node` hosts. Unknown shard ids
    /// and shards without a replica on `node` are left out.
    pub fn get_tables(
        &self,
        shard_ids: &[u32],
        node: &str,
    ) -> Result<HashMap<u32, ShardTableRecords>> {
        let topology = self.lock()?;
        if !topology.nodes.contains_key(node) {
            return Err(Error::NotFound(format!(
                "node {} in cluster {}",
                node, self.meta.name
            )));
        }

        let mut result = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let Some(shard) = topology.shards.get(shard_id) else {
                debug!(cluster = %self.meta.name, shard_id, "Skipping unknown shard");
                continue;
            };
            let Some(role) = shard.role_of(node) else {
                continue;
            };

            let tables = shard
                .table_ids
                .iter()
                .filter_map(|table_id| topology.tables.get(table_id))
                .filter_map(|table| {
                    topology
                        .schema_of(table)
                        .map(|schema| (schema.clone(), table.clone()))
                })
                .collect();

            result.insert(
                *shard_id,
                ShardTableRecords {
                    role,
                    version: shard.version,
                    tables,
                },
            );
        }

        Ok(result)
    }

    pub fn drop_table(&self, schema: &str, table: &str, table_id: u64) -> Result<()> {
        let mut topology = self.lock()?;

        let current = topology
            .schemas
            .get(schema)
            .ok_or_else(|| {
                Error::NotFound(format!("schema {} in cluster {}", schema, self.meta.name))
            })?
            .tables
            .get(table)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", schema, table)))?;
        if current != table_id {
            return Err(Error::NotFound(format!(
                "table {}.{} with id {} (current id {})",
                schema, table, table_id, current
            )));
        }

        let shard_id = topology
            .tables
            .get(&table_id)
            .map(|t| t.shard_id)
            .ok_or_else(|| Error::MetadataCorrupted(format!("table {} not cached", table_id)))?;

        self.storage.delete_table(self.meta.id, table_id)?;
        topology.tables.remove(&table_id);
        if let Some(entry) = topology.schemas.get_mut(schema) {
            entry.tables.remove(table);
        }

        if let Some(shard) = topology.shards.get(&shard_id) {
            let mut next = shard.clone();
            if next.table_ids.remove(&table_id) {
                next.version += 1;
                self.storage
                    .put_shard(self.meta.id, &next)
                    .with_context(|| format!("remove table {} from shard {}", table_id, shard_id))?;
                topology.shards.insert(shard_id, next);
            }
        }

        info!(
            cluster = %self.meta.name,
            schema,
            table,
            table_id,
            shard_id,
            "Dropped table"
        );
        Ok(())
    }

    /// Upsert the node with a fresh lease
    pub fn register_node(&self, node: &str, lease: u32) -> Result<NodeRecord> {
        validate_name("node", node)?;
        let mut topology = self.lock()?;

        let now = timestamp_now();
        let record = match topology.nodes.get(node) {
            Some(existing) => NodeRecord {
                lease,
                last_seen: now,
                ..existing.clone()
            },
            None => NodeRecord {
                name: node.to_string(),
                lease,
                last_seen: now,
                registered_at: now,
            },
        };
        self.storage
            .put_node(self.meta.id, &record)
            .with_context(|| format!("cluster {} register node {}", self.meta.name, node))?;

        if topology.nodes.insert(node.to_string(), record.clone()).is_none() {
            info!(cluster = %self.meta.name, node, lease, "New node registered");
        } else {
            debug!(cluster = %self.meta.name, node, lease, "Node lease refreshed");
        }
        Ok(record)
    }

    /// Shard ids (ascending) on which `node` holds a replica
    pub fn get_shard_ids(&self, node: &str) -> Result<Vec<u32>> {
        let topology = self.lock()?;
        if !topology.nodes.contains_key(node) {
            return Err(Error::NotFound(format!(
                "node {} in cluster {}",
                node, self.meta.name
            )));
        }
        Ok(topology
            .shards
            .values()
            .filter(|s| s.hosts(node))
            .map(|s| s.id)
            .collect())
    }

    pub fn topology(&self) -> Result<ClusterTopology> {
        let topology = self.lock()?;
        let now = timestamp_now();

        let nodes = topology
            .nodes
            .values()
            .map(|n| NodeStatus {
                name: n.name.clone(),
                lease: n.lease,
                last_seen: n.last_seen,
                lease_expired: n.lease_expired(now),
                shard_count: topology.shards.values().filter(|s| s.hosts(&n.name)).count(),
            })
            .collect();

        let shards = topology
            .shards
            .values()
            .map(|s| ShardStatus {
                id: s.id,
                version: s.version,
                replicas: s.replicas.clone(),
                table_count: s.table_ids.len(),
            })
            .collect();

        Ok(ClusterTopology {
            cluster: self.meta.clone(),
            schema_count: topology.schemas.len(),
            table_count: topology.tables.len(),
            nodes,
            shards,
        })
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("meta", &self.meta).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use crate::meta::id::TABLE_ID_NAMESPACE;
    use crate::storage::{KvBackend, MemBackend};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn new_cluster(storage: &MetaStorage, shard_total: u32) -> Cluster {
        let meta = ClusterRecord {
            id: 1,
            name: "db1".into(),
            min_node_count: 1,
            replication_factor: 1,
            shard_total,
            created_at: 0,
        };
        let table_ids = Arc::new(IdAllocator::new(storage.clone(), TABLE_ID_NAMESPACE, 10));
        let cluster = Cluster::new(meta, storage.clone(), table_ids, HeartbeatStreams::default(), 10);
        cluster.init().unwrap();
        cluster.load().unwrap();
        cluster
    }

    #[test]
    fn test_init_creates_unassigned_shards() {
        let storage = MetaStorage::memory();
        let cluster = new_cluster(&storage, 4);
        let topology = cluster.topology().unwrap();
        assert_eq!(topology.shards.len(), 4);
        assert!(topology
            .shards
            .iter()
            .all(|s| s.version == 0 && s.replicas.is_empty()));
    }

    #[test]
    fn test_schema_get_or_create_is_idempotent() {
        let cluster = new_cluster(&MetaStorage::memory(), 2);
        let a = cluster.get_or_create_schema("public").unwrap();
        let b = cluster.get_or_create_schema("public").unwrap();
        let c = cluster.get_or_create_schema("audit").unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(a, b);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_table_lands_on_emptiest_shard_and_bumps_version() {
        let cluster = new_cluster(&MetaStorage::memory(), 2);
        let t1 = cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        let t2 = cluster.get_or_create_table("node-1", "public", "t2").unwrap();
        assert_eq!(t1.shard_id, 0);
        assert_eq!(t2.shard_id, 1);

        let again = cluster.get_or_create_table("node-2", "public", "t1").unwrap();
        assert_eq!(again, t1);

        let topology = cluster.topology().unwrap();
        assert_eq!(topology.shards[0].version, 1);
        assert_eq!(topology.shards[0].table_count, 1);
    }

    #[test]
    fn test_table_prefers_shard_led_by_node() {
        let cluster = new_cluster(&MetaStorage::memory(), 3);
        cluster.register_node("node-1", 30).unwrap();
        cluster.coordinator().scatter().unwrap();

        // single node, single replica: node-1 leads everything
        let t = cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        assert_eq!(t.shard_id, 0);
        let t = cluster.get_or_create_table("node-1", "public", "t2").unwrap();
        assert_eq!(t.shard_id, 1);
    }

    #[test]
    fn test_get_tables_filters_by_node() {
        let cluster = new_cluster(&MetaStorage::memory(), 2);
        cluster.register_node("node-1", 30).unwrap();
        cluster.register_node("node-2", 30).unwrap();
        cluster.coordinator().scatter().unwrap();
        let t = cluster.get_or_create_table("node-1", "public", "t1").unwrap();

        let tables = cluster.get_tables(&[0, 1, 99], "node-1").unwrap();
        assert_eq!(tables.len(), 1);
        let view = &tables[&t.shard_id];
        assert_eq!(view.role, ShardRole::Leader);
        assert_eq!(view.tables.len(), 1);
        assert_eq!(view.tables[0].0.name, "public");
        assert_eq!(view.tables[0].1.name, "t1");

        let err = cluster.get_tables(&[0], "node-9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_drop_table() {
        let cluster = new_cluster(&MetaStorage::memory(), 1);
        let t = cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        let before = cluster.topology().unwrap().shards[0].version;

        let err = cluster.drop_table("public", "t1", t.id + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = cluster.drop_table("nope", "t1", t.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        cluster.drop_table("public", "t1", t.id).unwrap();
        let after = cluster.topology().unwrap();
        assert!(after.shards[0].version > before);
        assert_eq!(after.shards[0].table_count, 0);
        assert_eq!(after.table_count, 0);

        // recreated table gets a fresh id
        let t2 = cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        assert!(t2.id > t.id);
    }

    #[test]
    fn test_register_node_refreshes_lease() {
        let cluster = new_cluster(&MetaStorage::memory(), 1);
        let first = cluster.register_node("node-1", 10).unwrap();
        let second = cluster.register_node("node-1", 60).unwrap();
        assert_eq!(second.lease, 60);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(cluster.topology().unwrap().nodes.len(), 1);

        let err = cluster.register_node("", 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_get_shard_ids_unknown_node() {
        let cluster = new_cluster(&MetaStorage::memory(), 1);
        let err = cluster.get_shard_ids("node-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        cluster.register_node("node-1", 10).unwrap();
        assert!(cluster.get_shard_ids("node-1").unwrap().is_empty());
    }

    #[test]
    fn test_load_restores_state_and_reconciles_shards() {
        let storage = MetaStorage::memory();
        let t = {
            let cluster = new_cluster(&storage, 2);
            cluster.register_node("node-1", 30).unwrap();
            cluster.get_or_create_table("node-1", "public", "t1").unwrap()
        };

        // Simulate a crash after the table write but before its shard write,
        // plus a drop that deleted table 99 but never reached the other shard
        let stored_shard = |shard_id: u32| {
            storage
                .list_shards(1)
                .unwrap()
                .into_iter()
                .find(|s| s.id == shard_id)
                .unwrap()
        };
        let other_id = 1 - t.shard_id;
        let mut shard = stored_shard(t.shard_id);
        shard.table_ids.clear();
        storage.put_shard(1, &shard).unwrap();
        let mut other = stored_shard(other_id);
        other.table_ids.insert(99);
        storage.put_shard(1, &other).unwrap();

        let table_ids = Arc::new(IdAllocator::new(storage.clone(), TABLE_ID_NAMESPACE, 10));
        let reloaded = Cluster::new(
            ClusterRecord {
                id: 1,
                name: "db1".into(),
                min_node_count: 1,
                replication_factor: 1,
                shard_total: 2,
                created_at: 0,
            },
            storage.clone(),
            table_ids,
            HeartbeatStreams::default(),
            10,
        );
        reloaded.load().unwrap();

        // the repair is persisted with a version bump
        let repaired = stored_shard(t.shard_id);
        assert!(repaired.table_ids.contains(&t.id));
        assert_eq!(repaired.version, shard.version + 1);
        let pruned = stored_shard(other_id);
        assert!(pruned.table_ids.is_empty());
        assert_eq!(pruned.version, other.version + 1);

        let again = reloaded.get_or_create_table("node-1", "public", "t1").unwrap();
        assert_eq!(again.id, t.id);
        let topology = reloaded.topology().unwrap();
        assert_eq!(topology.shards[t.shard_id as usize].table_count, 1);
        assert_eq!(topology.nodes.len(), 1);
    }

    /// Backend whose shard writes fail while armed
    struct ShardWriteFailure {
        inner: MemBackend,
        armed: AtomicBool,
    }

    impl KvBackend for ShardWriteFailure {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.armed.load(Ordering::SeqCst) && key.contains("/shard/") {
                return Err(Error::Storage("injected shard write failure".into()));
            }
            self.inner.put(key, value)
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }
        fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }
        fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
            self.inner.compare_and_swap(key, expected, new)
        }
    }

    #[test]
    fn test_failed_shard_write_repaired_on_retry() {
        let backend = Arc::new(ShardWriteFailure {
            inner: MemBackend::new(),
            armed: AtomicBool::new(false),
        });
        let storage = MetaStorage::new(backend.clone());
        let cluster = new_cluster(&storage, 1);
        cluster.register_node("node-1", 30).unwrap();
        cluster.coordinator().scatter().unwrap();

        backend.armed.store(true, Ordering::SeqCst);
        let err = cluster.get_or_create_table("node-1", "public", "t1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(cluster.get_tables(&[0], "node-1").unwrap()[&0].tables.is_empty());

        backend.armed.store(false, Ordering::SeqCst);
        let t = cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        let tables = cluster.get_tables(&[0], "node-1").unwrap();
        assert_eq!(tables[&0].tables.len(), 1);
        assert_eq!(tables[&0].tables[0].1.id, t.id);

        let stored = storage.list_shards(1).unwrap();
        assert!(stored[0].table_ids.contains(&t.id));

        // a second retry leaves the shard untouched
        let version = stored[0].version;
        cluster.get_or_create_table("node-1", "public", "t1").unwrap();
        assert_eq!(storage.list_shards(1).unwrap()[0].version, version);
    }
}
