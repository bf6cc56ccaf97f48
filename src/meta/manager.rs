//! Process-wide cluster registry
//!
//! [`ClusterManager`] owns every loaded [`Cluster`] and routes administrative
//! calls to it. Lookups take the registry read lock; only cluster creation
//! takes the write lock, so work on existing clusters never waits on a
//! creation in progress beyond the map lookup.

use crate::common::{timestamp_now, validate_name, Error, ManagerConfig, Result, ResultExt};
use crate::meta::cluster::{Cluster, ClusterTopology};
use crate::meta::coordinator::ScatterReport;
use crate::meta::heartbeat::HeartbeatStreams;
use crate::meta::id::{IdAllocator, CLUSTER_ID_NAMESPACE, TABLE_ID_NAMESPACE};
use crate::storage::{ClusterRecord, MetaStorage, NodeRecord, ShardRole, TableRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Flattened table description handed to storage nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: u64,
    pub name: String,
    pub schema_id: u32,
    pub schema_name: String,
}

/// Tables of one shard as seen by one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTables {
    pub shard_id: u32,
    pub role: ShardRole,
    pub version: u64,
    /// Ordered by table id
    pub tables: Vec<TableInfo>,
}

/// Administrative surface of the metadata service
pub trait Manager: Send + Sync {
    fn create_cluster(
        &self,
        name: &str,
        node_count: u32,
        replication_factor: u32,
        shard_total: u32,
    ) -> Result<Arc<Cluster>>;

    fn alloc_schema_id(&self, cluster: &str, schema: &str) -> Result<u32>;

    fn alloc_table_id(
        &self,
        cluster: &str,
        schema: &str,
        table: &str,
        node: &str,
    ) -> Result<TableRecord>;

    fn get_tables(
        &self,
        cluster: &str,
        node: &str,
        shard_ids: &[u32],
    ) -> Result<HashMap<u32, ShardTables>>;

    fn drop_table(&self, cluster: &str, schema: &str, table: &str, table_id: u64) -> Result<()>;

    /// Register the node and place shards before returning
    fn register_node(&self, cluster: &str, node: &str, lease: u32) -> Result<()>;

    /// Persist the node registration without running placement
    fn register_node_only(&self, cluster: &str, node: &str, lease: u32) -> Result<NodeRecord>;

    fn scatter_shards(&self, cluster: &str) -> Result<ScatterReport>;

    fn get_shards(&self, cluster: &str, node: &str) -> Result<Vec<u32>>;

    fn list_clusters(&self) -> Result<Vec<ClusterRecord>>;

    fn describe_cluster(&self, cluster: &str) -> Result<ClusterTopology>;
}

pub struct ClusterManager {
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    storage: MetaStorage,
    cluster_ids: IdAllocator,
    table_ids: Arc<IdAllocator>,
    streams: HeartbeatStreams,
    id_alloc_step: u64,
}

impl ClusterManager {
    /// Build the manager and load every cluster found in storage
    pub fn open(
        storage: MetaStorage,
        streams: HeartbeatStreams,
        config: &ManagerConfig,
    ) -> Result<Self> {
        let step = config.id_alloc_step;
        let manager = Self {
            clusters: RwLock::new(HashMap::new()),
            cluster_ids: IdAllocator::new(storage.clone(), CLUSTER_ID_NAMESPACE, step),
            table_ids: Arc::new(IdAllocator::new(storage.clone(), TABLE_ID_NAMESPACE, step)),
            storage,
            streams,
            id_alloc_step: step,
        };
        manager.load_clusters()?;
        Ok(manager)
    }

    fn load_clusters(&self) -> Result<()> {
        let released = self
            .storage
            .prune_cluster_names()
            .context("clusters manager prune cluster names")?;
        if !released.is_empty() {
            warn!(names = ?released, "Released cluster names left by an interrupted create");
        }

        let records = self
            .storage
            .list_clusters()
            .context("clusters manager list clusters")?;

        let mut clusters = self.clusters.write()?;
        for record in records {
            let name = record.name.clone();
            let cluster = self.new_cluster(record);
            cluster
                .load()
                .with_context(|| format!("clusters manager load cluster {}", name))?;
            clusters.insert(name, Arc::new(cluster));
        }

        info!(clusters = clusters.len(), "Loaded clusters");
        Ok(())
    }

    fn new_cluster(&self, record: ClusterRecord) -> Cluster {
        Cluster::new(
            record,
            self.storage.clone(),
            self.table_ids.clone(),
            self.streams.clone(),
            self.id_alloc_step,
        )
    }

    /// Handle of a loaded cluster
    pub fn get_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cluster {}", name)))
    }
}

fn check_create_args(node_count: u32, replication_factor: u32, shard_total: u32) -> Result<()> {
    if node_count < 1 {
        return Err(Error::Validation("node count must be at least 1".into()));
    }
    if replication_factor < 1 {
        return Err(Error::Validation(
            "replication factor must be at least 1".into(),
        ));
    }
    if shard_total < 1 {
        return Err(Error::Validation("shard total must be at least 1".into()));
    }
    Ok(())
}

impl Manager for ClusterManager {
    fn create_cluster(
        &self,
        name: &str,
        node_count: u32,
        replication_factor: u32,
        shard_total: u32,
    ) -> Result<Arc<Cluster>> {
        let ctx = || format!("clusters manager create cluster {}", name);
        validate_name("cluster", name).with_context(ctx)?;
        check_create_args(node_count, replication_factor, shard_total).with_context(ctx)?;

        let mut clusters = self.clusters.write()?;
        if clusters.contains_key(name) {
            return Err(Error::AlreadyExists(format!("cluster {}", name)).context(ctx()));
        }

        let record = ClusterRecord {
            id: self.cluster_ids.alloc_u32().with_context(ctx)?,
            name: name.to_string(),
            min_node_count: node_count,
            replication_factor,
            shard_total,
            created_at: timestamp_now(),
        };
        let record = self.storage.create_cluster(&record).with_context(ctx)?;

        // A failure past this point leaves the record in storage without a
        // registry entry; the next startup load completes it.
        let cluster = self.new_cluster(record);
        if let Err(e) = cluster.init().and_then(|_| cluster.load()) {
            warn!(cluster = name, error = %e, "Cluster persisted but not initialized");
            return Err(e.context(ctx()));
        }

        let cluster = Arc::new(cluster);
        clusters.insert(name.to_string(), cluster.clone());

        info!(
            cluster = name,
            cluster_id = cluster.id(),
            min_node_count = node_count,
            replication_factor,
            shard_total,
            "Created cluster"
        );
        Ok(cluster)
    }

    fn alloc_schema_id(&self, cluster: &str, schema: &str) -> Result<u32> {
        let ctx = || format!("clusters manager alloc schema id, cluster:{}, schema:{}", cluster, schema);
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        let schema = cluster.get_or_create_schema(schema).with_context(ctx)?;
        Ok(schema.id)
    }

    fn alloc_table_id(
        &self,
        cluster: &str,
        schema: &str,
        table: &str,
        node: &str,
    ) -> Result<TableRecord> {
        let ctx = || {
            format!(
                "clusters manager alloc table id, cluster:{}, schema:{}, table:{}, node:{}",
                cluster, schema, table, node
            )
        };
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        cluster
            .get_or_create_table(node, schema, table)
            .with_context(ctx)
    }

    fn get_tables(
        &self,
        cluster: &str,
        node: &str,
        shard_ids: &[u32],
    ) -> Result<HashMap<u32, ShardTables>> {
        let ctx = || {
            format!(
                "clusters manager get tables, cluster:{}, node:{}, shards:{:?}",
                cluster, node, shard_ids
            )
        };
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        let views = cluster.get_tables(shard_ids, node).with_context(ctx)?;

        Ok(views
            .into_iter()
            .map(|(shard_id, view)| {
                let tables = view
                    .tables
                    .into_iter()
                    .map(|(schema, table)| TableInfo {
                        id: table.id,
                        name: table.name,
                        schema_id: schema.id,
                        schema_name: schema.name,
                    })
                    .collect();
                (
                    shard_id,
                    ShardTables {
                        shard_id,
                        role: view.role,
                        version: view.version,
                        tables,
                    },
                )
            })
            .collect())
    }

    fn drop_table(&self, cluster: &str, schema: &str, table: &str, table_id: u64) -> Result<()> {
        let ctx = || {
            format!(
                "clusters manager drop table, cluster:{}, schema:{}, table:{}, id:{}",
                cluster, schema, table, table_id
            )
        };
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        cluster.drop_table(schema, table, table_id).with_context(ctx)
    }

    fn register_node(&self, cluster: &str, node: &str, lease: u32) -> Result<()> {
        self.register_node_only(cluster, node, lease)?;
        self.scatter_shards(cluster)
            .with_context(|| format!("clusters manager register node {}", node))?;
        Ok(())
    }

    fn register_node_only(&self, cluster: &str, node: &str, lease: u32) -> Result<NodeRecord> {
        let ctx = || format!("clusters manager register node, cluster:{}, node:{}", cluster, node);
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        cluster.register_node(node, lease).with_context(ctx)
    }

    fn scatter_shards(&self, cluster: &str) -> Result<ScatterReport> {
        let ctx = || format!("clusters manager scatter shards, cluster:{}", cluster);
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        let report = cluster.coordinator().scatter().with_context(ctx)?;
        Ok(report)
    }

    fn get_shards(&self, cluster: &str, node: &str) -> Result<Vec<u32>> {
        let ctx = || format!("clusters manager get shards, cluster:{}, node:{}", cluster, node);
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        cluster.get_shard_ids(node).with_context(ctx)
    }

    fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        let clusters = self.clusters.read()?;
        let mut records: Vec<_> = clusters.values().map(|c| c.meta().clone()).collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn describe_cluster(&self, cluster: &str) -> Result<ClusterTopology> {
        let ctx = || format!("clusters manager describe cluster {}", cluster);
        let cluster = self.get_cluster(cluster).with_context(ctx)?;
        cluster.topology().with_context(ctx)
    }
}
