//! Typed metadata store over a [`KvBackend`]
//!
//! Key layout (values are bincode):
//!
//! ```text
//! /cluster/{cluster_id}                    -> ClusterRecord
//! /cluster_name/{name}                     -> cluster id (u32 LE)
//! /id/{namespace}                          -> allocator counter end (u64 LE)
//! /c/{cluster_id}/schema/{schema_id}       -> SchemaRecord
//! /c/{cluster_id}/table/{table_id}         -> TableRecord
//! /c/{cluster_id}/shard/{shard_id}         -> ShardRecord
//! /c/{cluster_id}/node/{node_name}         -> NodeRecord
//! ```
//!
//! Numeric ids are zero-padded so prefix scans return them in id order.

use super::records::{ClusterRecord, NodeRecord, SchemaRecord, ShardRecord, TableRecord};
use super::{KvBackend, MemBackend, RocksBackend};
use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const CLUSTER_PREFIX: &str = "/cluster/";
const CLUSTER_NAME_PREFIX: &str = "/cluster_name/";
const COUNTER_PREFIX: &str = "/id/";

fn cluster_key(cluster_id: u32) -> String {
    format!("{}{:010}", CLUSTER_PREFIX, cluster_id)
}

fn cluster_name_key(name: &str) -> String {
    format!("{}{}", CLUSTER_NAME_PREFIX, name)
}

fn counter_key(namespace: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, namespace)
}

fn scoped_prefix(cluster_id: u32, kind: &str) -> String {
    format!("/c/{:010}/{}/", cluster_id, kind)
}

fn schema_key(cluster_id: u32, schema_id: u32) -> String {
    format!("{}{:010}", scoped_prefix(cluster_id, "schema"), schema_id)
}

fn table_key(cluster_id: u32, table_id: u64) -> String {
    format!("{}{:020}", scoped_prefix(cluster_id, "table"), table_id)
}

fn shard_key(cluster_id: u32, shard_id: u32) -> String {
    format!("{}{:010}", scoped_prefix(cluster_id, "shard"), shard_id)
}

fn node_key(cluster_id: u32, node: &str) -> String {
    format!("{}{}", scoped_prefix(cluster_id, "node"), node)
}

/// Metadata store
#[derive(Clone)]
pub struct MetaStorage {
    backend: Arc<dyn KvBackend>,
}

impl MetaStorage {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Ephemeral in-memory store
    pub fn memory() -> Self {
        Self::new(Arc::new(MemBackend::new()))
    }

    /// Open or create a RocksDB-backed store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(RocksBackend::open(path)?)))
    }

    fn put_record<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let value = bincode::serialize(record)?;
        self.backend.put(key, &value)
    }

    fn scan_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, value)| {
                bincode::deserialize(&value)
                    .map_err(|e| Error::MetadataCorrupted(format!("{}: {}", key, e)))
            })
            .collect()
    }

    // === Cluster operations ===

    pub fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        self.scan_records(CLUSTER_PREFIX)
    }

    /// Persist a new cluster record. Fails with `AlreadyExists` if the id or
    /// the name is already taken. The name is claimed first and released
    /// again if the record cannot be written.
    pub fn create_cluster(&self, record: &ClusterRecord) -> Result<ClusterRecord> {
        let key = cluster_key(record.id);
        if self.backend.get(&key)?.is_some() {
            return Err(Error::AlreadyExists(format!("cluster id {}", record.id)));
        }

        let name_key = cluster_name_key(&record.name);
        let claimed = self
            .backend
            .compare_and_swap(&name_key, None, &record.id.to_le_bytes())?;
        if !claimed {
            return Err(Error::AlreadyExists(format!("cluster {}", record.name)));
        }

        if let Err(e) = self.put_record(&key, record) {
            if let Err(undo) = self.backend.delete(&name_key) {
                warn!(
                    cluster = %record.name,
                    error = %undo,
                    "Failed to release cluster name claim"
                );
            }
            return Err(e);
        }
        Ok(record.clone())
    }

    /// Drop name claims left without a matching cluster record by a crash
    /// between the claim and the record write. Returns the released names.
    /// Must run before any cluster is created in this process.
    pub fn prune_cluster_names(&self) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for (key, value) in self.backend.scan_prefix(CLUSTER_NAME_PREFIX)? {
            let name = key.strip_prefix(CLUSTER_NAME_PREFIX).unwrap_or(&key);
            let owner = match <[u8; 4]>::try_from(value.as_slice()) {
                Ok(raw) => self.backend.get(&cluster_key(u32::from_le_bytes(raw)))?,
                Err(_) => None,
            };
            let owned = match owner {
                // a corrupted record is reported by list_clusters, keep its claim
                Some(bytes) => bincode::deserialize::<ClusterRecord>(&bytes)
                    .map(|record| record.name == name)
                    .unwrap_or(true),
                None => false,
            };
            if !owned {
                self.backend.delete(&key)?;
                warn!(cluster = name, "Released cluster name without a record");
                released.push(name.to_string());
            }
        }
        Ok(released)
    }

    // === Schema operations ===

    pub fn put_schema(&self, schema: &SchemaRecord) -> Result<()> {
        self.put_record(&schema_key(schema.cluster_id, schema.id), schema)
    }

    pub fn list_schemas(&self, cluster_id: u32) -> Result<Vec<SchemaRecord>> {
        self.scan_records(&scoped_prefix(cluster_id, "schema"))
    }

    // === Table operations ===

    pub fn put_table(&self, cluster_id: u32, table: &TableRecord) -> Result<()> {
        self.put_record(&table_key(cluster_id, table.id), table)
    }

    pub fn delete_table(&self, cluster_id: u32, table_id: u64) -> Result<()> {
        self.backend.delete(&table_key(cluster_id, table_id))
    }

    pub fn list_tables(&self, cluster_id: u32) -> Result<Vec<TableRecord>> {
        self.scan_records(&scoped_prefix(cluster_id, "table"))
    }

    // === Shard operations ===

    pub fn put_shard(&self, cluster_id: u32, shard: &ShardRecord) -> Result<()> {
        self.put_record(&shard_key(cluster_id, shard.id), shard)
    }

    pub fn list_shards(&self, cluster_id: u32) -> Result<Vec<ShardRecord>> {
        self.scan_records(&scoped_prefix(cluster_id, "shard"))
    }

    // === Node operations ===

    pub fn put_node(&self, cluster_id: u32, node: &NodeRecord) -> Result<()> {
        self.put_record(&node_key(cluster_id, &node.name), node)
    }

    pub fn list_nodes(&self, cluster_id: u32) -> Result<Vec<NodeRecord>> {
        self.scan_records(&scoped_prefix(cluster_id, "node"))
    }

    // === Counter operations ===

    /// Current persisted end of an allocator namespace, if any
    pub fn load_counter(&self, namespace: &str) -> Result<Option<u64>> {
        match self.backend.get(&counter_key(namespace))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::MetadataCorrupted(format!(
                        "counter {} has {} bytes",
                        namespace,
                        bytes.len()
                    ))
                })?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Move a counter from `expected` to `new`; false if someone else moved it
    pub fn cas_counter(&self, namespace: &str, expected: Option<u64>, new: u64) -> Result<bool> {
        let expected = expected.map(u64::to_le_bytes);
        self.backend.compare_and_swap(
            &counter_key(namespace),
            expected.as_ref().map(|b| b.as_slice()),
            &new.to_le_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use crate::storage::{ShardReplica, ShardRole};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn cluster(id: u32, name: &str) -> ClusterRecord {
        ClusterRecord {
            id,
            name: name.to_string(),
            min_node_count: 3,
            replication_factor: 2,
            shard_total: 4,
            created_at: 1234567890,
        }
    }

    #[test]
    fn test_create_and_list_clusters() {
        let storage = MetaStorage::memory();
        storage.create_cluster(&cluster(1, "db1")).unwrap();
        storage.create_cluster(&cluster(2, "db2")).unwrap();

        let err = storage.create_cluster(&cluster(3, "db1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = storage.create_cluster(&cluster(2, "db9")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let clusters = storage.list_clusters().unwrap();
        let names: Vec<_> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["db1", "db2"]);
    }

    /// Backend whose cluster record writes fail while armed
    struct FailingRecordWrites {
        inner: MemBackend,
        armed: AtomicBool,
    }

    impl KvBackend for FailingRecordWrites {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.armed.load(Ordering::SeqCst) && key.starts_with(CLUSTER_PREFIX) {
                return Err(Error::Storage("injected record write failure".into()));
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
    fn test_failed_record_write_releases_name() {
        let backend = Arc::new(FailingRecordWrites {
            inner: MemBackend::new(),
            armed: AtomicBool::new(true),
        });
        let storage = MetaStorage::new(backend.clone());

        let err = storage.create_cluster(&cluster(1, "db1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(backend.get(&cluster_name_key("db1")).unwrap().is_none());

        backend.armed.store(false, Ordering::SeqCst);
        storage.create_cluster(&cluster(2, "db1")).unwrap();
        assert_eq!(storage.list_clusters().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_dangling_name_claims() {
        let storage = MetaStorage::memory();
        storage.create_cluster(&cluster(1, "db1")).unwrap();
        // claim left behind by a crash before the record write
        assert!(storage
            .backend
            .compare_and_swap(&cluster_name_key("db2"), None, &2u32.to_le_bytes())
            .unwrap());

        assert_eq!(storage.prune_cluster_names().unwrap(), vec!["db2".to_string()]);
        assert!(storage.prune_cluster_names().unwrap().is_empty());

        storage.create_cluster(&cluster(3, "db2")).unwrap();
        let err = storage.create_cluster(&cluster(4, "db1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_scoped_records_do_not_leak_between_clusters() {
        let storage = MetaStorage::memory();
        let mut shard = ShardRecord::new(0);
        shard.replicas.push(ShardReplica::leader("node-1"));
        storage.put_shard(1, &shard).unwrap();
        storage.put_shard(2, &ShardRecord::new(0)).unwrap();
        storage.put_shard(2, &ShardRecord::new(1)).unwrap();

        let shards = storage.list_shards(1).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].replicas[0].role, ShardRole::Leader);
        assert_eq!(storage.list_shards(2).unwrap().len(), 2);
    }

    #[test]
    fn test_tables_listed_in_id_order() {
        let storage = MetaStorage::memory();
        for id in [10u64, 2, 100] {
            let table = TableRecord {
                id,
                name: format!("t{}", id),
                schema_id: 1,
                shard_id: 0,
                owner_node: "node-1".into(),
                created_at: 0,
            };
            storage.put_table(1, &table).unwrap();
        }
        storage.delete_table(1, 10).unwrap();

        let ids: Vec<_> = storage
            .list_tables(1)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![2, 100]);
    }

    #[test]
    fn test_counter_cas() {
        let storage = MetaStorage::memory();
        assert_eq!(storage.load_counter("TableID").unwrap(), None);
        assert!(storage.cas_counter("TableID", None, 100).unwrap());
        assert!(!storage.cas_counter("TableID", None, 200).unwrap());
        assert!(storage.cas_counter("TableID", Some(100), 200).unwrap());
        assert_eq!(storage.load_counter("TableID").unwrap(), Some(200));
    }
}
