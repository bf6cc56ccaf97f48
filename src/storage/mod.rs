//! Durable metadata storage
//!
//! Two layers:
//! - [`KvBackend`]: an ordered byte store with prefix scans and a
//!   compare-and-swap primitive. Implemented over RocksDB for real
//!   deployments and over a `BTreeMap` for tests and ephemeral runs.
//! - [`MetaStorage`]: typed records (clusters, schemas, tables, shards,
//!   nodes, id counters) laid out under fixed key prefixes.

pub mod meta;
pub mod records;

pub use meta::MetaStorage;
pub use records::{
    ClusterRecord, NodeRecord, SchemaRecord, ShardRecord, ShardReplica, ShardRole, TableRecord,
};

use crate::common::{Error, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Trait for key-value storage backends
///
/// Keys are UTF-8 strings and iterate in byte order. Implementations must
/// give read-after-write consistency within one process.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically write `new` if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;
}

/// In-memory store
#[derive(Default)]
pub struct MemBackend {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.lock()?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let mut map = self.map.lock()?;
        if map.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        map.insert(key.to_string(), new.to_vec());
        Ok(true)
    }
}

/// RocksDB store
///
/// Writes are synced before returning. Compare-and-swap is serialized by a
/// process-local lock; RocksDB itself refuses a second process on the same
/// directory, so that lock covers every writer.
pub struct RocksBackend {
    db: DB,
    cas_lock: Mutex<()>,
}

impl RocksBackend {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)?;

        Ok(Self {
            db,
            cas_lock: Mutex::new(()),
        })
    }

    fn write_opts() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put_opt(key.as_bytes(), value, &Self::write_opts())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete_opt(key.as_bytes(), &Self::write_opts())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            if !key_bytes.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| Error::MetadataCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value_bytes.to_vec()));
        }

        Ok(entries)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        let _guard = self.cas_lock.lock()?;
        let current = self.db.get(key.as_bytes())?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.db.put_opt(key.as_bytes(), new, &Self::write_opts())?;
        Ok(true)
    }
}
