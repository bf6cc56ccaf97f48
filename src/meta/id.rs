//! Namespaced, crash-safe id allocation
//!
//! An allocator hands out ids from an in-memory range `(base, end]`. When the
//! range is exhausted it moves the durable counter from `end` to
//! `end + step` with a compare-and-swap and only then serves the new range,
//! so no id is ever handed out before the counter covering it is persisted.
//! A crash skips the unused rest of a range; ids are never reused.

use crate::common::{Error, Result, ResultExt};
use crate::storage::MetaStorage;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Namespace for cluster ids
pub const CLUSTER_ID_NAMESPACE: &str = "ClusterID";
/// Namespace for table ids (global across clusters)
pub const TABLE_ID_NAMESPACE: &str = "TableID";
/// Per-cluster schema namespace suffix
pub const SCHEMA_ID_SUFFIX: &str = "SchemaID";

/// Counter bumps attempted before giving up on a contended namespace
pub const MAX_CAS_RETRIES: usize = 8;

/// Schema namespace of one cluster
pub fn schema_namespace(cluster: &str) -> String {
    format!("{}/{}", cluster, SCHEMA_ID_SUFFIX)
}

#[derive(Debug, Default)]
struct IdRange {
    /// Last id handed out
    base: u64,
    /// Last id covered by the persisted counter
    end: u64,
}

pub struct IdAllocator {
    storage: MetaStorage,
    namespace: String,
    step: u64,
    range: Mutex<IdRange>,
}

impl IdAllocator {
    pub fn new(storage: MetaStorage, namespace: impl Into<String>, step: u64) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            step: step.max(1),
            range: Mutex::new(IdRange::default()),
        }
    }

    /// Allocate the next id in this namespace
    pub fn alloc(&self) -> Result<u64> {
        let mut range = self.range.lock()?;
        if range.base == range.end {
            self.rebase(&mut range)
                .with_context(|| format!("alloc id in namespace {}", self.namespace))?;
        }
        range.base += 1;
        Ok(range.base)
    }

    /// Allocate an id that must fit in 32 bits
    pub fn alloc_u32(&self) -> Result<u32> {
        let id = self.alloc()?;
        u32::try_from(id).map_err(|_| Error::Allocation {
            namespace: self.namespace.clone(),
            reason: format!("id {} exceeds u32 range", id),
        })
    }

    fn counter_error(&self, source: Error) -> Error {
        Error::CounterPersist {
            namespace: self.namespace.clone(),
            source: Box::new(source),
        }
    }

    fn rebase(&self, range: &mut IdRange) -> Result<()> {
        for attempt in 0..MAX_CAS_RETRIES {
            let current = self
                .storage
                .load_counter(&self.namespace)
                .map_err(|e| self.counter_error(e))?;
            let start = current.unwrap_or(0);
            let end = start.checked_add(self.step).ok_or_else(|| Error::Allocation {
                namespace: self.namespace.clone(),
                reason: "counter overflow".into(),
            })?;

            let swapped = self
                .storage
                .cas_counter(&self.namespace, current, end)
                .map_err(|e| self.counter_error(e))?;
            if swapped {
                debug!(
                    namespace = %self.namespace,
                    start,
                    end,
                    "Reserved id range"
                );
                range.base = start;
                range.end = end;
                return Ok(());
            }

            warn!(
                namespace = %self.namespace,
                attempt = attempt + 1,
                "Id counter moved concurrently, retrying"
            );
        }

        Err(Error::Allocation {
            namespace: self.namespace.clone(),
            reason: format!("counter still contended after {} attempts", MAX_CAS_RETRIES),
        })
    }
}
