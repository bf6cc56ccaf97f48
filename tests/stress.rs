//! Stress test for shardmeta: concurrent administrative calls

use shardmeta::common::ManagerConfig;
use shardmeta::meta::{ClusterManager, HeartbeatStreams, Manager};
use shardmeta::storage::MetaStorage;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tempfile::TempDir;

fn open(storage: MetaStorage) -> Arc<ClusterManager> {
    let config = ManagerConfig {
        id_alloc_step: 7,
        ..Default::default()
    };
    Arc::new(ClusterManager::open(storage, HeartbeatStreams::default(), &config).unwrap())
}

#[test]
fn test_concurrent_cluster_creation() {
    let manager = open(MetaStorage::memory());
    let n = 32;

    let handles: Vec<_> = (0..n)
        .map(|i| {
            let manager = manager.clone();
            thread::spawn(move || manager.create_cluster(&format!("db{}", i), 1, 1, 2).unwrap().id())
        })
        .collect();

    let ids: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), n);
    assert_eq!(manager.list_clusters().unwrap().len(), n);
}

#[test]
fn test_concurrent_same_name_creates_once() {
    let manager = open(MetaStorage::memory());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || manager.create_cluster("db1", 1, 1, 2).is_ok())
        })
        .collect();

    let created = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(created, 1);
}

#[test]
fn stress_table_allocation() {
    let dir = TempDir::new().unwrap();
    let manager = open(MetaStorage::open(dir.path().join("meta")).unwrap());
    manager.create_cluster("db1", 2, 2, 8).unwrap();
    manager.register_node("db1", "node-1", 30).unwrap();
    manager.register_node("db1", "node-2", 30).unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let manager = manager.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        // every worker asks for the same names from its own node
                        let node = format!("node-{}", worker % 2 + 1);
                        manager
                            .alloc_table_id("db1", "public", &format!("t{}", i), &node)
                            .unwrap()
                            .id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let elapsed = start.elapsed();

    // same (schema, table) pair resolves to the same id everywhere
    for ids in &results[1..] {
        assert_eq!(ids, &results[0]);
    }
    let unique: HashSet<_> = results[0].iter().collect();
    assert_eq!(unique.len(), 100);

    let topology = manager.describe_cluster("db1").unwrap();
    let placed: usize = topology.shards.iter().map(|s| s.table_count).sum();
    assert_eq!(placed, 100);

    println!("Allocated 100 tables from 4 threads: {:?}", elapsed);
    assert!(elapsed.as_secs_f64() < 30.0, "Allocation too slow");
}
