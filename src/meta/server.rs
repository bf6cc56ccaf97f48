//! Metadata server

use crate::common::{Config, Result, StorageBackend};
use crate::meta::heartbeat::HeartbeatStreams;
use crate::meta::http::{create_router, AppState};
use crate::meta::manager::{ClusterManager, Manager};
use crate::meta::worker::PlacementWorker;
use crate::storage::MetaStorage;
use std::sync::Arc;

pub struct MetaServer {
    config: Config,
}

impl MetaServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn open_storage(&self) -> Result<MetaStorage> {
        match self.config.server.backend {
            StorageBackend::Rocksdb => MetaStorage::open(&self.config.server.data_dir),
            StorageBackend::Memory => Ok(MetaStorage::memory()),
        }
    }

    /// Open storage, load clusters and serve the admin API until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let server = &self.config.server;
        tracing::info!("Starting shardmeta {}", crate::VERSION);
        tracing::info!("  HTTP API: {}", server.bind_addr);
        tracing::info!("  Backend: {:?}", server.backend);
        tracing::info!("  Data dir: {}", server.data_dir.display());
        tracing::info!("  Deferred placement: {}", self.config.placement.deferred);

        let storage = self.open_storage()?;
        let streams = HeartbeatStreams::new(self.config.manager.stream_capacity);

        // Loading touches every stored cluster, keep it off the runtime threads
        let manager_config = self.config.manager.clone();
        let manager = tokio::task::spawn_blocking(move || {
            ClusterManager::open(storage, streams, &manager_config)
        })
        .await
        .map_err(|e| crate::Error::Internal(format!("manager startup task failed: {}", e)))??;
        let manager: Arc<dyn Manager> = Arc::new(manager);

        let mut state = AppState::new(manager.clone());
        let mut worker_handle = None;
        if self.config.placement.deferred {
            let (worker, handle) =
                PlacementWorker::spawn(manager.clone(), self.config.placement.queue_depth);
            state = state.with_placement(worker);
            worker_handle = Some(handle);
        }

        let router = create_router(state);
        let listener = tokio::net::TcpListener::bind(server.bind_addr).await?;

        tracing::info!("✓ shardmeta ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // The router (and with it the worker handle) is gone, let queued
        // scatter passes finish.
        if let Some(handle) = worker_handle {
            if let Err(e) = handle.await {
                tracing::error!("Placement worker failed: {}", e);
            }
        }

        tracing::info!("shardmeta stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
