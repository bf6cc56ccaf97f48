//! Background placement
//!
//! With deferred placement, registration only persists the node and queues
//! the cluster here. The worker runs scatter on the blocking pool, one
//! request at a time, and logs failures; a later request or an explicit
//! scatter call picks up whatever was left.

use crate::common::{Error, Result};
use crate::meta::manager::Manager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct PlacementWorker {
    tx: mpsc::Sender<String>,
}

impl PlacementWorker {
    /// Start the worker. It stops once every handle has been dropped.
    pub fn spawn(manager: Arc<dyn Manager>, queue_depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(queue_depth.max(1));

        let handle = tokio::spawn(async move {
            while let Some(cluster) = rx.recv().await {
                let manager = manager.clone();
                let name = cluster.clone();
                match tokio::task::spawn_blocking(move || manager.scatter_shards(&name)).await {
                    Ok(Ok(report)) => debug!(
                        cluster = %cluster,
                        changed = ?report.changed,
                        "Deferred scatter finished"
                    ),
                    Ok(Err(e)) => warn!(
                        cluster = %cluster,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Deferred scatter failed"
                    ),
                    Err(e) => error!(cluster = %cluster, error = %e, "Scatter task panicked"),
                }
            }
            info!("Placement worker stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a scatter pass for `cluster`
    pub async fn schedule(&self, cluster: &str) -> Result<()> {
        self.tx
            .send(cluster.to_string())
            .await
            .map_err(|_| Error::Internal("placement worker stopped".into()))
    }
}
