//! HTTP admin API
//!
//! JSON routes over [`Manager`]. Manager calls block on storage, so every
//! handler runs them on the blocking pool. Errors come back as
//! `{"error": message, "kind": kind}` with a status derived from the kind.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::meta::manager::Manager;
use crate::meta::worker::PlacementWorker;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<dyn Manager>,
    /// Set when registration defers placement to the background worker
    pub placement: Option<PlacementWorker>,
}

impl AppState {
    pub fn new(manager: Arc<dyn Manager>) -> Self {
        Self {
            manager,
            placement: None,
        }
    }

    pub fn with_placement(mut self, worker: PlacementWorker) -> Self {
        self.placement = Some(worker);
        self
    }
}

/// Error response wrapper
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind().as_str(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(Error::Internal(format!("blocking task failed: {}", e))))?
        .map_err(ApiError)
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub node_count: u32,
    pub replication_factor: u32,
    pub shard_total: u32,
}

#[derive(Debug, Deserialize)]
pub struct AllocSchemaRequest {
    pub schema: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocTableRequest {
    pub schema: String,
    pub table: String,
    pub node: String,
}

#[derive(Debug, Deserialize)]
pub struct DropTableRequest {
    pub schema: String,
    pub table: String,
    pub table_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub node: String,
    pub lease: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node: String,
    /// Shards held right after registration; empty or partial when deferred
    pub shard_ids: Vec<u32>,
    pub deferred: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetTablesRequest {
    pub shard_ids: Vec<u32>,
}

/// Create the admin router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clusters", post(create_cluster).get(list_clusters))
        .route("/clusters/:cluster", get(describe_cluster))
        .route("/clusters/:cluster/schemas", post(alloc_schema_id))
        .route("/clusters/:cluster/tables", post(alloc_table_id))
        .route("/clusters/:cluster/tables/drop", post(drop_table))
        .route("/clusters/:cluster/nodes", post(register_node))
        .route("/clusters/:cluster/nodes/:node/shards", get(get_shards))
        .route("/clusters/:cluster/nodes/:node/tables", post(get_tables))
        .route("/clusters/:cluster/scatter", post(scatter_shards))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn create_cluster(
    State(state): State<AppState>,
    Json(req): Json<CreateClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let record = blocking(move || {
        manager
            .create_cluster(
                &req.name,
                req.node_count,
                req.replication_factor,
                req.shard_total,
            )
            .map(|cluster| cluster.meta().clone())
    })
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_clusters(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let clusters = blocking(move || manager.list_clusters()).await?;
    Ok(Json(clusters))
}

async fn describe_cluster(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let topology = blocking(move || manager.describe_cluster(&cluster)).await?;
    Ok(Json(topology))
}

async fn alloc_schema_id(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<AllocSchemaRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let schema_id = blocking(move || manager.alloc_schema_id(&cluster, &req.schema)).await?;
    Ok(Json(json!({ "schema_id": schema_id })))
}

async fn alloc_table_id(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<AllocTableRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let table = blocking(move || {
        manager.alloc_table_id(&cluster, &req.schema, &req.table, &req.node)
    })
    .await?;
    Ok(Json(table))
}

async fn drop_table(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<DropTableRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    blocking(move || manager.drop_table(&cluster, &req.schema, &req.table, req.table_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_node(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<RegisterNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let deferred = state.placement.is_some();
    let name = cluster.clone();
    let node = req.node.clone();
    let lease = req.lease;

    let shard_ids = blocking(move || {
        if deferred {
            manager.register_node_only(&name, &node, lease)?;
        } else {
            manager.register_node(&name, &node, lease)?;
        }
        manager.get_shards(&name, &node)
    })
    .await?;

    if let Some(worker) = &state.placement {
        worker.schedule(&cluster).await?;
    }

    let status = if deferred {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RegisterNodeResponse {
            node: req.node,
            shard_ids,
            deferred,
        }),
    ))
}

async fn get_shards(
    State(state): State<AppState>,
    Path((cluster, node)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let shard_ids = blocking(move || manager.get_shards(&cluster, &node)).await?;
    Ok(Json(json!({ "shard_ids": shard_ids })))
}

async fn get_tables(
    State(state): State<AppState>,
    Path((cluster, node)): Path<(String, String)>,
    Json(req): Json<GetTablesRequest>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let tables = blocking(move || manager.get_tables(&cluster, &node, &req.shard_ids)).await?;
    Ok(Json(tables))
}

async fn scatter_shards(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let manager = state.manager.clone();
    let report = blocking(move || manager.scatter_shards(&cluster)).await?;
    Ok(Json(report))
}
