//! Sync endpoint routes.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::Result;
use crate::sync::{Bookkeeping, OwnerHealth, PassSummary};
use crate::AppState;

/// Sync status response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub owner_id: String,
    pub bookkeeping: Bookkeeping,
    pub health: OwnerHealth,
    /// Queued remote writes not yet delivered
    pub queue_depth: u64,
    pub tombstones: u64,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/sync", post(sync_handler))
        .route("/sync/force", post(force_handler))
}

/// GET /status - Sync bookkeeping and queue state.
async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    let stores = state.coordinator.stores();
    let bookkeeping = state.coordinator.bookkeeping(&state.owner_id).await?;
    let queue_depth = stores.queue.depth().await?;
    let tombstones = stores.tombstones.count().await?;

    Ok(Json(StatusResponse {
        owner_id: state.owner_id.to_string(),
        bookkeeping,
        health: state.health.get(&state.owner_id),
        queue_depth,
        tombstones,
    }))
}

/// POST /sync - Run a full pass now.
async fn sync_handler(State(state): State<AppState>) -> Result<Json<PassSummary>> {
    let summary = state.coordinator.perform_full_sync(&state.owner_id).await?;
    Ok(Json(summary))
}

/// POST /sync/force - Re-push every owned entity.
async fn force_handler(State(state): State<AppState>) -> Result<Json<PassSummary>> {
    let summary = state
        .coordinator
        .force_sync_all_to_cloud(&state.owner_id)
        .await?;
    Ok(Json(summary))
}
