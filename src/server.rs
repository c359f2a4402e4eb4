use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analytics::{analyze_titles, TitleAnalytics};
use crate::queue::{QueueCounts, QueueStats};
use crate::record::Record;
use crate::status::StatusHandle;
use crate::store::ItemStore;

#[derive(Clone)]
pub struct AppState {
    pub status: StatusHandle,
    pub queue: Arc<QueueStats>,
    pub store: ItemStore,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    data: BTreeMap<u32, Vec<Record>>,
    log: VecDeque<String>,
    queue: QueueCounts,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/analytics", get(analytics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds `addr` and serves the status routes until the task is dropped.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router(state)).await
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.status.snapshot();
    Json(StatusResponse {
        data: snapshot.data,
        log: snapshot.log,
        queue: state.queue.counts(),
    })
}

/// Title analytics over every distinct title in the store.
async fn analytics_handler(
    State(state): State<AppState>,
) -> Result<Json<TitleAnalytics>, (StatusCode, String)> {
    let store = state.store.clone();
    let titles = tokio::task::spawn_blocking(move || store.distinct_titles())
        .await
        .map_err(|e| e.to_string())
        .and_then(|res| res.map_err(|e| e.to_string()));

    match titles {
        Ok(titles) => Ok(Json(analyze_titles(&titles))),
        Err(e) => {
            warn!(error = %e, "analytics failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
