use crate::ingest::IngestStats;
use crate::metrics::get_metrics_collector;
use crate::model::SearchRequest;
use crate::query::QueryOrchestrator;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: QueryOrchestrator,
    pub stats: Arc<IngestStats>,
    pub query_timeout: Duration,
}

impl AppState {
    pub fn new(orchestrator: QueryOrchestrator, stats: Arc<IngestStats>, query_timeout: Duration) -> Self {
        Self { orchestrator, stats, query_timeout }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/list-ids", get(list_ids))
        .route("/stats", get(stats))
        .route("/search", post(search))
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn run(
    listen: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    tracing::info!("API listening on {listen}");
    serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn root() -> impl IntoResponse {
    format!("hybrid-vectors {}\n", crate::VERSION)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let indexes = state.orchestrator.indexes();
    Json(json!({
        "documents": indexes.exact.len(),
        "approximate": indexes.approximate.as_ref().map(|index| index.len()),
        "categorized": indexes.labels.len(),
        "dimension": indexes.dim(),
    }))
}

async fn list_ids(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.indexes().exact.list_ids())
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ingest": state.stats.snapshot(),
        "metrics": get_metrics_collector().snapshot(),
    }))
}

async fn search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid request: {}", e.body_text())).into_response(),
    };

    let orchestrator = state.orchestrator.clone();
    let task = tokio::task::spawn_blocking(move || orchestrator.search(&req));

    match tokio::time::timeout(state.query_timeout, task).await {
        Ok(Ok(Ok(results))) => Json(results).into_response(),
        Ok(Ok(Err(e))) if e.is_caller_error() => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Search failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Query failed: {}", e)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Search task panicked: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Query failed".to_string()).into_response()
        }
        Err(_) => {
            get_metrics_collector().track_metric("query.timeouts", 1.0);
            (StatusCode::GATEWAY_TIMEOUT, "Query timed out".to_string()).into_response()
        }
    }
}
