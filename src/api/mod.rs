pub mod client;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::aggregator::MediaGroupAggregator;
use crate::event::SourceKey;
use crate::mapping::{Lookup, MappingStore, PostMapping, StoreTier};

pub struct AppState {
    pub mappings: Arc<MappingStore>,
    pub aggregator: Arc<MediaGroupAggregator>,
    pub api_token: Option<String>,
    pub started_at: Instant,
    /// Signalled by `POST /api/v1/shutdown`; the server drains and exits.
    pub shutdown: Arc<Notify>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub mapping_tier: StoreTier,
    pub mapping_backend: String,
    pub open_media_groups: usize,
    pub pending_reconciliation: usize,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let pending = state
        .mappings
        .pending()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        mapping_tier: state.mappings.tier(),
        mapping_backend: state.mappings.backend_name().to_string(),
        open_media_groups: state.aggregator.open_groups().await,
        pending_reconciliation: pending.len(),
    }))
}

async fn get_mapping(
    State(state): State<Arc<AppState>>,
    Path((channel_id, message_id)): Path<(i64, i32)>,
) -> Result<Json<PostMapping>, (StatusCode, String)> {
    let source = SourceKey::new(channel_id, message_id);
    match state.mappings.get(source).await {
        Ok(Lookup::Found(mapping)) => Ok(Json(mapping)),
        Ok(Lookup::NotFound) => Err((StatusCode::NOT_FOUND, format!("no mapping for {source}"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn shutdown(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("shutdown requested over the API");
    state.shutdown.notify_one();
    StatusCode::ACCEPTED
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_token {
        let auth = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match auth.and_then(|val| val.strip_prefix("Bearer ")) {
            Some(token) if token == expected.as_str() => {}
            _ => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        }
    }
    next.run(request).await
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/mappings/{channel_id}/{message_id}", get(get_mapping))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing;

    fn state(tmp: &tempfile::TempDir) -> Arc<AppState> {
        testing::app_state(tmp, Some("secret"))
    }

    #[tokio::test]
    async fn test_mapping_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);
        state
            .mappings
            .upsert(SourceKey::new(-1001, 5), 77, None)
            .await
            .unwrap();

        let Json(found) = get_mapping(State(state.clone()), Path((-1001, 5))).await.unwrap();
        assert_eq!(found.target_id, 77);

        let missing = get_mapping(State(state), Path((-1001, 6))).await;
        assert!(matches!(missing, Err((StatusCode::NOT_FOUND, _))));
    }

    #[tokio::test]
    async fn test_status_reports_degraded_tier() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);
        state
            .mappings
            .upsert(SourceKey::new(-1001, 1), 10, None)
            .await
            .unwrap();

        let Json(status) = status(State(state)).await.unwrap();
        assert_eq!(status.mapping_tier, StoreTier::Degraded);
        assert_eq!(status.mapping_backend, "fallback-log");
        assert_eq!(status.pending_reconciliation, 1);
        assert_eq!(status.open_media_groups, 0);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_the_server() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let code = shutdown(State(state.clone())).await;
        assert_eq!(code, StatusCode::ACCEPTED);

        // The permit is stored even when nobody is waiting yet.
        tokio::time::timeout(Duration::from_secs(1), state.shutdown.notified())
            .await
            .unwrap();
    }
}
