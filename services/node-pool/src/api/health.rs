//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolHealth>,
}

/// Pool occupancy, as seen by the registry.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct PoolHealth {
    pub nodes: usize,
    pub distributed: usize,

    /// Active scenes from the last successful demand refresh.
    pub scenes: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, pool: Option<PoolHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "node-pool".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        pool,
    }
}

/// Basic health check. Does not look at the pool.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Readiness: reports "degraded" until a demand refresh has seen at least one
/// active scene.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry().get().await;
    let scenes = state.registry().demand().await.len();
    let pool = PoolHealth {
        nodes: nodes.len(),
        distributed: nodes.iter().filter(|n| n.is_distributed).count(),
        scenes,
    };

    if scenes > 0 {
        (StatusCode::OK, Json(response("ok", Some(pool))))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response("degraded", Some(pool))))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
