//! Liveness and readiness.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::{db, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database_reachable: bool,
}

impl HealthResponse {
    fn new(database_reachable: bool) -> Self {
        Self {
            status: if database_reachable { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            database_reachable,
        }
    }

    fn status_code(&self) -> StatusCode {
        if self.database_reachable {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(|| async { "Groundwork Record API" }))
}

/// GET /health - 503 while Postgres is unreachable.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = HealthResponse::new(db::ping(&state.pool).await);
    if !health.database_reachable {
        tracing::warn!("health check: database unreachable");
    }
    (health.status_code(), Json(health))
}
