//! Liveness endpoint.

use axum::Json;
use axum::extract::State;
use tracing::warn;

use crate::AppState;
use crate::models::HealthResponse;

/// `GET /health`: version and database connectivity.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_connected = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Database health check failed: {e}");
            false
        }
    };

    Json(HealthResponse {
        status: if db_connected { "ok" } else { "degraded" }.into(),
        version: echo_core::version().to_string(),
        db_connected,
    })
}
