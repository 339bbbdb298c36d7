//! Bridge lifecycle HTTP handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::response;
use crate::server::AppState;

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.engine.status())).into_response()
}

/// POST /api/v1/start
pub async fn start_bridge(State(state): State<AppState>) -> Response {
    match state.engine.start(&state.bridge_config).await {
        Ok(()) => (StatusCode::OK, Json(state.engine.status())).into_response(),
        Err(e) => response::bridge_error(&e),
    }
}

/// POST /api/v1/stop
pub async fn stop_bridge(State(state): State<AppState>) -> Response {
    state.engine.stop().await;
    (StatusCode::OK, Json(state.engine.status())).into_response()
}
