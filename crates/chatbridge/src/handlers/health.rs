use axum::extract::State;
use axum::http::StatusCode;

use crate::bridge::BridgeState;
use crate::server::AppState;

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Ready only while the bridge is routing messages.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.engine.status().state == BridgeState::Connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not connected")
    }
}
