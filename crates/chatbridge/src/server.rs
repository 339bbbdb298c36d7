use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::timeout::TimeoutLayer;

use crate::bridge::BridgeEngine;
use crate::config::BridgeConfig;
use crate::handlers;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BridgeEngine>,
    /// Config used by `POST /api/v1/start`.
    pub bridge_config: Arc<BridgeConfig>,
}

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    let api_v1 = Router::new()
        .route("/status", get(handlers::v1::get_status))
        .route("/start", post(handlers::v1::start_bridge))
        .route("/stop", post(handlers::v1::stop_bridge))
        .with_state(state.clone());

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .with_state(state)
        .nest("/api/v1", api_v1)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
}
