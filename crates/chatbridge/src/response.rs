//! JSON error responses for the control plane.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::bridge::BridgeError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub fn error(
    status: StatusCode,
    error: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            message: message.into(),
        }),
    )
}

/// Map a bridge error to a status code: caller mistakes are 400, conflicts
/// with the current lifecycle state are 409, the rest 500.
pub fn bridge_error(err: &BridgeError) -> Response {
    let status = match err {
        BridgeError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        BridgeError::AlreadyRunning | BridgeError::PortInUse { .. } | BridgeError::Aborted => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.kind(), err.to_string()).into_response()
}
