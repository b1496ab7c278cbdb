use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use host_evals_mcp_runtime::rpc::{RpcError, error_response};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("port {0} has no successor to retry on")]
    NoRetryPort(u16),
    #[error("HTTP server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Transport-level rejection rendered as a JSON-RPC error body.
#[derive(Debug)]
pub enum AppError {
    /// No usable session for a non-initialize POST (400).
    NoValidSession,
    /// GET/DELETE without a known session (400).
    InvalidSession,
    /// A second SSE stream for the same session (409).
    StreamConflict,
    /// Body is not JSON (400).
    Parse,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::NoValidSession => (
                StatusCode::BAD_REQUEST,
                RpcError::bad_request("Bad Request: No valid session ID provided"),
            ),
            AppError::InvalidSession => (
                StatusCode::BAD_REQUEST,
                RpcError::bad_request("Invalid or missing session ID"),
            ),
            AppError::StreamConflict => (
                StatusCode::CONFLICT,
                RpcError::bad_request("Conflict: Only one SSE stream is allowed per session"),
            ),
            AppError::Parse => (StatusCode::BAD_REQUEST, RpcError::parse_error("Parse error")),
        };
        (status, Json(error_response(Value::Null, error))).into_response()
    }
}
