use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::error::AppError;
use crate::state::AppState;

pub const MCP_PATH: &str = "/mcp";
pub const SESSION_HEADER: &str = "mcp-session-id";

pub fn router() -> Router<AppState> {
    Router::new().route(MCP_PATH, post(mcp_post).get(mcp_get).delete(mcp_delete))
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn is_initialize(incoming: &Value) -> bool {
    let is_init = |message: &Value| message.get("method").and_then(Value::as_str) == Some("initialize");
    match incoming {
        Value::Array(batch) => batch.iter().any(is_init),
        message => is_init(message),
    }
}

async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return AppError::Parse.into_response(),
    };

    let session = match session_id(&headers) {
        Some(id) => match state.sessions.get(id) {
            Some(session) => session,
            None => {
                tracing::info!(event = "unknown_session", session_id = id, "POST for unknown session");
                return AppError::NoValidSession.into_response();
            }
        },
        None if is_initialize(&incoming) => state.sessions.create(state.registry.clone(), &state.harness),
        None => return AppError::NoValidSession.into_response(),
    };

    let responses = session.harness.handle_incoming_message(incoming).await;

    let mut response = match responses.len() {
        0 => StatusCode::ACCEPTED.into_response(),
        1 => (
            StatusCode::OK,
            Json(responses.into_iter().next().unwrap_or(Value::Null)),
        )
            .into_response(),
        _ => (StatusCode::OK, Json(Value::Array(responses))).into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&session.id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session) = session_id(&headers).and_then(|id| state.sessions.get(id)) else {
        return AppError::InvalidSession.into_response();
    };
    let Some(outbound) = session.claim_outbound() else {
        return AppError::StreamConflict.into_response();
    };
    tracing::info!(event = "sse_stream_opened", session_id = %session.id, "SSE stream opened");

    let events = outbound.map(|message| {
        Ok::<Event, Infallible>(Event::default().event("message").data(message.to_string()))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = session_id(&headers) else {
        return AppError::InvalidSession.into_response();
    };
    match state.sessions.remove(id) {
        Some(session) => {
            tracing::info!(event = "session_deleted", session_id = %session.id, "MCP session terminated by host");
            StatusCode::OK.into_response()
        }
        None => AppError::InvalidSession.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use host_evals_core::features::FeatureRegistry;
    use host_evals_mcp_runtime::HarnessConfig;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::app;

    fn state() -> AppState {
        AppState::new(Arc::new(FeatureRegistry::mcp()), HarnessConfig::default())
    }

    fn post_json(body: Value, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(MCP_PATH)
            .header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn bare(method: Method, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(MCP_PATH);
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::empty()).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn initialize() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
        })
    }

    async fn open_session(state: &AppState) -> String {
        let response = app(state.clone())
            .oneshot(post_json(initialize(), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .expect("session header")
            .to_string()
    }

    #[tokio::test]
    async fn post_without_session_must_initialize() {
        let response = app(state())
            .oneshot(post_json(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(body["error"]["message"], "Bad Request: No valid session ID provided");
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let response = app(state())
            .oneshot(post_json(initialize(), Some("not-a-session")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn initialize_creates_session_that_routes_later_requests() {
        let state = state();
        let id = open_session(&state).await;
        assert!(state.sessions.get(&id).is_some());

        let response = app(state.clone())
            .oneshot(post_json(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), Some(&id)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["result"]["tools"].is_array());

        let session = state.sessions.get(&id).expect("session");
        assert_eq!(session.harness.tracker().is_passed("tools/list"), Some(true));
    }

    #[tokio::test]
    async fn notification_only_body_is_accepted() {
        let state = state();
        let id = open_session(&state).await;
        let response = app(state)
            .oneshot(post_json(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                Some(&id),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let request = Request::builder()
            .method(Method::POST)
            .uri(MCP_PATH)
            .body(Body::from("{nope"))
            .expect("request");
        let response = app(state()).oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn second_stream_conflicts_while_first_is_open() {
        let state = state();
        let id = open_session(&state).await;

        let first = app(state.clone())
            .oneshot(bare(Method::GET, Some(&id)))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);

        let second = app(state.clone())
            .oneshot(bare(Method::GET, Some(&id)))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);
    }

    #[tokio::test]
    async fn stream_requires_a_known_session() {
        let response = app(state())
            .oneshot(bare(Method::GET, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"]["message"],
            "Invalid or missing session ID"
        );
    }

    #[tokio::test]
    async fn delete_tears_the_session_down() {
        let state = state();
        let id = open_session(&state).await;

        let response = app(state.clone())
            .oneshot(bare(Method::DELETE, Some(&id)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.sessions.get(&id).is_none());

        let again = app(state)
            .oneshot(bare(Method::DELETE, Some(&id)))
            .await
            .expect("response");
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    }
}
