//! Streamable HTTP transport: one harness session per `mcp-session-id`.

pub mod error;
pub mod routes;
pub mod session;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use host_evals_core::features::FeatureRegistry;
use host_evals_mcp_runtime::HarnessConfig;
use host_evals_mcp_runtime::shutdown::shutdown_signal;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub use crate::error::ServeError;
use crate::state::AppState;

#[derive(Clone)]
pub struct HttpServeOptions {
    pub host: String,
    pub port: u16,
    pub registry: Arc<FeatureRegistry>,
    pub harness: HarnessConfig,
    /// Sessions with no request and no open stream for this long are dropped.
    pub session_idle_timeout: Duration,
}

pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::mcp_http::router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Binds `host:port`; when the port is taken, tries `port + 1` once.
pub async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener, ServeError> {
    let addr = format!("{host}:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            let next = port.checked_add(1).ok_or(ServeError::NoRetryPort(port))?;
            tracing::warn!(event = "port_in_use", port, retry_port = next, "Port in use, retrying on the next one");
            let retry_addr = format!("{host}:{next}");
            TcpListener::bind(&retry_addr)
                .await
                .map_err(|source| ServeError::Bind {
                    addr: retry_addr,
                    source,
                })
        }
        Err(source) => Err(ServeError::Bind { addr, source }),
    }
}

pub async fn serve(options: HttpServeOptions) -> Result<(), ServeError> {
    let state = AppState::new(options.registry, options.harness);
    let sessions = state.sessions.clone();
    let listener = bind_with_retry(&options.host, options.port).await?;
    let local_addr = listener.local_addr().map_err(ServeError::Serve)?;
    tracing::info!(event = "http_listening", addr = %local_addr, "MCP host evals listening on http://{}/mcp", local_addr);

    let sweeper = {
        let sessions = sessions.clone();
        let idle_timeout = options.session_idle_timeout;
        let period = idle_timeout.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                sessions.evict_idle(idle_timeout);
            }
        })
    };

    let outcome = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServeError::Serve);
    sweeper.abort();
    sessions.close_all();
    outcome
}
