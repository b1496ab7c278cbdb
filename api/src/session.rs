use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use host_evals_core::features::FeatureRegistry;
use host_evals_mcp_runtime::peer::OUTBOUND_QUEUE_CAPACITY;
use host_evals_mcp_runtime::{HarnessConfig, McpHarness};
use serde_json::Value;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::Instant;
use tokio_stream::Stream;
use uuid::Uuid;

/// One host connection: its harness plus the bounded queue of server→host
/// messages waiting for an SSE stream to drain them. Once the queue is full,
/// new messages are dropped.
pub struct HttpSession {
    pub id: String,
    pub harness: McpHarness,
    outbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Value>>>,
    last_seen: Mutex<Instant>,
}

impl HttpSession {
    fn open(registry: Arc<FeatureRegistry>, config: &HarnessConfig) -> Self {
        let id = Uuid::now_v7().to_string();
        let span = tracing::info_span!("mcp_session", transport = "http", session_id = %id);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Self {
            harness: McpHarness::new(registry, config, span, tx),
            outbound: Arc::new(tokio::sync::Mutex::new(rx)),
            last_seen: Mutex::new(Instant::now()),
            id,
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// An SSE stream currently holds the queue.
    pub fn is_streaming(&self) -> bool {
        self.outbound.try_lock().is_err()
    }

    /// Claims the outbound queue. `None` while another stream holds it.
    pub fn claim_outbound(&self) -> Option<OutboundStream> {
        self.outbound
            .clone()
            .try_lock_owned()
            .ok()
            .map(|receiver| OutboundStream { receiver })
    }
}

/// Server→host messages for one SSE stream. Dropping it releases the queue
/// so the host can reconnect.
pub struct OutboundStream {
    receiver: OwnedMutexGuard<mpsc::Receiver<Value>>,
}

impl Stream for OutboundStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Arc<HttpSession>>>>,
}

impl SessionStore {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<HttpSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(&self, registry: Arc<FeatureRegistry>, config: &HarnessConfig) -> Arc<HttpSession> {
        let session = Arc::new(HttpSession::open(registry, config));
        self.lock().insert(session.id.clone(), session.clone());
        tracing::info!(event = "session_created", session_id = %session.id, "MCP session created");
        session
    }

    /// Looks a session up and marks it active.
    pub fn get(&self, id: &str) -> Option<Arc<HttpSession>> {
        let session = self.lock().get(id).cloned();
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    pub fn remove(&self, id: &str) -> Option<Arc<HttpSession>> {
        let removed = self.lock().remove(id);
        if let Some(session) = &removed {
            session.harness.close();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops sessions with no request for `max_idle` and no open stream.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<Arc<HttpSession>> = {
            let mut sessions = self.lock();
            let idle: Vec<String> = sessions
                .values()
                .filter(|session| !session.is_streaming() && session.idle_for(now) >= max_idle)
                .map(|session| session.id.clone())
                .collect();
            idle.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &evicted {
            session.harness.close();
            tracing::info!(event = "session_evicted", session_id = %session.id, "Idle MCP session evicted");
        }
        evicted.len()
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<HttpSession>> = self.lock().drain().map(|(_, session)| session).collect();
        for session in drained {
            session.harness.close();
        }
    }
}
