//! Outbound half of one MCP session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

use crate::rpc::{self, RpcError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Server→host messages a session buffers before newer ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("session transport is closed")]
    Closed,
    #[error("outbound queue is full, host is not draining it")]
    QueueFull,
    #[error("host did not answer {method} within {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("host rejected {method}: {message} ({code})")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },
}

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

pub struct HostPeer {
    outbound: mpsc::Sender<Value>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    capabilities: RwLock<Value>,
    client_info: RwLock<Option<Value>>,
    request_timeout: Duration,
    span: Span,
}

impl HostPeer {
    pub fn new(outbound: mpsc::Sender<Value>, request_timeout: Duration, span: Span) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            capabilities: RwLock::new(json!({})),
            client_info: RwLock::new(None),
            request_timeout,
            span,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingReply>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: Value) -> Result<(), PeerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::Closed);
        }
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                tracing::warn!(
                    parent: &self.span,
                    event = "outbound_dropped",
                    method = message.get("method").and_then(serde_json::Value::as_str).unwrap_or(""),
                    capacity = self.outbound.max_capacity(),
                    "Outbound queue full, dropping message"
                );
                Err(PeerError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PeerError::Closed),
        }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), PeerError> {
        self.send(rpc::notification(method, params))?;
        tracing::debug!(parent: &self.span, event = "notification_sent", method, "Sent notification to host");
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Sends a server→host request and waits for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, PeerError> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, PeerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(id, reply_tx);

        if let Err(err) = self.send(rpc::request(json!(id), method, params)) {
            self.pending().remove(&id);
            return Err(err);
        }
        tracing::debug!(parent: &self.span, event = "host_request_sent", method, id, "Sent request to host");

        let outcome = tokio::time::timeout(timeout, reply_rx).await;
        match outcome {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(PeerError::Rejected {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(Err(_)) => Err(PeerError::Closed),
            Err(_) => {
                self.pending().remove(&id);
                Err(PeerError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Routes a host response to the request waiting on it. Returns false for
    /// responses nobody is waiting for.
    pub fn handle_response(&self, message: &Value) -> bool {
        let Some(id) = message.get("id").and_then(response_id) else {
            return false;
        };
        let Some(reply) = self.pending().remove(&id) else {
            tracing::debug!(parent: &self.span, event = "orphan_response", id, "Response for unknown request");
            return false;
        };
        let outcome = match message.get("error") {
            Some(error) => Err(RpcError::from_value(error)),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = reply.send(outcome);
        true
    }

    pub fn set_client(&self, capabilities: Value, client_info: Option<Value>) {
        *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) = capabilities;
        *self.client_info.write().unwrap_or_else(|e| e.into_inner()) = client_info;
    }

    /// Whether the host declared `capability` during initialize.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(capability)
            .is_some_and(|value| !value.is_null())
    }

    pub fn client_name(&self) -> Option<String> {
        self.client_info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Fails every outstanding request and refuses further traffic.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<PendingReply> = self.pending().drain().map(|(_, reply)| reply).collect();
        let count = drained.len();
        drop(drained);
        tracing::debug!(parent: &self.span, event = "peer_closed", outstanding = count, "Host peer closed");
    }
}

fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
}
