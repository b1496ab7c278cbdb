//! Event trigger and callback dispatch.
//!
//! Every triggerable event belongs to exactly one class, checked in this
//! order: capability-gated host requests, notifications confirmed by a
//! follow-up host call, ping, and notifications whose content the operator
//! has to read back.

use std::sync::Arc;
use std::time::Duration;

use host_evals_core::error::codes;
use host_evals_core::tasks::{TEST_RESOURCE_URI, tools};
use host_evals_core::tracker::{ConfirmationOutcome, FeatureTracker};
use rand::Rng;
use serde_json::{Map, Value, json};
use tracing::Span;
use uuid::Uuid;

use crate::MCP_SERVER_NAME;
use crate::peer::HostPeer;
use crate::rpc::{ToolError, tool_result};

pub const PROGRESS_EVENT: &str = "notifications/progress";
pub const MESSAGE_EVENT: &str = "notifications/message";

/// Host-bound requests that need a declared client capability.
const GATED_EVENTS: [(&str, &str); 3] = [
    ("roots/list", "roots"),
    ("sampling/createMessage", "sampling"),
    ("elicitation/create", "elicitation"),
];

const IMMEDIATE_EVENTS: [&str; 2] = ["ping", "pong"];
/// Upper bound on how long `trigger_event("ping")` holds the tool call open.
pub const PING_TIMEOUT: Duration = Duration::from_secs(3);
const MESSAGE_CONTENT_EVENTS: [&str; 2] = [PROGRESS_EVENT, MESSAGE_EVENT];

const ASK_USER_INPUT: &str = "Please ask user to input the following message to continue. if cant get this message, input \"continue\" to skip this step. if user input \"continue\", you should skip this step. if user input the message, you should call the tool \"callback\", pass the raw message (ensure the message is only include user input content) to confirm that the message has been received and processed by the client.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Gated { capability: &'static str },
    CallbackConfirmed,
    Immediate,
    MessageContent,
}

impl EventClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EventClass::Gated { .. } => "gated",
            EventClass::CallbackConfirmed => "callback_confirmed",
            EventClass::Immediate => "immediate",
            EventClass::MessageContent => "message_content",
        }
    }
}

pub struct EventDispatcher {
    tracker: FeatureTracker,
    peer: Arc<HostPeer>,
    span: Span,
}

impl EventDispatcher {
    pub fn new(tracker: FeatureTracker, peer: Arc<HostPeer>, span: Span) -> Self {
        Self {
            tracker,
            peer,
            span,
        }
    }

    pub fn classify(&self, event_type: &str) -> Option<EventClass> {
        if !self.tracker.registry().contains(event_type) {
            return None;
        }
        if let Some(&(_, capability)) = GATED_EVENTS.iter().find(|(id, _)| *id == event_type) {
            return Some(EventClass::Gated { capability });
        }
        if self.tracker.registry().expected_callback(event_type).is_some() {
            return Some(EventClass::CallbackConfirmed);
        }
        if IMMEDIATE_EVENTS.contains(&event_type) {
            return Some(EventClass::Immediate);
        }
        if MESSAGE_CONTENT_EVENTS.contains(&event_type) {
            return Some(EventClass::MessageContent);
        }
        None
    }

    /// Event types `trigger_event` accepts, in registry order.
    pub fn triggerable(&self) -> Vec<String> {
        self.tracker
            .registry()
            .ids()
            .filter(|id| self.classify(id).is_some())
            .map(str::to_string)
            .collect()
    }

    pub async fn trigger(
        &self,
        event_type: &str,
        log_level: &str,
        progress_token: Option<Value>,
        data: Option<Map<String, Value>>,
    ) -> Result<Value, ToolError> {
        let Some(class) = self.classify(event_type) else {
            return Err(ToolError::new(
                codes::UNKNOWN_EVENT,
                format!("Unsupported event type: {event_type}"),
            )
            .with_field("event_type")
            .with_docs_hint(format!("Allowed values: {}", self.triggerable().join(", "))));
        };
        tracing::info!(
            parent: &self.span,
            event = "event_triggered",
            event_type,
            class = class.as_str(),
            "Triggering event"
        );

        let reply = match class {
            EventClass::Gated { capability } => self.trigger_gated(event_type, capability),
            EventClass::CallbackConfirmed => self.trigger_callback_confirmed(event_type, data),
            EventClass::Immediate => self.trigger_ping(event_type).await,
            EventClass::MessageContent => {
                self.trigger_message_content(event_type, log_level, progress_token)
            }
        };
        Ok(reply)
    }

    fn trigger_gated(&self, event_type: &str, capability: &str) -> Value {
        if !self.peer.supports(capability) {
            return reply_unsupported(event_type);
        }
        let params = gated_request_params(event_type);
        let peer = self.peer.clone();
        let tracker = self.tracker.clone();
        let span = self.span.clone();
        let method = event_type.to_string();
        tokio::spawn(async move {
            match peer.request(&method, params).await {
                Ok(_) => {
                    tracker.record_feature_call(&method, true);
                }
                Err(err) => {
                    tracing::warn!(parent: &span, event = "host_request_failed", method = %method, error = %err, "Host request failed");
                }
            }
        });
        reply_triggered(event_type)
    }

    /// `data` is kept on the pending event and merged over the default
    /// notification params.
    fn trigger_callback_confirmed(&self, event_type: &str, data: Option<Map<String, Value>>) -> Value {
        let mut params = if event_type == "notifications/resources/updated" {
            Map::from_iter([
                ("uri".to_string(), json!(TEST_RESOURCE_URI)),
                ("title".to_string(), json!("Test Resource")),
            ])
        } else {
            Map::new()
        };
        if let Some(data) = &data {
            params.extend(data.clone());
        }
        let params = (!params.is_empty()).then_some(Value::Object(params));

        self.tracker.record_pending_event(event_type, data.map(Value::Object));
        match self.peer.notify(event_type, params) {
            Ok(()) => reply_triggered(event_type),
            Err(err) => {
                self.tracker.clear_pending_event(event_type);
                tracing::warn!(parent: &self.span, event = "notification_failed", event_type, error = %err, "Notification failed");
                reply_unsupported(event_type)
            }
        }
    }

    /// Waits for the host's pong, bounded by [`PING_TIMEOUT`] rather than
    /// the general request timeout, so the operator's tool call stays short.
    async fn trigger_ping(&self, event_type: &str) -> Value {
        let timeout = PING_TIMEOUT.min(self.peer.request_timeout());
        match self.peer.request_with_timeout("ping", None, timeout).await {
            Ok(_) => {
                for id in IMMEDIATE_EVENTS {
                    self.tracker.record_feature_call(id, true);
                }
                reply_triggered(event_type)
            }
            Err(err) => {
                tracing::warn!(parent: &self.span, event = "host_request_failed", method = "ping", error = %err, "Host did not answer ping");
                reply_unsupported(event_type)
            }
        }
    }

    fn trigger_message_content(
        &self,
        event_type: &str,
        log_level: &str,
        progress_token: Option<Value>,
    ) -> Value {
        let (token, params) = if event_type == PROGRESS_EVENT {
            let value: f64 = rand::thread_rng().r#gen();
            let token = value.to_string();
            let params = json!({
                "progressToken": progress_token.unwrap_or_else(|| json!(MCP_SERVER_NAME)),
                "progress": value,
                "total": 1.0,
                "message": token
            });
            (token, params)
        } else {
            let token = Uuid::new_v4().to_string();
            let params = json!({
                "level": log_level,
                "logger": MCP_SERVER_NAME,
                "data": {
                    "message": token
                }
            });
            (token, params)
        };

        self.tracker.expect_confirmation(event_type, token);
        if let Err(err) = self.peer.notify(event_type, Some(params)) {
            self.tracker.clear_confirmation(event_type);
            tracing::warn!(parent: &self.span, event = "notification_failed", event_type, error = %err, "Notification failed");
            return tool_result(
                format!("Failed to send {event_type}: {err}"),
                json!({"event_type": event_type, "status": "failed"}),
            );
        }
        tool_result(
            ASK_USER_INPUT,
            json!({
                "event_type": event_type,
                "status": "awaiting_confirmation",
                "callback_tool": tools::CALLBACK
            }),
        )
    }

    pub fn callback(&self, event_name: &str, message: &str) -> Result<Value, ToolError> {
        if !MESSAGE_CONTENT_EVENTS.contains(&event_name) {
            return Err(ToolError::new(
                codes::UNKNOWN_CALLBACK,
                format!("Unsupported callback event name: {event_name}"),
            )
            .with_field("event_name")
            .with_docs_hint(format!("Allowed values: {}", MESSAGE_CONTENT_EVENTS.join(", "))));
        }
        let outcome = match self.tracker.confirm(event_name, message) {
            ConfirmationOutcome::Matched => "matched",
            ConfirmationOutcome::Mismatch { .. } => "mismatch",
            ConfirmationOutcome::NotAwaiting => "not_awaiting",
        };
        Ok(tool_result(
            format!("Callback received: {event_name}, message: {message}"),
            json!({
                "event_name": event_name,
                "outcome": outcome
            }),
        ))
    }
}

fn gated_request_params(event_type: &str) -> Option<Value> {
    match event_type {
        "sampling/createMessage" => Some(json!({
            "messages": [
                {
                    "role": "user",
                    "content": {
                        "type": "text",
                        "text": "Who are you?"
                    }
                }
            ],
            "maxTokens": 100
        })),
        "elicitation/create" => Some(json!({
            "message": "Can you get this message?",
            "requestedSchema": {
                "type": "object",
                "properties": {
                    "isGetElicitation": {
                        "type": "boolean",
                        "title": "Can get elicitation",
                        "description": "Can you get elicitation action?"
                    }
                },
                "required": ["isGetElicitation"]
            }
        })),
        _ => None,
    }
}

fn reply_triggered(event_type: &str) -> Value {
    tool_result(
        format!("Event triggered successfully! {event_type}"),
        json!({"event_type": event_type, "status": "triggered"}),
    )
}

fn reply_unsupported(event_type: &str) -> Value {
    tool_result(
        format!("Client does not support {event_type}, please continue to the next step."),
        json!({"event_type": event_type, "status": "unsupported"}),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use host_evals_core::features::FeatureRegistry;
    use host_evals_core::tracker::ExpiryPolicy;
    use tokio::sync::mpsc;

    use crate::peer::OUTBOUND_QUEUE_CAPACITY;

    use super::*;

    fn dispatcher() -> (EventDispatcher, Arc<HostPeer>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let peer = Arc::new(HostPeer::new(tx, Duration::from_secs(5), Span::none()));
        let tracker = FeatureTracker::new(
            Arc::new(FeatureRegistry::mcp()),
            ExpiryPolicy::default(),
            Span::none(),
        );
        (
            EventDispatcher::new(tracker, peer.clone(), Span::none()),
            peer,
            rx,
        )
    }

    fn text(reply: &Value) -> &str {
        reply["content"][0]["text"].as_str().unwrap_or_default()
    }

    #[test]
    fn classes_follow_priority_order() {
        let (dispatcher, _peer, _rx) = dispatcher();
        assert_eq!(
            dispatcher.classify("roots/list"),
            Some(EventClass::Gated { capability: "roots" })
        );
        assert_eq!(
            dispatcher.classify("notifications/resources/updated"),
            Some(EventClass::CallbackConfirmed)
        );
        assert_eq!(dispatcher.classify("pong"), Some(EventClass::Immediate));
        assert_eq!(
            dispatcher.classify(MESSAGE_EVENT),
            Some(EventClass::MessageContent)
        );
        assert_eq!(dispatcher.classify("notifications/initialized"), None);
        assert_eq!(dispatcher.classify("tools/list"), None);
    }

    #[tokio::test]
    async fn unknown_event_is_rejected() {
        let (dispatcher, _peer, _rx) = dispatcher();
        let err = dispatcher
            .trigger("notifications/cancelled", "info", None, None)
            .await
            .expect_err("unsupported");
        assert_eq!(err.code, codes::UNKNOWN_EVENT);
    }

    #[tokio::test]
    async fn gated_event_without_capability_sends_nothing() {
        let (dispatcher, _peer, mut rx) = dispatcher();
        let reply = dispatcher
            .trigger("sampling/createMessage", "info", None, None)
            .await
            .expect("reply");
        assert_eq!(
            text(&reply),
            "Client does not support sampling/createMessage, please continue to the next step."
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(
            dispatcher.tracker.is_passed("sampling/createMessage"),
            Some(false)
        );
    }

    #[tokio::test]
    async fn gated_event_passes_once_host_answers() {
        let (dispatcher, peer, mut rx) = dispatcher();
        peer.set_client(json!({"roots": {"listChanged": true}}), None);

        let reply = dispatcher.trigger("roots/list", "info", None, None).await.expect("reply");
        assert_eq!(text(&reply), "Event triggered successfully! roots/list");
        assert_eq!(dispatcher.tracker.is_passed("roots/list"), Some(false));

        let request = rx.recv().await.expect("roots request");
        assert_eq!(request["method"], "roots/list");
        peer.handle_response(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"roots": []}}));

        for _ in 0..50 {
            if dispatcher.tracker.is_passed("roots/list") == Some(true) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.tracker.is_passed("roots/list"), Some(true));
    }

    #[tokio::test]
    async fn callback_confirmed_event_registers_pending_and_notifies() {
        let (dispatcher, _peer, mut rx) = dispatcher();
        dispatcher
            .trigger("notifications/resources/updated", "info", None, None)
            .await
            .expect("reply");

        let sent = rx.recv().await.expect("notification");
        assert_eq!(sent["method"], "notifications/resources/updated");
        assert_eq!(sent["params"]["uri"], TEST_RESOURCE_URI);
        let pending = dispatcher
            .tracker
            .pending_event_by_method("resources/read")
            .expect("pending");
        assert_eq!(pending.event_type, "notifications/resources/updated");
    }

    #[tokio::test]
    async fn failed_notification_clears_pending_event() {
        let (dispatcher, peer, _rx) = dispatcher();
        peer.close();
        let reply = dispatcher
            .trigger("notifications/tools/list_changed", "info", None, None)
            .await
            .expect("reply");
        assert!(text(&reply).starts_with("Client does not support"));
        assert!(dispatcher.tracker.pending_events().is_empty());
    }

    #[tokio::test]
    async fn ping_marks_ping_and_pong_before_replying() {
        let (dispatcher, peer, mut rx) = dispatcher();
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.expect("ping");
            assert_eq!(request["method"], "ping");
            peer.handle_response(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}));
        });

        let reply = dispatcher.trigger("ping", "info", None, None).await.expect("reply");
        responder.await.expect("responder");
        assert_eq!(text(&reply), "Event triggered successfully! ping");
        assert_eq!(dispatcher.tracker.is_passed("ping"), Some(true));
        assert_eq!(dispatcher.tracker.is_passed("pong"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_host_fails_ping_within_the_ping_bound() {
        let (dispatcher, _peer, _rx) = dispatcher();
        let started = tokio::time::Instant::now();

        let reply = dispatcher.trigger("ping", "info", None, None).await.expect("reply");
        assert!(text(&reply).starts_with("Client does not support"));
        let elapsed = started.elapsed();
        assert!(elapsed >= PING_TIMEOUT && elapsed < Duration::from_secs(5), "{elapsed:?}");
        assert_eq!(dispatcher.tracker.is_passed("ping"), Some(false));
    }

    #[tokio::test]
    async fn trigger_data_rides_on_params_and_pending_event() {
        let (dispatcher, _peer, mut rx) = dispatcher();
        let data = json!({"title": "Renamed", "note": "from operator"});
        dispatcher
            .trigger(
                "notifications/resources/updated",
                "info",
                None,
                data.as_object().cloned(),
            )
            .await
            .expect("reply");

        let sent = rx.recv().await.expect("notification");
        assert_eq!(sent["params"]["uri"], TEST_RESOURCE_URI);
        assert_eq!(sent["params"]["title"], "Renamed");
        assert_eq!(sent["params"]["note"], "from operator");
        let pending = dispatcher
            .tracker
            .pending_event_by_method("resources/read")
            .expect("pending");
        assert_eq!(pending.data, Some(data));
    }

    #[tokio::test]
    async fn message_token_is_sent_but_never_echoed() {
        let (dispatcher, _peer, mut rx) = dispatcher();
        let reply = dispatcher.trigger(MESSAGE_EVENT, "warning", None, None).await.expect("reply");

        let sent = rx.recv().await.expect("notification");
        assert_eq!(sent["params"]["level"], "warning");
        let token = sent["params"]["data"]["message"]
            .as_str()
            .expect("token")
            .to_string();
        assert!(!reply.to_string().contains(&token));

        let echoed = dispatcher.callback(MESSAGE_EVENT, &token).expect("callback");
        assert_eq!(echoed["structuredContent"]["outcome"], "matched");
        assert_eq!(dispatcher.tracker.is_passed(MESSAGE_EVENT), Some(true));
    }

    #[tokio::test]
    async fn double_progress_accepts_only_latest_value() {
        let (dispatcher, _peer, mut rx) = dispatcher();
        dispatcher
            .trigger(PROGRESS_EVENT, "info", Some(json!("tok-1")), None)
            .await
            .expect("first");
        dispatcher.trigger(PROGRESS_EVENT, "info", None, None).await.expect("second");

        let first = rx.recv().await.expect("first notification");
        let second = rx.recv().await.expect("second notification");
        assert_eq!(first["params"]["progressToken"], "tok-1");
        let stale = first["params"]["message"].as_str().expect("token").to_string();
        let latest = second["params"]["message"].as_str().expect("token").to_string();

        if stale != latest {
            let reply = dispatcher.callback(PROGRESS_EVENT, &stale).expect("callback");
            assert_eq!(reply["structuredContent"]["outcome"], "mismatch");
            assert_eq!(dispatcher.tracker.is_passed(PROGRESS_EVENT), Some(false));
        }
        dispatcher.callback(PROGRESS_EVENT, &latest).expect("callback");
        assert_eq!(dispatcher.tracker.is_passed(PROGRESS_EVENT), Some(true));
    }

    #[test]
    fn callback_rejects_other_event_names() {
        let (dispatcher, _peer, _rx) = dispatcher();
        let err = dispatcher
            .callback("notifications/tools/list_changed", "x")
            .expect_err("rejected");
        assert_eq!(err.code, codes::UNKNOWN_CALLBACK);
    }
}
