//! One MCP session of the host evaluation harness: JSON-RPC dispatch,
//! scripted tools, fixtures and the host-bound peer.

pub mod events;
pub mod fixtures;
pub mod peer;
pub mod rpc;
pub mod shutdown;
pub mod stdio;
pub mod tools;
mod util;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use host_evals_core::error::codes;
use host_evals_core::features::FeatureRegistry;
use host_evals_core::report::ResultReport;
use host_evals_core::tasks::{StepAction, StepError, TaskStepper, mcp_tasks, tools as tool_names};
use host_evals_core::tracker::{ExpiryPolicy, FeatureTracker};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::Span;

use crate::events::{EventDispatcher, MESSAGE_EVENT, PROGRESS_EVENT};
use crate::peer::{DEFAULT_REQUEST_TIMEOUT, HostPeer};
use crate::rpc::{RpcError, ToolError, error_response, success_response, tool_result};
use crate::tools::{ToolDefinition, tool_definitions, tools_list_payload};
use crate::util::{arg_optional_string, arg_optional_u64, params_object, required_string};

pub const MCP_SERVER_NAME: &str = "mcp-host-evals";
pub const MCP_SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Newest first; the first entry is offered when the host asks for anything else.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

const LOG_LEVELS: [&str; 8] = [
    "debug",
    "info",
    "notice",
    "warning",
    "error",
    "critical",
    "alert",
    "emergency",
];
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy)]
pub struct HarnessConfig {
    pub policy: ExpiryPolicy,
    /// Upper bound on waiting for a host response to a server-initiated request.
    pub request_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            policy: ExpiryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

pub struct McpHarness {
    tracker: FeatureTracker,
    stepper: Mutex<TaskStepper>,
    peer: Arc<HostPeer>,
    events: EventDispatcher,
    tool_definitions: Vec<ToolDefinition>,
    log_level: Mutex<String>,
    subscriptions: Mutex<BTreeSet<String>>,
    span: Span,
}

impl McpHarness {
    /// Outbound traffic (notifications and host-bound requests) is written to
    /// `outbound`; the transport owns the receiving end.
    pub fn new(
        registry: Arc<FeatureRegistry>,
        config: &HarnessConfig,
        span: Span,
        outbound: mpsc::Sender<Value>,
    ) -> Self {
        let tracker = FeatureTracker::new(registry, config.policy, span.clone());
        let peer = Arc::new(HostPeer::new(outbound, config.request_timeout, span.clone()));
        let events = EventDispatcher::new(tracker.clone(), peer.clone(), span.clone());
        let tool_definitions = tool_definitions(&events.triggerable(), &[PROGRESS_EVENT, MESSAGE_EVENT]);
        Self {
            tracker,
            stepper: Mutex::new(TaskStepper::new(mcp_tasks())),
            peer,
            events,
            tool_definitions,
            log_level: Mutex::new(DEFAULT_LOG_LEVEL.to_string()),
            subscriptions: Mutex::new(BTreeSet::new()),
            span,
        }
    }

    pub fn tracker(&self) -> &FeatureTracker {
        &self.tracker
    }

    pub fn peer(&self) -> &Arc<HostPeer> {
        &self.peer
    }

    pub fn log_level(&self) -> String {
        self.log_level.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn report(&self) -> ResultReport {
        ResultReport::from_statuses(&self.tracker.statuses(), self.stepper().manual_task_count())
    }

    fn stepper(&self) -> MutexGuard<'_, TaskStepper> {
        self.stepper.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles one decoded transport message (single or batch) and returns
    /// the responses to send back, if any.
    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            if obj.contains_key("result") || obj.contains_key("error") {
                self.peer.handle_response(&incoming);
                return None;
            }
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("Message has neither method nor result"),
            ));
        };

        self.observe_inbound(method);

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => {
                    tracing::info!(
                        parent: &self.span,
                        event = "request_rejected",
                        method,
                        code = err.code,
                        message = %err.message,
                        "Request rejected"
                    );
                    error_response(id, err)
                }
            })
        } else {
            self.handle_notification(method);
            None
        }
    }

    /// Every inbound method first settles a pending event waiting for it,
    /// then counts as an observation of the method itself.
    fn observe_inbound(&self, method: &str) {
        self.tracker.resolve_inbound_call(method);
        self.tracker.record_feature_call(method, true);
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => {
                tracing::info!(
                    parent: &self.span,
                    event = "host_initialized",
                    client = self.peer.client_name().as_deref().unwrap_or("unknown"),
                    "Host finished initialization"
                );
            }
            _ => {
                tracing::debug!(parent: &self.span, event = "notification_received", method, "Notification received");
            }
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let args = params_object(&params);
        match method {
            "initialize" => Ok(self.initialize(&args)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload(&self.tool_definitions)),
            "tools/call" => self.handle_tools_call(&args).await,
            "resources/list" => Ok(fixtures::resources_list_payload()),
            "resources/read" => fixtures::read_resource(&args),
            "resources/templates/list" => Ok(fixtures::resource_templates_payload()),
            "resources/subscribe" => self.subscribe(&args),
            "resources/unsubscribe" => self.unsubscribe(&args),
            "prompts/list" => Ok(fixtures::prompts_list_payload()),
            "prompts/get" => fixtures::get_prompt(&args),
            "completion/complete" => fixtures::complete(&args),
            "logging/setLevel" => self.set_log_level(&args),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize(&self, args: &Map<String, Value>) -> Value {
        let capabilities = args.get("capabilities").cloned().unwrap_or_else(|| json!({}));
        self.peer.set_client(capabilities, args.get("clientInfo").cloned());

        let requested = args.get("protocolVersion").and_then(Value::as_str);
        let protocol_version = requested
            .filter(|version| SUPPORTED_PROTOCOL_VERSIONS.contains(version))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);

        tracing::info!(
            parent: &self.span,
            event = "session_initialize",
            client = self.peer.client_name().as_deref().unwrap_or("unknown"),
            requested_version = requested.unwrap_or(""),
            protocol_version,
            "Host initialize"
        );

        json!({
            "protocolVersion": protocol_version,
            "capabilities": {
                "tools": {
                    "listChanged": true
                },
                "resources": {
                    "listChanged": true,
                    "subscribe": true
                },
                "prompts": {
                    "listChanged": true
                },
                "completions": {},
                "logging": {}
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": MCP_SERVER_VERSION
            },
            "instructions": format!(
                "Call {} with action 'reset', then step through the tasks it returns. Call {} when every task is done.",
                tool_names::TEST_GUIDE,
                tool_names::GET_RESULT
            )
        })
    }

    async fn handle_tools_call(&self, params: &Map<String, Value>) -> Result<Value, RpcError> {
        let name = required_string(params, "name")?;
        let args = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        tracing::debug!(parent: &self.span, event = "tool_call", tool = %name, "Tool call");
        match name.as_str() {
            tool_names::TEST_GUIDE => self.tool_test_guide(&args),
            tool_names::TEST_TOOL_CALL => Ok(tool_result("success", json!({"status": "success"}))),
            tool_names::TRIGGER_EVENT => {
                let event_type = required_string(&args, "event_type")?;
                let progress_token = params
                    .get("_meta")
                    .and_then(|meta| meta.get("progressToken"))
                    .cloned();
                let data = match args.get("data") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(data)) => Some(data.clone()),
                    Some(_) => {
                        return Err(ToolError::new(codes::INVALID_ARGUMENT, "data must be an object")
                            .with_field("data")
                            .into());
                    }
                };
                let log_level = self.log_level();
                Ok(self
                    .events
                    .trigger(&event_type, &log_level, progress_token, data)
                    .await?)
            }
            tool_names::CALLBACK => {
                let event_name = required_string(&args, "event_name")?;
                let message = arg_optional_string(&args, "message")?.unwrap_or_default();
                Ok(self.events.callback(&event_name, &message)?)
            }
            tool_names::GET_RESULT => {
                let report = self.report();
                let structured = serde_json::to_value(&report)
                    .map_err(|err| RpcError::internal(format!("Failed to encode report: {err}")))?;
                Ok(tool_result(report.render(), structured))
            }
            other => Err(ToolError::new(codes::UNKNOWN_TOOL, format!("Unknown tool: {other}"))
                .with_field("name")
                .into()),
        }
    }

    fn tool_test_guide(&self, args: &Map<String, Value>) -> Result<Value, RpcError> {
        let action = match arg_optional_string(args, "action")? {
            None => StepAction::default(),
            Some(raw) => StepAction::parse(&raw).ok_or_else(|| {
                ToolError::new(
                    codes::INVALID_ARGUMENT,
                    format!("Unsupported action '{raw}'"),
                )
                .with_field("action")
                .with_docs_hint("Allowed values: next, reset")
            })?,
        };
        let step = arg_optional_u64(args, "step")?.map(|step| step as usize);

        let reply = self
            .stepper()
            .advance(step, action, &self.tracker)
            .map_err(|err| match err {
                StepError::ZeroStep => RpcError::from(
                    ToolError::new(codes::INVALID_ARGUMENT, err.to_string()).with_field("step"),
                ),
            })?;

        if action == StepAction::Reset {
            *self.log_level.lock().unwrap_or_else(|e| e.into_inner()) = DEFAULT_LOG_LEVEL.to_string();
            self.subscriptions().clear();
        }

        Ok(tool_result(
            reply.text.clone(),
            json!({
                "state": reply.state.as_str(),
                "step": reply.step,
                "total": reply.total,
                "task": reply.task
            }),
        ))
    }

    fn subscribe(&self, args: &Map<String, Value>) -> Result<Value, RpcError> {
        let uri = required_string(args, "uri")?;
        if !fixtures::is_known_resource(&uri) {
            return Err(ToolError::new(codes::UNKNOWN_RESOURCE, format!("Unknown resource: {uri}"))
                .with_field("uri")
                .into());
        }
        self.subscriptions().insert(uri);
        Ok(json!({}))
    }

    fn unsubscribe(&self, args: &Map<String, Value>) -> Result<Value, RpcError> {
        let uri = required_string(args, "uri")?;
        self.subscriptions().remove(&uri);
        Ok(json!({}))
    }

    fn set_log_level(&self, args: &Map<String, Value>) -> Result<Value, RpcError> {
        let level = required_string(args, "level")?;
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ToolError::new(
                codes::INVALID_ARGUMENT,
                format!("Unsupported logging level '{level}'"),
            )
            .with_field("level")
            .with_docs_hint(format!("Allowed values: {}", LOG_LEVELS.join(", ")))
            .into());
        }
        tracing::info!(parent: &self.span, event = "log_level_set", level = %level, "Host set logging level");
        *self.log_level.lock().unwrap_or_else(|e| e.into_inner()) = level;
        Ok(json!({}))
    }

    pub fn subscribed(&self, uri: &str) -> bool {
        self.subscriptions().contains(uri)
    }

    /// Ends the session: outstanding host requests fail and pending state is
    /// dropped.
    pub fn close(&self) {
        self.peer.close();
        self.tracker.clear_pending_events();
        self.tracker.clear_confirmations();
        tracing::info!(parent: &self.span, event = "session_closed", "Session closed");
    }
}
