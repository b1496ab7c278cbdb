use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    /// Transport-level rejection (missing or unknown session).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: -32000,
            message: message.into(),
            data: None,
        }
    }

    pub fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
            data: value.get("data").cloned(),
        }
    }
}

/// Tool-level failure; surfaces to the host as an invalid-params rejection
/// carrying the structured payload as `data`.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub docs_hint: Option<String>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        payload
    }
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        Self {
            code: -32602,
            message: err.message.clone(),
            data: Some(err.to_value()),
        }
    }
}

pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result
    })
}

pub fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

pub fn request(id: Value, method: &str, params: Option<Value>) -> Value {
    let mut payload = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method
    });
    if let Some(params) = params {
        payload["params"] = params;
    }
    payload
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut payload = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method
    });
    if let Some(params) = params {
        payload["params"] = params;
    }
    payload
}

/// A reply to a tool call: one text block plus machine-readable fields.
pub fn tool_result(text: impl Into<String>, structured: Value) -> Value {
    json!({
        "content": [
            {
                "type": "text",
                "text": text.into()
            }
        ],
        "structuredContent": structured
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_becomes_invalid_params_with_payload() {
        let err: RpcError = ToolError::new("unknown_event", "Unsupported event type: x")
            .with_field("event_type")
            .into();
        assert_eq!(err.code, -32602);
        let data = err.data.expect("payload");
        assert_eq!(data["error"], "unknown_event");
        assert_eq!(data["field"], "event_type");
    }

    #[test]
    fn error_response_carries_data_only_when_present() {
        let bare = error_response(json!(1), RpcError::method_not_found("nope"));
        assert_eq!(bare["error"]["code"], -32601);
        assert!(bare["error"].get("data").is_none());
    }

    #[test]
    fn notification_omits_missing_params() {
        let value = notification("notifications/tools/list_changed", None);
        assert!(value.get("params").is_none());
        assert!(value.get("id").is_none());
    }
}
