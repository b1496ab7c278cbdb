//! Static resources, prompts and completions hosts are asked to exercise.

use host_evals_core::error::codes;
use host_evals_core::tasks::TEST_RESOURCE_URI;
use serde_json::{Map, Value, json};

use crate::rpc::{RpcError, ToolError};
use crate::util::{arg_optional_string, required_string};

pub const TEST_PROMPT: &str = "test_prompt";
pub const TEST_COMPLETION_PROMPT: &str = "test_completion";
pub const TEST_RESOURCE_TEMPLATE: &str = "file://test-resource/{name}";

const TEST_RESOURCE_TEXT: &str = "This is a test resource content. if you can see this message, it means the resource has been read successfully.";

pub fn resources_list_payload() -> Value {
    json!({
        "resources": [
            {
                "uri": TEST_RESOURCE_URI,
                "name": "Test Resource",
                "mimeType": "text/plain"
            }
        ]
    })
}

pub fn resource_templates_payload() -> Value {
    json!({
        "resourceTemplates": [
            {
                "uriTemplate": TEST_RESOURCE_TEMPLATE,
                "name": "Test Resource Template",
                "mimeType": "text/plain"
            }
        ]
    })
}

pub fn is_known_resource(uri: &str) -> bool {
    uri == TEST_RESOURCE_URI
}

pub fn read_resource(params: &Map<String, Value>) -> Result<Value, RpcError> {
    let uri = required_string(params, "uri")?;
    if !is_known_resource(&uri) {
        return Err(ToolError::new(codes::UNKNOWN_RESOURCE, format!("Unknown resource: {uri}"))
            .with_field("uri")
            .into());
    }
    Ok(json!({
        "contents": [
            {
                "uri": TEST_RESOURCE_URI,
                "mimeType": "text/plain",
                "text": TEST_RESOURCE_TEXT
            }
        ]
    }))
}

pub fn prompts_list_payload() -> Value {
    json!({
        "prompts": [
            {
                "name": TEST_PROMPT,
                "description": "test prompt for MCP functionality testing"
            },
            {
                "name": TEST_COMPLETION_PROMPT,
                "description": "test completion for MCP functionality testing",
                "arguments": [
                    {
                        "name": "prompt",
                        "description": "test prompt for MCP functionality testing",
                        "required": true
                    }
                ]
            }
        ]
    })
}

pub fn get_prompt(params: &Map<String, Value>) -> Result<Value, RpcError> {
    let name = required_string(params, "name")?;
    let arguments = params
        .get("arguments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match name.as_str() {
        TEST_PROMPT => Ok(json!({
            "description": "MCP functionality test prompt",
            "messages": [
                {
                    "role": "user",
                    "content": {
                        "type": "text",
                        "text": "test is passed,continue test"
                    }
                }
            ]
        })),
        TEST_COMPLETION_PROMPT => {
            let prompt = arg_optional_string(&arguments, "prompt")?.unwrap_or_default();
            Ok(json!({
                "description": "MCP functionality test completion",
                "messages": [
                    {
                        "role": "user",
                        "content": {
                            "type": "text",
                            "text": format!("continue test, with user input prompt: {prompt}")
                        }
                    }
                ]
            }))
        }
        other => Err(ToolError::new(codes::UNKNOWN_PROMPT, format!("Unknown prompt: {other}"))
            .with_field("name")
            .into()),
    }
}

pub fn complete(params: &Map<String, Value>) -> Result<Value, RpcError> {
    let ref_type = params
        .get("ref")
        .and_then(|reference| reference.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let value = match ref_type {
        "ref/prompt" => "example prompt completion value",
        "ref/resource" => "example resource completion value",
        other => {
            return Err(RpcError::invalid_params(format!(
                "Invalid completion reference: {other}"
            )));
        }
    };
    Ok(json!({
        "completion": {
            "values": [value],
            "total": 1,
            "hasMore": false
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn reading_unknown_resource_is_invalid_params() {
        let err = read_resource(&params(json!({"uri": "file://elsewhere.txt"}))).expect_err("unknown");
        assert_eq!(err.code, -32602);
        let ok = read_resource(&params(json!({"uri": TEST_RESOURCE_URI}))).expect("known");
        assert_eq!(ok["contents"][0]["uri"], TEST_RESOURCE_URI);
    }

    #[test]
    fn completion_prompt_echoes_argument() {
        let result = get_prompt(&params(json!({
            "name": TEST_COMPLETION_PROMPT,
            "arguments": {"prompt": "hello"}
        })))
        .expect("prompt");
        assert_eq!(
            result["messages"][0]["content"]["text"],
            "continue test, with user input prompt: hello"
        );
        assert!(get_prompt(&params(json!({"name": "nope"}))).is_err());
    }

    #[test]
    fn completion_rejects_unknown_reference_kind() {
        let prompt = complete(&params(json!({"ref": {"type": "ref/prompt", "name": "test_completion"}})))
            .expect("prompt ref");
        assert_eq!(prompt["completion"]["values"][0], "example prompt completion value");

        let err = complete(&params(json!({"ref": {"type": "ref/other"}}))).expect_err("invalid");
        assert_eq!(err.code, -32602);
    }
}
