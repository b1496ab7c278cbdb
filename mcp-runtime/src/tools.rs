use host_evals_core::tasks::tools;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema
        })
    }
}

pub fn tool_definitions(triggerable: &[String], callback_events: &[&str]) -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: tools::TEST_GUIDE,
            description: format!(
                "Assessment task iteration tool that guides users to complete MCP protocol testing step by step. \
                 You must follow the instructions for each task and complete the specified operation before proceeding to the next task. \
                 After finishing the current task, use this tool to move to the next step. \
                 Before starting the assessment, call this tool with action 'reset' to reset the test state. \
                 After completing all tasks, you must call tool '{}' to get the test result.",
                tools::GET_RESULT
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "step": {
                        "type": "number",
                        "description": "Test step number to execute, starting from 1, it means the first step",
                        "minimum": 1
                    },
                    "action": {
                        "type": "string",
                        "description": "Operation type: next (next step), reset (reset)",
                        "enum": ["next", "reset"],
                        "default": "next"
                    }
                }
            }),
        },
        ToolDefinition {
            name: tools::TEST_TOOL_CALL,
            description: "Test tool_call invocation tool".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_name": {
                        "type": "string",
                        "description": "Name of the tool to call"
                    }
                }
            }),
        },
        ToolDefinition {
            name: tools::TRIGGER_EVENT,
            description: "Trigger an event and track whether the corresponding callback method is executed".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "event_type": {
                        "type": "string",
                        "description": "Type of event to trigger",
                        "enum": triggerable
                    },
                    "data": {
                        "type": "object",
                        "description": "Extra notification params, kept with the pending event"
                    }
                },
                "required": ["event_type"]
            }),
        },
        ToolDefinition {
            name: tools::CALLBACK,
            description: "Callback tool to confirm that a notification event has been received and processed by the client".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "event_name": {
                        "type": "string",
                        "description": "Name of the event that was received (e.g., 'notifications/progress', 'notifications/message')",
                        "enum": callback_events
                    },
                    "message": {
                        "type": "string",
                        "description": "The value the user read from the notification"
                    }
                },
                "required": ["event_name"]
            }),
        },
        ToolDefinition {
            name: tools::GET_RESULT,
            description: "Get the test results showing which MCP features have passed and which have failed. This tool should be called after all tasks are completed.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}

pub fn tools_list_payload(definitions: &[ToolDefinition]) -> Value {
    json!({
        "tools": definitions.iter().map(ToolDefinition::to_value).collect::<Vec<_>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_an_object_schema() {
        let definitions = tool_definitions(&["ping".to_string()], &["notifications/message"]);
        let names: Vec<&str> = definitions.iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                tools::TEST_GUIDE,
                tools::TEST_TOOL_CALL,
                tools::TRIGGER_EVENT,
                tools::CALLBACK,
                tools::GET_RESULT
            ]
        );
        for definition in &definitions {
            assert_eq!(definition.input_schema["type"], "object", "{}", definition.name);
        }
        let payload = tools_list_payload(&definitions);
        assert_eq!(
            payload["tools"][2]["inputSchema"]["properties"]["event_type"]["enum"],
            json!(["ping"])
        );
    }
}
