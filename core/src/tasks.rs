use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::tracker::FeatureTracker;

/// Tool names the scripted instructions refer to.
pub mod tools {
    pub const TEST_GUIDE: &str = "mcp_test_guide";
    pub const TEST_TOOL_CALL: &str = "test_tool_call";
    pub const TRIGGER_EVENT: &str = "trigger_event";
    pub const CALLBACK: &str = "callback";
    pub const GET_RESULT: &str = "get_result";
}

pub const TEST_RESOURCE_URI: &str = "file://test-resource/test-resource.txt";

const USER_HANDLER_PROMPT: &str = "This test does not require calling any tools, it needs to wait for user operations, and when the user answers 'continue', it will continue to evaluate.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub title: String,
    pub description: String,
    pub protocol: String,
    pub instructions: Vec<String>,
    pub is_manual: bool,
}

impl Task {
    fn new(
        title: &str,
        description: &str,
        protocol: &str,
        instructions: Vec<String>,
        is_manual: bool,
    ) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            protocol: protocol.to_string(),
            instructions,
            is_manual,
        }
    }
}

fn trigger(event: &str, rest: &str) -> String {
    format!(
        "Use the {} tool to fire the '{event}' event. {rest}",
        tools::TRIGGER_EVENT
    )
}

/// The scripted MCP host assessment, automatic tasks first.
pub fn mcp_tasks() -> Vec<Task> {
    vec![
        Task::new(
            "Root Directory List Test",
            "Test whether the MCP server can correctly retrieve the root directory list of the client roots",
            "roots/list",
            vec![trigger(
                "roots/list",
                "This will test the client's ability to answer a roots/list request from the server.",
            )],
            false,
        ),
        Task::new(
            "Resource List Changed Notification Test",
            "Test the client's ability to receive and respond to resource list change notifications",
            "notifications/resources/list_changed",
            vec![trigger(
                "notifications/resources/list_changed",
                "This will test whether the client properly receives the notification and responds by calling the resources/list endpoint to refresh its resource cache.",
            )],
            false,
        ),
        Task::new(
            "Prompt List Changed Notification Test",
            "Test the client's ability to receive and respond to prompt list change notifications",
            "notifications/prompts/list_changed",
            vec![trigger(
                "notifications/prompts/list_changed",
                "This will test whether the client properly receives the notification and responds by calling the prompts/list endpoint to refresh its prompt cache.",
            )],
            false,
        ),
        Task::new(
            "Tools List Changed Notification Test",
            "Test the client's ability to receive and respond to tools list change notifications",
            "notifications/tools/list_changed",
            vec![trigger(
                "notifications/tools/list_changed",
                "This will test whether the client properly receives the notification and responds by calling the tools/list endpoint to refresh its tool cache.",
            )],
            false,
        ),
        Task::new(
            "Ping Test",
            "Test the client's ability to answer a ping from the MCP server",
            "ping",
            vec![trigger("ping", "")],
            false,
        ),
        Task::new(
            "Logging Set Level Test",
            "Test the client's ability to set the logging level of the MCP server",
            "logging/setLevel",
            vec![
                USER_HANDLER_PROMPT.to_string(),
                "You must ask user to change the logging level (e.g. 'info', 'warning', 'error'), if user input 'continue', you should skip this step.".to_string(),
            ],
            true,
        ),
        Task::new(
            "Resource Management Test",
            "Test whether the client can correctly retrieve and read resources from the MCP server",
            "resources/list,resources/read",
            vec![
                USER_HANDLER_PROMPT.to_string(),
                "You must ask the user to select and send a resource from the current host. Before user send new message, you shouldn't do anything.".to_string(),
                format!("The required resource URI is: {TEST_RESOURCE_URI}."),
            ],
            true,
        ),
        Task::new(
            "Resource Subscribe Test",
            "Test whether the client can correctly subscribe to resources from the MCP server",
            "resources/subscribe,resources/unsubscribe",
            vec![
                USER_HANDLER_PROMPT.to_string(),
                format!(
                    "You must ask the user to subscribe to the resource uri:'{TEST_RESOURCE_URI}' from the current host."
                ),
                format!(
                    "And then when user input 'continue', you should call the tool '{}' with event_type 'notifications/resources/updated' to trigger the subscription event.",
                    tools::TRIGGER_EVENT
                ),
                format!(
                    "And then ask user to unsubscribe from the resource uri:'{TEST_RESOURCE_URI}' in the current host."
                ),
                "And then when user input 'continue', continue to the next step.".to_string(),
            ],
            true,
        ),
        Task::new(
            "Prompt Management Test",
            "Test whether the client can correctly retrieve and use prompts from the MCP server",
            "prompts/list,prompts/get",
            vec![
                USER_HANDLER_PROMPT.to_string(),
                "You must ask the user to send a prompt named 'test_prompt' to the server.".to_string(),
            ],
            true,
        ),
        Task::new(
            "Completion Management Test",
            "Test whether the client can correctly retrieve and use completions from the MCP server",
            "completion/complete",
            vec![
                USER_HANDLER_PROMPT.to_string(),
                "You must ask the user to send prompt named 'test_completion' to the server.".to_string(),
                "test_completion is a prompt that will trigger a completion from the server, if host is support completion".to_string(),
            ],
            true,
        ),
        Task::new(
            "Progress Notification Test",
            "Test the client's ability to receive and display progress notifications",
            "notifications/progress",
            vec![
                trigger(
                    "notifications/progress",
                    "This will test whether the client can properly receive and display progress updates from the server.",
                ),
                "You must ask user to input the progress message content (a float number, e.g. '0.52134213222121') to continue. If user input 'continue', you should skip this step.".to_string(),
                format!(
                    "If user input the progress message content, you should call the tool '{}' with event_name 'notifications/progress' and message content to confirm that you have successfully received and processed the notification.",
                    tools::CALLBACK
                ),
            ],
            true,
        ),
        Task::new(
            "Message Notification Test",
            "Test the client's ability to receive and process server message notifications",
            "notifications/message",
            vec![
                trigger(
                    "notifications/message",
                    "This will test whether the client can properly receive and process server-sent log messages and their content.",
                ),
                "You must ask user to input the message content (a string, e.g. '0b7e3c54-3a55-4f38-9d7e-1c2a9f1d2c11') to continue. If user input 'continue', you should skip this step.".to_string(),
                format!(
                    "If user input the message, you must call the tool '{}' with event_name 'notifications/message' with message content to confirm that you have successfully received and processed the notification.",
                    tools::CALLBACK
                ),
            ],
            true,
        ),
        Task::new(
            "Sampling Create Message Test",
            "Test the client's ability to create a message for the MCP server",
            "sampling/createMessage",
            vec![
                trigger("sampling/createMessage", ""),
                "Tell user if client has alerted some message, they must accept the request in the host application.".to_string(),
                "If nothing alerts, user should input 'continue' to skip this step.".to_string(),
            ],
            true,
        ),
        Task::new(
            "Elicitation Create Test",
            "Test the client's ability to answer an elicitation from the MCP server",
            "elicitation/create",
            vec![
                trigger("elicitation/create", ""),
                "Tell user if client has alerted some message, they must accept the request in the host application.".to_string(),
                "If nothing alerts, user should input 'continue' to skip this step.".to_string(),
            ],
            true,
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepAction {
    #[default]
    Next,
    Reset,
}

impl StepAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "next" | "current" => Some(StepAction::Next),
            "reset" => Some(StepAction::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperState {
    Idle,
    Running(usize),
    Completed,
}

impl StepperState {
    pub fn as_str(self) -> &'static str {
        match self {
            StepperState::Idle => "idle",
            StepperState::Running(_) => "running",
            StepperState::Completed => "completed",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("step numbers start at 1")]
    ZeroStep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReply {
    pub state: StepperState,
    /// The step the reply describes; `None` for reset and completion replies.
    pub step: Option<usize>,
    pub total: usize,
    pub text: String,
    pub task: Option<Task>,
}

/// Linear cursor over an immutable task script.
#[derive(Debug, Clone)]
pub struct TaskStepper {
    tasks: Arc<[Task]>,
    state: StepperState,
}

impl TaskStepper {
    pub fn new(mut tasks: Vec<Task>) -> Self {
        // Stable: automatic tasks keep their relative order ahead of manual ones.
        tasks.sort_by_key(|task| task.is_manual);
        Self {
            tasks: tasks.into(),
            state: StepperState::Idle,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    pub fn manual_task_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.is_manual).count()
    }

    /// `step` is caller supplied and may jump or replay; omitted means the
    /// current cursor. Reset wipes the tracker's status, pending events and
    /// confirmations.
    pub fn advance(
        &mut self,
        step: Option<usize>,
        action: StepAction,
        tracker: &FeatureTracker,
    ) -> Result<StepReply, StepError> {
        let total = self.tasks.len();

        if action == StepAction::Reset {
            tracker.reset();
            tracker.clear_pending_events();
            tracker.clear_confirmations();
            self.state = StepperState::Running(1);
            return Ok(StepReply {
                state: self.state,
                step: None,
                total,
                text: "Test progress has been reset, will start from the first task. Please call this tool again to start testing. step is 1.".to_string(),
                task: None,
            });
        }

        let step = match step {
            Some(0) => return Err(StepError::ZeroStep),
            Some(step) => step,
            None => match self.state {
                StepperState::Idle => 1,
                StepperState::Running(current) => current,
                StepperState::Completed => total + 1,
            },
        };

        if step > total {
            self.state = StepperState::Completed;
            return Ok(StepReply {
                state: self.state,
                step: None,
                total,
                text: format!(
                    "🎉 Congratulations! All assessment tasks have been completed! Please call the tool {} to get the test result. Ensure you tell the user everything about the test result.",
                    tools::GET_RESULT
                ),
                task: None,
            });
        }

        let task = &self.tasks[step - 1];
        self.state = StepperState::Running(step);
        Ok(StepReply {
            state: self.state,
            step: Some(step),
            total,
            text: render_task(task, step, total),
            task: Some(task.clone()),
        })
    }
}

fn render_task(task: &Task, step: usize, total: usize) -> String {
    let footer = if step < total {
        format!(
            "🔄 **Continue**: Please complete the current test and continue to the next task, next step is {}",
            step + 1
        )
    } else {
        "🏁 **Almost Done**: This is the last test task".to_string()
    };
    format!(
        "**Task ID**: {step}\n**MCP Protocol Assessment Task {step}/{total}**\n\n**Task Title**: {}\n**Test Protocol**: {}\n**Task Description**: {}\n\n**Task Instructions**: {}\n\n{footer}",
        task.title,
        task.protocol,
        task.description,
        task.instructions.join("\n"),
    )
}
