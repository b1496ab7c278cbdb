use thiserror::Error;

/// Raised when a feature catalog is internally inconsistent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("feature '{0}' is listed as both passive and active")]
    Overlap(String),
    #[error("feature '{0}' is listed more than once")]
    Duplicate(String),
    #[error("callback source '{0}' is not an active feature")]
    CallbackSourceNotActive(String),
    #[error("callback target '{target}' for '{event}' is not a passive feature")]
    CallbackTargetNotPassive { event: String, target: String },
    #[error("protected feature '{0}' is not part of the catalog")]
    UnknownProtected(String),
}

/// Machine-readable codes carried in tool error payloads.
pub mod codes {
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const UNKNOWN_EVENT: &str = "unknown_event";
    pub const UNKNOWN_CALLBACK: &str = "unknown_callback";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const UNKNOWN_PROMPT: &str = "unknown_prompt";
    pub const UNKNOWN_RESOURCE: &str = "unknown_resource";
}
