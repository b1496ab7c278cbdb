use host_evals_core::error::codes;
use serde_json::{Map, Value};

use crate::rpc::ToolError;

pub fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    match args.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(ToolError::new(
            codes::INVALID_ARGUMENT,
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        Some(_) => Err(
            ToolError::new(codes::INVALID_ARGUMENT, format!("'{key}' must be a string"))
                .with_field(key),
        ),
        None => Err(ToolError::new(
            codes::INVALID_ARGUMENT,
            format!("Missing required field '{key}'"),
        )
        .with_field(key)),
    }
}

pub fn arg_optional_string(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(
            ToolError::new(codes::INVALID_ARGUMENT, format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

/// Accepts integers and integral floats (some hosts send `1.0`).
pub fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_u64() {
                return Ok(Some(value));
            }
            match number.as_f64() {
                Some(value) if value >= 0.0 && value.fract() == 0.0 => Ok(Some(value as u64)),
                _ => Err(ToolError::new(
                    codes::INVALID_ARGUMENT,
                    format!("'{key}' must be a non-negative integer"),
                )
                .with_field(key)),
            }
        }
        Some(Value::String(raw)) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            ToolError::new(
                codes::INVALID_ARGUMENT,
                format!("'{key}' must be a non-negative integer"),
            )
            .with_field(key)
        }),
        Some(_) => Err(ToolError::new(
            codes::INVALID_ARGUMENT,
            format!("'{key}' must be a non-negative integer"),
        )
        .with_field(key)),
    }
}

pub fn params_object(params: &Value) -> Map<String, Value> {
    params.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn optional_u64_accepts_integral_numbers_and_strings() {
        let map = args(json!({"a": 3, "b": 2.0, "c": "7", "d": 1.5, "e": -1}));
        assert_eq!(arg_optional_u64(&map, "a").unwrap(), Some(3));
        assert_eq!(arg_optional_u64(&map, "b").unwrap(), Some(2));
        assert_eq!(arg_optional_u64(&map, "c").unwrap(), Some(7));
        assert!(arg_optional_u64(&map, "d").is_err());
        assert!(arg_optional_u64(&map, "e").is_err());
        assert_eq!(arg_optional_u64(&map, "missing").unwrap(), None);
    }

    #[test]
    fn required_string_reports_field() {
        let err = required_string(&args(json!({})), "event_type").expect_err("missing");
        assert_eq!(err.field.as_deref(), Some("event_type"));
        assert!(required_string(&args(json!({"event_type": " "})), "event_type").is_err());
    }
}
