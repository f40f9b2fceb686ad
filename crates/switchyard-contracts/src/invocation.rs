use serde_json::Value;

use crate::errors::DispatchError;

/// One normalized inbound action invocation. Built per call from the raw
/// action event, discarded once the envelope is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub model_id: String,
    pub prompt: String,
    pub action_group: String,
    pub api_path: String,
    pub http_method: String,
}

impl InvocationRequest {
    /// Parses the model-dispatch parameters out of an action event.
    /// Missing `modelId` or `prompt` is a validation failure, not a fault.
    pub fn from_event(event: &Value) -> Result<Self, DispatchError> {
        let model_id = named_parameter(event, "modelId")?;
        let prompt = named_parameter(event, "prompt")?;
        Ok(Self {
            model_id,
            prompt,
            action_group: event_field(event, "actionGroup", "defaultGroup"),
            api_path: event_field(event, "apiPath", "unknown"),
            http_method: event_field(event, "httpMethod", "POST"),
        })
    }
}

/// Fetches a named entry from the event's `parameters` list.
pub fn named_parameter(event: &Value, name: &str) -> Result<String, DispatchError> {
    event
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|item| item.get("value").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| DispatchError::validation(format!("Missing named parameter '{name}'")))
}

pub fn event_field(event: &Value, key: &str, default: &str) -> String {
    event
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}
