use serde::Serialize;
use serde_json::Value;

use crate::invocation::event_field;

pub const MESSAGE_VERSION: &str = "1.0";

/// The fixed wire contract the calling orchestrator expects back from the
/// dispatcher. Serialization order is fixed by the struct layout, so
/// identical inputs always produce byte-identical envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    #[serde(rename = "messageVersion")]
    pub message_version: String,
    pub response: ActionResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub action_group: String,
    pub api_path: String,
    pub http_method: String,
    pub http_status_code: u16,
    pub response_body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseBody {
    #[serde(rename = "application/json")]
    pub json: JsonBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonBody {
    pub body: Value,
}

/// Wraps a result (or error body) into the action-group envelope. Always
/// succeeds; absent event fields take the documented defaults.
pub fn build_response(code: u16, body: Value, event: &Value) -> ApiResponse {
    ApiResponse {
        message_version: MESSAGE_VERSION.to_string(),
        response: ActionResponse {
            action_group: event_field(event, "actionGroup", "defaultGroup"),
            api_path: event_field(event, "apiPath", "unknown"),
            http_method: event_field(event, "httpMethod", "POST"),
            http_status_code: code,
            response_body: ResponseBody {
                json: JsonBody { body },
            },
        },
    }
}
