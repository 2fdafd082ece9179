// API types for the nimbus gateway

use chrono::{DateTime, Utc};
use nimbus_common::{ErrorInfo, InvocationResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Service unavailable")]
    ServiceUnavailable,
}

/// Response to a synchronous or asynchronous invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub execution_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl InvokeResponse {
    pub fn from_result(execution_id: String, result: InvocationResult) -> Self {
        let status = if result.success {
            "success"
        } else if matches!(result.error_code(), Some("TIMEOUT") | Some("QUEUE_TIMEOUT")) {
            "timeout"
        } else {
            "error"
        };
        Self {
            execution_id,
            status: status.to_string(),
            output: result.output,
            error: result.error,
        }
    }

    pub fn queued(execution_id: String) -> Self {
        Self {
            execution_id,
            status: "queued".to_string(),
            output: None,
            error: None,
        }
    }
}

/// Execution lookup payload; `status` is one of pending | running | success
/// | error | timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatusResponse {
    pub execution_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Inbound completion callback from a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionCallback {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl From<CompletionCallback> for InvocationResult {
    fn from(callback: CompletionCallback) -> Self {
        InvocationResult {
            success: callback.success,
            output: callback.output,
            error: callback.error,
        }
    }
}

/// Machine-readable error body used for conflicts, not-found and backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u32>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            retry_after_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invoke_response_maps_result_status() {
        let ok = InvokeResponse::from_result(
            "e-1".into(),
            InvocationResult::success(Some(json!("out"))),
        );
        assert_eq!(ok.status, "success");
        let err = InvokeResponse::from_result(
            "e-2".into(),
            InvocationResult::error("POOL_ERROR", "boom"),
        );
        assert_eq!(err.status, "error");
        assert_eq!(err.error.expect("error info").code, "POOL_ERROR");
    }

    #[test]
    fn callback_converts_to_invocation_result() {
        let callback: CompletionCallback =
            serde_json::from_str(r#"{"success":true,"output":{"n":1}}"#).expect("parse");
        let result: InvocationResult = callback.into();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"n":1})));
    }
}
