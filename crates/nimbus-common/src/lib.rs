// Shared model types for the nimbus control plane. Re-export dependencies
// used in public interfaces of common types.

use std::collections::HashMap;
use std::fmt::Display;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

#[derive(Error, Debug)]
pub enum NimbusError {
    #[error("Registry Error: {0}")]
    Registry(String),

    #[error("Dispatch Error: {0}")]
    Dispatch(String),

    #[error("Queue Error: {0}")]
    Queue(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Function Spec Invalid: {0}")]
    SpecInvalid(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for nimbus operations
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Which backend services a function's invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Local,
    Pool,
    Cluster,
}

/// How the backend process is driven by the runtime shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeMode {
    Http,
    Stdio,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingStrategy {
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyControlMode {
    Fixed,
    StaticPerPod,
    AdaptivePerPod,
}

/// Resource requests forwarded to the execution substrate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetric {
    pub name: String,
    pub target: String,
}

impl ScalingMetric {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

/// Per-function concurrency control knobs. Unset fields are filled by the
/// spec resolver at registration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyControlConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConcurrencyControlMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_in_flight_per_pod: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_target_in_flight_per_pod: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_target_in_flight_per_pod: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upscale_cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downscale_cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_load_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_load_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ScalingStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<ScalingMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_control: Option<ConcurrencyControlConfig>,
}

/// Immutable function descriptor. Created at registration, replaced only by
/// remove + re-register. Optional fields left unset by the caller are filled
/// in by the spec resolver from [`FunctionDefaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_mode: Option<RuntimeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

impl FunctionSpec {
    /// Minimal spec with everything else left for the resolver.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: HashMap::new(),
            resources: None,
            timeout_ms: None,
            concurrency: None,
            queue_size: None,
            max_retries: None,
            endpoint_url: None,
            execution_mode: None,
            runtime_mode: None,
            runtime_command: None,
            scaling: None,
            image_pull_secrets: Vec::new(),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode.unwrap_or(ExecutionMode::Cluster)
    }
}

/// Process-wide fallbacks applied by the spec resolver when a registration
/// leaves a field unset. Passed explicitly into the resolver at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDefaults {
    pub timeout_ms: u64,
    pub concurrency: u32,
    pub queue_size: u32,
    pub max_retries: u32,
}

impl Default for FunctionDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            concurrency: 2,
            queue_size: 16,
            max_retries: 0,
        }
    }
}

/// Caller-supplied invocation payload. Never mutated by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl InvocationRequest {
    pub fn from_input(input: serde_json::Value) -> Self {
        Self {
            input,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Uniform outcome of one execution attempt, whichever backend ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl InvocationResult {
    pub fn success(output: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl Display for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InvocationResult(success: {}, output: {:?}, error: {:?})",
            self.success, self.output, self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_serialization() {
        let mut spec = FunctionSpec::new("word-stats", "registry.local/word-stats:1.2");
        spec.command = vec!["/app/run".to_string()];
        spec.timeout_ms = Some(5_000);
        spec.execution_mode = Some(ExecutionMode::Cluster);
        spec.runtime_mode = Some(RuntimeMode::Http);

        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"CLUSTER\""));
        assert!(json.contains("\"timeoutMs\":5000"));

        let back: FunctionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_minimal_spec_deserializes_with_unset_fields() {
        let spec: FunctionSpec =
            serde_json::from_str(r#"{"name":"echo","image":"local"}"#).unwrap();
        assert_eq!(spec.name, "echo");
        assert!(spec.timeout_ms.is_none());
        assert!(spec.command.is_empty());
        assert_eq!(spec.execution_mode(), ExecutionMode::Cluster);
    }

    #[test]
    fn test_result_round_trip() {
        let ok = InvocationResult::success(Some(json!({"n": 3})));
        let json = serde_json::to_string(&ok).unwrap();
        let back: InvocationResult = serde_json::from_str(&json).unwrap();
        assert!(back.success);
        assert_eq!(back.output, Some(json!({"n": 3})));

        let err = InvocationResult::error("QUEUE_TIMEOUT", "Queue wait exceeded");
        assert_eq!(err.error_code(), Some("QUEUE_TIMEOUT"));
        assert!(!err.success);
    }
}
