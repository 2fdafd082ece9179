//! Declarative one-shot job description for the cluster backend. The shape
//! follows the batch Job resource of the target substrate: metadata with
//! labels, a pod template with a single "function" container, no restarts.
//! Retries belong to the scheduler via attempt/max_retries, never to the
//! orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::InvocationTask;

pub const ENV_FUNCTION_NAME: &str = "NIMBUS_FUNCTION";
pub const ENV_EXECUTION_ID: &str = "NIMBUS_EXECUTION_ID";
pub const ENV_TRACE_ID: &str = "NIMBUS_TRACE_ID";
pub const ENV_TIMEOUT_MS: &str = "NIMBUS_TIMEOUT_MS";
pub const ENV_RUNTIME_MODE: &str = "NIMBUS_RUNTIME_MODE";
pub const ENV_RUNTIME_COMMAND: &str = "NIMBUS_RUNTIME_CMD";
pub const ENV_CALLBACK_URL: &str = "NIMBUS_CALLBACK_URL";
pub const ENV_PAYLOAD: &str = "NIMBUS_PAYLOAD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: JobMetadata,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub backoff_limit: u32,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<SecretReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretReference {
    pub name: String,
}

/// Renders a [`JobManifest`] from a function spec and an invocation task.
pub struct JobBuilder {
    callback_url: String,
}

impl JobBuilder {
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self {
            callback_url: callback_url.into(),
        }
    }

    pub fn build(&self, task: &InvocationTask) -> JobManifest {
        let spec = &task.spec;

        let mut env = vec![
            EnvVar::new(ENV_FUNCTION_NAME, &task.function_name),
            EnvVar::new(ENV_EXECUTION_ID, &task.execution_id),
        ];
        if let Some(trace_id) = &task.trace_id {
            env.push(EnvVar::new(ENV_TRACE_ID, trace_id));
        }
        if let Some(timeout_ms) = spec.timeout_ms {
            env.push(EnvVar::new(ENV_TIMEOUT_MS, timeout_ms.to_string()));
        }
        if let Some(mode) = spec.runtime_mode {
            let mode = serde_json::to_string(&mode).unwrap_or_default();
            env.push(EnvVar::new(ENV_RUNTIME_MODE, mode.trim_matches('"')));
        }
        if let Some(command) = &spec.runtime_command {
            if !command.is_empty() {
                env.push(EnvVar::new(ENV_RUNTIME_COMMAND, command));
            }
        }
        env.push(EnvVar::new(ENV_CALLBACK_URL, &self.callback_url));
        let payload =
            serde_json::to_string(&task.request).unwrap_or_else(|_| "{\"input\":null}".into());
        env.push(EnvVar::new(ENV_PAYLOAD, payload));
        for (key, value) in &spec.env {
            env.push(EnvVar::new(key, value));
        }

        let mut resources = ResourceRequirements::default();
        if let Some(requests) = &spec.resources {
            if let Some(cpu) = &requests.cpu {
                resources.requests.insert("cpu".into(), cpu.clone());
                resources.limits.insert("cpu".into(), cpu.clone());
            }
            if let Some(memory) = &requests.memory {
                resources.requests.insert("memory".into(), memory.clone());
                resources.limits.insert("memory".into(), memory.clone());
            }
        }

        let mut labels = BTreeMap::new();
        labels.insert("app".into(), "nimbus".into());
        labels.insert("function".into(), task.function_name.clone());
        labels.insert("execution-id".into(), task.execution_id.clone());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nimbus/trace-id".into(),
            task.trace_id.clone().unwrap_or_default(),
        );
        annotations.insert(
            "nimbus/idempotency-key".into(),
            task.idempotency_key.clone().unwrap_or_default(),
        );

        JobManifest {
            api_version: "batch/v1".into(),
            kind: "Job".into(),
            metadata: JobMetadata {
                generate_name: format!("fn-{}-", task.function_name),
                labels,
                annotations,
            },
            spec: JobSpec {
                // One attempt per job; the control plane decides on retries.
                backoff_limit: 0,
                template: PodTemplateSpec {
                    spec: PodSpec {
                        containers: vec![ContainerSpec {
                            name: "function".into(),
                            image: spec.image.clone(),
                            command: spec.command.clone(),
                            env,
                            resources,
                        }],
                        restart_policy: "Never".into(),
                        image_pull_secrets: spec
                            .image_pull_secrets
                            .iter()
                            .map(|name| SecretReference { name: name.clone() })
                            .collect(),
                    },
                },
            },
        }
    }
}
