use std::sync::Arc;
use std::time::Instant;

use nimbus_common::{FunctionSpec, InvocationRequest};

/// Immutable unit of work handed from admission to dispatch. Carries a
/// snapshot of the spec taken at admission time so later re-registration
/// cannot change in-flight behavior.
#[derive(Debug, Clone)]
pub struct InvocationTask {
    pub execution_id: String,
    pub function_name: String,
    pub spec: Arc<FunctionSpec>,
    pub request: InvocationRequest,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub enqueued_at: Instant,
    /// Starts at 1, incremented for each retry attempt.
    pub attempt: u32,
}

impl InvocationTask {
    pub fn new(
        execution_id: impl Into<String>,
        spec: Arc<FunctionSpec>,
        request: InvocationRequest,
        idempotency_key: Option<String>,
        trace_id: Option<String>,
        enqueued_at: Instant,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            function_name: spec.name.clone(),
            spec,
            request,
            idempotency_key,
            trace_id,
            enqueued_at,
            attempt: 1,
        }
    }

    /// Next attempt for the retry path. The idempotency key is dropped since
    /// retries are internal, not caller-initiated.
    pub fn retry(&self, enqueued_at: Instant) -> Self {
        Self {
            execution_id: self.execution_id.clone(),
            function_name: self.function_name.clone(),
            spec: self.spec.clone(),
            request: self.request.clone(),
            idempotency_key: None,
            trace_id: self.trace_id.clone(),
            enqueued_at,
            attempt: self.attempt + 1,
        }
    }
}
