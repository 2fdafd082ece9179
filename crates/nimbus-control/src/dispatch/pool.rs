//! Warm-worker backend. Workers register an HTTP endpoint per function;
//! dispatch checks one out round-robin, forwards the invocation and checks
//! it back in. No ready worker means fail-fast `NO_CAPACITY` rather than
//! blocking; the queue timeout is the backstop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use nimbus_common::{FunctionDefaults, InvocationResult};

use crate::dispatch::DispatchOutcome;
use crate::task::InvocationTask;

pub const EXECUTION_ID_HEADER: &str = "X-Execution-Id";
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Ready set of warm worker endpoints per function. Checkout pops the front
/// and checkin pushes the back, which makes selection round-robin and keeps
/// busy workers out of the ready set.
#[derive(Default)]
pub struct WorkerPool {
    ready: DashMap<String, VecDeque<String>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register_worker(&self, function_name: &str, endpoint: String) {
        let mut workers = self.ready.entry(function_name.to_string()).or_default();
        if !workers.contains(&endpoint) {
            workers.push_back(endpoint);
        }
    }

    pub fn remove_function(&self, function_name: &str) {
        self.ready.remove(function_name);
    }

    pub fn ready_count(&self, function_name: &str) -> usize {
        self.ready.get(function_name).map_or(0, |w| w.len())
    }

    pub fn checkout(&self, function_name: &str) -> Option<String> {
        self.ready.get_mut(function_name)?.pop_front()
    }

    pub fn checkin(&self, function_name: &str, endpoint: String) {
        self.ready
            .entry(function_name.to_string())
            .or_default()
            .push_back(endpoint);
    }
}

pub struct PoolDispatcher {
    http: reqwest::Client,
    pool: Arc<WorkerPool>,
    defaults: FunctionDefaults,
}

impl PoolDispatcher {
    pub fn new(http: reqwest::Client, pool: Arc<WorkerPool>, defaults: FunctionDefaults) -> Self {
        Self {
            http,
            pool,
            defaults,
        }
    }

    pub async fn dispatch(&self, task: &InvocationTask) -> DispatchOutcome {
        let Some(endpoint) = self.pool.checkout(&task.function_name) else {
            warn!(function = %task.function_name, "no ready pool worker");
            return DispatchOutcome::Completed(InvocationResult::error(
                "NO_CAPACITY",
                format!("no ready worker for function '{}'", task.function_name),
            ));
        };
        debug!(function = %task.function_name, %endpoint, "forwarding to pool worker");

        let result = self.forward(task, &endpoint).await;
        // Even a failed call returns the worker; eviction is a registration
        // concern, not the dispatcher's.
        self.pool.checkin(&task.function_name, endpoint);
        DispatchOutcome::Completed(result)
    }

    async fn forward(&self, task: &InvocationTask, endpoint: &str) -> InvocationResult {
        let timeout_ms = task.spec.timeout_ms.unwrap_or(self.defaults.timeout_ms);
        let mut request = self
            .http
            .post(endpoint)
            .timeout(Duration::from_millis(timeout_ms))
            .header(EXECUTION_ID_HEADER, &task.execution_id)
            .json(&task.request);
        if let Some(trace_id) = &task.trace_id {
            request = request.header(TRACE_ID_HEADER, trace_id);
        }
        if let Some(key) = &task.idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return InvocationResult::error(
                    "POOL_TIMEOUT",
                    format!("pool request timed out after {timeout_ms}ms"),
                );
            }
            Err(err) => {
                return InvocationResult::error("POOL_ERROR", err.to_string());
            }
        };

        let status = response.status();
        if status.is_success() {
            match response.json::<serde_json::Value>().await {
                Ok(body) => InvocationResult::success(Some(body)),
                Err(err) => InvocationResult::error(
                    "POOL_ERROR",
                    format!("invalid worker response: {err}"),
                ),
            }
        } else {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            InvocationResult::error("POOL_ERROR", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{FunctionSpec, InvocationRequest};
    use std::time::Instant;

    fn task(name: &str) -> InvocationTask {
        let mut spec = FunctionSpec::new(name, "img");
        spec.timeout_ms = Some(50);
        InvocationTask::new(
            "e-1",
            Arc::new(spec),
            InvocationRequest::default(),
            None,
            None,
            Instant::now(),
        )
    }

    #[test]
    fn checkout_and_checkin_rotate_workers() {
        let pool = WorkerPool::new();
        pool.register_worker("f", "http://a".into());
        pool.register_worker("f", "http://b".into());
        // Duplicate registrations are ignored.
        pool.register_worker("f", "http://a".into());
        assert_eq!(pool.ready_count("f"), 2);

        let first = pool.checkout("f").expect("worker");
        assert_eq!(first, "http://a");
        pool.checkin("f", first);
        let second = pool.checkout("f").expect("worker");
        assert_eq!(second, "http://b");
    }

    #[test]
    fn checked_out_workers_leave_the_ready_set() {
        let pool = WorkerPool::new();
        pool.register_worker("f", "http://a".into());
        let worker = pool.checkout("f").expect("worker");
        assert!(pool.checkout("f").is_none());
        pool.checkin("f", worker);
        assert_eq!(pool.ready_count("f"), 1);
    }

    #[tokio::test]
    async fn empty_pool_fails_fast_with_no_capacity() {
        let dispatcher = PoolDispatcher::new(
            reqwest::Client::new(),
            Arc::new(WorkerPool::new()),
            FunctionDefaults::default(),
        );
        let DispatchOutcome::Completed(result) = dispatcher.dispatch(&task("empty")).await else {
            panic!("pool dispatch always completes");
        };
        assert_eq!(result.error_code(), Some("NO_CAPACITY"));
    }

    #[tokio::test]
    async fn unreachable_worker_reports_pool_error_and_returns_worker() {
        let pool = Arc::new(WorkerPool::new());
        // Nothing listens on this port.
        pool.register_worker("f", "http://127.0.0.1:1/invoke".into());
        let dispatcher =
            PoolDispatcher::new(reqwest::Client::new(), pool.clone(), FunctionDefaults::default());
        let DispatchOutcome::Completed(result) = dispatcher.dispatch(&task("f")).await else {
            panic!("pool dispatch always completes");
        };
        assert!(!result.success);
        assert!(matches!(
            result.error_code(),
            Some("POOL_ERROR") | Some("POOL_TIMEOUT")
        ));
        assert_eq!(pool.ready_count("f"), 1);
    }
}
