//! Invocation path: creates (or reuses) the execution record, routes the
//! task through admission or straight to dispatch, suspends the caller on
//! the completion slot and applies the retry policy when attempts fail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use nimbus_common::{FunctionDefaults, FunctionSpec, InvocationRequest, InvocationResult};

use crate::dispatch::{DispatchOutcome, DispatcherRouter};
use crate::estimator::WaitEstimator;
use crate::idempotency::IdempotencyStore;
use crate::queue::QueueManager;
use crate::registry::FunctionService;
use crate::store::{
    ExecutionRecord, ExecutionSnapshot, ExecutionStore, QUEUE_TIMEOUT_CODE, SYNC_TIMEOUT_CODE,
};
use crate::sync_queue::SyncQueueService;
use crate::task::InvocationTask;
use crate::{Error, RejectReason, Result};

/// Outcome of a synchronous invocation: the execution id plus whatever the
/// completion slot resolved to.
#[derive(Debug)]
pub struct InvokeOutcome {
    pub execution_id: String,
    pub result: InvocationResult,
}

struct ExecutionLookup {
    record: Arc<ExecutionRecord>,
    is_new: bool,
}

pub struct InvocationService {
    functions: Arc<FunctionService>,
    store: Arc<ExecutionStore>,
    idempotency: Arc<IdempotencyStore>,
    router: Arc<DispatcherRouter>,
    queues: Arc<QueueManager>,
    sync_queue: Arc<SyncQueueService>,
    estimator: Arc<WaitEstimator>,
    defaults: FunctionDefaults,
}

impl InvocationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        functions: Arc<FunctionService>,
        store: Arc<ExecutionStore>,
        idempotency: Arc<IdempotencyStore>,
        router: Arc<DispatcherRouter>,
        queues: Arc<QueueManager>,
        sync_queue: Arc<SyncQueueService>,
        estimator: Arc<WaitEstimator>,
        defaults: FunctionDefaults,
    ) -> Self {
        Self {
            functions,
            store,
            idempotency,
            router,
            queues,
            sync_queue,
            estimator,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.store.get(execution_id).map(|r| r.snapshot())
    }

    /// Synchronous invocation: admits, dispatches and waits for the result
    /// up to the spec timeout (or the caller's override). A queue timeout
    /// surfaces as a retryable rejection, not a server failure.
    #[instrument(skip(self, request, idempotency_key, trace_id, timeout_override_ms), fields(function = %function_name))]
    pub async fn invoke(
        self: &Arc<Self>,
        function_name: &str,
        request: InvocationRequest,
        idempotency_key: Option<String>,
        trace_id: Option<String>,
        timeout_override_ms: Option<u64>,
    ) -> Result<InvokeOutcome> {
        let spec = self
            .functions
            .get(function_name)
            .ok_or_else(|| Error::FunctionNotFound(function_name.to_string()))?;
        let lookup = self.create_or_reuse(&spec, request, idempotency_key, trace_id)?;
        let record = lookup.record;

        if lookup.is_new {
            self.submit(record.task())?;
        }

        let timeout_ms = timeout_override_ms
            .or(spec.timeout_ms)
            .unwrap_or(self.defaults.timeout_ms);
        let result = match record.wait(Duration::from_millis(timeout_ms)).await {
            Some(result) => result,
            None => {
                // Caller-imposed wait elapsed first. The attempt is made
                // terminal; if a callback raced us in, its result wins.
                self.complete_execution(
                    record.execution_id(),
                    InvocationResult::error(
                        SYNC_TIMEOUT_CODE,
                        format!("no result within {timeout_ms}ms"),
                    ),
                )
                .await;
                record.result().unwrap_or_else(|| {
                    InvocationResult::error(SYNC_TIMEOUT_CODE, "no result")
                })
            }
        };

        if result.error_code() == Some(QUEUE_TIMEOUT_CODE) {
            return Err(Error::rejected(
                RejectReason::Timeout,
                self.sync_queue.retry_after_seconds(),
            ));
        }
        Ok(InvokeOutcome {
            execution_id: record.execution_id().to_string(),
            result,
        })
    }

    /// Asynchronous invocation: admits (or dispatches) and returns the
    /// execution id immediately for later polling.
    pub fn enqueue(
        self: &Arc<Self>,
        function_name: &str,
        request: InvocationRequest,
        idempotency_key: Option<String>,
        trace_id: Option<String>,
    ) -> Result<String> {
        let spec = self
            .functions
            .get(function_name)
            .ok_or_else(|| Error::FunctionNotFound(function_name.to_string()))?;
        let lookup = self.create_or_reuse(&spec, request, idempotency_key, trace_id)?;
        if lookup.is_new {
            self.submit(lookup.record.task())?;
        }
        Ok(lookup.record.execution_id().to_string())
    }

    /// Hands a new task to the admission queue, or directly to dispatch
    /// when the queue feature is disabled.
    fn submit(self: &Arc<Self>, task: InvocationTask) -> Result<()> {
        if self.sync_queue.enabled() {
            self.sync_queue.enqueue(task, Instant::now())
        } else {
            self.spawn_dispatch(task);
            Ok(())
        }
    }

    pub fn spawn_dispatch(self: &Arc<Self>, task: InvocationTask) {
        let service = self.clone();
        tokio::spawn(async move {
            service.dispatch(task).await;
        });
    }

    /// Routes one task to its backend and applies the outcome. Holds no
    /// queue lock across the backend call.
    pub async fn dispatch(self: &Arc<Self>, task: InvocationTask) {
        let Some(record) = self.store.get(&task.execution_id) else {
            warn!(execution_id = %task.execution_id, "dispatching task without a record");
            self.queues.release_slot(&task.function_name);
            return;
        };
        if record.state().is_terminal() {
            // A callback or timeout beat the scheduler to this task.
            self.queues.release_slot(&task.function_name);
            return;
        }
        record.mark_running();
        match self.router.dispatch(&task).await {
            DispatchOutcome::Completed(result) => {
                self.complete_execution(&task.execution_id, result).await;
            }
            // Accepted by an asynchronous substrate; the callback or the
            // queue timeout resolves the record.
            DispatchOutcome::Pending => {}
        }
    }

    /// Applies a completion: releases the dispatch slot, retries failed
    /// attempts that still have budget, and otherwise assigns the slot.
    /// Idempotent against duplicate callbacks. Returns false when the
    /// execution id is unknown.
    pub async fn complete_execution(
        self: &Arc<Self>,
        execution_id: &str,
        result: InvocationResult,
    ) -> bool {
        let Some(record) = self.store.get(execution_id) else {
            debug!(execution_id, "completion for unknown execution dropped");
            return false;
        };
        let task = record.task();
        self.queues.release_slot(&task.function_name);

        let timed_out = matches!(
            result.error_code(),
            Some(QUEUE_TIMEOUT_CODE) | Some(SYNC_TIMEOUT_CODE)
        );
        let max_retries = task.spec.max_retries.unwrap_or(self.defaults.max_retries);
        let retryable =
            !result.success && !timed_out && task.attempt < max_retries && !record.state().is_terminal();
        if retryable {
            let retry_task = task.retry(Instant::now());
            info!(
                execution_id,
                function = %task.function_name,
                attempt = retry_task.attempt,
                "retrying failed attempt"
            );
            record.reset_for_retry(retry_task.clone());
            let requeued = self.submit(retry_task);
            if let Err(err) = requeued {
                warn!(
                    execution_id,
                    error = %err,
                    "retry could not be queued, completing with original error"
                );
                self.finish(&record, &task.function_name, result, timed_out);
            }
            return true;
        }

        self.finish(&record, &task.function_name, result, timed_out);
        true
    }

    fn finish(
        &self,
        record: &Arc<ExecutionRecord>,
        function_name: &str,
        result: InvocationResult,
        timed_out: bool,
    ) {
        if record.complete(result) && !timed_out {
            // Throughput signal for the wait estimator: real attempt
            // outcomes only, queue timeouts are not completions.
            self.estimator
                .record_completion(function_name, Instant::now());
        }
    }

    fn create_or_reuse(
        &self,
        spec: &Arc<FunctionSpec>,
        request: InvocationRequest,
        idempotency_key: Option<String>,
        trace_id: Option<String>,
    ) -> Result<ExecutionLookup> {
        let execution_id = Uuid::new_v4().to_string();
        let key = idempotency_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(str::to_string);
        if let Some(key) = &key {
            if let Some(existing_id) = self.idempotency.put_if_absent(&spec.name, key, &execution_id)
            {
                if let Some(existing) = self.store.get(&existing_id) {
                    debug!(
                        function = %spec.name,
                        execution_id = %existing_id,
                        "idempotency key reuses existing execution"
                    );
                    return Ok(ExecutionLookup {
                        record: existing,
                        is_new: false,
                    });
                }
                // Stale mapping pointing at an evicted execution.
                self.idempotency.put(&spec.name, key, &execution_id);
            }
        }

        let task = InvocationTask::new(
            execution_id,
            spec.clone(),
            request,
            key,
            trace_id,
            Instant::now(),
        );
        let record = Arc::new(ExecutionRecord::new(task));
        self.store.insert(record.clone())?;
        Ok(ExecutionLookup {
            record,
            is_new: true,
        })
    }
}
