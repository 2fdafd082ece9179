//! Admission-controlled synchronous queue. Decides at offer time whether an
//! invocation may wait, and enforces the hard queue-wait deadline for
//! admitted items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use nimbus_common::InvocationResult;

use crate::estimator::WaitEstimator;
use crate::queue::{FunctionQueueState, QueueManager, QueuedInvocation};
use crate::store::{ExecutionStore, QUEUE_TIMEOUT_CODE};
use crate::task::InvocationTask;
use crate::{Error, RejectReason, Result};

#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    /// Master switch; disabled means every offer bypasses admission checks.
    pub enabled: bool,
    /// Estimate-based rejection on/off; depth rejection always applies.
    pub admission_enabled: bool,
    /// Absolute per-function queue length ceiling.
    pub max_depth: usize,
    /// Reject when the predicted wait exceeds this.
    pub max_estimated_wait: Duration,
    /// Hard timeout after which a still-queued item is forcibly failed.
    pub max_queue_wait: Duration,
    /// Advisory interval returned to rejected callers.
    pub retry_after_seconds: u32,
    pub throughput_window: Duration,
    pub per_function_min_samples: usize,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admission_enabled: true,
            max_depth: 64,
            max_estimated_wait: Duration::from_secs(10),
            max_queue_wait: Duration::from_secs(30),
            retry_after_seconds: 1,
            throughput_window: Duration::from_secs(60),
            per_function_min_samples: 5,
        }
    }
}

pub struct SyncQueueService {
    config: SyncQueueConfig,
    store: Arc<ExecutionStore>,
    estimator: Arc<WaitEstimator>,
    queues: Arc<QueueManager>,
}

impl SyncQueueService {
    pub fn new(
        config: SyncQueueConfig,
        store: Arc<ExecutionStore>,
        estimator: Arc<WaitEstimator>,
        queues: Arc<QueueManager>,
    ) -> Self {
        Self {
            config,
            store,
            estimator,
            queues,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn retry_after_seconds(&self) -> u32 {
        self.config.retry_after_seconds
    }

    pub fn max_queue_wait(&self) -> Duration {
        self.config.max_queue_wait
    }

    /// Admission decision for one offer. Depth is checked before the wait
    /// estimate so a full queue always reads as `Depth`.
    fn evaluate(&self, function_name: &str, depth: usize, now: Instant) -> Result<()> {
        if depth >= self.config.max_depth {
            return Err(Error::rejected(
                RejectReason::Depth,
                self.config.retry_after_seconds,
            ));
        }
        if !self.config.admission_enabled {
            return Ok(());
        }
        // An unknown estimate (warm-up) admits; new functions must not be
        // starved before the estimator has seen them complete.
        match self.estimator.estimate(function_name, depth, now) {
            Some(estimate) if estimate > self.config.max_estimated_wait => {
                debug!(
                    function = function_name,
                    estimate_ms = estimate.as_millis() as u64,
                    "admission rejected on estimated wait"
                );
                Err(Error::rejected(
                    RejectReason::EstWait,
                    self.config.retry_after_seconds,
                ))
            }
            _ => Ok(()),
        }
    }

    /// Offers a task for synchronous waiting. On admission the task is
    /// queued with a deadline of `now + max_queue_wait`.
    pub fn enqueue(&self, task: InvocationTask, now: Instant) -> Result<()> {
        let state = self
            .queues
            .get(&task.function_name)
            .ok_or_else(|| Error::FunctionNotFound(task.function_name.clone()))?;

        if self.config.enabled {
            self.evaluate(&task.function_name, state.depth(), now)?;
        }

        let function = task.function_name.clone();
        let admitted = state.offer(QueuedInvocation {
            task,
            enqueued_at: now,
            deadline: now + self.config.max_queue_wait,
        });
        if !admitted {
            // Lost the race for the last queue slot.
            return Err(Error::rejected(
                RejectReason::Depth,
                self.config.retry_after_seconds,
            ));
        }
        debug!(function = %function, "invocation admitted to sync queue");
        Ok(())
    }

    /// Fails every queued item whose deadline has passed, across all
    /// functions. Items are completed with `QUEUE_TIMEOUT` exactly once; the
    /// record's single-assignment slot discards the loser if a dispatch
    /// result arrives concurrently.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut timed_out = 0;
        self.queues.for_each(|state| {
            while let Some(expired) = state.pop_front_if_expired(now) {
                self.timeout(&expired.task);
                timed_out += 1;
            }
        });
        if timed_out > 0 {
            info!(count = timed_out, "timed out queued invocations");
        }
        timed_out
    }

    /// Next dispatchable task for one function: expired heads are failed in
    /// passing, and a concurrency slot is acquired before the task leaves
    /// the queue. Returns `None` when the queue is empty or the function is
    /// at its effective concurrency limit.
    pub fn next_ready(&self, state: &FunctionQueueState, now: Instant) -> Option<InvocationTask> {
        loop {
            if let Some(expired) = state.pop_front_if_expired(now) {
                self.timeout(&expired.task);
                continue;
            }
            state.peek_front()?;
            if !state.try_acquire_slot() {
                return None;
            }
            match state.pop_front() {
                Some(item) => return Some(item.task),
                None => {
                    // Sweeper emptied the queue between peek and pop.
                    state.release_slot();
                    return None;
                }
            }
        }
    }

    fn timeout(&self, task: &InvocationTask) {
        let Some(record) = self.store.get(&task.execution_id) else {
            warn!(execution_id = %task.execution_id, "timed-out task has no execution record");
            return;
        };
        if record.complete(InvocationResult::error(
            QUEUE_TIMEOUT_CODE,
            "Queue wait exceeded",
        )) {
            info!(
                execution_id = %task.execution_id,
                function = %task.function_name,
                "queued invocation timed out"
            );
        }
    }
}
