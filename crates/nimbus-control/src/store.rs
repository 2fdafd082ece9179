//! Execution correlation store. Each record owns a single-assignment
//! completion slot that joins asynchronous dispatch results with waiting
//! callers; the first writer wins and every later assignment is a no-op.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use nimbus_common::{ErrorInfo, InvocationResult};

use crate::task::InvocationTask;
use crate::{Error, Result};

pub const QUEUE_TIMEOUT_CODE: &str = "QUEUE_TIMEOUT";
pub const SYNC_TIMEOUT_CODE: &str = "TIMEOUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Running,
    Success,
    Error,
    Timeout,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success | ExecutionState::Error | ExecutionState::Timeout
        )
    }

    /// External status tag; queued executions surface as "pending".
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Success => "success",
            ExecutionState::Error => "error",
            ExecutionState::Timeout => "timeout",
        }
    }
}

#[derive(Debug)]
struct RecordInner {
    task: InvocationTask,
    state: ExecutionState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    output: Option<serde_json::Value>,
    last_error: Option<ErrorInfo>,
}

/// Consistent point-in-time view of a record.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub function_name: String,
    pub attempt: u32,
    pub state: ExecutionState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<ErrorInfo>,
}

pub struct ExecutionRecord {
    execution_id: String,
    inner: Mutex<RecordInner>,
    completion: watch::Sender<Option<InvocationResult>>,
}

impl ExecutionRecord {
    pub fn new(task: InvocationTask) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            execution_id: task.execution_id.clone(),
            inner: Mutex::new(RecordInner {
                task,
                state: ExecutionState::Queued,
                started_at: None,
                finished_at: None,
                output: None,
                last_error: None,
            }),
            completion,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task(&self) -> InvocationTask {
        self.lock().task.clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let inner = self.lock();
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            function_name: inner.task.function_name.clone(),
            attempt: inner.task.attempt,
            state: inner.state,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            output: inner.output.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    pub fn mark_running(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = ExecutionState::Running;
        inner.started_at = Some(Utc::now());
    }

    /// Rewinds the record for another attempt while keeping the completion
    /// slot (and everyone waiting on it) intact.
    pub fn reset_for_retry(&self, retry_task: InvocationTask) {
        let mut inner = self.lock();
        inner.task = retry_task;
        inner.state = ExecutionState::Queued;
        inner.started_at = None;
        inner.finished_at = None;
        inner.output = None;
        inner.last_error = None;
    }

    /// Assigns the completion slot. Returns false when the slot was already
    /// assigned, in which case the record is left untouched; this is how the
    /// race between a callback and a queue timeout is decided.
    pub fn complete(&self, result: InvocationResult) -> bool {
        let assigned = self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result.clone());
            true
        });
        if !assigned {
            debug!(execution_id = %self.execution_id, "completion slot already assigned, dropping result");
            return false;
        }

        let mut inner = self.lock();
        inner.finished_at = Some(Utc::now());
        if result.success {
            inner.state = ExecutionState::Success;
            inner.output = result.output;
            inner.last_error = None;
        } else {
            inner.state = match result.error_code() {
                Some(QUEUE_TIMEOUT_CODE) | Some(SYNC_TIMEOUT_CODE) => ExecutionState::Timeout,
                _ => ExecutionState::Error,
            };
            inner.output = None;
            inner.last_error = result.error;
        }
        true
    }

    /// Current slot value without waiting.
    pub fn result(&self) -> Option<InvocationResult> {
        self.completion.borrow().clone()
    }

    /// Suspends until the slot is assigned or `timeout` elapses. Never
    /// busy-polls; multiple callers may wait on the same record.
    pub async fn wait(&self, timeout: Duration) -> Option<InvocationResult> {
        let mut rx = self.completion.subscribe();
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|slot| slot.is_some())).await {
            Ok(Ok(value)) => value.clone(),
            // Sender dropped or timeout: fall back to whatever is there now.
            _ => None,
        };
        outcome.or_else(|| self.result())
    }
}

struct StoredExecution {
    record: Arc<ExecutionRecord>,
    created_at: Instant,
}

/// executionId -> record map shared by the invocation path, the scheduler
/// and the completion callback endpoint.
pub struct ExecutionStore {
    executions: DashMap<String, StoredExecution>,
    /// Terminal records older than this are evicted by the janitor.
    retention: Duration,
    /// Even non-terminal records are evicted past this, to bound growth.
    stale_after: Duration,
}

impl ExecutionStore {
    pub fn new(retention: Duration, stale_after: Duration) -> Self {
        Self {
            executions: DashMap::new(),
            retention,
            stale_after,
        }
    }

    /// Registers a new pending record. A duplicate execution id is a
    /// programming error and is reported rather than silently overwritten.
    pub fn insert(&self, record: Arc<ExecutionRecord>) -> Result<()> {
        let id = record.execution_id().to_string();
        match self.executions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateExecution(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StoredExecution {
                    record,
                    created_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<Arc<ExecutionRecord>> {
        self.executions.get(execution_id).map(|e| e.record.clone())
    }

    pub fn remove(&self, execution_id: &str) {
        self.executions.remove(execution_id);
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// One janitor pass. Called on a cadence by the background loop spawned
    /// in the server binary.
    pub fn evict_expired(&self, now: Instant) {
        self.executions.retain(|_, stored| {
            let age = now.saturating_duration_since(stored.created_at);
            if age >= self.stale_after {
                return false;
            }
            if age >= self.retention && stored.record.state().is_terminal() {
                return false;
            }
            true
        });
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::{FunctionSpec, InvocationRequest};
    use serde_json::json;

    fn record(id: &str) -> Arc<ExecutionRecord> {
        let spec = Arc::new(FunctionSpec::new("echo", "local"));
        let task = InvocationTask::new(
            id,
            spec,
            InvocationRequest::from_input(json!("hi")),
            None,
            None,
            Instant::now(),
        );
        Arc::new(ExecutionRecord::new(task))
    }

    #[test]
    fn duplicate_execution_id_is_reported() {
        let store = ExecutionStore::default();
        store.insert(record("e-1")).unwrap();
        let err = store.insert(record("e-1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateExecution(id) if id == "e-1"));
    }

    #[test]
    fn first_completion_wins() {
        let rec = record("e-2");
        assert!(rec.complete(InvocationResult::success(Some(json!("first")))));
        assert!(!rec.complete(InvocationResult::error("LATE", "too late")));
        assert_eq!(rec.state(), ExecutionState::Success);
        assert_eq!(rec.result().unwrap().output, Some(json!("first")));
    }

    #[tokio::test]
    async fn racing_success_and_timeout_yields_exactly_one_result() {
        let rec = record("e-3");
        let a = rec.clone();
        let b = rec.clone();
        let ok = tokio::spawn(async move { a.complete(InvocationResult::success(Some(json!(1)))) });
        let to = tokio::spawn(async move {
            b.complete(InvocationResult::error(QUEUE_TIMEOUT_CODE, "Queue wait exceeded"))
        });
        let (ok, to) = (ok.await.unwrap(), to.await.unwrap());
        assert!(ok ^ to, "exactly one writer must win");
        let result = rec.result().unwrap();
        if ok {
            assert!(result.success);
            assert_eq!(rec.state(), ExecutionState::Success);
        } else {
            assert_eq!(result.error_code(), Some(QUEUE_TIMEOUT_CODE));
            assert_eq!(rec.state(), ExecutionState::Timeout);
        }
    }

    #[tokio::test]
    async fn wait_resolves_when_completed() {
        let rec = record("e-4");
        let waiter = rec.clone();
        let handle =
            tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        rec.complete(InvocationResult::success(Some(json!("done"))));
        let got = handle.await.unwrap().expect("result");
        assert_eq!(got.output, Some(json!("done")));
    }

    #[tokio::test]
    async fn wait_times_out_without_completion() {
        let rec = record("e-5");
        let got = rec.wait(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[test]
    fn janitor_keeps_active_records_until_stale() {
        let store = ExecutionStore::new(Duration::from_secs(1), Duration::from_secs(10));
        let rec = record("e-6");
        store.insert(rec.clone()).unwrap();

        // Past retention but still pending: kept.
        store.evict_expired(Instant::now() + Duration::from_secs(2));
        assert!(store.get("e-6").is_some());

        // Terminal and past retention: evicted.
        rec.complete(InvocationResult::success(None));
        store.evict_expired(Instant::now() + Duration::from_secs(2));
        assert!(store.get("e-6").is_none());
    }

    #[test]
    fn janitor_force_evicts_stuck_records() {
        let store = ExecutionStore::new(Duration::from_secs(1), Duration::from_secs(5));
        store.insert(record("e-7")).unwrap();
        store.evict_expired(Instant::now() + Duration::from_secs(6));
        assert!(store.get("e-7").is_none());
    }
}
