//! Backend dispatch. The router picks a backend strictly from the task's
//! execution mode; each backend reports a uniform [`DispatchOutcome`] and
//! never retries on its own.

use tracing::instrument;

use nimbus_common::{ExecutionMode, InvocationResult};

use crate::task::InvocationTask;

pub mod cluster;
pub mod job;
pub mod local;
pub mod pool;

pub use cluster::{ClusterDispatcher, HttpJobSubmitter, JobSubmitter, SubmitError};
pub use job::{JobBuilder, JobManifest};
pub use local::LocalDispatcher;
pub use pool::{PoolDispatcher, WorkerPool};

/// What a dispatch attempt produced. `Pending` means the work was accepted
/// by an asynchronous substrate and the execution record will be resolved
/// later by the completion callback or the queue timeout.
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(InvocationResult),
    Pending,
}

pub struct DispatcherRouter {
    local: LocalDispatcher,
    pool: PoolDispatcher,
    cluster: ClusterDispatcher,
}

impl DispatcherRouter {
    pub fn new(local: LocalDispatcher, pool: PoolDispatcher, cluster: ClusterDispatcher) -> Self {
        Self {
            local,
            pool,
            cluster,
        }
    }

    #[instrument(skip(self, task), fields(execution_id = %task.execution_id, function = %task.function_name, attempt = task.attempt))]
    pub async fn dispatch(&self, task: &InvocationTask) -> DispatchOutcome {
        match task.spec.execution_mode() {
            ExecutionMode::Local => self.local.dispatch(task),
            ExecutionMode::Pool => self.pool.dispatch(task).await,
            ExecutionMode::Cluster => self.cluster.dispatch(task).await,
        }
    }
}
