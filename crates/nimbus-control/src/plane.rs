//! Wires the control plane together: one constructor building the shared
//! components the server binary and the background loops hang off.

use std::sync::Arc;
use std::time::Duration;

use nimbus_common::FunctionDefaults;

use crate::dispatch::{
    ClusterDispatcher, DispatcherRouter, JobBuilder, JobSubmitter, LocalDispatcher,
    PoolDispatcher, WorkerPool,
};
use crate::estimator::WaitEstimator;
use crate::idempotency::IdempotencyStore;
use crate::queue::QueueManager;
use crate::registry::FunctionService;
use crate::resolver::SpecResolver;
use crate::scaling::ConcurrencyController;
use crate::scheduler::SyncScheduler;
use crate::service::InvocationService;
use crate::store::ExecutionStore;
use crate::sync_queue::{SyncQueueConfig, SyncQueueService};

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub defaults: FunctionDefaults,
    pub sync_queue: SyncQueueConfig,
    /// Completion endpoint handed to cluster jobs via the manifest env.
    pub callback_url: String,
    /// Retention for terminal execution records.
    pub execution_retention: Duration,
    /// Hard eviction bound for stuck records.
    pub execution_stale_after: Duration,
    pub idempotency_ttl: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            defaults: FunctionDefaults::default(),
            sync_queue: SyncQueueConfig::default(),
            callback_url: "http://127.0.0.1:8080/v1/internal/executions".to_string(),
            execution_retention: Duration::from_secs(300),
            execution_stale_after: Duration::from_secs(600),
            idempotency_ttl: Duration::from_secs(600),
        }
    }
}

pub struct ControlPlane {
    pub functions: Arc<FunctionService>,
    pub invocations: Arc<InvocationService>,
    pub queues: Arc<QueueManager>,
    pub sync_queue: Arc<SyncQueueService>,
    pub store: Arc<ExecutionStore>,
    pub idempotency: Arc<IdempotencyStore>,
    pub estimator: Arc<WaitEstimator>,
    pub pool: Arc<WorkerPool>,
    pub controller: Arc<ConcurrencyController>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig, submitter: Box<dyn JobSubmitter>) -> Self {
        let store = Arc::new(ExecutionStore::new(
            config.execution_retention,
            config.execution_stale_after,
        ));
        let estimator = Arc::new(WaitEstimator::new(
            config.sync_queue.throughput_window,
            config.sync_queue.per_function_min_samples,
        ));
        let queues = Arc::new(QueueManager::new(config.defaults));
        let pool = Arc::new(WorkerPool::new());
        let idempotency = Arc::new(IdempotencyStore::new(config.idempotency_ttl));

        let functions = Arc::new(FunctionService::new(
            queues.clone(),
            pool.clone(),
            estimator.clone(),
            SpecResolver::new(config.defaults),
        ));
        let sync_queue = Arc::new(SyncQueueService::new(
            config.sync_queue,
            store.clone(),
            estimator.clone(),
            queues.clone(),
        ));

        let http = reqwest::Client::new();
        let router = Arc::new(DispatcherRouter::new(
            LocalDispatcher::new(),
            PoolDispatcher::new(http, pool.clone(), config.defaults),
            ClusterDispatcher::new(JobBuilder::new(config.callback_url), submitter),
        ));
        let invocations = Arc::new(InvocationService::new(
            functions.clone(),
            store.clone(),
            idempotency.clone(),
            router,
            queues.clone(),
            sync_queue.clone(),
            estimator.clone(),
            config.defaults,
        ));

        Self {
            functions,
            invocations,
            queues,
            sync_queue,
            store,
            idempotency,
            estimator,
            pool,
            controller: Arc::new(ConcurrencyController::new()),
        }
    }

    pub fn scheduler(&self, tick: Duration) -> SyncScheduler {
        SyncScheduler::new(
            self.queues.clone(),
            self.sync_queue.clone(),
            self.invocations.clone(),
            tick,
        )
    }
}
