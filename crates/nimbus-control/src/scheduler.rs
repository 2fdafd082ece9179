//! Background loops: the sync scheduler that drains admitted work into
//! dispatch, and the janitor that bounds the execution and idempotency
//! stores. Both are spawned by the server binary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

use crate::idempotency::IdempotencyStore;
use crate::queue::QueueManager;
use crate::service::InvocationService;
use crate::store::ExecutionStore;
use crate::sync_queue::SyncQueueService;

pub struct SyncScheduler {
    queues: Arc<QueueManager>,
    sync_queue: Arc<SyncQueueService>,
    service: Arc<InvocationService>,
    tick: Duration,
}

impl SyncScheduler {
    pub fn new(
        queues: Arc<QueueManager>,
        sync_queue: Arc<SyncQueueService>,
        service: Arc<InvocationService>,
        tick: Duration,
    ) -> Self {
        Self {
            queues,
            sync_queue,
            service,
            tick,
        }
    }

    /// One pass: fail expired items, then hand every dispatchable task to
    /// its backend. Dispatch runs on spawned tasks so a slow backend call
    /// never stalls the drain of other functions. Returns the number of
    /// tasks handed out, which makes single steps testable with a pinned
    /// `now`.
    pub fn run_once(&self, now: Instant) -> usize {
        self.sync_queue.sweep_expired(now);
        let mut states = Vec::new();
        self.queues.for_each(|state| states.push(state.clone()));

        let mut dispatched = 0;
        for state in states {
            while let Some(task) = self.sync_queue.next_ready(&state, now) {
                self.service.spawn_dispatch(task);
                dispatched += 1;
            }
        }
        dispatched
    }

    pub fn spawn(self) -> JoinHandle<()> {
        info!(tick_ms = self.tick.as_millis() as u64, "sync scheduler started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once(Instant::now());
            }
        })
    }
}

/// Retention sweep over the execution and idempotency stores.
pub fn spawn_janitor_loop(
    store: Arc<ExecutionStore>,
    idempotency: Arc<IdempotencyStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            store.evict_expired(now);
            idempotency.evict_expired(now);
        }
    })
}
