//! Per-function queue bookkeeping: the bounded FIFO of admitted work, the
//! in-flight counter and the effective concurrency limit the scheduler
//! honors when handing tasks to dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use dashmap::DashMap;

use nimbus_common::{FunctionDefaults, FunctionSpec};

use crate::task::InvocationTask;

/// A task sitting in the queue together with its hard wait deadline.
#[derive(Debug, Clone)]
pub struct QueuedInvocation {
    pub task: InvocationTask,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

pub struct FunctionQueueState {
    function_name: String,
    capacity: usize,
    items: Mutex<VecDeque<QueuedInvocation>>,
    in_flight: AtomicU32,
    configured_concurrency: AtomicU32,
    effective_concurrency: AtomicU32,
}

impl FunctionQueueState {
    pub fn new(function_name: impl Into<String>, capacity: usize, concurrency: u32) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            function_name: function_name.into(),
            capacity,
            items: Mutex::new(VecDeque::new()),
            in_flight: AtomicU32::new(0),
            configured_concurrency: AtomicU32::new(concurrency),
            effective_concurrency: AtomicU32::new(concurrency),
        }
    }

    fn items_lock(&self) -> MutexGuard<'_, VecDeque<QueuedInvocation>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn depth(&self) -> usize {
        self.items_lock().len()
    }

    /// Appends unless the queue is at capacity.
    pub fn offer(&self, item: QueuedInvocation) -> bool {
        let mut items = self.items_lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    pub fn peek_front(&self) -> Option<QueuedInvocation> {
        self.items_lock().front().cloned()
    }

    pub fn pop_front(&self) -> Option<QueuedInvocation> {
        self.items_lock().pop_front()
    }

    /// Pops the head only if its deadline is at or past `now`. Used by the
    /// timeout sweep so an item observed expired is removed exactly once.
    pub fn pop_front_if_expired(&self, now: Instant) -> Option<QueuedInvocation> {
        let mut items = self.items_lock();
        if matches!(items.front(), Some(head) if head.deadline <= now) {
            items.pop_front()
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Atomically claims a dispatch slot if the effective concurrency limit
    /// allows one more in-flight task.
    pub fn try_acquire_slot(&self) -> bool {
        let limit = self.effective_concurrency();
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current >= limit {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases a dispatch slot; never drops below zero.
    pub fn release_slot(&self) {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current == 0 {
                return;
            }
            if self
                .in_flight
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn configured_concurrency(&self) -> u32 {
        self.configured_concurrency.load(Ordering::Acquire)
    }

    pub fn effective_concurrency(&self) -> u32 {
        self.effective_concurrency.load(Ordering::Acquire)
    }

    /// Applies a controller decision, clamped to [1, configured].
    pub fn set_effective_concurrency(&self, value: u32) {
        let clamped = value.clamp(1, self.configured_concurrency());
        self.effective_concurrency.store(clamped, Ordering::Release);
    }
}

/// name -> queue state, provisioned at registration and torn down on removal.
pub struct QueueManager {
    queues: DashMap<String, Arc<FunctionQueueState>>,
    defaults: FunctionDefaults,
}

impl QueueManager {
    pub fn new(defaults: FunctionDefaults) -> Self {
        Self {
            queues: DashMap::new(),
            defaults,
        }
    }

    pub fn get_or_create(&self, spec: &FunctionSpec) -> Arc<FunctionQueueState> {
        self.queues
            .entry(spec.name.clone())
            .or_insert_with(|| {
                Arc::new(FunctionQueueState::new(
                    spec.name.clone(),
                    spec.queue_size.unwrap_or(self.defaults.queue_size) as usize,
                    spec.concurrency.unwrap_or(self.defaults.concurrency),
                ))
            })
            .clone()
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<FunctionQueueState>> {
        self.queues.get(function_name).map(|q| q.clone())
    }

    pub fn remove(&self, function_name: &str) {
        self.queues.remove(function_name);
    }

    pub fn release_slot(&self, function_name: &str) {
        if let Some(state) = self.get(function_name) {
            state.release_slot();
        }
    }

    pub fn for_each(&self, mut action: impl FnMut(&Arc<FunctionQueueState>)) {
        for entry in self.queues.iter() {
            action(entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::InvocationRequest;
    use std::time::Duration;

    fn queued(name: &str, now: Instant) -> QueuedInvocation {
        let spec = Arc::new(FunctionSpec::new(name, "local"));
        QueuedInvocation {
            task: InvocationTask::new(
                uuid::Uuid::new_v4().to_string(),
                spec,
                InvocationRequest::default(),
                None,
                None,
                now,
            ),
            enqueued_at: now,
            deadline: now + Duration::from_secs(2),
        }
    }

    #[test]
    fn offer_respects_capacity() {
        let state = FunctionQueueState::new("f", 1, 1);
        let now = Instant::now();
        assert!(state.offer(queued("f", now)));
        assert!(!state.offer(queued("f", now)));
        assert_eq!(state.depth(), 1);
    }

    #[test]
    fn slots_are_bounded_by_effective_concurrency() {
        let state = FunctionQueueState::new("f", 8, 2);
        assert!(state.try_acquire_slot());
        assert!(state.try_acquire_slot());
        assert!(!state.try_acquire_slot());
        state.release_slot();
        assert!(state.try_acquire_slot());
    }

    #[test]
    fn release_never_goes_negative() {
        let state = FunctionQueueState::new("f", 8, 1);
        state.release_slot();
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn effective_concurrency_is_clamped_to_configured() {
        let state = FunctionQueueState::new("f", 8, 4);
        state.set_effective_concurrency(16);
        assert_eq!(state.effective_concurrency(), 4);
        state.set_effective_concurrency(0);
        assert_eq!(state.effective_concurrency(), 1);
        state.set_effective_concurrency(3);
        assert_eq!(state.effective_concurrency(), 3);
    }

    #[test]
    fn expired_head_pops_exactly_once() {
        let state = FunctionQueueState::new("f", 8, 1);
        let now = Instant::now();
        state.offer(queued("f", now));
        let later = now + Duration::from_secs(3);
        assert!(state.pop_front_if_expired(later).is_some());
        assert!(state.pop_front_if_expired(later).is_none());
    }

    #[test]
    fn manager_provisions_from_spec_with_defaults() {
        let manager = QueueManager::new(FunctionDefaults::default());
        let mut spec = FunctionSpec::new("f", "img");
        spec.queue_size = Some(3);
        let state = manager.get_or_create(&spec);
        assert_eq!(state.function_name(), "f");
        let again = manager.get_or_create(&spec);
        assert!(Arc::ptr_eq(&state, &again));
        manager.remove("f");
        assert!(manager.get("f").is_none());
    }
}
