//! Function registry: concurrent name -> spec map with atomic
//! insert-if-absent, plus the service that ties registration to queue and
//! worker-pool provisioning.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use nimbus_common::{ExecutionMode, FunctionSpec};

use crate::dispatch::pool::WorkerPool;
use crate::estimator::WaitEstimator;
use crate::queue::QueueManager;
use crate::resolver::SpecResolver;
use crate::{Error, Result};

#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<FunctionSpec>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn list(&self) -> Vec<Arc<FunctionSpec>> {
        self.functions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionSpec>> {
        self.functions.get(name).map(|e| e.value().clone())
    }

    /// Atomic check-and-insert. Returns the existing spec when the name is
    /// already taken; the new spec is inserted only if absent, so no two
    /// concurrent callers can both observe success.
    pub fn put_if_absent(&self, spec: Arc<FunctionSpec>) -> Option<Arc<FunctionSpec>> {
        match self.functions.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Some(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(spec);
                None
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<FunctionSpec>> {
        self.functions.remove(name).map(|(_, spec)| spec)
    }
}

/// Registration front: resolves defaults, inserts atomically and provisions
/// the per-function queue (and pool workers) on success.
pub struct FunctionService {
    registry: FunctionRegistry,
    queues: Arc<QueueManager>,
    pool: Arc<WorkerPool>,
    estimator: Arc<WaitEstimator>,
    resolver: SpecResolver,
}

impl FunctionService {
    pub fn new(
        queues: Arc<QueueManager>,
        pool: Arc<WorkerPool>,
        estimator: Arc<WaitEstimator>,
        resolver: SpecResolver,
    ) -> Self {
        Self {
            registry: FunctionRegistry::new(),
            queues,
            pool,
            estimator,
            resolver,
        }
    }

    pub fn list(&self) -> Vec<Arc<FunctionSpec>> {
        self.registry.list()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionSpec>> {
        self.registry.get(name)
    }

    /// Registers a function. Never overwrites: a name conflict is reported
    /// to the caller, who must delete and re-register to change a spec.
    pub fn register(&self, spec: FunctionSpec) -> Result<Arc<FunctionSpec>> {
        let resolved = Arc::new(self.resolver.resolve(spec)?);
        if self.registry.put_if_absent(resolved.clone()).is_some() {
            return Err(Error::FunctionExists(resolved.name.clone()));
        }
        self.queues.get_or_create(&resolved);
        if resolved.execution_mode() == ExecutionMode::Pool {
            if let Some(endpoint) = &resolved.endpoint_url {
                self.pool.register_worker(&resolved.name, endpoint.clone());
            }
        }
        info!(function = %resolved.name, mode = ?resolved.execution_mode(), "registered function");
        Ok(resolved)
    }

    /// Removes a function and tears down its queue and pooled workers.
    pub fn remove(&self, name: &str) -> Result<Arc<FunctionSpec>> {
        let removed = self
            .registry
            .remove(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        self.queues.remove(name);
        self.pool.remove_function(name);
        self.estimator.forget(name);
        info!(function = %name, "removed function");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::FunctionDefaults;
    use std::time::Duration;

    fn service() -> FunctionService {
        let defaults = FunctionDefaults::default();
        FunctionService::new(
            Arc::new(QueueManager::new(defaults)),
            Arc::new(WorkerPool::new()),
            Arc::new(WaitEstimator::new(Duration::from_secs(60), 5)),
            SpecResolver::new(defaults),
        )
    }

    #[test]
    fn register_then_get_round_trips_the_resolved_spec() {
        let svc = service();
        let resolved = svc.register(FunctionSpec::new("echo", "local")).expect("register");
        let fetched = svc.get("echo").expect("present");
        assert_eq!(*fetched, *resolved);
        // Defaults were filled in by the resolver.
        assert!(fetched.timeout_ms.is_some());
        assert!(fetched.queue_size.is_some());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let svc = service();
        svc.register(FunctionSpec::new("echo", "local")).expect("first");
        let err = svc.register(FunctionSpec::new("echo", "other")).unwrap_err();
        assert!(matches!(err, Error::FunctionExists(name) if name == "echo"));
        // The original spec survived.
        assert_eq!(svc.get("echo").expect("present").image, "local");
    }

    #[test]
    fn concurrent_registration_yields_exactly_one_success() {
        let svc = Arc::new(service());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            handles.push(std::thread::spawn(move || {
                svc.register(FunctionSpec::new("contested", "img")).is_ok()
            }));
        }
        let successes: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread") as usize)
            .sum();
        assert_eq!(successes, 1);
    }

    #[test]
    fn remove_is_not_found_for_unknown_names() {
        let svc = service();
        let err = svc.remove("ghost").unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }

    #[test]
    fn remove_tears_down_queue_state() {
        let defaults = FunctionDefaults::default();
        let queues = Arc::new(QueueManager::new(defaults));
        let svc = FunctionService::new(
            queues.clone(),
            Arc::new(WorkerPool::new()),
            Arc::new(WaitEstimator::new(Duration::from_secs(60), 5)),
            SpecResolver::new(defaults),
        );
        svc.register(FunctionSpec::new("f", "img")).expect("register");
        assert!(queues.get("f").is_some());
        svc.remove("f").expect("remove");
        assert!(queues.get("f").is_none());
    }
}
