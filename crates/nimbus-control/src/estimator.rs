//! Sliding-window throughput tracker behind the admission decision.
//!
//! Completions are recorded per function and globally; estimates follow
//! Little's law over the recent window. Until a window has warmed up the
//! estimate is unknown (`None`) so that new functions are never rejected on
//! predicted wait alone.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub struct WaitEstimator {
    window: Duration,
    min_samples: usize,
    global: Mutex<VecDeque<Instant>>,
    per_function: DashMap<String, VecDeque<Instant>>,
}

impl WaitEstimator {
    pub fn new(window: Duration, min_samples: usize) -> Self {
        Self {
            window,
            min_samples: min_samples.max(1),
            global: Mutex::new(VecDeque::new()),
            per_function: DashMap::new(),
        }
    }

    fn global_lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_completion(&self, function_name: &str, now: Instant) {
        {
            let mut global = self.global_lock();
            global.push_back(now);
            Self::prune(&mut global, self.window, now);
        }
        let mut events = self
            .per_function
            .entry(function_name.to_string())
            .or_default();
        events.push_back(now);
        Self::prune(&mut events, self.window, now);
    }

    pub fn forget(&self, function_name: &str) {
        self.per_function.remove(function_name);
    }

    /// Predicted wait for a task arriving behind `depth` queued items, or
    /// `None` while neither the per-function nor the global window has
    /// enough samples to trust.
    pub fn estimate(&self, function_name: &str, depth: usize, now: Instant) -> Option<Duration> {
        if let Some(mut events) = self.per_function.get_mut(function_name) {
            Self::prune(&mut events, self.window, now);
            if events.len() >= self.min_samples {
                return Some(self.wait_for_depth(events.len(), depth));
            }
        }
        let mut global = self.global_lock();
        Self::prune(&mut global, self.window, now);
        if global.len() >= self.min_samples {
            return Some(self.wait_for_depth(global.len(), depth));
        }
        None
    }

    /// depth / throughput, with throughput = completions over the window.
    fn wait_for_depth(&self, completions: usize, depth: usize) -> Duration {
        let window_secs = self.window.as_secs_f64().max(1.0);
        let throughput = completions as f64 / window_secs;
        Duration::from_secs_f64(depth as f64 / throughput)
    }

    fn prune(events: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        let cutoff = now.checked_sub(window);
        let Some(cutoff) = cutoff else { return };
        while matches!(events.front(), Some(first) if *first < cutoff) {
            events.pop_front();
        }
    }
}
