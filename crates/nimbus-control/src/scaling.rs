//! Converts replica readiness and a load signal into an effective in-flight
//! concurrency target per function, with cooldown hysteresis so the target
//! never oscillates on every evaluation tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use nimbus_common::{ConcurrencyControlConfig, ConcurrencyControlMode, FunctionSpec};

use crate::queue::QueueManager;
use crate::registry::FunctionService;

/// Where the controller learns how many replicas are ready to take work.
/// The cluster integration provides a live implementation; a fixed count is
/// used for single-node deployments and tests.
pub trait ReplicaSource: Send + Sync {
    fn ready_replicas(&self, function_name: &str) -> u32;
}

pub struct FixedReplicaSource(pub u32);

impl ReplicaSource for FixedReplicaSource {
    fn ready_replicas(&self, _function_name: &str) -> u32 {
        self.0
    }
}

/// One observation of a function's load.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub ready_replicas: u32,
    /// in-flight / effective concurrency, in [0, 1+].
    pub load_ratio: f64,
    /// Replica autoscaling is exhausted; shedding per-replica pressure is
    /// the only remaining response to high load.
    pub at_max_replicas: bool,
}

#[derive(Debug)]
struct AdaptiveState {
    target_per_replica: u32,
    last_increase: Option<Instant>,
    last_decrease: Option<Instant>,
}

pub struct ConcurrencyController {
    states: DashMap<String, AdaptiveState>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    pub fn forget(&self, function_name: &str) {
        self.states.remove(function_name);
    }

    /// Effective in-flight concurrency for one function at `now`.
    pub fn compute(&self, spec: &FunctionSpec, sample: LoadSample, now: Instant) -> u32 {
        let configured = spec.concurrency.unwrap_or(1).max(1);
        let Some(control) = spec.scaling.as_ref().and_then(|s| s.concurrency_control.as_ref())
        else {
            return configured;
        };
        let mode = control.mode.unwrap_or(ConcurrencyControlMode::Fixed);
        if mode == ConcurrencyControlMode::Fixed {
            return configured;
        }

        let bounds = TargetBounds::from(control);
        // No ready capacity: fall back to the configured minimum target.
        if sample.ready_replicas == 0 {
            return bounds.min;
        }

        let target = if mode == ConcurrencyControlMode::StaticPerPod {
            bounds.clamp(bounds.target)
        } else {
            self.adaptive_target(&spec.name, control, &bounds, sample, now)
        };

        let desired = u64::from(target) * u64::from(sample.ready_replicas);
        desired.min(u64::from(configured)).max(1) as u32
    }

    /// Threshold-gated stepping with per-direction cooldowns: a second move
    /// in the same direction inside its cooldown window is suppressed and
    /// the previous target is returned unchanged. High load with replica
    /// scaling exhausted sheds per-replica pressure (target steps down);
    /// low load steps the target back up.
    fn adaptive_target(
        &self,
        function_name: &str,
        control: &ConcurrencyControlConfig,
        bounds: &TargetBounds,
        sample: LoadSample,
        now: Instant,
    ) -> u32 {
        let up_cooldown =
            Duration::from_millis(control.upscale_cooldown_ms.unwrap_or(30_000));
        let down_cooldown =
            Duration::from_millis(control.downscale_cooldown_ms.unwrap_or(60_000));
        let high = control.high_load_threshold.unwrap_or(0.85);
        let low = control.low_load_threshold.unwrap_or(0.35);

        let mut state = self
            .states
            .entry(function_name.to_string())
            .or_insert_with(|| AdaptiveState {
                target_per_replica: bounds.clamp(bounds.target),
                last_increase: None,
                last_decrease: None,
            });

        let current = bounds.clamp(state.target_per_replica);
        let next = if sample.at_max_replicas && sample.load_ratio >= high && current > bounds.min {
            if elapsed(state.last_decrease, now) >= down_cooldown {
                state.last_decrease = Some(now);
                current - 1
            } else {
                current
            }
        } else if sample.load_ratio <= low && current < bounds.max {
            if elapsed(state.last_increase, now) >= up_cooldown {
                state.last_increase = Some(now);
                current + 1
            } else {
                current
            }
        } else {
            current
        };
        state.target_per_replica = next;
        next
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new()
    }
}

struct TargetBounds {
    target: u32,
    min: u32,
    max: u32,
}

impl TargetBounds {
    fn from(control: &ConcurrencyControlConfig) -> Self {
        let min = control.min_target_in_flight_per_pod.unwrap_or(1).max(1);
        let max = control.max_target_in_flight_per_pod.unwrap_or(8).max(min);
        let target = control.target_in_flight_per_pod.unwrap_or(2);
        Self { target, min, max }
    }

    fn clamp(&self, value: u32) -> u32 {
        value.clamp(self.min, self.max)
    }
}

fn elapsed(since: Option<Instant>, now: Instant) -> Duration {
    match since {
        Some(at) => now.saturating_duration_since(at),
        None => Duration::MAX,
    }
}

/// Periodic re-evaluation: samples each function's load and pushes the
/// computed target into its queue state.
pub fn spawn_concurrency_loop(
    controller: Arc<ConcurrencyController>,
    functions: Arc<FunctionService>,
    queues: Arc<QueueManager>,
    replicas: Arc<dyn ReplicaSource>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            for spec in functions.list() {
                let Some(state) = queues.get(&spec.name) else { continue };
                let effective = state.effective_concurrency().max(1);
                let ready = replicas.ready_replicas(&spec.name);
                let max_replicas = spec
                    .scaling
                    .as_ref()
                    .and_then(|s| s.max_replicas)
                    .unwrap_or(1);
                let sample = LoadSample {
                    ready_replicas: ready,
                    load_ratio: f64::from(state.in_flight()) / f64::from(effective),
                    at_max_replicas: ready >= max_replicas,
                };
                let next = controller.compute(&spec, sample, now);
                if next != effective {
                    debug!(function = %spec.name, from = effective, to = next, "effective concurrency adjusted");
                }
                state.set_effective_concurrency(next);
            }
        }
    })
}
