//! Fills unset spec fields from process-wide defaults at registration time.
//! The defaults are an explicit immutable value handed in at construction.

use nimbus_common::{
    ConcurrencyControlConfig, ConcurrencyControlMode, ExecutionMode, FunctionDefaults,
    FunctionSpec, NimbusError, RuntimeMode, ScalingConfig, ScalingMetric, ScalingStrategy,
};

use crate::Result;

const DEFAULT_TARGET_PER_POD: u32 = 2;
const DEFAULT_MIN_TARGET_PER_POD: u32 = 1;
const DEFAULT_MAX_TARGET_PER_POD: u32 = 8;
const DEFAULT_UPSCALE_COOLDOWN_MS: u64 = 30_000;
const DEFAULT_DOWNSCALE_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_HIGH_LOAD_THRESHOLD: f64 = 0.85;
const DEFAULT_LOW_LOAD_THRESHOLD: f64 = 0.35;

pub struct SpecResolver {
    defaults: FunctionDefaults,
}

impl SpecResolver {
    pub fn new(defaults: FunctionDefaults) -> Self {
        Self { defaults }
    }

    pub fn resolve(&self, spec: FunctionSpec) -> Result<FunctionSpec> {
        if spec.name.trim().is_empty() {
            return Err(NimbusError::SpecInvalid("function name is required".into()).into());
        }
        if spec.image.trim().is_empty() {
            return Err(NimbusError::SpecInvalid("image is required".into()).into());
        }

        let mode = spec.execution_mode.unwrap_or(ExecutionMode::Cluster);
        let scaling = self.resolve_scaling(spec.scaling, mode);
        Ok(FunctionSpec {
            timeout_ms: spec.timeout_ms.or(Some(self.defaults.timeout_ms)),
            concurrency: spec.concurrency.or(Some(self.defaults.concurrency)),
            queue_size: spec.queue_size.or(Some(self.defaults.queue_size)),
            max_retries: spec.max_retries.or(Some(self.defaults.max_retries)),
            execution_mode: Some(mode),
            runtime_mode: spec.runtime_mode.or(Some(RuntimeMode::Http)),
            scaling,
            ..spec
        })
    }

    fn resolve_scaling(
        &self,
        scaling: Option<ScalingConfig>,
        mode: ExecutionMode,
    ) -> Option<ScalingConfig> {
        if mode != ExecutionMode::Cluster {
            return scaling;
        }
        let scaling = scaling.unwrap_or(ScalingConfig {
            strategy: None,
            min_replicas: None,
            max_replicas: None,
            metrics: Vec::new(),
            concurrency_control: None,
        });
        Some(ScalingConfig {
            strategy: scaling.strategy.or(Some(ScalingStrategy::Internal)),
            min_replicas: scaling.min_replicas.or(Some(1)),
            max_replicas: scaling.max_replicas.or(Some(10)),
            metrics: if scaling.metrics.is_empty() {
                vec![ScalingMetric::new("queue_depth", "5")]
            } else {
                scaling.metrics
            },
            concurrency_control: Some(normalize_concurrency_control(scaling.concurrency_control)),
        })
    }
}

fn normalize_concurrency_control(
    config: Option<ConcurrencyControlConfig>,
) -> ConcurrencyControlConfig {
    let mode = config.as_ref().and_then(|c| c.mode);
    let config = config.unwrap_or_default();
    if matches!(mode, None | Some(ConcurrencyControlMode::Fixed)) {
        return ConcurrencyControlConfig {
            mode: Some(ConcurrencyControlMode::Fixed),
            ..Default::default()
        };
    }

    let mut min = config
        .min_target_in_flight_per_pod
        .unwrap_or(DEFAULT_MIN_TARGET_PER_POD)
        .max(1);
    let max = config
        .max_target_in_flight_per_pod
        .unwrap_or(DEFAULT_MAX_TARGET_PER_POD)
        .max(1);
    if min > max {
        min = max;
    }
    let target = config
        .target_in_flight_per_pod
        .unwrap_or(DEFAULT_TARGET_PER_POD)
        .clamp(min, max);

    ConcurrencyControlConfig {
        mode,
        target_in_flight_per_pod: Some(target),
        min_target_in_flight_per_pod: Some(min),
        max_target_in_flight_per_pod: Some(max),
        upscale_cooldown_ms: Some(
            config
                .upscale_cooldown_ms
                .unwrap_or(DEFAULT_UPSCALE_COOLDOWN_MS),
        ),
        downscale_cooldown_ms: Some(
            config
                .downscale_cooldown_ms
                .unwrap_or(DEFAULT_DOWNSCALE_COOLDOWN_MS),
        ),
        high_load_threshold: Some(
            config
                .high_load_threshold
                .unwrap_or(DEFAULT_HIGH_LOAD_THRESHOLD),
        ),
        low_load_threshold: Some(
            config
                .low_load_threshold
                .unwrap_or(DEFAULT_LOW_LOAD_THRESHOLD),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SpecResolver {
        SpecResolver::new(FunctionDefaults::default())
    }

    #[test]
    fn fills_unset_fields_from_defaults() {
        let resolved = resolver().resolve(FunctionSpec::new("f", "img")).expect("resolve");
        let defaults = FunctionDefaults::default();
        assert_eq!(resolved.timeout_ms, Some(defaults.timeout_ms));
        assert_eq!(resolved.concurrency, Some(defaults.concurrency));
        assert_eq!(resolved.queue_size, Some(defaults.queue_size));
        assert_eq!(resolved.max_retries, Some(defaults.max_retries));
        assert_eq!(resolved.execution_mode, Some(ExecutionMode::Cluster));
        assert_eq!(resolved.runtime_mode, Some(RuntimeMode::Http));
    }

    #[test]
    fn explicit_fields_are_preserved() {
        let mut spec = FunctionSpec::new("f", "img");
        spec.timeout_ms = Some(1234);
        spec.execution_mode = Some(ExecutionMode::Local);
        let resolved = resolver().resolve(spec).expect("resolve");
        assert_eq!(resolved.timeout_ms, Some(1234));
        assert_eq!(resolved.execution_mode, Some(ExecutionMode::Local));
        // Non-cluster functions keep whatever scaling they were given (none).
        assert!(resolved.scaling.is_none());
    }

    #[test]
    fn cluster_mode_gets_a_default_scaling_config() {
        let resolved = resolver().resolve(FunctionSpec::new("f", "img")).expect("resolve");
        let scaling = resolved.scaling.expect("scaling defaulted");
        assert_eq!(scaling.strategy, Some(ScalingStrategy::Internal));
        assert_eq!(scaling.min_replicas, Some(1));
        assert_eq!(scaling.max_replicas, Some(10));
        assert_eq!(scaling.metrics[0].name, "queue_depth");
        let control = scaling.concurrency_control.expect("control");
        assert_eq!(control.mode, Some(ConcurrencyControlMode::Fixed));
    }

    #[test]
    fn adaptive_targets_are_clamped_into_bounds() {
        let mut spec = FunctionSpec::new("f", "img");
        spec.scaling = Some(ScalingConfig {
            strategy: None,
            min_replicas: None,
            max_replicas: None,
            metrics: Vec::new(),
            concurrency_control: Some(ConcurrencyControlConfig {
                mode: Some(ConcurrencyControlMode::AdaptivePerPod),
                target_in_flight_per_pod: Some(99),
                min_target_in_flight_per_pod: Some(2),
                max_target_in_flight_per_pod: Some(6),
                ..Default::default()
            }),
        });
        let resolved = resolver().resolve(spec).expect("resolve");
        let control = resolved
            .scaling
            .and_then(|s| s.concurrency_control)
            .expect("control");
        assert_eq!(control.target_in_flight_per_pod, Some(6));
        assert_eq!(control.upscale_cooldown_ms, Some(30_000));
        assert_eq!(control.downscale_cooldown_ms, Some(60_000));
    }

    #[test]
    fn blank_name_or_image_is_invalid() {
        assert!(resolver().resolve(FunctionSpec::new("", "img")).is_err());
        assert!(resolver().resolve(FunctionSpec::new("f", " ")).is_err());
    }
}
