//! Environment-backed configuration for the gateway binary. Everything is
//! read once at startup and handed to the control plane as explicit values.

use std::net::SocketAddr;
use std::time::Duration;

use nimbus_common::{FunctionDefaults, NimbusError, Result};
use nimbus_control::plane::ControlPlaneConfig;
use nimbus_control::sync_queue::SyncQueueConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Where cluster jobs are POSTed.
    pub jobs_url: String,
    pub substrate_api_timeout: Duration,
    /// Advertised completion endpoint baked into job manifests.
    pub callback_url: String,
    pub scheduler_tick: Duration,
    pub janitor_interval: Duration,
    pub concurrency_interval: Duration,
    pub ready_replicas: u32,
    pub plane: ControlPlaneConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr: SocketAddr = env_or("NIMBUS_BIND_ADDR", "0.0.0.0:8080")?;
        let callback_url = std::env::var("NIMBUS_CALLBACK_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}/v1/internal/executions"));

        let defaults = FunctionDefaults {
            timeout_ms: env_or("NIMBUS_DEFAULT_TIMEOUT_MS", "30000")?,
            concurrency: env_or("NIMBUS_DEFAULT_CONCURRENCY", "2")?,
            queue_size: env_or("NIMBUS_DEFAULT_QUEUE_SIZE", "16")?,
            max_retries: env_or("NIMBUS_DEFAULT_MAX_RETRIES", "0")?,
        };
        let sync_queue = SyncQueueConfig {
            enabled: env_or("NIMBUS_SYNC_QUEUE_ENABLED", "true")?,
            admission_enabled: env_or("NIMBUS_SYNC_QUEUE_ADMISSION_ENABLED", "true")?,
            max_depth: env_or("NIMBUS_SYNC_QUEUE_MAX_DEPTH", "64")?,
            max_estimated_wait: millis(env_or("NIMBUS_SYNC_QUEUE_MAX_ESTIMATED_WAIT_MS", "10000")?),
            max_queue_wait: millis(env_or("NIMBUS_SYNC_QUEUE_MAX_QUEUE_WAIT_MS", "30000")?),
            retry_after_seconds: env_or("NIMBUS_SYNC_QUEUE_RETRY_AFTER_SECONDS", "1")?,
            throughput_window: millis(env_or("NIMBUS_SYNC_QUEUE_THROUGHPUT_WINDOW_MS", "60000")?),
            per_function_min_samples: env_or("NIMBUS_SYNC_QUEUE_MIN_SAMPLES", "5")?,
        };

        Ok(Self {
            bind_addr,
            jobs_url: std::env::var("NIMBUS_JOBS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6443/apis/batch/v1/jobs".to_string()),
            substrate_api_timeout: millis(env_or("NIMBUS_SUBSTRATE_API_TIMEOUT_MS", "10000")?),
            callback_url: callback_url.clone(),
            scheduler_tick: millis(env_or("NIMBUS_SCHEDULER_TICK_MS", "2")?),
            janitor_interval: millis(env_or("NIMBUS_JANITOR_INTERVAL_MS", "60000")?),
            concurrency_interval: millis(env_or("NIMBUS_CONCURRENCY_INTERVAL_MS", "5000")?),
            ready_replicas: env_or("NIMBUS_READY_REPLICAS", "1")?,
            plane: ControlPlaneConfig {
                defaults,
                sync_queue,
                callback_url,
                execution_retention: millis(env_or("NIMBUS_EXECUTION_RETENTION_MS", "300000")?),
                execution_stale_after: millis(env_or("NIMBUS_EXECUTION_STALE_MS", "600000")?),
                idempotency_ttl: millis(env_or("NIMBUS_IDEMPOTENCY_TTL_MS", "600000")?),
            },
        })
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn env_or<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|_| {
        NimbusError::Config(format!("invalid value for {key}: {raw:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: the environment is process-global state.
    #[test]
    fn defaults_apply_and_invalid_values_are_reported() {
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.plane.defaults.timeout_ms, 30_000);
        assert!(config.plane.sync_queue.enabled);
        assert_eq!(config.plane.sync_queue.max_depth, 64);

        std::env::set_var("NIMBUS_SYNC_QUEUE_MAX_DEPTH", "not-a-number");
        let err = GatewayConfig::from_env().unwrap_err();
        std::env::remove_var("NIMBUS_SYNC_QUEUE_MAX_DEPTH");
        assert!(err.to_string().contains("NIMBUS_SYNC_QUEUE_MAX_DEPTH"));
    }
}
