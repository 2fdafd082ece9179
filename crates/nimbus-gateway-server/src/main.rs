use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use nimbus_control::dispatch::HttpJobSubmitter;
use nimbus_control::plane::ControlPlane;
use nimbus_control::scaling::{spawn_concurrency_loop, FixedReplicaSource};
use nimbus_control::scheduler::spawn_janitor_loop;
use nimbus_gateway_server::config::GatewayConfig;
use nimbus_gateway_server::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nimbus_gateway_server=debug".into()),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    let submitter = HttpJobSubmitter::new(
        reqwest::Client::new(),
        config.jobs_url.clone(),
        config.substrate_api_timeout,
    );
    let plane = ControlPlane::new(config.plane.clone(), Box::new(submitter));

    // Background loops: queue drain + timeout sweep, store retention, and
    // the concurrency controller cadence.
    plane.scheduler(config.scheduler_tick).spawn();
    spawn_janitor_loop(
        plane.store.clone(),
        plane.idempotency.clone(),
        config.janitor_interval,
    );
    spawn_concurrency_loop(
        plane.controller.clone(),
        plane.functions.clone(),
        plane.queues.clone(),
        Arc::new(FixedReplicaSource(config.ready_replicas)),
        config.concurrency_interval.max(Duration::from_millis(100)),
    );

    let state = AppState {
        functions: plane.functions.clone(),
        invocations: plane.invocations.clone(),
    };
    let app = create_app(state);

    info!(addr = %config.bind_addr, jobs_url = %config.jobs_url, "nimbus gateway listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
