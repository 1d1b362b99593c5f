use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sd_image_service::model::ProceduralPipeline;
use sd_image_service::{AppConfig, ResidencyController, ServiceStatus, build_router, queue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        ?config.listen_addr,
        policy = ?config.residency_policy,
        model = %config.model_id,
        "starting image generation service"
    );

    let status = Arc::new(ServiceStatus::new());
    let mut controller = ResidencyController::new(
        config.residency_policy,
        config.device_memory_ceiling_bytes,
        Box::new(ProceduralPipeline::new(config.model_profile)),
    );
    // Warm to the policy baseline before accepting traffic, so the first
    // job pays only the per-job placement cost.
    let snapshot = controller.release_to_baseline()?;
    status.publish(snapshot);
    tracing::info!(
        device_allocated_bytes = snapshot.device_allocated_bytes,
        host_model_present = snapshot.host_model_present,
        "model staged at baseline"
    );

    let queue = Arc::new(queue::spawn(
        controller,
        config.queue_depth_limit,
        config.default_timeout,
        status.clone(),
    ));

    spawn_periodic_reclaim(queue.clone(), config.reclaim_interval);

    let router = build_router(config.clone(), queue, status);
    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

/// Background reclaim sweep, keeping device memory at baseline even when
/// traffic is idle for long stretches.
fn spawn_periodic_reclaim(queue: Arc<sd_image_service::JobQueue>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            match queue.reclaim().await {
                Ok(snapshot) => tracing::debug!(
                    device_allocated_bytes = snapshot.device_allocated_bytes,
                    "periodic reclaim complete"
                ),
                Err(error) => tracing::error!(%error, "periodic reclaim failed"),
            }
        }
    });
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
