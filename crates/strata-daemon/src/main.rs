//! Strata Daemon - Main entry point
//!
//! Runs the worker pool, the expiration scheduler and the task socket.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata_daemon::{
    ChannelQueue, ExpirationScheduler, Services, StrataConfig, TaskIntake, WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Strata daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config
    let config_path = StrataConfig::default_path();
    let config = StrataConfig::load_or_create(&config_path)?;
    config.ensure_directories()?;

    // Initialize components
    let services = Services::from_config(&config)?;
    let (queue, deliveries) = ChannelQueue::new();

    let pool = WorkerPool::new(
        Arc::new(services.dispatcher()),
        queue.clone(),
        config.worker.concurrency,
        config.worker.delivery_attempts,
    );

    let scheduler = ExpirationScheduler::new(
        Arc::clone(&services.store),
        queue.clone(),
        Duration::from_secs(config.worker.scan_interval_secs),
        config.worker.retimestamp_margin_days,
    );
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    let intake = TaskIntake::new(config.worker.socket_path.clone(), queue.clone());
    let intake_handle = tokio::spawn(async move {
        if let Err(e) = intake.run().await {
            error!("Task socket error: {}", e);
        }
    });

    info!("Daemon started successfully");

    // Run until shutdown, letting running tasks finish
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = scheduler_handle => {
                error!("Scheduler exited unexpectedly");
            }
            _ = intake_handle => {
                error!("Task socket exited unexpectedly");
            }
        }
    };
    pool.run(deliveries, shutdown).await?;

    if let Err(e) = std::fs::remove_file(&config.worker.socket_path) {
        error!("Could not remove {:?}: {}", config.worker.socket_path, e);
    }
    info!("Daemon shutting down");

    Ok(())
}
