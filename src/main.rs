//! `deliverd` — process entry point.
//!
//! Loads configuration, connects to the database (running pending migrations
//! via [`deliverd::database::Database::connect`]), assembles the
//! [`deliverd::config::Container`], spawns the queue worker loop, the
//! stuck-item watchdog, and the cleanup loop as supervised `tokio` tasks, and
//! serves the REST API with graceful shutdown on `SIGINT`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use deliverd::config::{AppConfig, Container};
use deliverd::rest_api::create_app;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line arguments accepted by the `deliverd` server binary.
#[derive(Debug, Parser)]
#[command(name = "deliverd", about = "Multi-tenant reliable delivery orchestrator")]
struct Args {
    /// Path to a TOML configuration file. Defaults layer under it; `DELIVERD__`
    /// prefixed environment variables layer over it.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// How often the watchdog checks for stuck `processing` items, independent
/// of the configured `processing_timeout` threshold itself.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
/// How often terminal queue items older than `max_completed_age` are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deliverd=info".parse()?),
        )
        .json()
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    info!(bind_address = %config.bind_address, "starting deliverd");

    let bind_address = config.bind_address.clone();
    let container = Arc::new(Container::build(config).await?);

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(worker_loop(container.clone(), shutdown.clone()));
    tasks.spawn(watchdog_loop(container.clone(), shutdown.clone()));
    tasks.spawn(cleanup_loop(container.clone(), shutdown.clone()));

    let listener = TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "REST API listening");

    let app = create_app(container);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to install SIGINT handler, shutting down immediately");
            }
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    info!("deliverd shut down gracefully");
    Ok(())
}

/// Dequeues and delivers ready items on a fixed tick until `shutdown` fires.
async fn worker_loop(container: Arc<Container>, shutdown: CancellationToken) {
    let interval = container.config.queue.processing_interval;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match container.queue_manager.run_once().await {
                    Ok(processed) if processed > 0 => info!(processed, "worker tick"),
                    Ok(_) => {}
                    Err(error) => error!(%error, "worker tick failed"),
                }
            }
        }
    }
}

/// Reclaims items stuck in `processing` on a fixed tick until `shutdown`
/// fires.
async fn watchdog_loop(container: Arc<Container>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match container.queue_manager.process_stuck_items().await {
                    Ok(reclaimed) if reclaimed > 0 => warn!(reclaimed, "watchdog reclaimed stuck items"),
                    Ok(_) => {}
                    Err(error) => error!(%error, "watchdog tick failed"),
                }
            }
        }
    }
}

/// Deletes terminal queue items past `max_completed_age` and expired
/// maintenance windows/debounce state on a fixed tick until `shutdown`
/// fires.
async fn cleanup_loop(container: Arc<Container>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match container.queue_manager.perform_cleanup().await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "cleanup swept completed items"),
                    Ok(_) => {}
                    Err(error) => error!(%error, "cleanup tick failed"),
                }
                match container.alert_debouncer.cleanup().await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "cleanup swept expired maintenance windows"),
                    Ok(_) => {}
                    Err(error) => error!(%error, "alert debouncer cleanup failed"),
                }
            }
        }
    }
}
