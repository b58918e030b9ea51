//! `orchestratorctl` — operator CLI for tasks that don't need the HTTP
//! surface: seeding a destination, forcing a circuit breaker open/closed,
//! requeuing stuck items, and tailing queue health.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deliverd::config::{AppConfig, Container};
use deliverd::destination_manager::CreateDestinationInput;
use deliverd::domain::{DestinationConfig, HttpMethod, WebhookConfig};
use deliverd::domain_types::{DestinationId, OrganizationId};

#[derive(Debug, Parser)]
#[command(name = "orchestratorctl", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the same TOML configuration file `deliverd` was started with.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates a webhook destination for a tenant.
    SeedDestination {
        /// Owning tenant.
        #[arg(long)]
        organization_id: String,
        /// Human-readable label.
        #[arg(long)]
        label: String,
        /// Target webhook URL.
        #[arg(long)]
        url: String,
        /// Register this destination as a default delivery target.
        #[arg(long)]
        is_default: bool,
    },
    /// Forces a destination's circuit breaker open or closed, bypassing the
    /// normal failure-threshold evaluation.
    ForceBreaker {
        /// Destination to act on.
        #[arg(long)]
        destination_id: String,
        #[command(subcommand)]
        state: BreakerState,
    },
    /// Requeues items the watchdog finds stuck in `processing`.
    Requeue,
    /// Prints queue health once, or repeatedly with `--watch`.
    Health {
        /// Re-print every `interval` seconds until interrupted.
        #[arg(long)]
        watch: bool,
        /// Polling interval in seconds, used only with `--watch`.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[derive(Debug, Subcommand)]
enum BreakerState {
    /// Trips the breaker, short-circuiting further delivery attempts.
    Open {
        /// Human-readable reason, recorded on the health record.
        #[arg(long, default_value = "forced via orchestratorctl")]
        reason: String,
    },
    /// Clears the breaker back to `closed`.
    Closed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    let container = Container::build(config).await?;

    match args.command {
        Command::SeedDestination {
            organization_id,
            label,
            url,
            is_default,
        } => seed_destination(&container, organization_id, label, url, is_default).await,
        Command::ForceBreaker {
            destination_id,
            state,
        } => force_breaker(&container, destination_id, state).await,
        Command::Requeue => requeue(&container).await,
        Command::Health { watch, interval } => health(&container, watch, interval).await,
    }
}

async fn seed_destination(
    container: &Container,
    organization_id: String,
    label: String,
    url: String,
    is_default: bool,
) -> Result<()> {
    let organization_id =
        OrganizationId::try_new(organization_id).context("invalid organization id")?;
    let config = DestinationConfig::Webhook(WebhookConfig {
        url,
        method: HttpMethod::Post,
        headers: std::collections::BTreeMap::new(),
        timeout: Duration::from_secs(30),
        retry_config: None,
    });
    let destination = container
        .destination_manager
        .create(CreateDestinationInput {
            organization_id,
            label,
            description: None,
            config,
            is_default,
        })
        .await?;
    println!("created destination {}", destination.id);
    Ok(())
}

async fn force_breaker(container: &Container, destination_id: String, state: BreakerState) -> Result<()> {
    let destination_id =
        DestinationId::try_new(destination_id).context("invalid destination id")?;
    match state {
        BreakerState::Open { reason } => {
            container.circuit_breaker.force_open(&destination_id, reason).await?;
            println!("forced destination {destination_id} open");
        }
        BreakerState::Closed => {
            container.circuit_breaker.force_close(&destination_id).await?;
            println!("forced destination {destination_id} closed");
        }
    }
    Ok(())
}

async fn requeue(container: &Container) -> Result<()> {
    let reclaimed = container.queue_manager.process_stuck_items().await?;
    println!("reclaimed {reclaimed} stuck item(s)");
    Ok(())
}

async fn health(container: &Container, watch: bool, interval: u64) -> Result<()> {
    loop {
        let health = container.queue_manager.get_queue_health().await?;
        println!("status: {:?}", health.status);
        println!(
            "  depth={} failure_rate={:.2} throughput={}",
            health.metrics.queue_depth, health.metrics.failure_rate, health.metrics.throughput
        );
        for alert in &health.alerts {
            println!("  alert[{}]: {}", alert.kind, alert.message);
        }
        if !watch {
            break;
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
    Ok(())
}
