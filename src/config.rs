//! Process configuration and the explicit component container.
//!
//! Numeric defaults are chosen so the service runs sensibly out of the box
//! with zero configuration, and everything is loadable from a TOML file via
//! the `config` crate. Every component is built once into a `Container` at
//! process start and handed down explicitly — no global singletons.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::{TransportAdapter, WebhookAdapter};
use crate::alert_access_control::AlertAccessControl;
use crate::alert_debouncer::AlertDebouncer;
use crate::alert_manager::AlertManager;
use crate::circuit_breaker::CircuitBreaker;
use crate::database::{Database, DatabaseConfig};
use crate::destination_manager::DestinationManager;
use crate::delivery_service::DeliveryService;
use crate::observability::{default_observer, SharedObserver};
use crate::queue_manager::QueueManager;
use crate::retry_manager::RetryManager;
use crate::storage::sqlite::{
    SqliteAlertConfigRepository, SqliteAlertRepository, SqliteDeliveryLogRepository,
    SqliteDestinationHealthRepository, SqliteDestinationRepository, SqliteMaintenanceWindowRepository,
    SqliteQueueRepository,
};
use crate::storage::StorageError;

/// Per-destination circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip the breaker.
    pub failure_threshold: u32,
    /// Minimum sample size before the breaker is allowed to trip.
    pub volume_threshold: u32,
    /// How long an open breaker waits before trialing a half-open request.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close the breaker.
    pub success_threshold: u32,
    /// Window over which failure-rate alerts are evaluated.
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            volume_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            monitoring_window: Duration::from_secs(5 * 60),
        }
    }
}

/// Retry/backoff defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts before an item is marked failed.
    pub max_retries: u32,
    /// Base delay for the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to the computed backoff.
    pub max_delay: Duration,
    /// Exponential multiplier applied per attempt.
    pub multiplier: f64,
    /// Whether to add uniform jitter to the computed backoff.
    pub jitter_enabled: bool,
    /// Maximum jitter, as a percentage of the computed backoff.
    pub jitter_max_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_percent: 10.0,
        }
    }
}

/// Queue worker / scheduler defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often the worker loop ticks.
    pub processing_interval: Duration,
    /// Maximum items dequeued, and delivered concurrently, per tick.
    pub max_concurrent_deliveries: u32,
    /// How long a `processing` item may sit before the watchdog rescues it.
    pub processing_timeout: Duration,
    /// Maximum age of a terminal item before cleanup deletes it.
    pub max_completed_age: Duration,
    /// Pending queue depth past which `GetQueueHealth` reports `degraded`.
    pub queue_depth_warning: u64,
    /// Pending queue depth past which `GetQueueHealth` reports `critical`.
    pub queue_depth_critical: u64,
    /// Oldest-item age past which `GetQueueHealth` emits a `stale_items` alert.
    pub stale_item_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(1),
            max_concurrent_deliveries: 10,
            processing_timeout: Duration::from_secs(5 * 60),
            max_completed_age: Duration::from_secs(24 * 60 * 60),
            queue_depth_warning: 500,
            queue_depth_critical: 2000,
            stale_item_age: Duration::from_secs(10 * 60),
        }
    }
}

/// Delivery service defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryServiceConfig {
    /// Maximum serialized payload size accepted by `Deliver`.
    pub max_payload_size: usize,
}

impl Default for DeliveryServiceConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 10 * 1024 * 1024,
        }
    }
}

/// Default debounce/escalation timing for alert types not otherwise
/// configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertDebounceDefaults {
    /// Rolling window used for the rate limit.
    pub window_minutes: i64,
    /// Minimum time between two alerts of the same key.
    pub cooldown_minutes: i64,
    /// Maximum alerts permitted per window.
    pub max_alerts_per_window: u32,
    /// Minutes since first alert before the first escalation check.
    pub escalation_delay_minutes: i64,
}

impl Default for AlertDebounceDefaults {
    fn default() -> Self {
        Self {
            window_minutes: 10,
            cooldown_minutes: 30,
            max_alerts_per_window: 2,
            escalation_delay_minutes: 30,
        }
    }
}

/// Per-destination adapter timeout default.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Default per-attempt timeout applied when a destination doesn't
    /// override it.
    pub default_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level process configuration, loadable from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `SQLite` connection settings.
    pub database: DatabaseSettings,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry/backoff defaults.
    pub retry: RetryConfig,
    /// Queue worker/scheduler defaults.
    pub queue: QueueConfig,
    /// Delivery service defaults.
    pub delivery: DeliveryServiceConfig,
    /// Alert debounce/escalation defaults.
    pub alert_debounce: AlertDebounceDefaults,
    /// Adapter timeout defaults.
    pub adapter: AdapterConfig,
    /// HTTP bind address for the REST API.
    pub bind_address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            delivery: DeliveryServiceConfig::default(),
            alert_debounce: AlertDebounceDefaults::default(),
            adapter: AdapterConfig::default(),
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Wire representation of [`DatabaseConfig`], since the latter carries a
/// `PathBuf` that the `config` crate's TOML layer maps more naturally from
/// a plain string.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Path to the `SQLite` database file.
    pub path: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Whether to enable WAL mode.
    pub enable_wal_mode: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "deliverd.db".to_string(),
            max_connections: 10,
            enable_wal_mode: true,
        }
    }
}

impl From<&DatabaseSettings> for DatabaseConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            path: settings.path.clone().into(),
            max_connections: settings.max_connections,
            enable_wal_mode: settings.enable_wal_mode,
        }
    }
}

impl AppConfig {
    /// Loads configuration from an optional TOML file layered over the
    /// built-in defaults, with environment variables as the final layer.
    /// Missing files are not an error; every field falls back to its
    /// documented default.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but fails to parse, or if an
    /// environment override fails to deserialize into the expected type.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DELIVERD")
                .separator("__")
                .try_parsing(true),
        );
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Every component wired up and shared as `Arc<...>`, assembled once at
/// process start. No component reaches for global state; everything it
/// needs arrives through its constructor.
pub struct Container {
    /// Application configuration the container was built from.
    pub config: AppConfig,
    /// Destination CRUD and validation.
    pub destination_manager: Arc<DestinationManager>,
    /// Per-destination circuit breaker.
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry eligibility and backoff.
    pub retry_manager: Arc<RetryManager>,
    /// Priority queue scheduler and worker loop.
    pub queue_manager: Arc<QueueManager>,
    /// Delivery orchestration entry point.
    pub delivery_service: Arc<DeliveryService>,
    /// Alert debounce/escalation state.
    pub alert_debouncer: Arc<AlertDebouncer>,
    /// Alert role/tenant access control.
    pub alert_access_control: Arc<AlertAccessControl>,
    /// Alert threshold evaluation and operator API.
    pub alert_manager: Arc<AlertManager>,
    /// Structured event sink shared by every component.
    pub observer: SharedObserver,
}

impl Container {
    /// Connects to the configured database, runs migrations, and wires up
    /// every component against `SQLite`-backed repositories and a real
    /// [`WebhookAdapter`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or migration fails.
    pub async fn build(config: AppConfig) -> Result<Self, StorageError> {
        let database = Database::connect(&DatabaseConfig::from(&config.database)).await?;
        Ok(Self::from_database(config, database, Arc::new(WebhookAdapter::new())))
    }

    /// Wires every component against an already-connected `database` and a
    /// caller-supplied adapter, used by integration tests that want
    /// `SQLite` persistence without a real network transport (swap in
    /// [`crate::adapter::NullAdapter`]).
    #[must_use]
    pub fn from_database(
        config: AppConfig,
        database: Database,
        adapter: Arc<dyn TransportAdapter>,
    ) -> Self {
        let pool = database.pool().clone();
        let observer = default_observer();

        let destination_repo = Arc::new(SqliteDestinationRepository::new(pool.clone()));
        let delivery_repo = Arc::new(SqliteDeliveryLogRepository::new(pool.clone()));
        let queue_repo = Arc::new(SqliteQueueRepository::new(pool.clone()));
        let health_repo = Arc::new(SqliteDestinationHealthRepository::new(pool.clone()));
        let alert_repo = Arc::new(SqliteAlertRepository::new(pool.clone()));
        let alert_config_repo = Arc::new(SqliteAlertConfigRepository::new(pool.clone()));
        let window_repo = Arc::new(SqliteMaintenanceWindowRepository::new(pool));

        Self::assemble(
            config,
            destination_repo,
            delivery_repo,
            queue_repo,
            health_repo,
            alert_repo,
            alert_config_repo,
            window_repo,
            adapter,
            observer,
        )
    }

    /// Wires every component against caller-supplied repositories (used by
    /// in-memory-fake-backed integration tests, which never touch `SQLite`
    /// at all).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: AppConfig,
        destination_repo: Arc<dyn crate::storage::DestinationRepository>,
        delivery_repo: Arc<dyn crate::storage::DeliveryLogRepository>,
        queue_repo: Arc<dyn crate::storage::QueueRepository>,
        health_repo: Arc<dyn crate::storage::DestinationHealthRepository>,
        alert_repo: Arc<dyn crate::storage::AlertRepository>,
        alert_config_repo: Arc<dyn crate::storage::AlertConfigRepository>,
        window_repo: Arc<dyn crate::storage::MaintenanceWindowRepository>,
        adapter: Arc<dyn TransportAdapter>,
        observer: SharedObserver,
    ) -> Self {
        let destination_manager = Arc::new(DestinationManager::new(
            destination_repo.clone(),
            adapter.clone(),
        ));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            health_repo.clone(),
            config.circuit_breaker.clone(),
            observer.clone(),
        ));
        let retry_manager = Arc::new(RetryManager::new(
            queue_repo.clone(),
            config.retry.clone(),
            observer.clone(),
        ));
        let queue_manager = Arc::new(QueueManager::new(
            queue_repo,
            destination_repo.clone(),
            circuit_breaker.clone(),
            retry_manager.clone(),
            adapter,
            config.queue.clone(),
            observer.clone(),
        ));
        let delivery_service = Arc::new(DeliveryService::new(
            delivery_repo,
            destination_manager.clone(),
            circuit_breaker.clone(),
            queue_manager.clone(),
            config.delivery.clone(),
        ));
        let alert_debouncer = Arc::new(AlertDebouncer::new(
            window_repo,
            config.alert_debounce.clone(),
        ));
        let alert_access_control = Arc::new(AlertAccessControl::new());
        let alert_manager = Arc::new(AlertManager::new(
            alert_repo,
            alert_config_repo,
            health_repo,
            queue_manager.clone(),
            alert_debouncer.clone(),
            alert_access_control.clone(),
            observer.clone(),
        ));

        Self {
            config,
            destination_manager,
            circuit_breaker,
            retry_manager,
            queue_manager,
            delivery_service,
            alert_debouncer,
            alert_access_control,
            alert_manager,
            observer,
        }
    }
}
