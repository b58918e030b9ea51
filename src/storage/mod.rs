//! Repository boundary.
//!
//! Narrow, per-entity repository traits: each trait is a small async CRUD
//! surface, kept independent of any particular backing store. [`sqlite`]
//! holds the `SQLx` SQLite implementation used in production; [`memory`]
//! holds in-memory fakes used by every component's unit tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    Alert, AlertConfig, AlertStatus, AlertType, Destination, DestinationHealth, DestinationType,
    MaintenanceWindow, DeliveryLog, QueueItem, QueueItemStatus,
};
use crate::domain_types::{
    AlertId, DeliveryId, DestinationId, MaintenanceWindowId, OrganizationId, QueueItemId,
};

/// Errors returned by repository implementations.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    /// The backing store returned an error (connection, constraint
    /// violation, serialization failure, ...).
    #[error("backend error: {0}")]
    Backend(String),

    /// The requested row does not exist.
    #[error("not found")]
    NotFound,

    /// A uniqueness or other invariant the store enforces was violated.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result alias for repository operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Filters accepted by [`DestinationRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct DestinationListFilter {
    /// Restrict to a single destination type.
    pub destination_type: Option<DestinationType>,
    /// Restrict to enabled or disabled destinations.
    pub disabled: Option<bool>,
    /// Maximum rows returned.
    pub limit: u32,
    /// Rows to skip, for pagination.
    pub offset: u32,
}

/// CRUD + query operations over the `destinations` table.
#[async_trait]
pub trait DestinationRepository: Send + Sync {
    /// Inserts a new destination.
    async fn create(&self, destination: Destination) -> StorageResult<Destination>;
    /// Fetches a destination by id, scoped to `organization_id` when given.
    async fn get(&self, id: &DestinationId) -> StorageResult<Option<Destination>>;
    /// Replaces the stored destination (all fields except `id`/
    /// `organization_id`/`destination_type`, which are immutable).
    async fn update(&self, destination: Destination) -> StorageResult<Destination>;
    /// Soft-deletes a destination.
    async fn delete(&self, id: &DestinationId) -> StorageResult<()>;
    /// Lists destinations for one tenant, optionally filtered.
    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DestinationListFilter,
    ) -> StorageResult<Vec<Destination>>;
    /// Lists the destinations marked `is_default` for one tenant.
    async fn list_defaults(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Destination>>;
    /// Increments `count_usage` and sets `last_used_at`.
    async fn record_usage(&self, id: &DestinationId, at: DateTime<Utc>) -> StorageResult<()>;
}

/// Filters accepted by [`DeliveryLogRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct DeliveryListFilter {
    /// Restrict to deliveries created at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Restrict to deliveries created at or before this time.
    pub until: Option<DateTime<Utc>>,
    /// Restrict to one overall status.
    pub status: Option<crate::domain::DeliveryStatus>,
    /// Maximum rows returned.
    pub limit: u32,
    /// Rows to skip, for pagination.
    pub offset: u32,
}

/// CRUD + query operations over the `delivery_logs` table.
#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    /// Inserts a new delivery log.
    async fn create(&self, log: DeliveryLog) -> StorageResult<DeliveryLog>;
    /// Fetches a delivery log by id.
    async fn get(&self, id: &DeliveryId) -> StorageResult<Option<DeliveryLog>>;
    /// Replaces the stored delivery log (used after status or per-destination
    /// substate changes).
    async fn update(&self, log: DeliveryLog) -> StorageResult<DeliveryLog>;
    /// Lists delivery logs for one tenant, optionally filtered.
    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DeliveryListFilter,
    ) -> StorageResult<Vec<DeliveryLog>>;
}

/// CRUD + query operations over the `delivery_queue` table.
///
/// `dequeue_batch` is the one operation that needs a store-specific feature
/// (row locking / `UPDATE ... RETURNING`) to atomically claim rows; every
/// other method is plain CRUD.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Inserts a new queue item.
    async fn create(&self, item: QueueItem) -> StorageResult<QueueItem>;
    /// Fetches a queue item by id.
    async fn get(&self, id: &QueueItemId) -> StorageResult<Option<QueueItem>>;
    /// Replaces the stored queue item.
    async fn update(&self, item: QueueItem) -> StorageResult<QueueItem>;
    /// Atomically claims up to `limit` ready items
    /// (`status = Pending AND (next_retry_at IS NULL OR next_retry_at <=
    /// now)`), ordered `priority DESC, created_at ASC`, transitioning each to
    /// `Processing` with `updated_at = now` as part of the same operation
    ///.
    async fn dequeue_batch(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<Vec<QueueItem>>;
    /// Finds items stuck in `Processing` since before `older_than`, for the
    /// watchdog.
    async fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<QueueItem>>;
    /// Deletes terminal items older than `older_than`.
    async fn delete_completed_older_than(&self, older_than: DateTime<Utc>) -> StorageResult<u64>;
    /// Lists all non-terminal items belonging to a delivery, for
    /// `CancelDelivery`.
    async fn list_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>>;
    /// Lists every item belonging to a delivery regardless of status, used
    /// by `DeliveryService` to reconstruct per-destination substates.
    async fn list_all_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>>;
    /// Counts items by status for one tenant (or all tenants when `None`),
    /// used by queue health and per-org stats.
    async fn count_by_status(
        &self,
        organization_id: Option<&OrganizationId>,
        status: QueueItemStatus,
    ) -> StorageResult<u64>;
    /// Returns the age of the oldest non-terminal item queue-wide, if any,
    /// used by `GetQueueHealth`'s `stale_items` alert.
    async fn oldest_pending_age(&self, now: DateTime<Utc>) -> StorageResult<Option<std::time::Duration>>;
    /// Returns the age of the oldest non-terminal item belonging to
    /// `organization_id`, if any, used by `GetOrgStats`'s `average_wait_time`
    /// so a tenant's read never reflects another tenant's backlog.
    async fn oldest_pending_age_for_org(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<std::time::Duration>>;
    /// Returns every item in `Completed` or `Failed` status, used by
    /// `RetryManager::get_retry_statistics` to aggregate retry counts and
    /// the non-retryable breakdown across terminal items.
    async fn list_terminal(&self) -> StorageResult<Vec<QueueItem>>;
}

/// CRUD operations over the `destination_health` table.
#[async_trait]
pub trait DestinationHealthRepository: Send + Sync {
    /// Fetches the health record for a destination, if one exists.
    async fn get(&self, destination_id: &DestinationId) -> StorageResult<Option<DestinationHealth>>;
    /// Inserts or replaces a health record.
    async fn upsert(&self, health: DestinationHealth) -> StorageResult<DestinationHealth>;
    /// Returns every tracked health record, for `GetAllStates`.
    async fn list_all(&self) -> StorageResult<Vec<DestinationHealth>>;
}

/// CRUD + query operations over the `alerts` table.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Inserts a new alert.
    async fn create(&self, alert: Alert) -> StorageResult<Alert>;
    /// Fetches an alert by id.
    async fn get(&self, id: &AlertId) -> StorageResult<Option<Alert>>;
    /// Replaces a stored alert (status transitions, acknowledgement, notes).
    async fn update(&self, alert: Alert) -> StorageResult<Alert>;
    /// Lists alerts for one tenant, optionally filtered by status/type.
    async fn list(
        &self,
        organization_id: &OrganizationId,
        status: Option<AlertStatus>,
        alert_type: Option<AlertType>,
    ) -> StorageResult<Vec<Alert>>;
}

/// CRUD operations over the `alert_configs` table.
#[async_trait]
pub trait AlertConfigRepository: Send + Sync {
    /// Fetches the configured thresholds for a tenant, if any have been set.
    async fn get(&self, organization_id: &OrganizationId) -> StorageResult<Option<AlertConfig>>;
    /// Inserts or replaces the configured thresholds for a tenant.
    async fn upsert(&self, config: AlertConfig) -> StorageResult<AlertConfig>;
}

/// CRUD + query operations over the `maintenance_windows` table.
#[async_trait]
pub trait MaintenanceWindowRepository: Send + Sync {
    /// Inserts a new maintenance window.
    async fn create(&self, window: MaintenanceWindow) -> StorageResult<MaintenanceWindow>;
    /// Deletes a maintenance window, e.g. once it has expired.
    async fn delete(&self, id: &MaintenanceWindowId) -> StorageResult<()>;
    /// Lists windows active at `now` for a tenant (and optionally scoped to
    /// one destination).
    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>>;
    /// Deletes every window whose `end_time` has passed, for periodic
    /// cleanup (`AlertDebouncer::cleanup`).
    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}
