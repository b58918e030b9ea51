//! Queue item entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{DeliveryId, DestinationId, OrganizationId, Priority, QueueItemId};

/// Status of a single queue item. Wire-stable; do not reorder or rename variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting to be dequeued (or waiting for `next_retry_at`).
    Pending,
    /// Currently claimed by a worker.
    Processing,
    /// Delivered successfully.
    Completed,
    /// Exhausted retries, or classified non-retryable.
    Failed,
    /// Cancelled alongside its owning delivery.
    Cancelled,
}

impl QueueItemStatus {
    /// Terminal statuses are never revisited by the scheduler or watchdog.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One retry attempt recorded in a queue item's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt was made.
    pub timestamp: DateTime<Utc>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Error message, if the attempt failed.
    pub error: Option<String>,
}

/// Metadata accumulated on a queue item over its retry lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueItemMetadata {
    /// History of attempts, oldest first.
    #[serde(default)]
    pub retry_attempts: Vec<RetryAttempt>,
    /// Set once an error has been classified non-retryable
    /// ([`crate::retry_manager::RetryManager::mark_as_non_retryable`]).
    #[serde(default)]
    pub non_retryable: bool,
    /// Set when the scheduler skipped this item because the destination's
    /// circuit breaker was open.
    #[serde(default)]
    pub circuit_open_skip: bool,
}

/// The persisted unit of work for one `(delivery, destination)` pair.
///
/// Invariants: `retry_count <= max_retries`; a `Processing`
/// item has an implicit watchdog deadline of `updated_at + processing_timeout`
/// (§4.4); cancelling a delivery cancels all non-terminal items sharing its
/// `delivery_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier.
    pub id: QueueItemId,
    /// Owning delivery.
    pub delivery_id: DeliveryId,
    /// Owning tenant (denormalized from the delivery for cheap org-scoped
    /// queries).
    pub organization_id: OrganizationId,
    /// Target destination for this item.
    pub destination_id: DestinationId,
    /// Dequeue priority, `10` highest.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: QueueItemStatus,
    /// Number of retries already performed.
    pub retry_count: u32,
    /// Maximum retries permitted before the item is marked failed.
    pub max_retries: u32,
    /// Earliest time this item may be redequeued, set by
    /// [`crate::retry_manager::RetryManager::record_attempt`] on failure.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Snapshot of the payload at enqueue time, so in-flight retries are
    /// unaffected by later mutation of the delivery log.
    pub payload_snapshot: Value,
    /// Retry history and classification flags.
    pub metadata: QueueItemMetadata,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status-transition timestamp; the watchdog compares this against
    /// `processing_timeout`.
    pub updated_at: DateTime<Utc>,
    /// When the item reached a terminal status, if it has.
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Whether the item is eligible for dequeue right now: `Pending` and
    /// either no `next_retry_at` or it has already elapsed.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Pending
            && self.next_retry_at.is_none_or(|at| at <= now)
    }
}
