//! Retry eligibility, backoff, and attempt bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::adapter::{AdapterError, ErrorClass};
use crate::config::RetryConfig;
use crate::domain::{QueueItem, QueueItemStatus, RetryAttempt};
use crate::domain_types::QueueItemId;
use crate::error::{OrchestratorError, Result};
use crate::observability::{RetryScheduledEvent, SharedObserver};
use crate::storage::QueueRepository;

/// Current retry posture for one queue item, returned by
/// [`RetryManager::get_retry_schedule`].
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    /// Retries performed so far.
    pub current_attempt: u32,
    /// Maximum retries permitted.
    pub max_attempts: u32,
    /// Backoff that would be applied to the next attempt.
    pub next_backoff: Duration,
    /// Sum of every backoff applied so far, ignoring jitter.
    pub total_elapsed_delay: Duration,
}

/// Aggregated counters returned by [`RetryManager::get_retry_statistics`].
///
/// `non_retryable_count` is kept disjoint from `failed_retries`: an item
/// marked non-retryable is counted there and nowhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryStatistics {
    /// Total retry attempts across every completed/failed item.
    pub total_retries: u64,
    /// Attempts that ultimately succeeded.
    pub successful_retries: u64,
    /// Attempts that exhausted retries without a non-retryable
    /// classification.
    pub failed_retries: u64,
    /// Items marked non-retryable, counted separately from `failed_retries`.
    pub non_retryable_count: u64,
    /// Mean retry count across every terminal item observed.
    pub average_retry_count: f64,
}

/// Decides retry eligibility, computes backoff, and records attempt
/// history on queue items.
pub struct RetryManager {
    queue_repo: Arc<dyn QueueRepository>,
    config: RetryConfig,
    observer: SharedObserver,
}

impl RetryManager {
    /// Builds a retry manager over `queue_repo`.
    #[must_use]
    pub fn new(queue_repo: Arc<dyn QueueRepository>, config: RetryConfig, observer: SharedObserver) -> Self {
        Self {
            queue_repo,
            config,
            observer,
        }
    }

    async fn load(&self, id: &QueueItemId) -> Result<QueueItem> {
        self.queue_repo
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("queue item {id}")))
    }

    /// Whether `item` should be retried given `error`:
    /// `false` once `retry_count >= max_retries`, once the item has been
    /// flagged non-retryable, or when `error`'s class is
    /// [`ErrorClass::NonRetryable`].
    #[must_use]
    pub fn should_retry(&self, item: &QueueItem, error: &AdapterError) -> bool {
        if item.metadata.non_retryable {
            return false;
        }
        if item.retry_count >= item.max_retries.min(self.config.max_retries) {
            return false;
        }
        error.class != ErrorClass::NonRetryable
    }

    /// Computes the backoff for `attempt` (0-based: `0` is the first retry),
    /// `min(base * multiplier ^ attempt, max_delay)`, with uniform jitter
    /// added when enabled.
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = f64::from(attempt.min(32));
        let scaled = self.config.base_delay.as_secs_f64() * self.config.multiplier.powf(exponent);
        let capped = scaled.min(self.config.max_delay.as_secs_f64());

        let with_jitter = if self.config.jitter_enabled {
            let max_jitter = capped * (self.config.jitter_max_percent / 100.0);
            let jitter = rand::thread_rng().gen_range(0.0..=max_jitter.max(0.0));
            (capped + jitter).min(self.config.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(with_jitter.max(0.0))
    }

    /// Records the outcome of a delivery attempt against `item`, either
    /// completing it, scheduling a retry, or marking it failed.
    ///
    /// `retry_after` floors the computed backoff when the adapter reported
    /// one larger than it.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue item can't be read or written.
    pub async fn record_attempt(
        &self,
        id: &QueueItemId,
        success: bool,
        error: Option<&AdapterError>,
        retry_after: Option<Duration>,
    ) -> Result<QueueItem> {
        let mut item = self.load(id).await?;
        let now = Utc::now();
        let attempt_number = item.metadata.retry_attempts.len() as u32 + 1;

        item.metadata.retry_attempts.push(RetryAttempt {
            attempt_number,
            timestamp: now,
            success,
            error: error.map(ToString::to_string),
        });

        if success {
            item.status = QueueItemStatus::Completed;
            item.processed_at = Some(now);
            item.updated_at = now;
            return Ok(self.queue_repo.update(item).await?);
        }

        let adapter_error = error.expect("failure outcomes carry an adapter error");
        if !self.should_retry(&item, adapter_error) {
            item.status = QueueItemStatus::Failed;
            item.processed_at = Some(now);
            item.updated_at = now;
            if adapter_error.class == ErrorClass::NonRetryable {
                item.metadata.non_retryable = true;
            }
            return Ok(self.queue_repo.update(item).await?);
        }

        let computed = self.calculate_backoff(item.retry_count);
        let backoff = retry_after.map_or(computed, |floor| computed.max(floor));
        item.retry_count += 1;
        item.next_retry_at = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
        item.status = QueueItemStatus::Pending;
        item.updated_at = now;

        self.observer.on_retry_scheduled(&RetryScheduledEvent {
            destination_id: item.destination_id.clone(),
            retry_count: item.retry_count,
            backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        });

        Ok(self.queue_repo.update(item).await?)
    }

    /// Returns the current retry posture for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue item doesn't exist.
    pub async fn get_retry_schedule(&self, id: &QueueItemId) -> Result<RetrySchedule> {
        let item = self.load(id).await?;
        let total_elapsed_delay = (0..item.retry_count).map(|n| self.calculate_backoff(n)).sum();
        Ok(RetrySchedule {
            current_attempt: item.retry_count,
            max_attempts: item.max_retries,
            next_backoff: self.calculate_backoff(item.retry_count),
            total_elapsed_delay,
        })
    }

    /// Zeroes `id`'s retry counter and attempt history, returning the item
    /// to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue item can't be read or written.
    pub async fn reset_retry_count(&self, id: &QueueItemId) -> Result<QueueItem> {
        let mut item = self.load(id).await?;
        item.retry_count = 0;
        item.next_retry_at = None;
        item.metadata.retry_attempts.clear();
        item.metadata.non_retryable = false;
        item.status = QueueItemStatus::Pending;
        item.updated_at = Utc::now();
        Ok(self.queue_repo.update(item).await?)
    }

    /// Marks `id` permanently non-retryable with `reason` recorded against
    /// its attempt history.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue item can't be read or written.
    pub async fn mark_as_non_retryable(&self, id: &QueueItemId, reason: String) -> Result<QueueItem> {
        let mut item = self.load(id).await?;
        let now = Utc::now();
        item.status = QueueItemStatus::Failed;
        item.metadata.non_retryable = true;
        item.metadata.retry_attempts.push(RetryAttempt {
            attempt_number: item.metadata.retry_attempts.len() as u32 + 1,
            timestamp: now,
            success: false,
            error: Some(reason),
        });
        item.processed_at = Some(now);
        item.updated_at = now;
        Ok(self.queue_repo.update(item).await?)
    }

    /// Aggregates retry statistics across every completed and failed item
    /// tracked in the queue table.
    ///
    /// `non_retryable_count` is kept as its own disjoint category from
    /// `failed_retries`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_retry_statistics(&self) -> Result<RetryStatistics> {
        let items = self.queue_repo.list_terminal().await?;

        let mut total_retries = 0u64;
        let mut successful_retries = 0u64;
        let mut failed_retries = 0u64;
        let mut non_retryable_count = 0u64;

        for item in &items {
            total_retries += u64::from(item.retry_count);
            if item.metadata.non_retryable {
                non_retryable_count += 1;
            } else if item.status == QueueItemStatus::Completed {
                successful_retries += 1;
            } else if item.status == QueueItemStatus::Failed {
                failed_retries += 1;
            }
        }

        let count = items.len() as f64;
        let average_retry_count = if items.is_empty() {
            0.0
        } else {
            total_retries as f64 / count
        };

        Ok(RetryStatistics {
            total_retries,
            successful_retries,
            failed_retries,
            non_retryable_count,
            average_retry_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueItemMetadata;
    use crate::domain_types::{DeliveryId, DestinationId, OrganizationId, Priority};
    use crate::observability::default_observer;
    use crate::storage::memory::InMemoryQueueRepository;
    use serde_json::json;

    fn manager() -> (RetryManager, Arc<InMemoryQueueRepository>) {
        let repo = Arc::new(InMemoryQueueRepository::default());
        let manager = RetryManager::new(repo.clone(), RetryConfig::default(), default_observer());
        (manager, repo)
    }

    async fn seed_item(repo: &InMemoryQueueRepository, max_retries: u32) -> QueueItemId {
        let id = QueueItemId::generate();
        let now = Utc::now();
        repo.create(QueueItem {
            id,
            delivery_id: DeliveryId::generate(),
            organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
            destination_id: DestinationId::generate(),
            priority: Priority::default(),
            status: QueueItemStatus::Processing,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            payload_snapshot: json!({"k": "v"}),
            metadata: QueueItemMetadata::default(),
            created_at: now,
            updated_at: now,
            processed_at: None,
        })
        .await
        .unwrap();
        id
    }

    fn retryable_error() -> AdapterError {
        AdapterError {
            class: ErrorClass::Retryable,
            message: "timeout".to_string(),
            retry_after: None,
        }
    }

    fn non_retryable_error() -> AdapterError {
        AdapterError {
            class: ErrorClass::NonRetryable,
            message: "unauthorized".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn success_completes_item() {
        let (manager, repo) = manager();
        let id = seed_item(&repo, 3).await;
        let item = manager.record_attempt(&id, true, None, None).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Completed);
    }

    #[tokio::test]
    async fn retryable_failure_schedules_retry() {
        let (manager, repo) = manager();
        let id = seed_item(&repo, 3).await;
        let err = retryable_error();
        let item = manager.record_attempt(&id, false, Some(&err), None).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.retry_count, 1);
        // First retry is attempt 0: base_delay * multiplier^0 == base_delay
        // (plus up to 10% jitter), not base_delay * multiplier^1.
        let delay = item.next_retry_at.unwrap() - item.updated_at;
        assert!(delay >= chrono::Duration::milliseconds(1000), "delay was {delay:?}");
        assert!(delay <= chrono::Duration::milliseconds(1100), "delay was {delay:?}");
    }

    #[tokio::test]
    async fn non_retryable_failure_marks_failed() {
        let (manager, repo) = manager();
        let id = seed_item(&repo, 3).await;
        let err = non_retryable_error();
        let item = manager.record_attempt(&id, false, Some(&err), None).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);
        assert!(item.metadata.non_retryable);
    }

    #[tokio::test]
    async fn exhausted_retries_marks_failed() {
        let (manager, repo) = manager();
        let id = seed_item(&repo, 1).await;
        let err = retryable_error();
        manager.record_attempt(&id, false, Some(&err), None).await.unwrap();
        let item = manager.record_attempt(&id, false, Some(&err), None).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);
    }

    #[tokio::test]
    async fn retry_statistics_keep_non_retryable_disjoint_from_failed() {
        let (manager, repo) = manager();

        let success_id = seed_item(&repo, 3).await;
        manager.record_attempt(&success_id, true, None, None).await.unwrap();

        let failed_id = seed_item(&repo, 0).await;
        let err = retryable_error();
        manager.record_attempt(&failed_id, false, Some(&err), None).await.unwrap();

        let non_retryable_id = seed_item(&repo, 3).await;
        let err = non_retryable_error();
        manager.record_attempt(&non_retryable_id, false, Some(&err), None).await.unwrap();

        let stats = manager.get_retry_statistics().await.unwrap();
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.failed_retries, 1);
        assert_eq!(stats.non_retryable_count, 1);
        assert_eq!(stats.total_retries, 0);
    }

    #[test]
    fn backoff_is_monotonic_without_jitter() {
        let config = RetryConfig {
            jitter_enabled: false,
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(
            Arc::new(InMemoryQueueRepository::default()),
            config,
            default_observer(),
        );
        let mut previous = Duration::ZERO;
        for attempt in 1..10 {
            let backoff = manager.calculate_backoff(attempt);
            assert!(backoff >= previous);
            previous = backoff;
        }
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let manager = RetryManager::new(
            Arc::new(InMemoryQueueRepository::default()),
            RetryConfig::default(),
            default_observer(),
        );
        for attempt in 1..40 {
            assert!(manager.calculate_backoff(attempt) <= manager.config.max_delay);
        }
    }

    proptest::proptest! {
        #[test]
        fn retry_bound_never_exceeds_max_retries_plus_one(max_retries in 0u32..5) {
            let item = QueueItem {
                id: QueueItemId::generate(),
                delivery_id: DeliveryId::generate(),
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                destination_id: DestinationId::generate(),
                priority: Priority::default(),
                status: QueueItemStatus::Processing,
                retry_count: max_retries,
                max_retries,
                next_retry_at: None,
                payload_snapshot: json!({}),
                metadata: QueueItemMetadata::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                processed_at: None,
            };
            let manager = RetryManager::new(
                Arc::new(InMemoryQueueRepository::default()),
                RetryConfig::default(),
                default_observer(),
            );
            let err = AdapterError {
                class: ErrorClass::Retryable,
                message: "x".to_string(),
                retry_after: None,
            };
            assert!(!manager.should_retry(&item, &err));
        }
    }
}
