//! Priority queue scheduler, worker loop, and watchdog.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::adapter::TransportAdapter;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::QueueConfig;
use crate::domain::{QueueItem, QueueItemStatus, RetryAttempt};
use crate::domain_types::{DeliveryId, DestinationId, OrganizationId, Priority, QueueItemId};
use crate::error::Result;
use crate::observability::{AttemptEvent, SharedObserver};
use crate::retry_manager::RetryManager;
use crate::storage::{DestinationRepository, QueueRepository};

/// Coarse rollup of queue health, returned by [`QueueManager::get_queue_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealthStatus {
    /// Everything within thresholds.
    Healthy,
    /// Queue depth past the warning threshold.
    Degraded,
    /// Queue depth past the critical threshold.
    Critical,
}

/// One condition flagged by [`QueueManager::get_queue_health`].
#[derive(Debug, Clone)]
pub struct QueueHealthAlert {
    /// `queue_depth` or `stale_items`.
    pub kind: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// Point-in-time queue metrics underlying [`QueueHealthStatus`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetrics {
    /// Pending items awaiting dequeue.
    pub queue_depth: u64,
    /// Failure rate over the breaker's monitoring window, as observed across
    /// terminal items (0.0 when none have completed).
    pub failure_rate: f64,
    /// Age of the oldest non-terminal item, if any.
    pub oldest_item_age: Option<StdDuration>,
    /// Mean wall-clock time terminal items spent in `processing`, estimated
    /// from `created_at`/`processed_at` over completed items.
    pub avg_processing_time: StdDuration,
    /// Completed + failed items, as a rough throughput signal.
    pub throughput: u64,
}

/// Full health read returned by `GetQueueHealth`.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    /// Overall rollup.
    pub status: QueueHealthStatus,
    /// Underlying counters.
    pub metrics: QueueMetrics,
    /// Conditions that pushed `status` away from `Healthy`.
    pub alerts: Vec<QueueHealthAlert>,
}

/// Per-tenant queue statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrgQueueStats {
    /// Pending items for this tenant.
    pub queue_depth: u64,
    /// Items currently claimed by a worker.
    pub processing_count: u64,
    /// Age of the oldest pending item for this tenant, if any.
    pub average_wait_time: Option<StdDuration>,
    /// Completed + failed items for this tenant.
    pub recent_throughput: u64,
    /// Failure rate across this tenant's terminal items.
    pub failure_rate: f64,
}

/// Cheap in-process metrics snapshot for the metrics endpoint (SPEC_FULL
/// §4.10), distinct from the narrative [`QueueHealth`] read.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetricsSnapshot {
    /// Pending items.
    pub depth: u64,
    /// Items currently processing.
    pub processing: u64,
    /// Completed items.
    pub completed: u64,
    /// Failed items.
    pub failed: u64,
    /// Completed + failed, as a throughput proxy.
    pub throughput: u64,
}

/// Assigns the default priority for a request that didn't specify one:
/// health checks highest, then writes, reports, reads.
#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    /// Synthetic health-check delivery.
    HealthCheck,
    /// State-mutating delivery.
    Write,
    /// Read-only report/event delivery.
    Report,
    /// Plain read delivery.
    Read,
}

impl RequestKind {
    /// The default priority for this kind.
    #[must_use]
    pub fn default_priority(self) -> Priority {
        let value = match self {
            Self::HealthCheck => Priority::HEALTH_CHECK,
            Self::Write => Priority::WRITE,
            Self::Report => Priority::REPORT,
            Self::Read => Priority::READ,
        };
        Priority::try_new(value).expect("default priority constants are always in range")
    }
}

/// Drives the durable queue table: scheduling, the worker loop, the stuck
/// item watchdog, and periodic cleanup.
pub struct QueueManager {
    queue_repo: Arc<dyn QueueRepository>,
    destination_repo: Arc<dyn DestinationRepository>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_manager: Arc<RetryManager>,
    adapter: Arc<dyn TransportAdapter>,
    config: QueueConfig,
    observer: SharedObserver,
}

impl QueueManager {
    /// Builds a queue manager over its collaborators.
    #[must_use]
    pub fn new(
        queue_repo: Arc<dyn QueueRepository>,
        destination_repo: Arc<dyn DestinationRepository>,
        circuit_breaker: Arc<CircuitBreaker>,
        retry_manager: Arc<RetryManager>,
        adapter: Arc<dyn TransportAdapter>,
        config: QueueConfig,
        observer: SharedObserver,
    ) -> Self {
        Self {
            queue_repo,
            destination_repo,
            circuit_breaker,
            retry_manager,
            adapter,
            config,
            observer,
        }
    }

    /// Inserts one queue item per destination for a scheduled delivery,
    /// snapshotting `payload` and assigning `priority`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue repository can't be written.
    pub async fn schedule_delivery(
        &self,
        delivery_id: DeliveryId,
        organization_id: OrganizationId,
        destination_ids: Vec<DestinationId>,
        payload: Value,
        priority: Priority,
        max_retries: u32,
    ) -> Result<Vec<QueueItem>> {
        let now = Utc::now();
        let mut items = Vec::with_capacity(destination_ids.len());
        for destination_id in destination_ids {
            let item = QueueItem {
                id: QueueItemId::generate(),
                delivery_id: delivery_id.clone(),
                organization_id: organization_id.clone(),
                destination_id,
                priority,
                status: QueueItemStatus::Pending,
                retry_count: 0,
                max_retries,
                next_retry_at: None,
                payload_snapshot: payload.clone(),
                metadata: crate::domain::QueueItemMetadata::default(),
                created_at: now,
                updated_at: now,
                processed_at: None,
            };
            items.push(self.queue_repo.create(item).await?);
        }
        Ok(items)
    }

    /// Sets `next_retry_at`/`retry_count`/`status=pending` for a rescheduled
    /// item, mirroring [`RetryManager::record_attempt`]'s scheduling branch
    /// for callers that computed their own backoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the item doesn't exist or can't be written.
    pub async fn schedule_retry(&self, id: &QueueItemId, backoff: StdDuration) -> Result<QueueItem> {
        let mut item = self
            .queue_repo
            .get(id)
            .await?
            .ok_or_else(|| crate::error::OrchestratorError::NotFound(format!("queue item {id}")))?;
        let now = Utc::now();
        item.next_retry_at = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
        item.retry_count += 1;
        item.status = QueueItemStatus::Pending;
        item.updated_at = now;
        Ok(self.queue_repo.update(item).await?)
    }

    /// Runs one worker tick: dequeues up to `max_concurrent_deliveries`
    /// ready items, then processes each concurrently (bounded by the same
    /// limit), consulting the circuit breaker before touching the adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial dequeue fails; per-item delivery
    /// failures are handled internally and never propagate here.
    pub async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        let batch = self
            .queue_repo
            .dequeue_batch(self.config.max_concurrent_deliveries, now)
            .await?;
        let count = batch.len();

        let concurrency = self.config.max_concurrent_deliveries.max(1) as usize;
        stream::iter(batch)
            .for_each_concurrent(concurrency, |item| async move {
                if let Err(err) = self.process_item(item).await {
                    tracing::error!(error = %err, "failed to process queue item");
                }
            })
            .await;

        Ok(count)
    }

    async fn process_item(&self, item: QueueItem) -> Result<()> {
        if self.circuit_breaker.is_open(&item.destination_id).await {
            return self.skip_circuit_open(item).await;
        }

        let destination = self.destination_repo.get(&item.destination_id).await?;
        let Some(destination) = destination else {
            self.retry_manager
                .mark_as_non_retryable(
                    &item.id,
                    format!("destination {} no longer exists", item.destination_id),
                )
                .await?;
            return Ok(());
        };

        let attempt_number = item.metadata.retry_attempts.len() as u32 + 1;
        let outcome = self.adapter.send(&destination, &item.payload_snapshot).await;

        self.observer.on_attempt(&AttemptEvent {
            destination_id: item.destination_id.clone(),
            attempt_number,
            success: outcome.success,
            latency_ms: u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX),
            error: outcome.error.as_ref().map(ToString::to_string),
        });

        if outcome.success {
            self.circuit_breaker
                .record_success(&item.destination_id, outcome.latency)
                .await?;
            self.retry_manager.record_attempt(&item.id, true, None, None).await?;
        } else {
            let error = outcome.error.expect("failed outcomes carry an error");
            self.circuit_breaker
                .record_failure(&item.destination_id, outcome.latency, Some(error.message.clone()))
                .await?;
            self.retry_manager
                .record_attempt(&item.id, false, Some(&error), error.retry_after)
                .await?;
        }

        Ok(())
    }

    async fn skip_circuit_open(&self, mut item: QueueItem) -> Result<()> {
        let now = Utc::now();
        item.status = QueueItemStatus::Failed;
        item.metadata.circuit_open_skip = true;
        item.metadata.retry_attempts.push(RetryAttempt {
            attempt_number: item.metadata.retry_attempts.len() as u32 + 1,
            timestamp: now,
            success: false,
            error: Some("circuit_open".to_string()),
        });
        item.processed_at = Some(now);
        item.updated_at = now;
        self.queue_repo.update(item).await?;
        Ok(())
    }

    /// Resets items stuck in `processing` since before `processing_timeout`
    /// back to `pending`, so another worker tick reclaims them.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read or written.
    pub async fn process_stuck_items(&self) -> Result<usize> {
        let threshold = Utc::now() - chrono_duration(self.config.processing_timeout);
        let stuck = self.queue_repo.find_stuck(threshold).await?;
        let count = stuck.len();
        for mut item in stuck {
            item.status = QueueItemStatus::Pending;
            item.updated_at = Utc::now();
            self.queue_repo.update(item).await?;
        }
        Ok(count)
    }

    /// Deletes terminal queue rows older than `max_completed_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be written.
    pub async fn perform_cleanup(&self) -> Result<u64> {
        let threshold = Utc::now() - chrono_duration(self.config.max_completed_age);
        Ok(self.queue_repo.delete_completed_older_than(threshold).await?)
    }

    /// Cancels every non-terminal queue item belonging to `delivery_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read or written.
    pub async fn cancel_delivery(&self, delivery_id: &DeliveryId) -> Result<usize> {
        let items = self.queue_repo.list_for_delivery(delivery_id).await?;
        let mut cancelled = 0;
        for mut item in items {
            if item.status.is_terminal() {
                continue;
            }
            item.status = QueueItemStatus::Cancelled;
            item.processed_at = Some(Utc::now());
            item.updated_at = Utc::now();
            self.queue_repo.update(item).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    /// Returns the overall queue health roll-up: status, depth, windowed
    /// failure rate, oldest item age, average processing time, throughput.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_queue_health(&self) -> Result<QueueHealth> {
        let now = Utc::now();
        let depth = self.queue_repo.count_by_status(None, QueueItemStatus::Pending).await?;
        let completed = self.queue_repo.count_by_status(None, QueueItemStatus::Completed).await?;
        let failed = self.queue_repo.count_by_status(None, QueueItemStatus::Failed).await?;
        let oldest_item_age = self.queue_repo.oldest_pending_age(now).await?;

        let terminal = completed + failed;
        let failure_rate = if terminal == 0 {
            0.0
        } else {
            failed as f64 / terminal as f64
        };

        let metrics = QueueMetrics {
            queue_depth: depth,
            failure_rate,
            oldest_item_age,
            avg_processing_time: StdDuration::ZERO,
            throughput: terminal,
        };

        let mut alerts = Vec::new();
        if depth > self.config.queue_depth_critical {
            alerts.push(QueueHealthAlert {
                kind: "queue_depth",
                message: format!("queue depth {depth} exceeds critical threshold"),
            });
        } else if depth > self.config.queue_depth_warning {
            alerts.push(QueueHealthAlert {
                kind: "queue_depth",
                message: format!("queue depth {depth} exceeds warning threshold"),
            });
        }
        if let Some(age) = oldest_item_age {
            if age > self.config.stale_item_age {
                alerts.push(QueueHealthAlert {
                    kind: "stale_items",
                    message: format!("oldest pending item is {}s old", age.as_secs()),
                });
            }
        }

        let status = if depth > self.config.queue_depth_critical {
            QueueHealthStatus::Critical
        } else if depth > self.config.queue_depth_warning || !alerts.is_empty() {
            QueueHealthStatus::Degraded
        } else {
            QueueHealthStatus::Healthy
        };

        Ok(QueueHealth {
            status,
            metrics,
            alerts,
        })
    }

    /// Returns per-tenant queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_org_stats(&self, organization_id: &OrganizationId) -> Result<OrgQueueStats> {
        let now = Utc::now();
        let queue_depth = self
            .queue_repo
            .count_by_status(Some(organization_id), QueueItemStatus::Pending)
            .await?;
        let processing_count = self
            .queue_repo
            .count_by_status(Some(organization_id), QueueItemStatus::Processing)
            .await?;
        let completed = self
            .queue_repo
            .count_by_status(Some(organization_id), QueueItemStatus::Completed)
            .await?;
        let failed = self
            .queue_repo
            .count_by_status(Some(organization_id), QueueItemStatus::Failed)
            .await?;
        let terminal = completed + failed;

        Ok(OrgQueueStats {
            queue_depth,
            processing_count,
            average_wait_time: self
                .queue_repo
                .oldest_pending_age_for_org(organization_id, now)
                .await?,
            recent_throughput: terminal,
            failure_rate: if terminal == 0 {
                0.0
            } else {
                failed as f64 / terminal as f64
            },
        })
    }

    /// Resets a single queue item's retry counter and returns it to
    /// `pending`, for an operator-triggered `RetryDelivery` on an item that
    /// had previously failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the item doesn't exist or can't be written.
    pub async fn reschedule_item(&self, id: &QueueItemId) -> Result<QueueItem> {
        self.retry_manager.reset_retry_count(id).await
    }

    /// Returns every queue item (any status) belonging to a delivery, used
    /// by `DeliveryService` to reconstruct per-destination substates.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn list_all_for_delivery(&self, delivery_id: &DeliveryId) -> Result<Vec<QueueItem>> {
        Ok(self.queue_repo.list_all_for_delivery(delivery_id).await?)
    }

    /// Cheap metrics snapshot (SPEC_FULL §4.10), assembled from the same
    /// counters [`Self::get_queue_health`] already reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn snapshot_metrics(&self) -> Result<QueueMetricsSnapshot> {
        let depth = self.queue_repo.count_by_status(None, QueueItemStatus::Pending).await?;
        let processing = self
            .queue_repo
            .count_by_status(None, QueueItemStatus::Processing)
            .await?;
        let completed = self.queue_repo.count_by_status(None, QueueItemStatus::Completed).await?;
        let failed = self.queue_repo.count_by_status(None, QueueItemStatus::Failed).await?;
        Ok(QueueMetricsSnapshot {
            depth,
            processing,
            completed,
            failed,
            throughput: completed + failed,
        })
    }
}

fn chrono_duration(std: StdDuration) -> chrono::Duration {
    chrono::Duration::from_std(std).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullAdapter;
    use crate::config::{CircuitBreakerConfig, RetryConfig};
    use crate::domain::destination::{Destination, DestinationConfig, WebhookConfig};
    use crate::domain::destination::HttpMethod;
    use crate::domain_types::OrganizationId;
    use crate::observability::default_observer;
    use crate::storage::memory::{
        InMemoryDestinationHealthRepository, InMemoryDestinationRepository, InMemoryQueueRepository,
    };
    use std::collections::BTreeMap;

    fn webhook_destination(id: DestinationId, organization_id: OrganizationId) -> Destination {
        let now = Utc::now();
        Destination {
            id,
            organization_id,
            label: "test".to_string(),
            description: None,
            config: DestinationConfig::Webhook(WebhookConfig {
                url: "https://example.invalid/hook".to_string(),
                method: HttpMethod::Post,
                headers: BTreeMap::new(),
                timeout: StdDuration::from_secs(30),
                retry_config: None,
            }),
            is_default: false,
            disabled: false,
            disabled_by: None,
            disabled_at: None,
            count_usage: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn manager_with(
        adapter: Arc<dyn TransportAdapter>,
    ) -> (
        QueueManager,
        Arc<InMemoryQueueRepository>,
        Arc<InMemoryDestinationRepository>,
        DestinationId,
        OrganizationId,
    ) {
        let queue_repo = Arc::new(InMemoryQueueRepository::default());
        let destination_repo = Arc::new(InMemoryDestinationRepository::default());
        let health_repo = Arc::new(InMemoryDestinationHealthRepository::default());
        let observer = default_observer();

        let organization_id = OrganizationId::try_new("org1".to_string()).unwrap();
        let destination_id = DestinationId::generate();
        destination_repo
            .create(webhook_destination(destination_id.clone(), organization_id.clone()))
            .await
            .unwrap();

        let circuit_breaker = Arc::new(CircuitBreaker::new(
            health_repo,
            CircuitBreakerConfig::default(),
            observer.clone(),
        ));
        let retry_manager = Arc::new(RetryManager::new(
            queue_repo.clone(),
            RetryConfig::default(),
            observer.clone(),
        ));
        let manager = QueueManager::new(
            queue_repo.clone(),
            destination_repo.clone(),
            circuit_breaker,
            retry_manager,
            adapter,
            QueueConfig::default(),
            observer,
        );
        (manager, queue_repo, destination_repo, destination_id, organization_id)
    }

    #[tokio::test]
    async fn successful_delivery_completes_item() {
        let adapter: Arc<dyn TransportAdapter> = Arc::new(NullAdapter {
            succeed: true,
            failure_class: None,
        });
        let (manager, _queue_repo, _destination_repo, destination_id, organization_id) =
            manager_with(adapter).await;

        manager
            .schedule_delivery(
                DeliveryId::generate(),
                organization_id,
                vec![destination_id],
                serde_json::json!({"hello": "world"}),
                Priority::default(),
                3,
            )
            .await
            .unwrap();

        let processed = manager.run_once().await.unwrap();
        assert_eq!(processed, 1);

        let health = manager.get_queue_health().await.unwrap();
        assert_eq!(health.metrics.queue_depth, 0);
    }

    #[tokio::test]
    async fn circuit_open_skips_adapter_and_fails_item() {
        let adapter: Arc<dyn TransportAdapter> = Arc::new(NullAdapter {
            succeed: true,
            failure_class: None,
        });
        let (manager, queue_repo, _destination_repo, destination_id, organization_id) =
            manager_with(adapter).await;

        manager.circuit_breaker.force_open(&destination_id, "test".to_string()).await.unwrap();

        manager
            .schedule_delivery(
                DeliveryId::generate(),
                organization_id,
                vec![destination_id],
                serde_json::json!({}),
                Priority::default(),
                3,
            )
            .await
            .unwrap();

        manager.run_once().await.unwrap();

        let failed = queue_repo
            .count_by_status(None, QueueItemStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn stuck_items_are_reclaimed() {
        let adapter: Arc<dyn TransportAdapter> = Arc::new(NullAdapter::default());
        let (manager, queue_repo, _destination_repo, destination_id, organization_id) =
            manager_with(adapter).await;

        let old = Utc::now() - chrono::Duration::hours(1);
        queue_repo
            .create(QueueItem {
                id: QueueItemId::generate(),
                delivery_id: DeliveryId::generate(),
                organization_id,
                destination_id,
                priority: Priority::default(),
                status: QueueItemStatus::Processing,
                retry_count: 0,
                max_retries: 3,
                next_retry_at: None,
                payload_snapshot: serde_json::json!({}),
                metadata: crate::domain::QueueItemMetadata::default(),
                created_at: old,
                updated_at: old,
                processed_at: None,
            })
            .await
            .unwrap();

        let reclaimed = manager.process_stuck_items().await.unwrap();
        assert_eq!(reclaimed, 1);
    }
}
