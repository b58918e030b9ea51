//! Single-entry-point delivery orchestration: `Deliver`, `RetryDelivery`,
//! status reads, and metrics aggregation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::DeliveryServiceConfig;
use crate::destination_manager::DestinationManager;
use crate::domain::{
    aggregate_status, DeliveryDestinationState, DeliveryLog, DeliveryStatus, DestinationDeliveryStatus,
    Payload, QueueItemStatus,
};
use crate::domain_types::{CorrelationId, DeliveryId, DestinationId, IdempotencyKey, OrganizationId, Priority};
use crate::error::{OrchestratorError, Result};
use crate::queue_manager::QueueManager;
use crate::storage::{DeliveryListFilter, DeliveryLogRepository};

/// A caller's request to `Deliver`.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// The payload to fan out.
    pub payload: Payload,
    /// Explicit destination ids, or `None` to use the tenant's defaults.
    pub destinations: Option<Vec<DestinationId>>,
    /// Dequeue priority. `None` derives a default from `payload.kind`.
    pub priority: Option<Priority>,
    /// Maximum retries per destination.
    pub max_retries: u32,
    /// Caller-supplied correlation id.
    pub correlation_id: Option<CorrelationId>,
}

/// Response from `Deliver`: the created log plus the resolved overall
/// status.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// The delivery id assigned to this call.
    pub delivery_id: DeliveryId,
    /// Overall status immediately after enqueueing.
    pub status: DeliveryStatus,
    /// The full stored log.
    pub log: DeliveryLog,
}

/// Aggregated counters returned by `GetDeliveryMetrics`.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetrics {
    /// Total deliveries in the window.
    pub total: u64,
    /// Deliveries that reached `Completed`.
    pub successful: u64,
    /// Deliveries that reached `Failed`.
    pub failed: u64,
    /// `successful / total * 100`, `0.0` when `total == 0`.
    pub success_rate_pct: f64,
    /// Mean wall-clock time from `created_at` to `updated_at` across
    /// terminal deliveries.
    pub avg_delivery_time: std::time::Duration,
}

/// Orchestrates `DeliveryLog` creation, dispatch via the queue, and reads,
/// deriving overall/per-destination status from the underlying queue items
/// rather than maintaining a second source of truth.
pub struct DeliveryService {
    delivery_repo: Arc<dyn DeliveryLogRepository>,
    destination_manager: Arc<DestinationManager>,
    circuit_breaker: Arc<CircuitBreaker>,
    queue_manager: Arc<QueueManager>,
    config: DeliveryServiceConfig,
}

impl DeliveryService {
    /// Builds a delivery service over its collaborators.
    #[must_use]
    pub fn new(
        delivery_repo: Arc<dyn DeliveryLogRepository>,
        destination_manager: Arc<DestinationManager>,
        circuit_breaker: Arc<CircuitBreaker>,
        queue_manager: Arc<QueueManager>,
        config: DeliveryServiceConfig,
    ) -> Self {
        Self {
            delivery_repo,
            destination_manager,
            circuit_breaker,
            queue_manager,
            config,
        }
    }

    fn validate_request(&self, req: &DeliveryRequest) -> Result<()> {
        if req.payload.data.is_null() {
            return Err(OrchestratorError::Validation(
                "payload.data must not be null".to_string(),
            ));
        }
        let size = serde_json::to_vec(&req.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > self.config.max_payload_size {
            return Err(OrchestratorError::Validation(format!(
                "payload size {size} exceeds max_payload_size {}",
                self.config.max_payload_size
            )));
        }
        if let Some(destinations) = &req.destinations {
            if destinations.is_empty() {
                return Err(OrchestratorError::Validation(
                    "destinations must be non-empty when explicitly provided".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolves the requested destination ids against this tenant, silently
    /// excluding ids that are missing, belong to another tenant, or are
    /// disabled rather than failing the whole call — a per-destination
    /// resolution failure is contained the same way a per-destination
    /// delivery failure is (spec.md §7's "per-destination errors ...
    /// never fail sibling destinations"), and never distinguishes "missing"
    /// from "cross-tenant" to a caller scoped to another organization (§7's
    /// "never leaks cross-tenant existence"). If every requested id turns
    /// out unresolvable, `deliver` still creates a log with an empty
    /// destination set, which [`aggregate_status`] resolves to `Failed`.
    async fn resolve_destinations(&self, req: &DeliveryRequest) -> Result<Vec<DestinationId>> {
        match &req.destinations {
            Some(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(destination) = self.destination_manager.get(id).await? else {
                        continue;
                    };
                    if destination.organization_id != req.organization_id {
                        continue;
                    }
                    if !destination.is_deliverable() {
                        continue;
                    }
                    resolved.push(destination.id);
                }
                Ok(resolved)
            }
            None => {
                let defaults = self.destination_manager.get_defaults(&req.organization_id).await?;
                Ok(defaults.into_iter().map(|d| d.id).collect())
            }
        }
    }

    /// Validates, resolves destinations, creates the delivery log, and
    /// enqueues one queue item per destination whose circuit breaker is
    /// currently closed. A requested destination id that's missing,
    /// cross-tenant, or disabled is silently excluded rather than failing
    /// the call; if nothing resolves, the response still carries `failed`
    /// with an empty destination set (spec.md §8 scenario 2).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] on malformed input, or a
    /// storage error.
    pub async fn deliver(&self, req: DeliveryRequest) -> Result<DeliveryResponse> {
        self.validate_request(&req)?;
        let destination_ids = self.resolve_destinations(&req).await?;

        let now = Utc::now();
        let delivery_id = DeliveryId::generate();
        let mut enqueueable = Vec::new();
        let mut destinations = Vec::with_capacity(destination_ids.len());

        for destination_id in &destination_ids {
            if self.circuit_breaker.is_open(destination_id).await {
                destinations.push(DeliveryDestinationState {
                    destination_id: destination_id.clone(),
                    status: DestinationDeliveryStatus::Skipped,
                    attempts: 0,
                    last_error: Some("circuit breaker open".to_string()),
                    delivered_at: None,
                    cross_system_reference: None,
                });
            } else {
                enqueueable.push(destination_id.clone());
                destinations.push(DeliveryDestinationState {
                    destination_id: destination_id.clone(),
                    status: DestinationDeliveryStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    delivered_at: None,
                    cross_system_reference: None,
                });
            }
        }

        let priority = req
            .priority
            .unwrap_or_else(|| default_priority_for_kind(&req.payload.kind));

        let log = DeliveryLog {
            id: delivery_id.clone(),
            organization_id: req.organization_id.clone(),
            payload: req.payload.clone(),
            status: aggregate_status(&destinations),
            destinations,
            correlation_id: req.correlation_id,
            idempotency_key: IdempotencyKey::generate(),
            created_at: now,
            updated_at: now,
        };
        let log = self.delivery_repo.create(log).await?;

        if !enqueueable.is_empty() {
            self.queue_manager
                .schedule_delivery(
                    delivery_id.clone(),
                    req.organization_id,
                    enqueueable,
                    req.payload.data,
                    priority,
                    req.max_retries,
                )
                .await?;
        }

        for destination_id in &destination_ids {
            self.destination_manager.record_usage(destination_id).await?;
        }

        Ok(DeliveryResponse {
            delivery_id,
            status: log.status,
            log,
        })
    }

    fn derive_destination_state(
        previous: &DeliveryDestinationState,
        items: &[crate::domain::QueueItem],
    ) -> DeliveryDestinationState {
        let Some(item) = items
            .iter()
            .find(|i| i.destination_id == previous.destination_id)
        else {
            return previous.clone();
        };

        let status = match item.status {
            QueueItemStatus::Pending => DestinationDeliveryStatus::Pending,
            QueueItemStatus::Processing => DestinationDeliveryStatus::Processing,
            QueueItemStatus::Completed => DestinationDeliveryStatus::Delivered,
            QueueItemStatus::Failed if item.metadata.circuit_open_skip => {
                DestinationDeliveryStatus::Skipped
            }
            QueueItemStatus::Failed | QueueItemStatus::Cancelled => DestinationDeliveryStatus::Failed,
        };

        DeliveryDestinationState {
            destination_id: previous.destination_id.clone(),
            status,
            attempts: item.metadata.retry_attempts.len() as u32,
            last_error: item.metadata.retry_attempts.last().and_then(|a| a.error.clone()),
            delivered_at: (item.status == QueueItemStatus::Completed).then_some(item.processed_at).flatten(),
            cross_system_reference: previous.cross_system_reference.clone(),
        }
    }

    /// Reads `delivery_id`, reconciles its per-destination substates against
    /// the underlying queue items, persists the reconciliation, and returns
    /// the refreshed log.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] if the delivery doesn't exist,
    /// [`OrchestratorError::TenantMismatch`] if it belongs to another
    /// tenant, or a storage error.
    pub async fn get_delivery_status(
        &self,
        delivery_id: &DeliveryId,
        organization_id: &OrganizationId,
    ) -> Result<DeliveryLog> {
        let log = self.load(delivery_id, organization_id).await?;
        self.reconcile(log).await
    }

    async fn load(&self, delivery_id: &DeliveryId, organization_id: &OrganizationId) -> Result<DeliveryLog> {
        let log = self
            .delivery_repo
            .get(delivery_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("delivery {delivery_id}")))?;
        if &log.organization_id != organization_id {
            return Err(OrchestratorError::TenantMismatch(format!(
                "delivery {delivery_id} does not belong to this organization"
            )));
        }
        Ok(log)
    }

    async fn reconcile(&self, mut log: DeliveryLog) -> Result<DeliveryLog> {
        if log.status == DeliveryStatus::Cancelled {
            return Ok(log);
        }
        let items = self.queue_manager.list_all_for_delivery(&log.id).await?;
        if items.is_empty() {
            return Ok(log);
        }

        let destinations: Vec<_> = log
            .destinations
            .iter()
            .map(|state| Self::derive_destination_state(state, &items))
            .collect();
        let status = aggregate_status(&destinations);

        if destinations_changed(&log.destinations, &destinations) || status != log.status {
            log.destinations = destinations;
            log.status = status;
            log.updated_at = Utc::now();
            log = self.delivery_repo.update(log).await?;
        }

        Ok(log)
    }

    /// Lists deliveries for `organization_id`, applying `filter`.
    /// Tenant scoping is always enforced.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be read.
    pub async fn list_deliveries(
        &self,
        organization_id: &OrganizationId,
        filter: &DeliveryListFilter,
    ) -> Result<Vec<DeliveryLog>> {
        Ok(self.delivery_repo.list(organization_id, filter).await?)
    }

    /// Re-checks the currently-failed per-destination substates and
    /// reschedules them.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`]/[`OrchestratorError::TenantMismatch`]
    /// if the delivery can't be resolved for this tenant, or a storage error.
    pub async fn retry_delivery(
        &self,
        delivery_id: &DeliveryId,
        organization_id: &OrganizationId,
    ) -> Result<DeliveryLog> {
        let log = self.load(delivery_id, organization_id).await?;
        let log = self.reconcile(log).await?;

        let items = self.queue_manager.list_all_for_delivery(delivery_id).await?;
        let mut retried = 0;
        for item in items.iter().filter(|i| i.status == QueueItemStatus::Failed) {
            if item.metadata.non_retryable || item.metadata.circuit_open_skip {
                continue;
            }
            self.queue_manager.reschedule_item(&item.id).await?;
            retried += 1;
        }

        if retried == 0 {
            return Ok(log);
        }
        self.reconcile(log).await
    }

    /// Cancels every non-terminal queue item for a delivery and marks the
    /// log `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`]/[`OrchestratorError::TenantMismatch`]
    /// if the delivery can't be resolved for this tenant, or a storage error.
    pub async fn cancel_delivery(
        &self,
        delivery_id: &DeliveryId,
        organization_id: &OrganizationId,
    ) -> Result<DeliveryLog> {
        let mut log = self.load(delivery_id, organization_id).await?;
        self.queue_manager.cancel_delivery(delivery_id).await?;
        log.status = DeliveryStatus::Cancelled;
        log.updated_at = Utc::now();
        Ok(self.delivery_repo.update(log).await?)
    }

    /// Aggregates counters over the deliveries a filter selects
    ///.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be read.
    pub async fn get_delivery_metrics(
        &self,
        organization_id: &OrganizationId,
        filter: &DeliveryListFilter,
    ) -> Result<DeliveryMetrics> {
        let logs = self.delivery_repo.list(organization_id, filter).await?;
        let total = logs.len() as u64;
        let successful = logs.iter().filter(|l| l.status == DeliveryStatus::Completed).count() as u64;
        let failed = logs.iter().filter(|l| l.status == DeliveryStatus::Failed).count() as u64;

        let terminal: Vec<_> = logs
            .iter()
            .filter(|l| {
                matches!(
                    l.status,
                    DeliveryStatus::Completed
                        | DeliveryStatus::Failed
                        | DeliveryStatus::Partial
                        | DeliveryStatus::Cancelled
                )
            })
            .collect();
        let avg_delivery_time = if terminal.is_empty() {
            std::time::Duration::ZERO
        } else {
            let total_nanos: i64 = terminal
                .iter()
                .map(|l| (l.updated_at - l.created_at).num_nanoseconds().unwrap_or(0))
                .sum();
            std::time::Duration::from_nanos((total_nanos / terminal.len() as i64).max(0) as u64)
        };

        Ok(DeliveryMetrics {
            total,
            successful,
            failed,
            success_rate_pct: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64 * 100.0
            },
            avg_delivery_time,
        })
    }
}

fn destinations_changed(before: &[DeliveryDestinationState], after: &[DeliveryDestinationState]) -> bool {
    if before.len() != after.len() {
        return true;
    }
    before.iter().zip(after.iter()).any(|(a, b)| {
        a.status != b.status || a.attempts != b.attempts || a.last_error != b.last_error
    })
}

/// Default priority assignment from a payload's `kind` tag.
/// Unknown kinds fall back to the `write` default.
fn default_priority_for_kind(kind: &str) -> Priority {
    let request_kind = match kind {
        "health_check" => crate::queue_manager::RequestKind::HealthCheck,
        "report" | "event" => crate::queue_manager::RequestKind::Report,
        "read" => crate::queue_manager::RequestKind::Read,
        _ => crate::queue_manager::RequestKind::Write,
    };
    request_kind.default_priority()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullAdapter;
    use crate::config::{CircuitBreakerConfig, QueueConfig, RetryConfig};
    use crate::destination_manager::CreateDestinationInput;
    use crate::domain::{DestinationConfig, HttpMethod, WebhookConfig};
    use crate::observability::default_observer;
    use crate::retry_manager::RetryManager;
    use crate::storage::memory::{
        InMemoryDeliveryLogRepository, InMemoryDestinationHealthRepository, InMemoryDestinationRepository,
        InMemoryQueueRepository,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn service_with(
        succeed: bool,
    ) -> (DeliveryService, Arc<DestinationManager>, OrganizationId, DestinationId) {
        let destination_repo = Arc::new(InMemoryDestinationRepository::default());
        let health_repo = Arc::new(InMemoryDestinationHealthRepository::default());
        let queue_repo = Arc::new(InMemoryQueueRepository::default());
        let delivery_repo = Arc::new(InMemoryDeliveryLogRepository::default());
        let observer = default_observer();
        let adapter: Arc<dyn crate::adapter::TransportAdapter> = Arc::new(NullAdapter {
            succeed,
            failure_class: None,
        });

        let destination_manager = Arc::new(DestinationManager::new(destination_repo.clone(), adapter.clone()));
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
        let queue_manager = Arc::new(QueueManager::new(
            queue_repo,
            destination_repo,
            circuit_breaker.clone(),
            retry_manager,
            adapter,
            QueueConfig::default(),
            observer,
        ));

        let organization_id = OrganizationId::try_new("org1".to_string()).unwrap();
        let destination = destination_manager
            .create(CreateDestinationInput {
                organization_id: organization_id.clone(),
                label: "primary".to_string(),
                description: None,
                config: DestinationConfig::Webhook(WebhookConfig {
                    url: "https://example.invalid/hook".to_string(),
                    method: HttpMethod::Post,
                    headers: BTreeMap::new(),
                    timeout: Duration::from_secs(30),
                    retry_config: None,
                }),
                is_default: true,
            })
            .await
            .unwrap();

        let service = DeliveryService::new(
            delivery_repo,
            destination_manager.clone(),
            circuit_breaker,
            queue_manager,
            DeliveryServiceConfig::default(),
        );
        (service, destination_manager, organization_id, destination.id)
    }

    fn payload() -> Payload {
        Payload {
            kind: "write".to_string(),
            data: serde_json::json!({"hello": "world"}),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn deliver_rejects_null_payload() {
        let (service, _dm, organization_id, destination_id) = service_with(true).await;
        let req = DeliveryRequest {
            organization_id,
            payload: Payload {
                kind: "write".to_string(),
                data: Value::Null,
                metadata: Value::Null,
            },
            destinations: Some(vec![destination_id]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        };
        let result = service.deliver(req).await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn deliver_queues_against_resolved_destination() {
        let (service, _dm, organization_id, destination_id) = service_with(true).await;
        let req = DeliveryRequest {
            organization_id: organization_id.clone(),
            payload: payload(),
            destinations: Some(vec![destination_id]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        };
        let response = service.deliver(req).await.unwrap();
        assert_eq!(response.status, DeliveryStatus::Queued);
        assert_eq!(response.log.destinations.len(), 1);
    }

    #[tokio::test]
    async fn deliver_excludes_cross_tenant_destination_and_fails() {
        // spec.md §8 scenario 2: a cross-tenant destination id never fails
        // the call outright; it's silently excluded from resolution, and
        // an empty resolved set aggregates to `failed` with no substates.
        let (service, dm, _organization_id, destination_id) = service_with(true).await;
        let other_org = OrganizationId::try_new("org2".to_string()).unwrap();
        let req = DeliveryRequest {
            organization_id: other_org,
            payload: payload(),
            destinations: Some(vec![destination_id.clone()]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        };
        let response = service.deliver(req).await.unwrap();
        assert_eq!(response.status, DeliveryStatus::Failed);
        assert!(response.log.destinations.is_empty());

        let destination = dm.get(&destination_id).await.unwrap().unwrap();
        assert_eq!(destination.count_usage, 0);
    }

    #[tokio::test]
    async fn status_reflects_completed_queue_item() {
        let (service, _dm, organization_id, destination_id) = service_with(true).await;
        let req = DeliveryRequest {
            organization_id: organization_id.clone(),
            payload: payload(),
            destinations: Some(vec![destination_id]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        };
        let response = service.deliver(req).await.unwrap();
        service.queue_manager.run_once().await.unwrap();

        let log = service
            .get_delivery_status(&response.delivery_id, &organization_id)
            .await
            .unwrap();
        assert_eq!(log.status, DeliveryStatus::Completed);
    }

    #[tokio::test]
    async fn get_delivery_status_rejects_other_tenant() {
        let (service, _dm, organization_id, destination_id) = service_with(true).await;
        let req = DeliveryRequest {
            organization_id: organization_id.clone(),
            payload: payload(),
            destinations: Some(vec![destination_id]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        };
        let response = service.deliver(req).await.unwrap();
        let other_org = OrganizationId::try_new("org2".to_string()).unwrap();
        let result = service.get_delivery_status(&response.delivery_id, &other_org).await;
        assert!(matches!(result, Err(OrchestratorError::TenantMismatch(_))));
    }
}
