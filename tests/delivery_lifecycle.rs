//! End-to-end delivery lifecycle tests against the in-memory repository
//! fakes: request a delivery, run the queue worker loop, and observe the
//! resulting log, circuit breaker, and alert state the way a real caller
//! would through the service layer rather than by poking storage directly.

use std::sync::Arc;

use deliverd::adapter::NullAdapter;
use deliverd::alert_access_control::AlertAccessControl;
use deliverd::alert_debouncer::AlertDebouncer;
use deliverd::alert_manager::AlertManager;
use deliverd::circuit_breaker::CircuitBreaker;
use deliverd::config::{
    AlertDebounceDefaults, CircuitBreakerConfig, DeliveryServiceConfig, QueueConfig, RetryConfig,
};
use deliverd::delivery_service::{DeliveryRequest, DeliveryService};
use deliverd::destination_manager::{CreateDestinationInput, DestinationManager};
use deliverd::domain::destination::{DestinationConfig, HttpMethod, WebhookConfig};
use deliverd::domain::{DeliveryStatus, DestinationDeliveryStatus, Payload};
use deliverd::domain_types::OrganizationId;
use deliverd::observability::default_observer;
use deliverd::queue_manager::QueueManager;
use deliverd::retry_manager::RetryManager;
use deliverd::storage::memory::{
    InMemoryAlertConfigRepository, InMemoryAlertRepository, InMemoryDeliveryLogRepository,
    InMemoryDestinationHealthRepository, InMemoryDestinationRepository, InMemoryMaintenanceWindowRepository,
    InMemoryQueueRepository,
};
use serde_json::json;

fn org() -> OrganizationId {
    OrganizationId::try_new("org-lifecycle".to_string()).unwrap()
}

fn webhook_config() -> DestinationConfig {
    DestinationConfig::Webhook(WebhookConfig {
        url: "https://example.test/hook".to_string(),
        method: HttpMethod::Post,
        headers: Default::default(),
        timeout: std::time::Duration::from_secs(5),
        retry_config: None,
    })
}

struct Harness {
    destination_manager: Arc<DestinationManager>,
    delivery_service: DeliveryService,
    queue_manager: Arc<QueueManager>,
    circuit_breaker: Arc<CircuitBreaker>,
    alert_manager: AlertManager,
}

fn harness(succeed: bool) -> Harness {
    let observer = default_observer();
    let health_repo = Arc::new(InMemoryDestinationHealthRepository::default());
    let queue_repo = Arc::new(InMemoryQueueRepository::default());
    let destination_repo = Arc::new(InMemoryDestinationRepository::default());
    let delivery_repo = Arc::new(InMemoryDeliveryLogRepository::default());

    let adapter = Arc::new(NullAdapter {
        succeed,
        failure_class: None,
    });

    let circuit_breaker = Arc::new(CircuitBreaker::new(
        health_repo.clone(),
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
        destination_repo.clone(),
        circuit_breaker.clone(),
        retry_manager,
        adapter.clone(),
        QueueConfig::default(),
        observer.clone(),
    ));
    let destination_manager = Arc::new(DestinationManager::new(destination_repo, adapter));
    let delivery_service = DeliveryService::new(
        delivery_repo,
        destination_manager.clone(),
        circuit_breaker.clone(),
        queue_manager.clone(),
        DeliveryServiceConfig::default(),
    );

    let debouncer = Arc::new(AlertDebouncer::new(
        Arc::new(InMemoryMaintenanceWindowRepository::default()),
        AlertDebounceDefaults::default(),
    ));
    let alert_manager = AlertManager::new(
        Arc::new(InMemoryAlertRepository::default()),
        Arc::new(InMemoryAlertConfigRepository::default()),
        health_repo,
        queue_manager.clone(),
        debouncer,
        Arc::new(AlertAccessControl::new()),
        observer,
    );

    Harness {
        destination_manager,
        delivery_service,
        queue_manager,
        circuit_breaker,
        alert_manager,
    }
}

#[tokio::test]
async fn successful_delivery_reaches_completed() {
    let h = harness(true);
    let destination = h
        .destination_manager
        .create(CreateDestinationInput {
            organization_id: org(),
            label: "primary webhook".to_string(),
            description: None,
            config: webhook_config(),
            is_default: true,
        })
        .await
        .unwrap();

    let response = h
        .delivery_service
        .deliver(DeliveryRequest {
            organization_id: org(),
            payload: Payload {
                kind: "event".to_string(),
                data: json!({"hello": "world"}),
                metadata: json!({}),
            },
            destinations: Some(vec![destination.id.clone()]),
            priority: None,
            max_retries: 3,
            correlation_id: None,
        })
        .await
        .unwrap();

    assert_eq!(response.status, DeliveryStatus::Queued);

    let processed = h.queue_manager.run_once().await.unwrap();
    assert_eq!(processed, 1);

    let items = h.queue_manager.list_all_for_delivery(&response.delivery_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].status.is_terminal());

    let metrics = h.circuit_breaker.get_metrics(&destination.id).await.unwrap();
    assert_eq!(metrics.total_deliveries, 1);
    assert_eq!(metrics.total_failures, 0);
}

#[tokio::test]
async fn repeated_failures_trip_breaker_and_raise_alert() {
    let h = harness(false);
    let destination = h
        .destination_manager
        .create(CreateDestinationInput {
            organization_id: org(),
            label: "flaky webhook".to_string(),
            description: None,
            config: webhook_config(),
            is_default: true,
        })
        .await
        .unwrap();

    for _ in 0..10 {
        let response = h
            .delivery_service
            .deliver(DeliveryRequest {
                organization_id: org(),
                payload: Payload {
                    kind: "event".to_string(),
                    data: json!({"n": 1}),
                    metadata: json!({}),
                },
                destinations: Some(vec![destination.id.clone()]),
                priority: None,
                max_retries: 0,
                correlation_id: None,
            })
            .await;

        // Once the breaker trips, `deliver` still succeeds: the destination
        // keeps resolving, but its queue item is marked `skipped` instead of
        // being enqueued.
        let Ok(response) = response else { continue };
        h.queue_manager.list_all_for_delivery(&response.delivery_id).await.unwrap();
        let _ = h.queue_manager.run_once().await.unwrap();
    }

    let state = h.circuit_breaker.get_state(&destination.id).await.unwrap();
    assert_eq!(state, deliverd::domain::CircuitBreakerState::Open);

    let alerts = h
        .alert_manager
        .check_failure_thresholds(&destination.id, &org())
        .await
        .unwrap();
    assert!(alerts.iter().any(|a| a.alert_type == deliverd::domain::AlertType::ConsecutiveFailures));
}

#[tokio::test]
async fn failure_threshold_check_is_a_noop_without_a_health_record() {
    let h = harness(false);
    let destination = h
        .destination_manager
        .create(CreateDestinationInput {
            organization_id: org(),
            label: "flaky webhook".to_string(),
            description: None,
            config: webhook_config(),
            is_default: true,
        })
        .await
        .unwrap();

    let created = h
        .alert_manager
        .check_failure_thresholds(&destination.id, &org())
        .await
        .unwrap();
    assert!(created.is_empty());
}
