//! Explicit observability sink.
//!
//! Every component holds a narrow `Arc<dyn DeliveryObserver>` trait object
//! rather than calling a logger directly, emitting structured events the
//! caller can render however it likes. The default implementation renders
//! them as `tracing` events.

use std::sync::Arc;

use crate::domain::CircuitBreakerState;
use crate::domain_types::{AlertId, DestinationId};

/// One delivery attempt against one destination.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    /// Destination the attempt targeted.
    pub destination_id: DestinationId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Observed latency, in milliseconds.
    pub latency_ms: u64,
    /// Error message, when `success` is `false`.
    pub error: Option<String>,
}

/// A retry was scheduled for a queue item.
#[derive(Debug, Clone)]
pub struct RetryScheduledEvent {
    /// Destination the retry targets.
    pub destination_id: DestinationId,
    /// The retry count after this scheduling.
    pub retry_count: u32,
    /// Computed backoff, in milliseconds.
    pub backoff_ms: u64,
}

/// A circuit breaker transitioned state.
#[derive(Debug, Clone)]
pub struct BreakerTransitionEvent {
    /// Destination whose breaker transitioned.
    pub destination_id: DestinationId,
    /// State before the transition.
    pub from: CircuitBreakerState,
    /// State after the transition.
    pub to: CircuitBreakerState,
    /// Human-readable reason, when one was supplied (e.g. operator override).
    pub reason: Option<String>,
}

/// An alert was created.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    /// The created alert's id.
    pub alert_id: AlertId,
    /// The alert's type tag (`"consecutive_failures"`, `"queue_backlog"`, ...).
    pub alert_type: &'static str,
    /// The alert's severity tag.
    pub severity: &'static str,
}

/// Structured hooks every core component emits through, in place of
/// decorator-based logging. External collaborators decide how (or whether)
/// to render these; the core never formats log lines itself beyond the
/// default [`TracingObserver`].
pub trait DeliveryObserver: Send + Sync {
    /// Called once per delivery attempt against a destination.
    fn on_attempt(&self, event: &AttemptEvent) {
        let _ = event;
    }

    /// Called whenever a queue item is rescheduled for retry.
    fn on_retry_scheduled(&self, event: &RetryScheduledEvent) {
        let _ = event;
    }

    /// Called whenever a destination's circuit breaker changes state.
    fn on_breaker_transition(&self, event: &BreakerTransitionEvent) {
        let _ = event;
    }

    /// Called whenever an alert is created.
    fn on_alert(&self, event: &AlertEvent) {
        let _ = event;
    }
}

/// Default observer: renders every hook as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_attempt(&self, event: &AttemptEvent) {
        if event.success {
            tracing::info!(
                destination_id = %event.destination_id,
                attempt_number = event.attempt_number,
                latency_ms = event.latency_ms,
                "delivery attempt succeeded"
            );
        } else {
            tracing::warn!(
                destination_id = %event.destination_id,
                attempt_number = event.attempt_number,
                latency_ms = event.latency_ms,
                error = event.error.as_deref().unwrap_or("unknown"),
                "delivery attempt failed"
            );
        }
    }

    fn on_retry_scheduled(&self, event: &RetryScheduledEvent) {
        tracing::info!(
            destination_id = %event.destination_id,
            retry_count = event.retry_count,
            backoff_ms = event.backoff_ms,
            "retry scheduled"
        );
    }

    fn on_breaker_transition(&self, event: &BreakerTransitionEvent) {
        tracing::warn!(
            destination_id = %event.destination_id,
            from = ?event.from,
            to = ?event.to,
            reason = event.reason.as_deref().unwrap_or(""),
            "circuit breaker transitioned"
        );
    }

    fn on_alert(&self, event: &AlertEvent) {
        tracing::warn!(
            alert_id = %event.alert_id,
            alert_type = event.alert_type,
            severity = event.severity,
            "alert created"
        );
    }
}

/// Shared handle type every component stores, so swapping the observer
/// implementation doesn't ripple through constructor signatures.
pub type SharedObserver = Arc<dyn DeliveryObserver>;

/// Builds the default tracing-backed observer as a [`SharedObserver`].
#[must_use]
pub fn default_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}
