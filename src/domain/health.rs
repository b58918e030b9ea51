//! Per-destination health and circuit-breaker state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::DestinationId;

/// Circuit breaker state machine states. Wire-stable; do not reorder or rename variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitBreakerState {
    /// Normal operation; requests pass through.
    Closed,
    /// Recovering; a bounded number of trial requests are permitted.
    HalfOpen,
    /// Tripped; requests are short-circuited without reaching the adapter.
    Open,
}

/// Health counters and breaker state for one destination, keyed by
/// `destination_id`.
///
/// Invariants: `state == Open` implies `circuit_breaker_opened_at`
/// is set; `half_open_successes` resets on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationHealth {
    /// The destination this record tracks.
    pub destination_id: DestinationId,
    /// Current circuit breaker state.
    pub circuit_breaker_state: CircuitBreakerState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Total delivery attempts ever made to this destination.
    pub total_deliveries: u64,
    /// Total failed attempts ever made to this destination.
    pub total_failures: u64,
    /// Timestamp of the most recent success, if any.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent failure, if any.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker most recently transitioned to `Open`.
    pub circuit_breaker_opened_at: Option<DateTime<Utc>>,
    /// Successes observed while `HalfOpen`, reset on every transition.
    pub half_open_successes: u32,
    /// Trial requests currently outstanding while `HalfOpen`, reset on
    /// every transition. Bounds concurrent probes to `success_threshold`.
    #[serde(default)]
    pub half_open_probes_in_flight: u32,
    /// Free-form metadata (`open_reason`, etc.), opaque beyond the breaker's
    /// own reads/writes.
    #[serde(default)]
    pub metadata: Value,
    /// Exponential moving average of observed delivery latency, in
    /// milliseconds, used as the `response_time` alert's input signal.
    #[serde(default)]
    pub avg_response_time_ms: f64,
    /// Number of latency samples folded into `avg_response_time_ms`.
    #[serde(default)]
    pub response_time_samples: u64,
    /// Last time this record was read or written.
    pub last_check_at: DateTime<Utc>,
}

/// Weight given to each new latency sample in the EMA; lower values smooth
/// out single slow/fast attempts, higher values track recent behavior more
/// closely.
const RESPONSE_TIME_EMA_ALPHA: f64 = 0.2;

impl DestinationHealth {
    /// A fresh, all-zero health record for a destination that has never been
    /// observed.
    #[must_use]
    pub fn new(destination_id: DestinationId, now: DateTime<Utc>) -> Self {
        Self {
            destination_id,
            circuit_breaker_state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            total_deliveries: 0,
            total_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            circuit_breaker_opened_at: None,
            half_open_successes: 0,
            half_open_probes_in_flight: 0,
            metadata: Value::Null,
            avg_response_time_ms: 0.0,
            response_time_samples: 0,
            last_check_at: now,
        }
    }

    /// Folds one observed delivery latency into the rolling average, used
    /// by the circuit breaker after every attempt.
    pub fn record_latency(&mut self, latency: std::time::Duration) {
        #[allow(clippy::cast_precision_loss)]
        let sample_ms = latency.as_millis() as f64;
        if self.response_time_samples == 0 {
            self.avg_response_time_ms = sample_ms;
        } else {
            self.avg_response_time_ms =
                RESPONSE_TIME_EMA_ALPHA * sample_ms + (1.0 - RESPONSE_TIME_EMA_ALPHA) * self.avg_response_time_ms;
        }
        self.response_time_samples += 1;
    }

    /// How long the breaker has been in its current state, derived from
    /// `circuit_breaker_opened_at`/`last_check_at`.
    #[must_use]
    pub fn time_in_current_state(&self, now: DateTime<Utc>) -> std::time::Duration {
        let since = self.circuit_breaker_opened_at.unwrap_or(self.last_check_at);
        (now - since).to_std().unwrap_or_default()
    }

    /// Failure rate in `[0.0, 1.0]` over the lifetime of the destination,
    /// used as one input to the alert manager's failure-rate threshold.
    #[must_use]
    pub fn lifetime_failure_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_deliveries as f64
        }
    }
}

/// Read-model returned by `CircuitBreaker::get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// The destination these metrics describe.
    pub destination_id: DestinationId,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Consecutive failures observed.
    pub consecutive_failures: u32,
    /// Total attempts.
    pub total_deliveries: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Duration spent in the current state.
    pub time_in_current_state: std::time::Duration,
}
