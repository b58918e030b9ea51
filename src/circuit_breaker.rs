//! Per-destination circuit breaker.
//!
//! State machine:
//!
//! ```text
//! closed    --(consecutive_failures >= failure_threshold AND
//!              total_deliveries >= volume_threshold)--> open
//! open      --(now >= opened_at + recovery_timeout)-->   half-open
//! half-open --(success)--> half_open_successes++; closed once >= success_threshold
//! half-open --(failure)--> open (opened_at reset to now)
//! ```

use std::sync::Arc;

use chrono::Utc;

use crate::config::CircuitBreakerConfig;
use crate::domain::{CircuitBreakerMetrics, CircuitBreakerState, DestinationHealth};
use crate::domain_types::DestinationId;
use crate::error::Result;
use crate::observability::{BreakerTransitionEvent, SharedObserver};
use crate::storage::DestinationHealthRepository;

/// Per-destination state machine over [`DestinationHealth`], backed by the
/// repository boundary so its state survives process restarts.
pub struct CircuitBreaker {
    health_repo: Arc<dyn DestinationHealthRepository>,
    config: CircuitBreakerConfig,
    observer: SharedObserver,
}

impl CircuitBreaker {
    /// Builds a circuit breaker over `health_repo`.
    #[must_use]
    pub fn new(
        health_repo: Arc<dyn DestinationHealthRepository>,
        config: CircuitBreakerConfig,
        observer: SharedObserver,
    ) -> Self {
        Self {
            health_repo,
            config,
            observer,
        }
    }

    async fn load_or_new(&self, destination_id: &DestinationId) -> Result<DestinationHealth> {
        let now = Utc::now();
        Ok(match self.health_repo.get(destination_id).await? {
            Some(health) => health,
            None => DestinationHealth::new(destination_id.clone(), now),
        })
    }

    fn emit_transition(
        &self,
        destination_id: &DestinationId,
        from: CircuitBreakerState,
        to: CircuitBreakerState,
        reason: Option<String>,
    ) {
        if from != to {
            self.observer.on_breaker_transition(&BreakerTransitionEvent {
                destination_id: destination_id.clone(),
                from,
                to,
                reason,
            });
        }
    }

    /// Returns whether the breaker is currently short-circuiting requests
    /// to `destination_id`.
    ///
    /// Side-effectfully transitions `open -> half-open` once the recovery
    /// window has elapsed. While `half-open`, at most `success_threshold`
    /// trial requests are let through concurrently: each permitted caller
    /// claims one slot of `half_open_probes_in_flight`, released by the
    /// matching `record_success`/`record_failure`; callers beyond the
    /// budget see `true` the same as a fully open breaker. Reads that fail
    /// are treated as closed (fail safe) rather than propagated, since a
    /// missing health record must never become an outage.
    pub async fn is_open(&self, destination_id: &DestinationId) -> bool {
        let Ok(mut health) = self.load_or_new(destination_id).await else {
            return false;
        };

        match health.circuit_breaker_state {
            CircuitBreakerState::Closed => false,
            CircuitBreakerState::HalfOpen => self.try_claim_half_open_probe(health).await,
            CircuitBreakerState::Open => {
                let now = Utc::now();
                let opened_at = health.circuit_breaker_opened_at.unwrap_or(now);
                if now < opened_at + self.config.recovery_timeout_chrono() {
                    return true;
                }

                health.circuit_breaker_state = CircuitBreakerState::HalfOpen;
                health.half_open_successes = 0;
                health.half_open_probes_in_flight = 0;
                health.last_check_at = now;
                self.emit_transition(
                    destination_id,
                    CircuitBreakerState::Open,
                    CircuitBreakerState::HalfOpen,
                    Some("recovery timeout elapsed".to_string()),
                );
                if self.health_repo.upsert(health.clone()).await.is_err() {
                    return true;
                }
                self.try_claim_half_open_probe(health).await
            }
        }
    }

    /// Claims one of the `success_threshold` half-open probe slots for
    /// `health`, persisting the claim. Returns `true` (deny) once the
    /// budget is spent.
    async fn try_claim_half_open_probe(&self, mut health: DestinationHealth) -> bool {
        if health.half_open_probes_in_flight >= self.config.success_threshold {
            return true;
        }

        health.half_open_probes_in_flight += 1;
        health.last_check_at = Utc::now();
        if self.health_repo.upsert(health).await.is_err() {
            return true;
        }
        false
    }

    /// Records a successful delivery attempt against `destination_id`,
    /// observed with the given `latency`.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read or written.
    pub async fn record_success(
        &self,
        destination_id: &DestinationId,
        latency: std::time::Duration,
    ) -> Result<()> {
        let mut health = self.load_or_new(destination_id).await?;
        let from = health.circuit_breaker_state;
        let now = Utc::now();

        health.consecutive_failures = 0;
        health.total_deliveries += 1;
        health.last_success_at = Some(now);
        health.last_check_at = now;
        health.record_latency(latency);

        if from == CircuitBreakerState::HalfOpen {
            health.half_open_successes += 1;
            health.half_open_probes_in_flight = health.half_open_probes_in_flight.saturating_sub(1);
            if health.half_open_successes >= self.config.success_threshold {
                health.circuit_breaker_state = CircuitBreakerState::Closed;
                health.half_open_successes = 0;
                health.half_open_probes_in_flight = 0;
            }
        }

        self.emit_transition(destination_id, from, health.circuit_breaker_state, None);
        self.health_repo.upsert(health).await?;
        Ok(())
    }

    /// Records a failed delivery attempt against `destination_id`, observed
    /// with the given `latency`, possibly tripping the breaker.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read or written.
    pub async fn record_failure(
        &self,
        destination_id: &DestinationId,
        latency: std::time::Duration,
        reason: Option<String>,
    ) -> Result<()> {
        let mut health = self.load_or_new(destination_id).await?;
        let from = health.circuit_breaker_state;
        let now = Utc::now();

        health.consecutive_failures += 1;
        health.total_deliveries += 1;
        health.total_failures += 1;
        health.last_failure_at = Some(now);
        health.last_check_at = now;
        health.record_latency(latency);

        match from {
            CircuitBreakerState::HalfOpen => {
                health.circuit_breaker_state = CircuitBreakerState::Open;
                health.circuit_breaker_opened_at = Some(now);
                health.half_open_successes = 0;
                health.half_open_probes_in_flight = 0;
            }
            CircuitBreakerState::Closed
                if health.consecutive_failures >= self.config.failure_threshold
                    && health.total_deliveries >= u64::from(self.config.volume_threshold) =>
            {
                health.circuit_breaker_state = CircuitBreakerState::Open;
                health.circuit_breaker_opened_at = Some(now);
            }
            _ => {}
        }

        self.emit_transition(destination_id, from, health.circuit_breaker_state, reason);
        self.health_repo.upsert(health).await?;
        Ok(())
    }

    /// Forces `destination_id`'s breaker open regardless of observed
    /// thresholds or sample volume — an unconditional operator override.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read or written.
    pub async fn force_open(&self, destination_id: &DestinationId, reason: String) -> Result<()> {
        let mut health = self.load_or_new(destination_id).await?;
        let from = health.circuit_breaker_state;
        let now = Utc::now();

        health.circuit_breaker_state = CircuitBreakerState::Open;
        health.circuit_breaker_opened_at = Some(now);
        health.half_open_successes = 0;
        health.half_open_probes_in_flight = 0;
        health.last_check_at = now;

        self.emit_transition(destination_id, from, CircuitBreakerState::Open, Some(reason));
        self.health_repo.upsert(health).await?;
        Ok(())
    }

    /// Forces `destination_id`'s breaker closed and zeroes its consecutive
    /// failure count.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read or written.
    pub async fn force_close(&self, destination_id: &DestinationId) -> Result<()> {
        let mut health = self.load_or_new(destination_id).await?;
        let from = health.circuit_breaker_state;
        let now = Utc::now();

        health.circuit_breaker_state = CircuitBreakerState::Closed;
        health.consecutive_failures = 0;
        health.half_open_successes = 0;
        health.half_open_probes_in_flight = 0;
        health.circuit_breaker_opened_at = None;
        health.last_check_at = now;

        self.emit_transition(
            destination_id,
            from,
            CircuitBreakerState::Closed,
            Some("operator override".to_string()),
        );
        self.health_repo.upsert(health).await?;
        Ok(())
    }

    /// Returns the current breaker state for `destination_id`, `closed` if
    /// no health record exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read.
    pub async fn get_state(&self, destination_id: &DestinationId) -> Result<CircuitBreakerState> {
        Ok(self.load_or_new(destination_id).await?.circuit_breaker_state)
    }

    /// Returns the read-model metrics for `destination_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the health record can't be read.
    pub async fn get_metrics(&self, destination_id: &DestinationId) -> Result<CircuitBreakerMetrics> {
        let health = self.load_or_new(destination_id).await?;
        Ok(to_metrics(&health))
    }

    /// Returns metrics for every destination with a tracked health record.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_all_states(&self) -> Result<Vec<CircuitBreakerMetrics>> {
        let records = self.health_repo.list_all().await?;
        Ok(records.iter().map(to_metrics).collect())
    }
}

fn to_metrics(health: &DestinationHealth) -> CircuitBreakerMetrics {
    let now = Utc::now();
    CircuitBreakerMetrics {
        destination_id: health.destination_id.clone(),
        state: health.circuit_breaker_state,
        consecutive_failures: health.consecutive_failures,
        total_deliveries: health.total_deliveries,
        total_failures: health.total_failures,
        time_in_current_state: health.time_in_current_state(now),
    }
}

impl CircuitBreakerConfig {
    fn recovery_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.recovery_timeout).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::default_observer;
    use crate::storage::memory::InMemoryDestinationHealthRepository;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(InMemoryDestinationHealthRepository::default()),
            CircuitBreakerConfig::default(),
            default_observer(),
        )
    }

    #[tokio::test]
    async fn fresh_destination_is_closed() {
        let cb = breaker();
        let id = DestinationId::generate();
        assert!(!cb.is_open(&id).await);
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn trips_open_after_threshold_with_enough_volume() {
        let cb = breaker();
        let id = DestinationId::generate();
        for _ in 0..5 {
            cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        }
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::Open);
        assert!(cb.is_open(&id).await);
    }

    #[tokio::test]
    async fn volume_threshold_suppresses_tiny_samples() {
        let mut config = CircuitBreakerConfig::default();
        config.volume_threshold = 100;
        let cb = CircuitBreaker::new(
            Arc::new(InMemoryDestinationHealthRepository::default()),
            config,
            default_observer(),
        );
        let id = DestinationId::generate();
        for _ in 0..10 {
            cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        }
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let cb = breaker();
        let id = DestinationId::generate();
        cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        cb.record_success(&id, std::time::Duration::from_millis(5)).await.unwrap();
        let metrics = cb.get_metrics(&id).await.unwrap();
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn force_open_is_unconditional() {
        let cb = breaker();
        let id = DestinationId::generate();
        cb.force_open(&id, "operator maintenance".to_string()).await.unwrap();
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_at_most_success_threshold_concurrent_probes() {
        let cb = breaker();
        let id = DestinationId::generate();
        for _ in 0..5 {
            cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        }
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::Open);

        let health_repo = Arc::new(InMemoryDestinationHealthRepository::default());
        let mut health = cb.load_or_new(&id).await.unwrap();
        health.circuit_breaker_opened_at = Some(Utc::now() - chrono::Duration::hours(1));
        health_repo.upsert(health).await.unwrap();
        let cb = CircuitBreaker::new(health_repo, CircuitBreakerConfig::default(), default_observer());

        let success_threshold = cb.config.success_threshold;
        let mut admitted = 0;
        for _ in 0..(success_threshold + 3) {
            if !cb.is_open(&id).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, success_threshold);
        assert_eq!(cb.get_state(&id).await.unwrap(), CircuitBreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn force_close_zeroes_consecutive_failures() {
        let cb = breaker();
        let id = DestinationId::generate();
        for _ in 0..5 {
            cb.record_failure(&id, std::time::Duration::from_millis(5), None).await.unwrap();
        }
        cb.force_close(&id).await.unwrap();
        let metrics = cb.get_metrics(&id).await.unwrap();
        assert_eq!(metrics.state, CircuitBreakerState::Closed);
        assert_eq!(metrics.consecutive_failures, 0);
    }
}
