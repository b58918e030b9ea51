//! Delivery log entity and status aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{
    CorrelationId, DeliveryId, DestinationId, IdempotencyKey, OrganizationId,
};

/// Overall delivery status. Wire-stable; do not reorder or rename variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, at least one per-destination substate still pending and none
    /// yet attempted.
    Queued,
    /// At least one destination has been attempted and at least one is still
    /// non-terminal.
    Processing,
    /// Every destination reached `Delivered`.
    Completed,
    /// A mix of `Delivered` and `Failed`/`Skipped`, with nothing non-terminal
    /// left.
    Partial,
    /// No destinations, or every destination is `Failed`/`Skipped`.
    Failed,
    /// Cancelled by the caller via `CancelDelivery`.
    Cancelled,
}

/// Per-destination delivery substate. Wire-stable; do not reorder or rename variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationDeliveryStatus {
    /// Enqueued, not yet attempted.
    Pending,
    /// A worker currently holds the corresponding queue item.
    Processing,
    /// Delivered successfully.
    Delivered,
    /// Exhausted retries, classified non-retryable, or the circuit was open.
    Failed,
    /// Never attempted because the destination's circuit breaker was open
    /// at enqueue time.
    Skipped,
}

impl DestinationDeliveryStatus {
    /// `true` for statuses that will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Skipped)
    }
}

/// Per-destination delivery state tracked on a [`DeliveryLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDestinationState {
    /// The destination this substate tracks.
    pub destination_id: DestinationId,
    /// Current substate.
    pub status: DestinationDeliveryStatus,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Most recent error, if any.
    pub last_error: Option<String>,
    /// When delivery succeeded, if it has.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Opaque reference returned by the transport adapter on success
    /// (e.g. a provider message id), surfaced to callers for reconciliation.
    pub cross_system_reference: Option<String>,
}

/// The payload carried by a delivery, opaque to the orchestrator beyond its
/// declared `kind` (used for default priority assignment) and size
/// (validated against `max_payload_size`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Application-defined payload kind (`"health_check"`, `"write"`,
    /// `"report"`, `"event"`, `"read"`, ...), used only for default priority
    /// assignment; never interpreted further by the core.
    pub kind: String,
    /// Opaque payload body.
    pub data: Value,
    /// Opaque metadata carried alongside the body.
    #[serde(default)]
    pub metadata: Value,
}

/// A persisted delivery record: one payload fanned out to N destinations.
///
/// Invariants: `status` is a pure function of the per-destination
/// substates (see [`aggregate_status`]); never mutated cross-tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    /// Globally unique delivery identifier, `del_<ts>_<rand>`.
    pub id: DeliveryId,
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// The payload being delivered.
    pub payload: Payload,
    /// Overall status, derived via [`aggregate_status`] and persisted
    /// alongside the per-destination substates for cheap reads.
    pub status: DeliveryStatus,
    /// Per-destination substates.
    pub destinations: Vec<DeliveryDestinationState>,
    /// Caller-supplied correlation id, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Idempotency key generated for this delivery call.
    pub idempotency_key: IdempotencyKey,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Pure status-aggregation function.
///
/// Given the set of per-destination substates `D`, the overall status is:
/// - `Failed` if `D` is empty, or every member is `Failed`/`Skipped`.
/// - `Completed` if every member is `Delivered`.
/// - `Partial` if some member is `Delivered`, some is `Failed`, and none is
///   non-terminal.
/// - `Processing` if some member is non-terminal and at least one has been
///   attempted (`attempts > 0` or already terminal).
/// - `Queued` otherwise (nothing attempted yet).
#[must_use]
pub fn aggregate_status(destinations: &[DeliveryDestinationState]) -> DeliveryStatus {
    if destinations.is_empty() {
        return DeliveryStatus::Failed;
    }

    let all_failed_or_skipped = destinations.iter().all(|d| {
        matches!(
            d.status,
            DestinationDeliveryStatus::Failed | DestinationDeliveryStatus::Skipped
        )
    });
    if all_failed_or_skipped {
        return DeliveryStatus::Failed;
    }

    let all_delivered = destinations
        .iter()
        .all(|d| d.status == DestinationDeliveryStatus::Delivered);
    if all_delivered {
        return DeliveryStatus::Completed;
    }

    let any_non_terminal = destinations.iter().any(|d| !d.status.is_terminal());
    let any_delivered = destinations
        .iter()
        .any(|d| d.status == DestinationDeliveryStatus::Delivered);
    let any_failed = destinations
        .iter()
        .any(|d| d.status == DestinationDeliveryStatus::Failed);

    if !any_non_terminal && any_delivered && any_failed {
        return DeliveryStatus::Partial;
    }

    let any_attempted = destinations.iter().any(|d| d.attempts > 0 || d.status.is_terminal());
    if any_non_terminal && any_attempted {
        return DeliveryStatus::Processing;
    }

    DeliveryStatus::Queued
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: DestinationDeliveryStatus, attempts: u32) -> DeliveryDestinationState {
        DeliveryDestinationState {
            destination_id: DestinationId::generate(),
            status,
            attempts,
            last_error: None,
            delivered_at: None,
            cross_system_reference: None,
        }
    }

    #[test]
    fn empty_destination_set_is_failed() {
        assert_eq!(aggregate_status(&[]), DeliveryStatus::Failed);
    }

    #[test]
    fn all_delivered_is_completed() {
        let states = vec![
            state(DestinationDeliveryStatus::Delivered, 1),
            state(DestinationDeliveryStatus::Delivered, 1),
        ];
        assert_eq!(aggregate_status(&states), DeliveryStatus::Completed);
    }

    #[test]
    fn mixed_delivered_and_failed_is_partial() {
        let states = vec![
            state(DestinationDeliveryStatus::Delivered, 1),
            state(DestinationDeliveryStatus::Failed, 3),
        ];
        assert_eq!(aggregate_status(&states), DeliveryStatus::Partial);
    }

    #[test]
    fn pending_and_processing_mix_is_processing_once_attempted() {
        let states = vec![
            state(DestinationDeliveryStatus::Delivered, 1),
            state(DestinationDeliveryStatus::Pending, 0),
        ];
        assert_eq!(aggregate_status(&states), DeliveryStatus::Processing);
    }

    #[test]
    fn all_pending_untouched_is_queued() {
        let states = vec![
            state(DestinationDeliveryStatus::Pending, 0),
            state(DestinationDeliveryStatus::Pending, 0),
        ];
        assert_eq!(aggregate_status(&states), DeliveryStatus::Queued);
    }

    #[test]
    fn all_skipped_is_failed() {
        let states = vec![state(DestinationDeliveryStatus::Skipped, 0)];
        assert_eq!(aggregate_status(&states), DeliveryStatus::Failed);
    }

    /// Counts-based restatement of `aggregate_status`'s documented rules,
    /// kept deliberately independent of its branch order so the proptest
    /// below catches divergence rather than just mirroring the same logic.
    fn reference_aggregate_status(destinations: &[DeliveryDestinationState]) -> DeliveryStatus {
        let total = destinations.len();
        if total == 0 {
            return DeliveryStatus::Failed;
        }

        let delivered = destinations
            .iter()
            .filter(|d| d.status == DestinationDeliveryStatus::Delivered)
            .count();
        let failed = destinations
            .iter()
            .filter(|d| d.status == DestinationDeliveryStatus::Failed)
            .count();
        let skipped = destinations
            .iter()
            .filter(|d| d.status == DestinationDeliveryStatus::Skipped)
            .count();
        let terminal = destinations.iter().filter(|d| d.status.is_terminal()).count();
        let attempted = destinations.iter().any(|d| d.attempts > 0 || d.status.is_terminal());

        if failed + skipped == total {
            DeliveryStatus::Failed
        } else if delivered == total {
            DeliveryStatus::Completed
        } else if terminal == total && delivered > 0 && failed > 0 {
            DeliveryStatus::Partial
        } else if terminal < total && attempted {
            DeliveryStatus::Processing
        } else {
            DeliveryStatus::Queued
        }
    }

    proptest::proptest! {
        #[test]
        fn aggregate_status_matches_reference(
            inputs in proptest::collection::vec((0u8..5, 0u32..2), 0..8),
        ) {
            let states: Vec<_> = inputs
                .into_iter()
                .map(|(s, attempts)| {
                    let status = match s {
                        0 => DestinationDeliveryStatus::Pending,
                        1 => DestinationDeliveryStatus::Processing,
                        2 => DestinationDeliveryStatus::Delivered,
                        3 => DestinationDeliveryStatus::Failed,
                        _ => DestinationDeliveryStatus::Skipped,
                    };
                    state(status, attempts)
                })
                .collect();
            proptest::prop_assert_eq!(aggregate_status(&states), reference_aggregate_status(&states));
        }
    }

    #[test]
    fn aggregate_status_exhaustive_for_small_sets() {
        let variants = [
            DestinationDeliveryStatus::Pending,
            DestinationDeliveryStatus::Processing,
            DestinationDeliveryStatus::Delivered,
            DestinationDeliveryStatus::Failed,
            DestinationDeliveryStatus::Skipped,
        ];

        // Every status vector of length 0..=3 over the 5 substates, encoded
        // as a base-5 counter, attempts fixed at 1 (terminality is what
        // aggregate_status cares about, not the exact count).
        for n in 0..=3usize {
            for combo in 0..variants.len().pow(n as u32) {
                let mut combo = combo;
                let states: Vec<_> = (0..n)
                    .map(|_| {
                        let digit = combo % variants.len();
                        combo /= variants.len();
                        state(variants[digit], 1)
                    })
                    .collect();
                assert_eq!(
                    aggregate_status(&states),
                    reference_aggregate_status(&states),
                    "mismatch for {states:?}"
                );
            }
        }
    }
}
