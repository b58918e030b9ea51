//! Domain newtypes
//!
//! Strongly-typed identifiers and bounded values: every primitive the
//! domain cares about is wrapped in a `nutype` so illegal values (negative
//! priorities, empty organization ids, malformed delivery ids) cannot be
//! constructed.

use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Tenant identifier. Immutable once a destination or delivery is created.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct OrganizationId(String);

/// Unique identifier for a destination.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct DestinationId(String);

impl DestinationId {
    /// Generates a new random destination id.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(format!("dst_{}", Uuid::new_v4().simple()))
            .expect("generated destination id is always valid")
    }
}

/// Unique identifier for a delivery, format `del_<unixNanos>_<base62(rand64)>`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct DeliveryId(String);

impl DeliveryId {
    /// Generates a new delivery id: `del_<unixNanos>_<rand8>`.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let rand_part = base62_random(8);
        Self::try_new(format!("del_{nanos}_{rand_part}"))
            .expect("generated delivery id is always valid")
    }
}

/// Unique identifier for a queue item.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    /// Generates a new random queue item id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an alert.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct AlertId(Uuid);

impl AlertId {
    /// Generates a new random alert id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a maintenance window.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct MaintenanceWindowId(Uuid);

impl MaintenanceWindowId {
    /// Generates a new random maintenance window id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Idempotency key attached to each delivery call so adapters can dedup
/// retries.
#[nutype(derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into
))]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Generates a new random idempotency key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Optional correlation id a caller can attach to a delivery request to tie
/// it to an upstream trace.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct CorrelationId(String);

/// Delivery priority, `0..=10` with `10` the highest.
#[nutype(
    validate(less_or_equal = 10),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5
)]
pub struct Priority(u8);

impl Priority {
    /// Default priority for health-check deliveries.
    pub const HEALTH_CHECK: u8 = 10;
    /// Default priority for write deliveries.
    pub const WRITE: u8 = 5;
    /// Default priority for report/event deliveries.
    pub const REPORT: u8 = 3;
    /// Default priority for read deliveries.
    pub const READ: u8 = 1;
}

/// Generates a base-62 random string of the given length, used for the
/// random suffix of generated delivery ids.
fn base62_random(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_id_has_expected_prefix() {
        let id = DeliveryId::generate();
        assert!(id.to_string().starts_with("del_"));
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::try_new(11).is_err());
        assert!(Priority::try_new(10).is_ok());
    }

    #[test]
    fn organization_id_rejects_empty() {
        assert!(OrganizationId::try_new(String::new()).is_err());
    }
}
