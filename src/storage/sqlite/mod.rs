//! `SQLite`-backed repository implementations.
//!
//! Each submodule splits a private `sql` module holding pure SQL string
//! generation (functional core) from the public repository struct holding
//! the actual `SQLx` I/O (imperative shell). Structured columns (typed
//! destination config, per-destination delivery substates, queue metadata)
//! are stored as JSON `TEXT` and (de)serialized here rather than normalized
//! further.

pub mod alert_storage;
pub mod delivery_storage;
pub mod destination_storage;
pub mod health_storage;
pub mod queue_storage;
pub mod window_storage;

pub use alert_storage::{SqliteAlertConfigRepository, SqliteAlertRepository};
pub use delivery_storage::SqliteDeliveryLogRepository;
pub use destination_storage::SqliteDestinationRepository;
pub use health_storage::SqliteDestinationHealthRepository;
pub use queue_storage::SqliteQueueRepository;
pub use window_storage::SqliteMaintenanceWindowRepository;

use chrono::{DateTime, Utc};

use crate::storage::StorageError;

/// Parses an RFC 3339 timestamp column, mapping failures to
/// [`StorageError::Backend`].
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Backend(format!("invalid timestamp {raw:?}: {e}")))
}

/// Parses an optional RFC 3339 timestamp column.
pub(crate) fn parse_optional_timestamp(
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(parse_timestamp).transpose()
}

/// Formats a timestamp for storage.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

/// Parses a JSON column, mapping failures to [`StorageError::Backend`].
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Backend(format!("invalid json: {e}")))
}
