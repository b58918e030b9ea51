//! `SQLite` storage for the `destination_health` table.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::domain::{CircuitBreakerState, DestinationHealth};
use crate::domain_types::DestinationId;
use crate::storage::{DestinationHealthRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn upsert() -> &'static str {
        "INSERT INTO destination_health
            (destination_id, circuit_breaker_state, consecutive_failures, total_deliveries,
             total_failures, last_success_at, last_failure_at, circuit_breaker_opened_at,
             half_open_successes, metadata_json, last_check_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(destination_id) DO UPDATE SET
            circuit_breaker_state = excluded.circuit_breaker_state,
            consecutive_failures = excluded.consecutive_failures,
            total_deliveries = excluded.total_deliveries,
            total_failures = excluded.total_failures,
            last_success_at = excluded.last_success_at,
            last_failure_at = excluded.last_failure_at,
            circuit_breaker_opened_at = excluded.circuit_breaker_opened_at,
            half_open_successes = excluded.half_open_successes,
            metadata_json = excluded.metadata_json,
            last_check_at = excluded.last_check_at"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT destination_id, circuit_breaker_state, consecutive_failures, total_deliveries,
                total_failures, last_success_at, last_failure_at, circuit_breaker_opened_at,
                half_open_successes, metadata_json, last_check_at
         FROM destination_health WHERE destination_id = ?"
    }

    pub(super) fn select_all() -> &'static str {
        "SELECT destination_id, circuit_breaker_state, consecutive_failures, total_deliveries,
                total_failures, last_success_at, last_failure_at, circuit_breaker_opened_at,
                half_open_successes, metadata_json, last_check_at
         FROM destination_health"
    }
}

fn state_tag(state: CircuitBreakerState) -> &'static str {
    match state {
        CircuitBreakerState::Closed => "closed",
        CircuitBreakerState::HalfOpen => "half-open",
        CircuitBreakerState::Open => "open",
    }
}

fn parse_state(raw: &str) -> StorageResult<CircuitBreakerState> {
    match raw {
        "closed" => Ok(CircuitBreakerState::Closed),
        "half-open" => Ok(CircuitBreakerState::HalfOpen),
        "open" => Ok(CircuitBreakerState::Open),
        other => Err(StorageError::Backend(format!("unknown circuit breaker state {other:?}"))),
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn row_to_health(row: &sqlx::sqlite::SqliteRow) -> StorageResult<DestinationHealth> {
    let destination_id: String = row.try_get("destination_id").map_err(backend_err)?;
    let circuit_breaker_state: String = row.try_get("circuit_breaker_state").map_err(backend_err)?;
    let last_success_at: Option<String> = row.try_get("last_success_at").map_err(backend_err)?;
    let last_failure_at: Option<String> = row.try_get("last_failure_at").map_err(backend_err)?;
    let circuit_breaker_opened_at: Option<String> =
        row.try_get("circuit_breaker_opened_at").map_err(backend_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(backend_err)?;
    let last_check_at: String = row.try_get("last_check_at").map_err(backend_err)?;

    Ok(DestinationHealth {
        destination_id: DestinationId::try_new(destination_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        circuit_breaker_state: parse_state(&circuit_breaker_state)?,
        consecutive_failures: u32::try_from(
            row.try_get::<i64, _>("consecutive_failures").map_err(backend_err)?,
        )
        .unwrap_or(0),
        total_deliveries: u64::try_from(
            row.try_get::<i64, _>("total_deliveries").map_err(backend_err)?,
        )
        .unwrap_or(0),
        total_failures: u64::try_from(
            row.try_get::<i64, _>("total_failures").map_err(backend_err)?,
        )
        .unwrap_or(0),
        last_success_at: parse_optional_timestamp(last_success_at.as_deref())?,
        last_failure_at: parse_optional_timestamp(last_failure_at.as_deref())?,
        circuit_breaker_opened_at: parse_optional_timestamp(circuit_breaker_opened_at.as_deref())?,
        half_open_successes: u32::try_from(
            row.try_get::<i64, _>("half_open_successes").map_err(backend_err)?,
        )
        .unwrap_or(0),
        metadata: serde_json::from_str::<Value>(&metadata_json).unwrap_or(Value::Null),
        last_check_at: parse_timestamp(&last_check_at)?,
    })
}

/// `SQLx` SQLite-backed [`DestinationHealthRepository`].
pub struct SqliteDestinationHealthRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDestinationHealthRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DestinationHealthRepository for SqliteDestinationHealthRepository {
    async fn get(&self, destination_id: &DestinationId) -> StorageResult<Option<DestinationHealth>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(destination_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_health).transpose()
    }

    async fn upsert(&self, health: DestinationHealth) -> StorageResult<DestinationHealth> {
        sqlx::query(sql::upsert())
            .bind(health.destination_id.to_string())
            .bind(state_tag(health.circuit_breaker_state))
            .bind(i64::from(health.consecutive_failures))
            .bind(health.total_deliveries as i64)
            .bind(health.total_failures as i64)
            .bind(health.last_success_at.map(format_timestamp))
            .bind(health.last_failure_at.map(format_timestamp))
            .bind(health.circuit_breaker_opened_at.map(format_timestamp))
            .bind(i64::from(health.half_open_successes))
            .bind(
                serde_json::to_string(&health.metadata)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .bind(format_timestamp(health.last_check_at))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(health)
    }

    async fn list_all(&self) -> StorageResult<Vec<DestinationHealth>> {
        let rows = sqlx::query(sql::select_all())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_health).collect()
    }
}
