//! `SQLite` storage for the `maintenance_windows` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_timestamp};
use crate::domain::{AlertType, MaintenanceWindow};
use crate::domain_types::{DestinationId, MaintenanceWindowId, OrganizationId};
use crate::storage::{MaintenanceWindowRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn insert() -> &'static str {
        "INSERT INTO maintenance_windows
            (id, organization_id, destination_id, start_time, end_time, timezone, reason,
             suppress_alert_types_json, created_by)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn delete_by_id() -> &'static str {
        "DELETE FROM maintenance_windows WHERE id = ?"
    }

    pub(super) fn select_active() -> &'static str {
        "SELECT id, organization_id, destination_id, start_time, end_time, timezone, reason,
                suppress_alert_types_json, created_by
         FROM maintenance_windows
         WHERE organization_id = ? AND start_time <= ? AND end_time > ?"
    }

    pub(super) fn delete_expired() -> &'static str {
        "DELETE FROM maintenance_windows WHERE end_time <= ?"
    }
}

fn alert_type_tag(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::ConsecutiveFailures => "consecutive_failures",
        AlertType::FailureRate => "failure_rate",
        AlertType::QueueBacklog => "queue_backlog",
        AlertType::ResponseTime => "response_time",
    }
}

fn parse_alert_type(raw: &str) -> StorageResult<AlertType> {
    match raw {
        "consecutive_failures" => Ok(AlertType::ConsecutiveFailures),
        "failure_rate" => Ok(AlertType::FailureRate),
        "queue_backlog" => Ok(AlertType::QueueBacklog),
        "response_time" => Ok(AlertType::ResponseTime),
        other => Err(StorageError::Backend(format!("unknown alert type {other:?}"))),
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn row_to_window(row: &sqlx::sqlite::SqliteRow) -> StorageResult<MaintenanceWindow> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let destination_id: Option<String> = row.try_get("destination_id").map_err(backend_err)?;
    let start_time: String = row.try_get("start_time").map_err(backend_err)?;
    let end_time: String = row.try_get("end_time").map_err(backend_err)?;
    let suppress_alert_types_json: String =
        row.try_get("suppress_alert_types_json").map_err(backend_err)?;

    let suppress_alert_types_raw: Vec<String> = serde_json::from_str(&suppress_alert_types_json)
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let suppress_alert_types = suppress_alert_types_raw
        .iter()
        .map(|s| parse_alert_type(s))
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(MaintenanceWindow {
        id: MaintenanceWindowId::new(
            uuid::Uuid::parse_str(&id).map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        destination_id: destination_id
            .map(DestinationId::try_new)
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        start_time: parse_timestamp(&start_time)?,
        end_time: parse_timestamp(&end_time)?,
        timezone: row.try_get("timezone").map_err(backend_err)?,
        reason: row.try_get("reason").map_err(backend_err)?,
        suppress_alert_types,
        created_by: row.try_get("created_by").map_err(backend_err)?,
    })
}

/// `SQLx` SQLite-backed [`MaintenanceWindowRepository`].
pub struct SqliteMaintenanceWindowRepository {
    pool: Pool<Sqlite>,
}

impl SqliteMaintenanceWindowRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MaintenanceWindowRepository for SqliteMaintenanceWindowRepository {
    async fn create(&self, window: MaintenanceWindow) -> StorageResult<MaintenanceWindow> {
        let suppress_json = serde_json::to_string(
            &window
                .suppress_alert_types
                .iter()
                .copied()
                .map(alert_type_tag)
                .collect::<Vec<_>>(),
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(sql::insert())
            .bind(window.id.to_string())
            .bind(window.organization_id.to_string())
            .bind(window.destination_id.as_ref().map(ToString::to_string))
            .bind(format_timestamp(window.start_time))
            .bind(format_timestamp(window.end_time))
            .bind(&window.timezone)
            .bind(&window.reason)
            .bind(suppress_json)
            .bind(&window.created_by)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(window)
    }

    async fn delete(&self, id: &MaintenanceWindowId) -> StorageResult<()> {
        sqlx::query(sql::delete_by_id())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>> {
        let rows = sqlx::query(sql::select_active())
            .bind(organization_id.to_string())
            .bind(format_timestamp(now))
            .bind(format_timestamp(now))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_window).collect()
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(sql::delete_expired())
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }
}
