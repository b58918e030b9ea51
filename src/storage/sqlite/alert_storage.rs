//! `SQLite` storage for the `alerts` and `alert_configs` tables.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::domain::{Alert, AlertConfig, AlertSeverity, AlertStatus, AlertType, SuppressionWindow};
use crate::domain_types::{AlertId, DestinationId, OrganizationId};
use crate::storage::{AlertConfigRepository, AlertRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn upsert_alert() -> &'static str {
        "INSERT INTO alerts
            (id, organization_id, destination_id, alert_type, severity, title, description,
             metadata_json, status, created_at, acknowledged_by, acknowledged_at,
             resolved_by, resolved_at, notes, department_id, team_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            severity = excluded.severity,
            status = excluded.status,
            acknowledged_by = excluded.acknowledged_by,
            acknowledged_at = excluded.acknowledged_at,
            resolved_by = excluded.resolved_by,
            resolved_at = excluded.resolved_at,
            notes = excluded.notes"
    }

    pub(super) fn select_alert_by_id() -> &'static str {
        "SELECT id, organization_id, destination_id, alert_type, severity, title, description,
                metadata_json, status, created_at, acknowledged_by, acknowledged_at,
                resolved_by, resolved_at, notes, department_id, team_id
         FROM alerts WHERE id = ?"
    }

    pub(super) fn upsert_config() -> &'static str {
        "INSERT INTO alert_configs
            (organization_id, failure_rate_threshold, consecutive_failure_threshold,
             queue_backlog_threshold, response_time_threshold_ms, debounce_window_minutes,
             escalation_delay_minutes, suppression_windows_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(organization_id) DO UPDATE SET
            failure_rate_threshold = excluded.failure_rate_threshold,
            consecutive_failure_threshold = excluded.consecutive_failure_threshold,
            queue_backlog_threshold = excluded.queue_backlog_threshold,
            response_time_threshold_ms = excluded.response_time_threshold_ms,
            debounce_window_minutes = excluded.debounce_window_minutes,
            escalation_delay_minutes = excluded.escalation_delay_minutes,
            suppression_windows_json = excluded.suppression_windows_json"
    }

    pub(super) fn select_config() -> &'static str {
        "SELECT organization_id, failure_rate_threshold, consecutive_failure_threshold,
                queue_backlog_threshold, response_time_threshold_ms, debounce_window_minutes,
                escalation_delay_minutes, suppression_windows_json
         FROM alert_configs WHERE organization_id = ?"
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

fn severity_tag(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Low => "low",
        AlertSeverity::Medium => "medium",
        AlertSeverity::High => "high",
        AlertSeverity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> StorageResult<AlertSeverity> {
    match raw {
        "low" => Ok(AlertSeverity::Low),
        "medium" => Ok(AlertSeverity::Medium),
        "high" => Ok(AlertSeverity::High),
        "critical" => Ok(AlertSeverity::Critical),
        other => Err(StorageError::Backend(format!("unknown alert severity {other:?}"))),
    }
}

fn status_tag(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Active => "active",
        AlertStatus::Acknowledged => "acknowledged",
        AlertStatus::Resolved => "resolved",
    }
}

fn parse_status(raw: &str) -> StorageResult<AlertStatus> {
    match raw {
        "active" => Ok(AlertStatus::Active),
        "acknowledged" => Ok(AlertStatus::Acknowledged),
        "resolved" => Ok(AlertStatus::Resolved),
        other => Err(StorageError::Backend(format!("unknown alert status {other:?}"))),
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Alert> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let destination_id: Option<String> = row.try_get("destination_id").map_err(backend_err)?;
    let alert_type: String = row.try_get("alert_type").map_err(backend_err)?;
    let severity: String = row.try_get("severity").map_err(backend_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let acknowledged_at: Option<String> = row.try_get("acknowledged_at").map_err(backend_err)?;
    let resolved_at: Option<String> = row.try_get("resolved_at").map_err(backend_err)?;

    Ok(Alert {
        id: AlertId::new(uuid::Uuid::parse_str(&id).map_err(|e| StorageError::Backend(e.to_string()))?),
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        destination_id: destination_id
            .map(DestinationId::try_new)
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        alert_type: parse_alert_type(&alert_type)?,
        severity: parse_severity(&severity)?,
        title: row.try_get("title").map_err(backend_err)?,
        description: row.try_get("description").map_err(backend_err)?,
        metadata: serde_json::from_str::<Value>(&metadata_json).unwrap_or(Value::Null),
        status: parse_status(&status)?,
        created_at: parse_timestamp(&created_at)?,
        acknowledged_by: row.try_get("acknowledged_by").map_err(backend_err)?,
        acknowledged_at: parse_optional_timestamp(acknowledged_at.as_deref())?,
        resolved_by: row.try_get("resolved_by").map_err(backend_err)?,
        resolved_at: parse_optional_timestamp(resolved_at.as_deref())?,
        notes: row.try_get("notes").map_err(backend_err)?,
        department_id: row.try_get("department_id").map_err(backend_err)?,
        team_id: row.try_get("team_id").map_err(backend_err)?,
    })
}

fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> StorageResult<AlertConfig> {
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let suppression_windows_json: String =
        row.try_get("suppression_windows_json").map_err(backend_err)?;

    Ok(AlertConfig {
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        failure_rate_threshold: row.try_get("failure_rate_threshold").map_err(backend_err)?,
        consecutive_failure_threshold: u32::try_from(
            row.try_get::<i64, _>("consecutive_failure_threshold").map_err(backend_err)?,
        )
        .unwrap_or(0),
        queue_backlog_threshold: u64::try_from(
            row.try_get::<i64, _>("queue_backlog_threshold").map_err(backend_err)?,
        )
        .unwrap_or(0),
        response_time_threshold_ms: u64::try_from(
            row.try_get::<i64, _>("response_time_threshold_ms").map_err(backend_err)?,
        )
        .unwrap_or(0),
        debounce_window_minutes: row.try_get("debounce_window_minutes").map_err(backend_err)?,
        escalation_delay_minutes: row.try_get("escalation_delay_minutes").map_err(backend_err)?,
        suppression_windows: serde_json::from_str::<Vec<SuppressionWindow>>(&suppression_windows_json)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

/// `SQLx` SQLite-backed [`AlertRepository`].
pub struct SqliteAlertRepository {
    pool: Pool<Sqlite>,
}

impl SqliteAlertRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn upsert_row(&self, alert: &Alert) -> StorageResult<()> {
        sqlx::query(sql::upsert_alert())
            .bind(alert.id.to_string())
            .bind(alert.organization_id.to_string())
            .bind(alert.destination_id.as_ref().map(ToString::to_string))
            .bind(alert_type_tag(alert.alert_type))
            .bind(severity_tag(alert.severity))
            .bind(&alert.title)
            .bind(&alert.description)
            .bind(serde_json::to_string(&alert.metadata).map_err(|e| StorageError::Backend(e.to_string()))?)
            .bind(status_tag(alert.status))
            .bind(format_timestamp(alert.created_at))
            .bind(&alert.acknowledged_by)
            .bind(alert.acknowledged_at.map(format_timestamp))
            .bind(&alert.resolved_by)
            .bind(alert.resolved_at.map(format_timestamp))
            .bind(&alert.notes)
            .bind(&alert.department_id)
            .bind(&alert.team_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn create(&self, alert: Alert) -> StorageResult<Alert> {
        self.upsert_row(&alert).await?;
        Ok(alert)
    }

    async fn get(&self, id: &AlertId) -> StorageResult<Option<Alert>> {
        let row = sqlx::query(sql::select_alert_by_id())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_alert).transpose()
    }

    async fn update(&self, alert: Alert) -> StorageResult<Alert> {
        self.upsert_row(&alert).await?;
        Ok(alert)
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        status: Option<AlertStatus>,
        alert_type: Option<AlertType>,
    ) -> StorageResult<Vec<Alert>> {
        let mut query = String::from(
            "SELECT id, organization_id, destination_id, alert_type, severity, title, description,
                    metadata_json, status, created_at, acknowledged_by, acknowledged_at,
                    resolved_by, resolved_at, notes, department_id, team_id
             FROM alerts WHERE organization_id = ?",
        );
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        if alert_type.is_some() {
            query.push_str(" AND alert_type = ?");
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query).bind(organization_id.to_string());
        if let Some(status) = status {
            q = q.bind(status_tag(status));
        }
        if let Some(alert_type) = alert_type {
            q = q.bind(alert_type_tag(alert_type));
        }

        let rows = q.fetch_all(&self.pool).await.map_err(backend_err)?;
        rows.iter().map(row_to_alert).collect()
    }
}

/// `SQLx` SQLite-backed [`AlertConfigRepository`].
pub struct SqliteAlertConfigRepository {
    pool: Pool<Sqlite>,
}

impl SqliteAlertConfigRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertConfigRepository for SqliteAlertConfigRepository {
    async fn get(&self, organization_id: &OrganizationId) -> StorageResult<Option<AlertConfig>> {
        let row = sqlx::query(sql::select_config())
            .bind(organization_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_config).transpose()
    }

    async fn upsert(&self, config: AlertConfig) -> StorageResult<AlertConfig> {
        sqlx::query(sql::upsert_config())
            .bind(config.organization_id.to_string())
            .bind(config.failure_rate_threshold)
            .bind(i64::from(config.consecutive_failure_threshold))
            .bind(config.queue_backlog_threshold as i64)
            .bind(config.response_time_threshold_ms as i64)
            .bind(config.debounce_window_minutes)
            .bind(config.escalation_delay_minutes)
            .bind(
                serde_json::to_string(&config.suppression_windows)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(config)
    }
}
