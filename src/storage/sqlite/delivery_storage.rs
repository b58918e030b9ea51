//! `SQLite` storage for the `delivery_logs` table.

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_json, parse_timestamp};
use crate::domain::{DeliveryDestinationState, DeliveryLog, DeliveryStatus, Payload};
use crate::domain_types::{CorrelationId, DeliveryId, IdempotencyKey, OrganizationId};
use crate::storage::{DeliveryListFilter, DeliveryLogRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn upsert() -> &'static str {
        "INSERT INTO delivery_logs
            (id, organization_id, payload_json, status, destinations_json,
             correlation_id, idempotency_key, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            destinations_json = excluded.destinations_json,
            updated_at = excluded.updated_at"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT id, organization_id, payload_json, status, destinations_json,
                correlation_id, idempotency_key, created_at, updated_at
         FROM delivery_logs WHERE id = ?"
    }
}

fn status_tag(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Queued => "queued",
        DeliveryStatus::Processing => "processing",
        DeliveryStatus::Completed => "completed",
        DeliveryStatus::Partial => "partial",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Cancelled => "cancelled",
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> StorageResult<DeliveryLog> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let payload_json: String = row.try_get("payload_json").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    let destinations_json: String = row.try_get("destinations_json").map_err(backend_err)?;
    let correlation_id: Option<String> = row.try_get("correlation_id").map_err(backend_err)?;
    let idempotency_key: String = row.try_get("idempotency_key").map_err(backend_err)?;
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(backend_err)?;

    Ok(DeliveryLog {
        id: DeliveryId::try_new(id).map_err(|e| StorageError::Backend(e.to_string()))?,
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        payload: parse_json::<Payload>(&payload_json)?,
        status: parse_status(&status)?,
        destinations: parse_json::<Vec<DeliveryDestinationState>>(&destinations_json)?,
        correlation_id: correlation_id
            .map(CorrelationId::try_new)
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        idempotency_key: IdempotencyKey::try_new(idempotency_key)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_status(raw: &str) -> StorageResult<DeliveryStatus> {
    match raw {
        "queued" => Ok(DeliveryStatus::Queued),
        "processing" => Ok(DeliveryStatus::Processing),
        "completed" => Ok(DeliveryStatus::Completed),
        "partial" => Ok(DeliveryStatus::Partial),
        "failed" => Ok(DeliveryStatus::Failed),
        "cancelled" => Ok(DeliveryStatus::Cancelled),
        other => Err(StorageError::Backend(format!("unknown delivery status {other:?}"))),
    }
}

/// `SQLx` SQLite-backed [`DeliveryLogRepository`].
pub struct SqliteDeliveryLogRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDeliveryLogRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn upsert_row(&self, log: &DeliveryLog) -> StorageResult<()> {
        sqlx::query(sql::upsert())
            .bind(log.id.to_string())
            .bind(log.organization_id.to_string())
            .bind(serde_json::to_string(&log.payload).map_err(|e| StorageError::Backend(e.to_string()))?)
            .bind(status_tag(log.status))
            .bind(
                serde_json::to_string(&log.destinations)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .bind(log.correlation_id.as_ref().map(ToString::to_string))
            .bind(log.idempotency_key.to_string())
            .bind(format_timestamp(log.created_at))
            .bind(format_timestamp(log.updated_at))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogRepository for SqliteDeliveryLogRepository {
    async fn create(&self, log: DeliveryLog) -> StorageResult<DeliveryLog> {
        self.upsert_row(&log).await?;
        Ok(log)
    }

    async fn get(&self, id: &DeliveryId) -> StorageResult<Option<DeliveryLog>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_log).transpose()
    }

    async fn update(&self, log: DeliveryLog) -> StorageResult<DeliveryLog> {
        self.upsert_row(&log).await?;
        Ok(log)
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DeliveryListFilter,
    ) -> StorageResult<Vec<DeliveryLog>> {
        let mut query = String::from(
            "SELECT id, organization_id, payload_json, status, destinations_json,
                    correlation_id, idempotency_key, created_at, updated_at
             FROM delivery_logs WHERE organization_id = ?",
        );
        if filter.since.is_some() {
            query.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            query.push_str(" AND created_at <= ?");
        }
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query).bind(organization_id.to_string());
        if let Some(since) = filter.since {
            q = q.bind(format_timestamp(since));
        }
        if let Some(until) = filter.until {
            q = q.bind(format_timestamp(until));
        }
        if let Some(status) = filter.status {
            q = q.bind(status_tag(status));
        }
        let limit = if filter.limit == 0 { i64::MAX } else { i64::from(filter.limit) };
        q = q.bind(limit).bind(i64::from(filter.offset));

        let rows = q.fetch_all(&self.pool).await.map_err(backend_err)?;
        rows.iter().map(row_to_log).collect()
    }
}
