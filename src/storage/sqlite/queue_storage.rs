//! `SQLite` storage for the `delivery_queue` table.
//!
//! `dequeue_batch` is the one query here that needs a store-specific
//! feature to claim rows atomically. `SQLite` has no `UPDATE ... RETURNING`
//! form that also orders and limits in one statement, so this selects the
//! candidate rows inside a transaction and then updates them by id before
//! committing — a two-step claim that holds the transaction for the
//! duration of both statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp};
use crate::domain::{QueueItem, QueueItemMetadata, QueueItemStatus};
use crate::domain_types::{DeliveryId, DestinationId, OrganizationId, Priority, QueueItemId};
use crate::storage::{QueueRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn upsert() -> &'static str {
        "INSERT INTO delivery_queue
            (id, delivery_id, organization_id, destination_id, priority, status,
             retry_count, max_retries, next_retry_at, payload_snapshot_json,
             metadata_json, created_at, updated_at, processed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            retry_count = excluded.retry_count,
            next_retry_at = excluded.next_retry_at,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at,
            processed_at = excluded.processed_at"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT id, delivery_id, organization_id, destination_id, priority, status,
                retry_count, max_retries, next_retry_at, payload_snapshot_json,
                metadata_json, created_at, updated_at, processed_at
         FROM delivery_queue WHERE id = ?"
    }

    pub(super) fn select_ready_candidates() -> &'static str {
        "SELECT id FROM delivery_queue
         WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
         ORDER BY priority DESC, created_at ASC
         LIMIT ?"
    }

    pub(super) fn claim_by_id() -> &'static str {
        "UPDATE delivery_queue SET status = 'processing', updated_at = ?
         WHERE id = ? AND status = 'pending'"
    }

    pub(super) fn select_stuck() -> &'static str {
        "SELECT id, delivery_id, organization_id, destination_id, priority, status,
                retry_count, max_retries, next_retry_at, payload_snapshot_json,
                metadata_json, created_at, updated_at, processed_at
         FROM delivery_queue WHERE status = 'processing' AND updated_at < ?"
    }

    pub(super) fn delete_completed_older_than() -> &'static str {
        "DELETE FROM delivery_queue
         WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?"
    }

    pub(super) fn select_for_delivery() -> &'static str {
        "SELECT id, delivery_id, organization_id, destination_id, priority, status,
                retry_count, max_retries, next_retry_at, payload_snapshot_json,
                metadata_json, created_at, updated_at, processed_at
         FROM delivery_queue WHERE delivery_id = ? AND status NOT IN ('completed', 'failed', 'cancelled')"
    }

    pub(super) fn select_all_for_delivery() -> &'static str {
        "SELECT id, delivery_id, organization_id, destination_id, priority, status,
                retry_count, max_retries, next_retry_at, payload_snapshot_json,
                metadata_json, created_at, updated_at, processed_at
         FROM delivery_queue WHERE delivery_id = ?"
    }

    pub(super) fn count_by_status_for_org() -> &'static str {
        "SELECT COUNT(*) AS n FROM delivery_queue WHERE organization_id = ? AND status = ?"
    }

    pub(super) fn count_by_status_all() -> &'static str {
        "SELECT COUNT(*) AS n FROM delivery_queue WHERE status = ?"
    }

    pub(super) fn oldest_pending() -> &'static str {
        "SELECT MIN(created_at) AS oldest FROM delivery_queue
         WHERE status IN ('pending', 'processing')"
    }

    pub(super) fn oldest_pending_for_org() -> &'static str {
        "SELECT MIN(created_at) AS oldest FROM delivery_queue
         WHERE status IN ('pending', 'processing') AND organization_id = ?"
    }

    pub(super) fn select_terminal() -> &'static str {
        "SELECT id, delivery_id, organization_id, destination_id, priority, status,
                retry_count, max_retries, next_retry_at, payload_snapshot_json,
                metadata_json, created_at, updated_at, processed_at
         FROM delivery_queue WHERE status IN ('completed', 'failed')"
    }
}

fn status_tag(status: QueueItemStatus) -> &'static str {
    match status {
        QueueItemStatus::Pending => "pending",
        QueueItemStatus::Processing => "processing",
        QueueItemStatus::Completed => "completed",
        QueueItemStatus::Failed => "failed",
        QueueItemStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> StorageResult<QueueItemStatus> {
    match raw {
        "pending" => Ok(QueueItemStatus::Pending),
        "processing" => Ok(QueueItemStatus::Processing),
        "completed" => Ok(QueueItemStatus::Completed),
        "failed" => Ok(QueueItemStatus::Failed),
        "cancelled" => Ok(QueueItemStatus::Cancelled),
        other => Err(StorageError::Backend(format!("unknown queue item status {other:?}"))),
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> StorageResult<QueueItem> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let delivery_id: String = row.try_get("delivery_id").map_err(backend_err)?;
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let destination_id: String = row.try_get("destination_id").map_err(backend_err)?;
    let priority: i64 = row.try_get("priority").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at").map_err(backend_err)?;
    let payload_snapshot_json: String = row.try_get("payload_snapshot_json").map_err(backend_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(backend_err)?;
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(backend_err)?;
    let processed_at: Option<String> = row.try_get("processed_at").map_err(backend_err)?;

    Ok(QueueItem {
        id: QueueItemId::new(
            uuid::Uuid::parse_str(&id).map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        delivery_id: DeliveryId::try_new(delivery_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        destination_id: DestinationId::try_new(destination_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        priority: Priority::try_from(u8::try_from(priority).unwrap_or(0))
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        status: parse_status(&status)?,
        retry_count: u32::try_from(row.try_get::<i64, _>("retry_count").map_err(backend_err)?)
            .unwrap_or(0),
        max_retries: u32::try_from(row.try_get::<i64, _>("max_retries").map_err(backend_err)?)
            .unwrap_or(0),
        next_retry_at: parse_optional_timestamp(next_retry_at.as_deref())?,
        payload_snapshot: parse_json(&payload_snapshot_json)?,
        metadata: parse_json::<QueueItemMetadata>(&metadata_json)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        processed_at: parse_optional_timestamp(processed_at.as_deref())?,
    })
}

/// `SQLx` SQLite-backed [`QueueRepository`].
pub struct SqliteQueueRepository {
    pool: Pool<Sqlite>,
}

impl SqliteQueueRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn upsert_row(&self, item: &QueueItem) -> StorageResult<()> {
        sqlx::query(sql::upsert())
            .bind(item.id.to_string())
            .bind(item.delivery_id.to_string())
            .bind(item.organization_id.to_string())
            .bind(item.destination_id.to_string())
            .bind(i64::from(u8::from(item.priority)))
            .bind(status_tag(item.status))
            .bind(i64::from(item.retry_count))
            .bind(i64::from(item.max_retries))
            .bind(item.next_retry_at.map(format_timestamp))
            .bind(
                serde_json::to_string(&item.payload_snapshot)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .bind(
                serde_json::to_string(&item.metadata)
                    .map_err(|e| StorageError::Backend(e.to_string()))?,
            )
            .bind(format_timestamp(item.created_at))
            .bind(format_timestamp(item.updated_at))
            .bind(item.processed_at.map(format_timestamp))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn create(&self, item: QueueItem) -> StorageResult<QueueItem> {
        self.upsert_row(&item).await?;
        Ok(item)
    }

    async fn get(&self, id: &QueueItemId) -> StorageResult<Option<QueueItem>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn update(&self, item: QueueItem) -> StorageResult<QueueItem> {
        self.upsert_row(&item).await?;
        Ok(item)
    }

    async fn dequeue_batch(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<Vec<QueueItem>> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let candidate_ids: Vec<String> = sqlx::query(sql::select_ready_candidates())
            .bind(format_timestamp(now))
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(backend_err)?
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(backend_err)?;

        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let result = sqlx::query(sql::claim_by_id())
                .bind(format_timestamp(now))
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            if result.rows_affected() == 1 {
                claimed.push(id);
            }
        }

        let mut items = Vec::with_capacity(claimed.len());
        for id in &claimed {
            let row = sqlx::query(sql::select_by_id())
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend_err)?;
            items.push(row_to_item(&row)?);
        }

        tx.commit().await.map_err(backend_err)?;
        Ok(items)
    }

    async fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<QueueItem>> {
        let rows = sqlx::query(sql::select_stuck())
            .bind(format_timestamp(older_than))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn delete_completed_older_than(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(sql::delete_completed_older_than())
            .bind(format_timestamp(older_than))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    async fn list_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>> {
        let rows = sqlx::query(sql::select_for_delivery())
            .bind(delivery_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn list_all_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>> {
        let rows = sqlx::query(sql::select_all_for_delivery())
            .bind(delivery_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn count_by_status(
        &self,
        organization_id: Option<&OrganizationId>,
        status: QueueItemStatus,
    ) -> StorageResult<u64> {
        let row = if let Some(org) = organization_id {
            sqlx::query(sql::count_by_status_for_org())
                .bind(org.to_string())
                .bind(status_tag(status))
                .fetch_one(&self.pool)
                .await
        } else {
            sqlx::query(sql::count_by_status_all())
                .bind(status_tag(status))
                .fetch_one(&self.pool)
                .await
        }
        .map_err(backend_err)?;
        let n: i64 = row.try_get("n").map_err(backend_err)?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn oldest_pending_age(&self, now: DateTime<Utc>) -> StorageResult<Option<std::time::Duration>> {
        let row = sqlx::query(sql::oldest_pending())
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let oldest: Option<String> = row.try_get("oldest").map_err(backend_err)?;
        oldest
            .map(|raw| {
                let ts = parse_timestamp(&raw)?;
                Ok((now - ts).to_std().unwrap_or_default())
            })
            .transpose()
    }

    async fn oldest_pending_age_for_org(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<std::time::Duration>> {
        let row = sqlx::query(sql::oldest_pending_for_org())
            .bind(organization_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let oldest: Option<String> = row.try_get("oldest").map_err(backend_err)?;
        oldest
            .map(|raw| {
                let ts = parse_timestamp(&raw)?;
                Ok((now - ts).to_std().unwrap_or_default())
            })
            .transpose()
    }

    async fn list_terminal(&self) -> StorageResult<Vec<QueueItem>> {
        let rows = sqlx::query(sql::select_terminal())
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_item).collect()
    }
}
