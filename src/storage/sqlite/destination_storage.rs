//! `SQLite` storage for the `destinations` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

use super::{format_timestamp, parse_json, parse_optional_timestamp, parse_timestamp};
use crate::domain::{Destination, DestinationConfig, DestinationType};
use crate::domain_types::{DestinationId, OrganizationId};
use crate::storage::{DestinationListFilter, DestinationRepository, StorageError, StorageResult};

mod sql {
    pub(super) fn upsert() -> &'static str {
        "INSERT INTO destinations
            (id, organization_id, label, description, destination_type, config_json,
             is_default, disabled, disabled_by, disabled_at, count_usage, last_used_at,
             created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            label = excluded.label,
            description = excluded.description,
            config_json = excluded.config_json,
            is_default = excluded.is_default,
            disabled = excluded.disabled,
            disabled_by = excluded.disabled_by,
            disabled_at = excluded.disabled_at,
            count_usage = excluded.count_usage,
            last_used_at = excluded.last_used_at,
            updated_at = excluded.updated_at"
    }

    pub(super) fn select_by_id() -> &'static str {
        "SELECT id, organization_id, label, description, destination_type, config_json,
                is_default, disabled, disabled_by, disabled_at, count_usage, last_used_at,
                created_at, updated_at
         FROM destinations WHERE id = ?"
    }

    pub(super) fn soft_delete() -> &'static str {
        "UPDATE destinations SET disabled = 1, updated_at = ? WHERE id = ?"
    }

    pub(super) fn record_usage() -> &'static str {
        "UPDATE destinations SET count_usage = count_usage + 1, last_used_at = ? WHERE id = ?"
    }
}

fn destination_type_tag(destination_type: DestinationType) -> &'static str {
    match destination_type {
        DestinationType::Webhook => "webhook",
        DestinationType::Email => "email",
        DestinationType::Storage => "storage",
    }
}

fn row_to_destination(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Destination> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let organization_id: String = row.try_get("organization_id").map_err(backend_err)?;
    let config_json: String = row.try_get("config_json").map_err(backend_err)?;
    let created_at: String = row.try_get("created_at").map_err(backend_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(backend_err)?;
    let disabled_at: Option<String> = row.try_get("disabled_at").map_err(backend_err)?;
    let last_used_at: Option<String> = row.try_get("last_used_at").map_err(backend_err)?;

    Ok(Destination {
        id: DestinationId::try_new(id).map_err(|e| StorageError::Backend(e.to_string()))?,
        organization_id: OrganizationId::try_new(organization_id)
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        label: row.try_get("label").map_err(backend_err)?,
        description: row.try_get("description").map_err(backend_err)?,
        config: parse_json::<DestinationConfig>(&config_json)?,
        is_default: row.try_get::<i64, _>("is_default").map_err(backend_err)? != 0,
        disabled: row.try_get::<i64, _>("disabled").map_err(backend_err)? != 0,
        disabled_by: row.try_get("disabled_by").map_err(backend_err)?,
        disabled_at: parse_optional_timestamp(disabled_at.as_deref())?,
        count_usage: row
            .try_get::<i64, _>("count_usage")
            .map_err(backend_err)? as u64,
        last_used_at: parse_optional_timestamp(last_used_at.as_deref())?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// `SQLx` SQLite-backed [`DestinationRepository`].
pub struct SqliteDestinationRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDestinationRepository {
    /// Builds a repository over the given pool.
    #[must_use]
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn upsert_row(&self, destination: &Destination) -> StorageResult<()> {
        sqlx::query(sql::upsert())
            .bind(destination.id.to_string())
            .bind(destination.organization_id.to_string())
            .bind(&destination.label)
            .bind(&destination.description)
            .bind(destination_type_tag(destination.config.destination_type()))
            .bind(serde_json::to_string(&destination.config).map_err(|e| StorageError::Backend(e.to_string()))?)
            .bind(i64::from(destination.is_default))
            .bind(i64::from(destination.disabled))
            .bind(&destination.disabled_by)
            .bind(destination.disabled_at.map(format_timestamp))
            .bind(destination.count_usage as i64)
            .bind(destination.last_used_at.map(format_timestamp))
            .bind(format_timestamp(destination.created_at))
            .bind(format_timestamp(destination.updated_at))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl DestinationRepository for SqliteDestinationRepository {
    async fn create(&self, destination: Destination) -> StorageResult<Destination> {
        self.upsert_row(&destination).await?;
        Ok(destination)
    }

    async fn get(&self, id: &DestinationId) -> StorageResult<Option<Destination>> {
        let row = sqlx::query(sql::select_by_id())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(row_to_destination).transpose()
    }

    async fn update(&self, destination: Destination) -> StorageResult<Destination> {
        self.upsert_row(&destination).await?;
        Ok(destination)
    }

    async fn delete(&self, id: &DestinationId) -> StorageResult<()> {
        sqlx::query(sql::soft_delete())
            .bind(format_timestamp(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DestinationListFilter,
    ) -> StorageResult<Vec<Destination>> {
        let mut query = String::from(
            "SELECT id, organization_id, label, description, destination_type, config_json,
                    is_default, disabled, disabled_by, disabled_at, count_usage, last_used_at,
                    created_at, updated_at
             FROM destinations WHERE organization_id = ?",
        );
        if filter.destination_type.is_some() {
            query.push_str(" AND destination_type = ?");
        }
        if filter.disabled.is_some() {
            query.push_str(" AND disabled = ?");
        }
        query.push_str(" ORDER BY created_at ASC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query).bind(organization_id.to_string());
        if let Some(t) = filter.destination_type {
            q = q.bind(destination_type_tag(t));
        }
        if let Some(d) = filter.disabled {
            q = q.bind(i64::from(d));
        }
        let limit = if filter.limit == 0 { i64::MAX } else { i64::from(filter.limit) };
        q = q.bind(limit).bind(i64::from(filter.offset));

        let rows = q.fetch_all(&self.pool).await.map_err(backend_err)?;
        rows.iter().map(row_to_destination).collect()
    }

    async fn list_defaults(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Destination>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, label, description, destination_type, config_json,
                    is_default, disabled, disabled_by, disabled_at, count_usage, last_used_at,
                    created_at, updated_at
             FROM destinations WHERE organization_id = ? AND is_default = 1 AND disabled = 0",
        )
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(row_to_destination).collect()
    }

    async fn record_usage(&self, id: &DestinationId, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query(sql::record_usage())
            .bind(format_timestamp(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
