//! In-memory repository fakes, used by every component's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

use super::{
    AlertConfigRepository, AlertRepository, DeliveryListFilter, DeliveryLogRepository,
    DestinationHealthRepository, DestinationListFilter, DestinationRepository,
    MaintenanceWindowRepository, QueueRepository, StorageError, StorageResult,
};
use crate::domain::{
    Alert, AlertConfig, AlertStatus, AlertType, DeliveryLog, Destination, DestinationHealth,
    MaintenanceWindow, QueueItem, QueueItemStatus,
};
use crate::domain_types::{
    AlertId, DeliveryId, DestinationId, MaintenanceWindowId, OrganizationId, QueueItemId,
};

/// In-memory [`DestinationRepository`].
#[derive(Default)]
pub struct InMemoryDestinationRepository {
    rows: DashMap<DestinationId, Destination>,
}

#[async_trait]
impl DestinationRepository for InMemoryDestinationRepository {
    async fn create(&self, destination: Destination) -> StorageResult<Destination> {
        self.rows.insert(destination.id.clone(), destination.clone());
        Ok(destination)
    }

    async fn get(&self, id: &DestinationId) -> StorageResult<Option<Destination>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn update(&self, destination: Destination) -> StorageResult<Destination> {
        if !self.rows.contains_key(&destination.id) {
            return Err(StorageError::NotFound);
        }
        self.rows.insert(destination.id.clone(), destination.clone());
        Ok(destination)
    }

    async fn delete(&self, id: &DestinationId) -> StorageResult<()> {
        if let Some(mut entry) = self.rows.get_mut(id) {
            entry.disabled = true;
        }
        Ok(())
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DestinationListFilter,
    ) -> StorageResult<Vec<Destination>> {
        let mut rows: Vec<Destination> = self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|d| &d.organization_id == organization_id)
            .filter(|d| {
                filter
                    .destination_type
                    .is_none_or(|t| d.config.destination_type() == t)
            })
            .filter(|d| filter.disabled.is_none_or(|want| d.disabled == want))
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let offset = filter.offset as usize;
        let limit = if filter.limit == 0 { rows.len() } else { filter.limit as usize };
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_defaults(&self, organization_id: &OrganizationId) -> StorageResult<Vec<Destination>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|d| &d.organization_id == organization_id && d.is_default && !d.disabled)
            .collect())
    }

    async fn record_usage(&self, id: &DestinationId, at: DateTime<Utc>) -> StorageResult<()> {
        if let Some(mut entry) = self.rows.get_mut(id) {
            entry.count_usage += 1;
            entry.last_used_at = Some(at);
        }
        Ok(())
    }
}

/// In-memory [`DeliveryLogRepository`].
#[derive(Default)]
pub struct InMemoryDeliveryLogRepository {
    rows: DashMap<DeliveryId, DeliveryLog>,
}

#[async_trait]
impl DeliveryLogRepository for InMemoryDeliveryLogRepository {
    async fn create(&self, log: DeliveryLog) -> StorageResult<DeliveryLog> {
        self.rows.insert(log.id.clone(), log.clone());
        Ok(log)
    }

    async fn get(&self, id: &DeliveryId) -> StorageResult<Option<DeliveryLog>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn update(&self, log: DeliveryLog) -> StorageResult<DeliveryLog> {
        if !self.rows.contains_key(&log.id) {
            return Err(StorageError::NotFound);
        }
        self.rows.insert(log.id.clone(), log.clone());
        Ok(log)
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DeliveryListFilter,
    ) -> StorageResult<Vec<DeliveryLog>> {
        let mut rows: Vec<DeliveryLog> = self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|d| &d.organization_id == organization_id)
            .filter(|d| filter.since.is_none_or(|since| d.created_at >= since))
            .filter(|d| filter.until.is_none_or(|until| d.created_at <= until))
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset as usize;
        let limit = if filter.limit == 0 { rows.len() } else { filter.limit as usize };
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

/// In-memory [`QueueRepository`]. The `dequeue_batch` compare-and-swap is
/// emulated with a `Mutex` guarding the claim step, mirroring the row lock a
/// real store would take.
#[derive(Default)]
pub struct InMemoryQueueRepository {
    rows: DashMap<QueueItemId, QueueItem>,
    dequeue_lock: Mutex<()>,
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn create(&self, item: QueueItem) -> StorageResult<QueueItem> {
        self.rows.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get(&self, id: &QueueItemId) -> StorageResult<Option<QueueItem>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn update(&self, item: QueueItem) -> StorageResult<QueueItem> {
        if !self.rows.contains_key(&item.id) {
            return Err(StorageError::NotFound);
        }
        self.rows.insert(item.id, item.clone());
        Ok(item)
    }

    async fn dequeue_batch(&self, limit: u32, now: DateTime<Utc>) -> StorageResult<Vec<QueueItem>> {
        let _guard = self.dequeue_lock.lock().expect("dequeue lock poisoned");
        let mut ready: Vec<QueueItem> = self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|item| item.is_ready(now))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit as usize);

        for item in &mut ready {
            item.status = QueueItemStatus::Processing;
            item.updated_at = now;
            self.rows.insert(item.id, item.clone());
        }
        Ok(ready)
    }

    async fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<QueueItem>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|item| item.status == QueueItemStatus::Processing && item.updated_at < older_than)
            .collect())
    }

    async fn delete_completed_older_than(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let doomed: Vec<QueueItemId> = self
            .rows
            .iter()
            .filter(|r| r.value().status.is_terminal() && r.value().updated_at < older_than)
            .map(|r| *r.key())
            .collect();
        for id in &doomed {
            self.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn list_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|item| &item.delivery_id == delivery_id && !item.status.is_terminal())
            .collect())
    }

    async fn list_all_for_delivery(&self, delivery_id: &DeliveryId) -> StorageResult<Vec<QueueItem>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|item| &item.delivery_id == delivery_id)
            .collect())
    }

    async fn count_by_status(
        &self,
        organization_id: Option<&OrganizationId>,
        status: QueueItemStatus,
    ) -> StorageResult<u64> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.value().status == status)
            .filter(|r| organization_id.is_none_or(|org| &r.value().organization_id == org))
            .count() as u64)
    }

    async fn oldest_pending_age(&self, now: DateTime<Utc>) -> StorageResult<Option<std::time::Duration>> {
        let oldest = self
            .rows
            .iter()
            .filter(|r| !r.value().status.is_terminal())
            .map(|r| r.value().created_at)
            .min();
        Ok(oldest.map(|created| (now - created).to_std().unwrap_or_default()))
    }

    async fn oldest_pending_age_for_org(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<std::time::Duration>> {
        let oldest = self
            .rows
            .iter()
            .filter(|r| !r.value().status.is_terminal() && &r.value().organization_id == organization_id)
            .map(|r| r.value().created_at)
            .min();
        Ok(oldest.map(|created| (now - created).to_std().unwrap_or_default()))
    }

    async fn list_terminal(&self) -> StorageResult<Vec<QueueItem>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|item| matches!(item.status, QueueItemStatus::Completed | QueueItemStatus::Failed))
            .collect())
    }
}

/// In-memory [`DestinationHealthRepository`].
#[derive(Default)]
pub struct InMemoryDestinationHealthRepository {
    rows: DashMap<DestinationId, DestinationHealth>,
}

#[async_trait]
impl DestinationHealthRepository for InMemoryDestinationHealthRepository {
    async fn get(&self, destination_id: &DestinationId) -> StorageResult<Option<DestinationHealth>> {
        Ok(self.rows.get(destination_id).map(|r| r.clone()))
    }

    async fn upsert(&self, health: DestinationHealth) -> StorageResult<DestinationHealth> {
        self.rows.insert(health.destination_id.clone(), health.clone());
        Ok(health)
    }

    async fn list_all(&self) -> StorageResult<Vec<DestinationHealth>> {
        Ok(self.rows.iter().map(|r| r.value().clone()).collect())
    }
}

/// In-memory [`AlertRepository`].
#[derive(Default)]
pub struct InMemoryAlertRepository {
    rows: DashMap<AlertId, Alert>,
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn create(&self, alert: Alert) -> StorageResult<Alert> {
        self.rows.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn get(&self, id: &AlertId) -> StorageResult<Option<Alert>> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn update(&self, alert: Alert) -> StorageResult<Alert> {
        if !self.rows.contains_key(&alert.id) {
            return Err(StorageError::NotFound);
        }
        self.rows.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn list(
        &self,
        organization_id: &OrganizationId,
        status: Option<AlertStatus>,
        alert_type: Option<AlertType>,
    ) -> StorageResult<Vec<Alert>> {
        let mut rows: Vec<Alert> = self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|a| &a.organization_id == organization_id)
            .filter(|a| status.is_none_or(|s| a.status == s))
            .filter(|a| alert_type.is_none_or(|t| a.alert_type == t))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}

/// In-memory [`AlertConfigRepository`].
#[derive(Default)]
pub struct InMemoryAlertConfigRepository {
    rows: DashMap<OrganizationId, AlertConfig>,
}

#[async_trait]
impl AlertConfigRepository for InMemoryAlertConfigRepository {
    async fn get(&self, organization_id: &OrganizationId) -> StorageResult<Option<AlertConfig>> {
        Ok(self.rows.get(organization_id).map(|r| r.clone()))
    }

    async fn upsert(&self, config: AlertConfig) -> StorageResult<AlertConfig> {
        self.rows.insert(config.organization_id.clone(), config.clone());
        Ok(config)
    }
}

/// In-memory [`MaintenanceWindowRepository`].
#[derive(Default)]
pub struct InMemoryMaintenanceWindowRepository {
    rows: DashMap<MaintenanceWindowId, MaintenanceWindow>,
}

#[async_trait]
impl MaintenanceWindowRepository for InMemoryMaintenanceWindowRepository {
    async fn create(&self, window: MaintenanceWindow) -> StorageResult<MaintenanceWindow> {
        self.rows.insert(window.id, window.clone());
        Ok(window)
    }

    async fn delete(&self, id: &MaintenanceWindowId) -> StorageResult<()> {
        self.rows.remove(id);
        Ok(())
    }

    async fn list_active(
        &self,
        organization_id: &OrganizationId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|w| &w.organization_id == organization_id && w.is_active(now))
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let doomed: Vec<MaintenanceWindowId> = self
            .rows
            .iter()
            .filter(|r| r.value().end_time < now)
            .map(|r| *r.key())
            .collect();
        for id in &doomed {
            self.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
