//! Threshold evaluation, alert lifecycle, and the authenticated alert API
//!.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::alert_access_control::{AlertAccessControl, AlertUserContext, Permission};
use crate::alert_debouncer::AlertDebouncer;
use crate::domain::{Alert, AlertConfig, AlertSeverity, AlertStatus, AlertType};
use crate::domain_types::{AlertId, DestinationId, OrganizationId};
use crate::error::{OrchestratorError, Result};
use crate::observability::{AlertEvent, SharedObserver};
use crate::queue_manager::QueueManager;
use crate::storage::{
    AlertConfigRepository, AlertRepository, DestinationHealthRepository,
};

fn alert_type_tag(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::ConsecutiveFailures => "consecutive_failures",
        AlertType::FailureRate => "failure_rate",
        AlertType::QueueBacklog => "queue_backlog",
        AlertType::ResponseTime => "response_time",
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

/// Derives a primary alert's severity from how far `observed` has crossed
/// `threshold`. Graduated rather than constant so the escalation
/// schedule's first step (60 minutes unresolved → `medium`) is a real
/// severity change rather than a no-op.
fn severity_from_ratio(observed: f64, threshold: f64) -> AlertSeverity {
    if threshold <= 0.0 {
        return AlertSeverity::High;
    }
    let ratio = observed / threshold;
    if ratio < 1.5 {
        AlertSeverity::Low
    } else if ratio < 2.0 {
        AlertSeverity::Medium
    } else if ratio < 4.0 {
        AlertSeverity::High
    } else {
        AlertSeverity::Critical
    }
}

/// Evaluates destination health and queue depth against an organization's
/// configured thresholds, creates/escalates alerts, and exposes the
/// access-controlled `*WithAuth` operator API.
pub struct AlertManager {
    alert_repo: Arc<dyn AlertRepository>,
    alert_config_repo: Arc<dyn AlertConfigRepository>,
    health_repo: Arc<dyn DestinationHealthRepository>,
    queue_manager: Arc<QueueManager>,
    debouncer: Arc<AlertDebouncer>,
    access_control: Arc<AlertAccessControl>,
    observer: SharedObserver,
}

impl AlertManager {
    /// Builds an alert manager over its repositories and collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alert_repo: Arc<dyn AlertRepository>,
        alert_config_repo: Arc<dyn AlertConfigRepository>,
        health_repo: Arc<dyn DestinationHealthRepository>,
        queue_manager: Arc<QueueManager>,
        debouncer: Arc<AlertDebouncer>,
        access_control: Arc<AlertAccessControl>,
        observer: SharedObserver,
    ) -> Self {
        Self {
            alert_repo,
            alert_config_repo,
            health_repo,
            queue_manager,
            debouncer,
            access_control,
            observer,
        }
    }

    async fn config_for(&self, organization_id: &OrganizationId) -> Result<AlertConfig> {
        Ok(self
            .alert_config_repo
            .get(organization_id)
            .await?
            .unwrap_or_else(|| AlertConfig {
                organization_id: organization_id.clone(),
                ..AlertConfig::default()
            }))
    }

    /// Evaluates `destination_id`'s health against `organization_id`'s
    /// configured thresholds, creating (debounced) `consecutive_failures`
    /// and `failure_rate` alerts as needed. Returns every alert newly
    /// created (including escalations).
    ///
    /// # Errors
    ///
    /// Returns an error if repositories can't be read or written.
    pub async fn check_failure_thresholds(
        &self,
        destination_id: &DestinationId,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Alert>> {
        let config = self.config_for(organization_id).await?;
        let Some(health) = self.health_repo.get(destination_id).await? else {
            return Ok(Vec::new());
        };

        let mut created = Vec::new();

        if health.consecutive_failures >= config.consecutive_failure_threshold {
            if let Some(alert) = self
                .maybe_emit(
                    AlertType::ConsecutiveFailures,
                    Some(destination_id.clone()),
                    organization_id,
                    "Consecutive delivery failures".to_string(),
                    format!(
                        "{} consecutive failures, threshold {}",
                        health.consecutive_failures, config.consecutive_failure_threshold
                    ),
                    json!({
                        "threshold": config.consecutive_failure_threshold,
                        "observed": health.consecutive_failures,
                    }),
                    severity_from_ratio(
                        f64::from(health.consecutive_failures),
                        f64::from(config.consecutive_failure_threshold),
                    ),
                )
                .await?
            {
                created.extend(alert);
            }
        }

        let failure_rate_pct = health.lifetime_failure_rate() * 100.0;
        if failure_rate_pct >= config.failure_rate_threshold {
            if let Some(alert) = self
                .maybe_emit(
                    AlertType::FailureRate,
                    Some(destination_id.clone()),
                    organization_id,
                    "Elevated delivery failure rate".to_string(),
                    format!(
                        "failure rate {failure_rate_pct:.1}%, threshold {}%",
                        config.failure_rate_threshold
                    ),
                    json!({
                        "threshold": config.failure_rate_threshold,
                        "observed": failure_rate_pct,
                    }),
                    severity_from_ratio(failure_rate_pct, config.failure_rate_threshold),
                )
                .await?
            {
                created.extend(alert);
            }
        }

        if health.response_time_samples > 0
            && health.avg_response_time_ms >= config.response_time_threshold_ms as f64
        {
            if let Some(alert) = self
                .maybe_emit(
                    AlertType::ResponseTime,
                    Some(destination_id.clone()),
                    organization_id,
                    "Elevated delivery response time".to_string(),
                    format!(
                        "average response time {:.0}ms, threshold {}ms",
                        health.avg_response_time_ms, config.response_time_threshold_ms
                    ),
                    json!({
                        "threshold": config.response_time_threshold_ms,
                        "observed": health.avg_response_time_ms,
                    }),
                    severity_from_ratio(health.avg_response_time_ms, config.response_time_threshold_ms as f64),
                )
                .await?
            {
                created.extend(alert);
            }
        }

        Ok(created)
    }

    /// Evaluates `organization_id`'s pending queue depth against its
    /// configured `queue_backlog_threshold`, creating a system-wide
    /// `queue_backlog` alert (`destination_id = None`, since backlog is a
    /// property of the queue rather than any single destination) if
    /// exceeded.
    ///
    /// # Errors
    ///
    /// Returns an error if repositories can't be read or written.
    pub async fn check_queue_backlog(&self, organization_id: &OrganizationId) -> Result<Vec<Alert>> {
        let config = self.config_for(organization_id).await?;
        let stats = self.queue_manager.get_org_stats(organization_id).await?;

        if stats.queue_depth < config.queue_backlog_threshold {
            return Ok(Vec::new());
        }

        Ok(self
            .maybe_emit(
                AlertType::QueueBacklog,
                None,
                organization_id,
                "Queue backlog threshold exceeded".to_string(),
                format!(
                    "{} pending items, threshold {}",
                    stats.queue_depth, config.queue_backlog_threshold
                ),
                json!({
                    "threshold": config.queue_backlog_threshold,
                    "observed": stats.queue_depth,
                }),
                severity_from_ratio(stats.queue_depth as f64, config.queue_backlog_threshold as f64),
            )
            .await?
            .unwrap_or_default())
    }

    /// Debounce-gated alert creation, with escalation:
    /// 1. skip if the debouncer says not to send.
    /// 2. create the primary alert, at `severity`.
    /// 3. if the debouncer says to escalate, create a linked `[ESCALATED]`
    ///    alert at the next severity.
    #[allow(clippy::too_many_arguments)]
    async fn maybe_emit(
        &self,
        alert_type: AlertType,
        destination_id: Option<DestinationId>,
        organization_id: &OrganizationId,
        title: String,
        description: String,
        mut metadata: Value,
        severity: AlertSeverity,
    ) -> Result<Option<Vec<Alert>>> {
        if !self
            .debouncer
            .should_send_alert(alert_type, destination_id.as_ref(), organization_id)
            .await?
        {
            return Ok(None);
        }

        let now = chrono::Utc::now();
        let primary = Alert {
            id: AlertId::generate(),
            organization_id: organization_id.clone(),
            destination_id: destination_id.clone(),
            alert_type,
            severity,
            title,
            description,
            metadata: metadata.take(),
            status: AlertStatus::Active,
            created_at: now,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            department_id: None,
            team_id: None,
        };
        let primary = self.alert_repo.create(primary).await?;
        self.observer.on_alert(&AlertEvent {
            alert_id: primary.id,
            alert_type: alert_type_tag(primary.alert_type),
            severity: severity_tag(primary.severity),
        });
        info!(alert_id = %primary.id, alert_type = ?primary.alert_type, "alert created");

        let mut created = vec![primary.clone()];

        let decision =
            self.debouncer
                .should_escalate_alert(alert_type, destination_id.as_ref(), organization_id);
        if decision.should_escalate {
            let escalated = Alert {
                id: AlertId::generate(),
                organization_id: organization_id.clone(),
                destination_id,
                alert_type,
                severity: decision.new_severity,
                title: format!("[ESCALATED] {}", primary.title),
                description: primary.description.clone(),
                metadata: json!({ "original_alert_id": primary.id, "channels": decision.channels }),
                status: AlertStatus::Active,
                created_at: now,
                acknowledged_by: None,
                acknowledged_at: None,
                resolved_by: None,
                resolved_at: None,
                notes: None,
                department_id: None,
                team_id: None,
            };
            let escalated = self.alert_repo.create(escalated).await?;
            warn!(
                alert_id = %escalated.id,
                original_alert_id = %primary.id,
                severity = ?escalated.severity,
                "alert escalated"
            );
            self.observer.on_alert(&AlertEvent {
                alert_id: escalated.id,
                alert_type: alert_type_tag(escalated.alert_type),
                severity: severity_tag(escalated.severity),
            });
            created.push(escalated);
        }

        Ok(Some(created))
    }

    fn require(&self, ctx: &AlertUserContext, permission: Permission, alert: Option<&Alert>) -> Result<()> {
        let validation = self.access_control.validate_alert_operation(ctx, permission, alert);
        if !validation.allowed {
            return Err(OrchestratorError::AccessDenied(
                validation.reason.unwrap_or_else(|| "operation not permitted".to_string()),
            ));
        }
        Ok(())
    }

    /// Lists alerts for `ctx`'s tenant, sanitized for `ctx`'s role
    ///.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_alerts_for_user(
        &self,
        ctx: &AlertUserContext,
        status: Option<AlertStatus>,
        alert_type: Option<AlertType>,
    ) -> Result<Vec<Alert>> {
        self.require(ctx, Permission::ViewAlerts, None)?;
        let alerts = self.alert_repo.list(&ctx.organization_id, status, alert_type).await?;
        Ok(alerts
            .into_iter()
            .filter(|a| self.access_control.can_access_alert(ctx, a))
            .filter_map(|a| self.access_control.sanitize_alert_for_user(ctx, &a))
            .collect())
    }

    async fn load(&self, id: &AlertId) -> Result<Alert> {
        self.alert_repo
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("alert {id}")))
    }

    /// Acknowledges an alert on behalf of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert doesn't exist, `ctx` lacks access or
    /// permission, or the repository can't be written.
    pub async fn acknowledge_alert(&self, id: &AlertId, ctx: &AlertUserContext) -> Result<Alert> {
        let alert = self.load(id).await?;
        self.require(ctx, Permission::AcknowledgeAlerts, Some(&alert))?;
        if alert.status != AlertStatus::Active {
            return Err(OrchestratorError::Validation(format!(
                "alert {id} is {:?}, only an active alert can be acknowledged",
                alert.status
            )));
        }
        let mut alert = alert;
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(ctx.user_id.clone());
        alert.acknowledged_at = Some(chrono::Utc::now());
        Ok(self.alert_repo.update(alert).await?)
    }

    /// Resolves an alert on behalf of `ctx`, clearing its debounce state so
    /// a fresh recurrence of the same issue re-alerts immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert doesn't exist, `ctx` lacks access or
    /// permission, or the repository can't be written.
    pub async fn resolve_alert(
        &self,
        id: &AlertId,
        ctx: &AlertUserContext,
        notes: Option<String>,
    ) -> Result<Alert> {
        let alert = self.load(id).await?;
        self.require(ctx, Permission::ResolveAlerts, Some(&alert))?;
        if alert.status == AlertStatus::Resolved {
            return Err(OrchestratorError::Validation(format!("alert {id} is already resolved")));
        }
        let mut alert = alert;
        alert.status = AlertStatus::Resolved;
        alert.resolved_by = Some(ctx.user_id.clone());
        alert.resolved_at = Some(chrono::Utc::now());
        alert.notes = notes;
        let alert = self.alert_repo.update(alert).await?;
        self.debouncer.reset_debounce_state(
            alert.alert_type,
            alert.destination_id.as_ref(),
            &alert.organization_id,
        );
        Ok(alert)
    }

    /// Replaces an organization's alert thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be written.
    pub async fn configure_alert_thresholds(
        &self,
        organization_id: &OrganizationId,
        config: AlertConfig,
    ) -> Result<AlertConfig> {
        if &config.organization_id != organization_id {
            return Err(OrchestratorError::TenantMismatch(
                "config organization_id does not match target organization".to_string(),
            ));
        }
        Ok(self.alert_config_repo.upsert(config).await?)
    }

    /// Registers a maintenance window on behalf of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ctx` lacks access or permission, or the
    /// repository can't be written.
    pub async fn add_maintenance_window_with_auth(
        &self,
        ctx: &AlertUserContext,
        window: crate::domain::MaintenanceWindow,
    ) -> Result<crate::domain::MaintenanceWindow> {
        self.access_control
            .prevent_cross_organization_access(ctx, &window.organization_id)?;
        self.require(ctx, Permission::ManageMaintenanceWindows, None)?;
        self.debouncer.add_maintenance_window(window).await
    }

    /// Suppresses an alert key on behalf of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ctx` lacks the `suppress_alerts` permission.
    pub fn suppress_alerts_with_auth(
        &self,
        ctx: &AlertUserContext,
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        minutes: i64,
    ) -> Result<()> {
        self.require(ctx, Permission::SuppressAlerts, None)?;
        self.debouncer
            .suppress_alerts(alert_type, destination_id, &ctx.organization_id, minutes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_access_control::Role;
    use crate::domain::{CircuitBreakerState, DestinationHealth};
    use crate::observability::default_observer;
    use crate::storage::memory::{
        InMemoryAlertConfigRepository, InMemoryAlertRepository, InMemoryDestinationHealthRepository,
        InMemoryDestinationRepository, InMemoryMaintenanceWindowRepository, InMemoryQueueRepository,
    };
    use crate::adapter::NullAdapter;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::{AlertDebounceDefaults, CircuitBreakerConfig, QueueConfig, RetryConfig};
    use crate::retry_manager::RetryManager;

    fn org() -> OrganizationId {
        OrganizationId::try_new("org1".to_string()).unwrap()
    }

    fn ctx(role: Role) -> AlertUserContext {
        AlertUserContext {
            user_id: "user-1".to_string(),
            organization_id: org(),
            role,
            department_id: None,
            team_id: None,
        }
    }

    fn manager() -> AlertManager {
        let health_repo = Arc::new(InMemoryDestinationHealthRepository::default());
        let queue_repo = Arc::new(InMemoryQueueRepository::default());
        let destination_repo = Arc::new(InMemoryDestinationRepository::default());
        let observer = default_observer();
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            health_repo.clone(),
            CircuitBreakerConfig::default(),
            observer.clone(),
        ));
        let retry_manager = Arc::new(RetryManager::new(
            queue_repo.clone(),
            RetryConfig::default(),
            observer.clone(),
        ));
        let queue_manager = Arc::new(QueueManager::new(
            queue_repo,
            destination_repo,
            circuit_breaker,
            retry_manager,
            Arc::new(NullAdapter::default()),
            QueueConfig::default(),
            observer.clone(),
        ));
        let debouncer = Arc::new(AlertDebouncer::new(
            Arc::new(InMemoryMaintenanceWindowRepository::default()),
            AlertDebounceDefaults::default(),
        ));
        AlertManager::new(
            Arc::new(InMemoryAlertRepository::default()),
            Arc::new(InMemoryAlertConfigRepository::default()),
            health_repo,
            queue_manager,
            debouncer,
            Arc::new(AlertAccessControl::new()),
            observer,
        )
    }

    #[tokio::test]
    async fn consecutive_failures_over_threshold_creates_alert() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        health.circuit_breaker_state = CircuitBreakerState::Open;
        manager.health_repo.upsert(health).await.unwrap();

        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].alert_type, AlertType::ConsecutiveFailures);
    }

    #[test]
    fn severity_escalates_with_how_far_threshold_is_crossed() {
        assert_eq!(severity_from_ratio(5.0, 5.0), AlertSeverity::Low);
        assert_eq!(severity_from_ratio(8.0, 5.0), AlertSeverity::Medium);
        assert_eq!(severity_from_ratio(15.0, 5.0), AlertSeverity::High);
        assert_eq!(severity_from_ratio(30.0, 5.0), AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn viewer_cannot_acknowledge_alert() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        manager.health_repo.upsert(health).await.unwrap();
        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        let alert_id = created[0].id;

        let result = manager.acknowledge_alert(&alert_id, &ctx(Role::Viewer)).await;
        assert!(matches!(result, Err(OrchestratorError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn resolve_resets_debounce_state() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        manager.health_repo.upsert(health).await.unwrap();
        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        let alert_id = created[0].id;

        manager
            .resolve_alert(&alert_id, &ctx(Role::Admin), Some("fixed".to_string()))
            .await
            .unwrap();

        let second = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_twice_is_rejected() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        manager.health_repo.upsert(health).await.unwrap();
        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        let alert_id = created[0].id;

        manager.acknowledge_alert(&alert_id, &ctx(Role::Operator)).await.unwrap();
        let result = manager.acknowledge_alert(&alert_id, &ctx(Role::Operator)).await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn resolving_an_already_resolved_alert_is_rejected() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        manager.health_repo.upsert(health).await.unwrap();
        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        let alert_id = created[0].id;

        manager
            .resolve_alert(&alert_id, &ctx(Role::Admin), None)
            .await
            .unwrap();
        let result = manager.resolve_alert(&alert_id, &ctx(Role::Admin), None).await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn resolving_directly_from_active_is_permitted() {
        let manager = manager();
        let destination_id = DestinationId::generate();
        let org = org();
        let mut health = DestinationHealth::new(destination_id.clone(), chrono::Utc::now());
        health.consecutive_failures = 10;
        manager.health_repo.upsert(health).await.unwrap();
        let created = manager
            .check_failure_thresholds(&destination_id, &org)
            .await
            .unwrap();
        let alert_id = created[0].id;

        let resolved = manager
            .resolve_alert(&alert_id, &ctx(Role::Admin), None)
            .await
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
    }
}
