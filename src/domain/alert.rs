//! Alert, alert config, and maintenance window entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{AlertId, DestinationId, MaintenanceWindowId, OrganizationId};

/// Alert kind. `queue_backlog` (and any future system-wide kind) is reported
/// with `destination_id = None`, since it is a property of the queue rather
/// than any single destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// `health.consecutive_failures >= consecutive_failure_threshold`.
    ConsecutiveFailures,
    /// Windowed failure ratio exceeded `failure_rate_threshold`.
    FailureRate,
    /// System-wide: pending queue depth exceeded `queue_backlog_threshold`.
    QueueBacklog,
    /// Destination response time exceeded `response_time_threshold`.
    ResponseTime,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Low,
    /// Moderate; also the first escalation tier (60 minutes unresolved).
    Medium,
    /// Serious; also the second escalation tier (240 minutes unresolved).
    High,
    /// Most severe; also the third escalation tier (1440 minutes
    /// unresolved).
    Critical,
}

/// Alert lifecycle status. Transitions strictly `Active -> Acknowledged? ->
/// Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Newly created, unseen by an operator.
    Active,
    /// An operator has acknowledged the alert but not resolved it.
    Acknowledged,
    /// The underlying issue has been resolved.
    Resolved,
}

/// A persisted alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier.
    pub id: AlertId,
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// The destination this alert concerns, or `None` for a system-wide
    /// alert (e.g. `queue_backlog`).
    pub destination_id: Option<DestinationId>,
    /// The kind of threshold breach that produced this alert.
    pub alert_type: AlertType,
    /// Severity at creation (or after an escalation produced this alert).
    pub severity: AlertSeverity,
    /// Short human-readable title.
    pub title: String,
    /// Longer human-readable description.
    pub description: String,
    /// Structured metadata (threshold value, observed value,
    /// `original_alert_id` for escalations, etc.).
    #[serde(default)]
    pub metadata: Value,
    /// Current lifecycle status.
    pub status: AlertStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Who acknowledged the alert, if acknowledged.
    pub acknowledged_by: Option<String>,
    /// When the alert was acknowledged, if acknowledged.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Who resolved the alert, if resolved.
    pub resolved_by: Option<String>,
    /// When the alert was resolved, if resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes, typically attached at resolution time.
    pub notes: Option<String>,
    /// Optional department scope, used by access control.
    pub department_id: Option<String>,
    /// Optional team scope, used by access control.
    pub team_id: Option<String>,
}

/// Per-organization alert thresholds and debounce timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// Failure-rate percentage (`0.0..=100.0`) that triggers a `failure_rate`
    /// alert.
    pub failure_rate_threshold: f64,
    /// Consecutive failure count that triggers a `consecutive_failures`
    /// alert.
    pub consecutive_failure_threshold: u32,
    /// Pending queue depth that triggers a `queue_backlog` alert.
    pub queue_backlog_threshold: u64,
    /// Response time (milliseconds) that triggers a `response_time` alert.
    pub response_time_threshold_ms: u64,
    /// Debounce cooldown, in minutes.
    pub debounce_window_minutes: i64,
    /// Minutes an unresolved alert waits before the first escalation check.
    pub escalation_delay_minutes: i64,
    /// Ad hoc suppression windows layered on top of `MaintenanceWindow`s.
    #[serde(default)]
    pub suppression_windows: Vec<SuppressionWindow>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            organization_id: OrganizationId::try_new("unset".to_string())
                .expect("literal is valid"),
            failure_rate_threshold: 50.0,
            consecutive_failure_threshold: 5,
            queue_backlog_threshold: 1000,
            response_time_threshold_ms: 30_000,
            debounce_window_minutes: 30,
            escalation_delay_minutes: 60,
            suppression_windows: Vec::new(),
        }
    }
}

/// A simple ad hoc suppression window attached directly to an
/// [`AlertConfig`] (distinct from the richer, repository-backed
/// [`MaintenanceWindow`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionWindow {
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end.
    pub end: DateTime<Utc>,
    /// Alert types suppressed while this window is active.
    pub suppress_alert_types: Vec<AlertType>,
}

/// A scheduled interval during which a defined set of alert types are
/// suppressed for a tenant/destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// Unique identifier.
    pub id: MaintenanceWindowId,
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// Destination this window applies to, or `None` for all destinations.
    pub destination_id: Option<DestinationId>,
    /// Window start.
    pub start_time: DateTime<Utc>,
    /// Window end.
    pub end_time: DateTime<Utc>,
    /// IANA timezone name the window was authored in (display only; all
    /// comparisons use UTC instants).
    pub timezone: String,
    /// Human-readable reason, shown to operators.
    pub reason: String,
    /// Alert types suppressed while the window is active.
    pub suppress_alert_types: Vec<AlertType>,
    /// Who created the window.
    pub created_by: String,
}

impl MaintenanceWindow {
    /// Whether `now` falls within the window's `[start_time, end_time)`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    /// Whether this window applies to the given destination: either it's a
    /// tenant-wide window (`destination_id: None`) or it names this exact
    /// destination.
    #[must_use]
    pub fn applies_to(&self, destination_id: Option<&DestinationId>) -> bool {
        match &self.destination_id {
            None => true,
            Some(scoped) => destination_id == Some(scoped),
        }
    }
}
