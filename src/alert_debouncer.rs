//! Alert cooldown, rate-limiting, maintenance-window suppression, and
//! escalation state.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::AlertDebounceDefaults;
use crate::domain::{AlertSeverity, AlertType, MaintenanceWindow};
use crate::domain_types::{DestinationId, OrganizationId};
use crate::error::Result;
use crate::storage::MaintenanceWindowRepository;

/// The key identifying one debounce/escalation state bucket:
/// `(alertType, destinationId, organizationId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    alert_type: AlertType,
    destination_id: Option<DestinationId>,
    organization_id: OrganizationId,
}

/// Per-key debounce/escalation state.
#[derive(Debug, Clone)]
struct DebounceState {
    first_sent_at: DateTime<Utc>,
    last_sent_at: DateTime<Utc>,
    window_start: DateTime<Utc>,
    alerts_in_window: u32,
    escalation_level: u32,
    suppressed_until: Option<DateTime<Utc>>,
}

/// Outcome of [`AlertDebouncer::should_escalate_alert`].
#[derive(Debug, Clone)]
pub struct EscalationDecision {
    /// Whether escalation should fire right now.
    pub should_escalate: bool,
    /// The severity the escalated alert should carry.
    pub new_severity: AlertSeverity,
    /// Notification channels the escalated alert should be routed to.
    pub channels: Vec<&'static str>,
}

/// One step of the escalation schedule: minutes since the
/// first alert in a key's lifetime, the severity to escalate to, and the
/// channels to notify.
struct EscalationStep {
    minutes: i64,
    severity: AlertSeverity,
    channels: &'static [&'static str],
}

const ESCALATION_SCHEDULE: &[EscalationStep] = &[
    EscalationStep {
        minutes: 60,
        severity: AlertSeverity::Medium,
        channels: &["email"],
    },
    EscalationStep {
        minutes: 240,
        severity: AlertSeverity::High,
        channels: &["pagerduty"],
    },
    EscalationStep {
        minutes: 1440,
        severity: AlertSeverity::Critical,
        channels: &["pagerduty", "sms"],
    },
];

/// Debounce/rate-limit/escalation state for alerting, keyed by
/// `(alertType, destinationId, organizationId)`.
///
/// In-process state is intentionally not persisted: a process restart
/// resets debounce windows, which is the conservative failure mode (a
/// missed debounce produces a duplicate alert, not a silently dropped one).
pub struct AlertDebouncer {
    window_repo: Arc<dyn MaintenanceWindowRepository>,
    defaults: AlertDebounceDefaults,
    state: DashMap<DebounceKey, DebounceState>,
}

impl AlertDebouncer {
    /// Builds a debouncer over `window_repo`, using `defaults` for any alert
    /// type without a narrower per-organization override.
    #[must_use]
    pub fn new(window_repo: Arc<dyn MaintenanceWindowRepository>, defaults: AlertDebounceDefaults) -> Self {
        Self {
            window_repo,
            defaults,
            state: DashMap::new(),
        }
    }

    fn key(
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        organization_id: &OrganizationId,
    ) -> DebounceKey {
        DebounceKey {
            alert_type,
            destination_id: destination_id.cloned(),
            organization_id: organization_id.clone(),
        }
    }

    /// Decides whether an alert of `alert_type` for `destination_id` (or
    /// `None` for a system-wide alert) should be sent, applying maintenance
    /// windows, manual suppression, cooldown, and the per-window rate limit
    /// in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if active maintenance windows can't be read.
    pub async fn should_send_alert(
        &self,
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        organization_id: &OrganizationId,
    ) -> Result<bool> {
        let now = Utc::now();

        let windows = self.window_repo.list_active(organization_id, now).await?;
        let suppressed_by_window = windows.iter().any(|w| {
            w.applies_to(destination_id) && w.suppress_alert_types.contains(&alert_type)
        });
        if suppressed_by_window {
            return Ok(false);
        }

        let key = Self::key(alert_type, destination_id, organization_id);

        match self.state.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(DebounceState {
                    first_sent_at: now,
                    last_sent_at: now,
                    window_start: now,
                    alerts_in_window: 1,
                    escalation_level: 0,
                    suppressed_until: None,
                });
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();

                if let Some(until) = existing.suppressed_until {
                    if until > now {
                        return Ok(false);
                    }
                }

                if now - existing.last_sent_at < ChronoDuration::minutes(self.defaults.cooldown_minutes) {
                    return Ok(false);
                }

                if now - existing.window_start > ChronoDuration::minutes(self.defaults.window_minutes) {
                    existing.window_start = now;
                    existing.alerts_in_window = 0;
                }

                if existing.alerts_in_window + 1 > self.defaults.max_alerts_per_window {
                    return Ok(false);
                }

                existing.alerts_in_window += 1;
                existing.last_sent_at = now;
                Ok(true)
            }
        }
    }

    /// Evaluates the escalation schedule for `(alert_type, destination_id,
    /// organization_id)` against the time since its first alert.
    ///
    /// Returns `should_escalate: false` if the key has never alerted, or if
    /// every schedule step up to the elapsed time has already fired.
    #[must_use]
    pub fn should_escalate_alert(
        &self,
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        organization_id: &OrganizationId,
    ) -> EscalationDecision {
        let key = Self::key(alert_type, destination_id, organization_id);
        let now = Utc::now();

        let Some(mut existing) = self.state.get_mut(&key) else {
            return EscalationDecision {
                should_escalate: false,
                new_severity: AlertSeverity::Low,
                channels: Vec::new(),
            };
        };

        let elapsed_minutes = (now - existing.first_sent_at).num_minutes();
        let next_step = ESCALATION_SCHEDULE.get(existing.escalation_level as usize);

        match next_step {
            Some(step) if elapsed_minutes >= step.minutes => {
                existing.escalation_level += 1;
                EscalationDecision {
                    should_escalate: true,
                    new_severity: step.severity,
                    channels: step.channels.to_vec(),
                }
            }
            _ => EscalationDecision {
                should_escalate: false,
                new_severity: AlertSeverity::Low,
                channels: Vec::new(),
            },
        }
    }

    /// Suppresses alerts of `alert_type` for `(destination_id,
    /// organization_id)` until `minutes` from now.
    pub fn suppress_alerts(
        &self,
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        organization_id: &OrganizationId,
        minutes: i64,
    ) {
        let key = Self::key(alert_type, destination_id, organization_id);
        let now = Utc::now();
        let until = now + ChronoDuration::minutes(minutes);
        self.state
            .entry(key)
            .and_modify(|s| s.suppressed_until = Some(until))
            .or_insert(DebounceState {
                first_sent_at: now,
                last_sent_at: now,
                window_start: now,
                alerts_in_window: 0,
                escalation_level: 0,
                suppressed_until: Some(until),
            });
    }

    /// Clears the debounce/escalation state for a key, called when an alert
    /// is resolved so a fresh issue can immediately re-alert.
    pub fn reset_debounce_state(
        &self,
        alert_type: AlertType,
        destination_id: Option<&DestinationId>,
        organization_id: &OrganizationId,
    ) {
        let key = Self::key(alert_type, destination_id, organization_id);
        self.state.remove(&key);
    }

    /// Registers a new maintenance window.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be written.
    pub async fn add_maintenance_window(&self, window: MaintenanceWindow) -> Result<MaintenanceWindow> {
        Ok(self.window_repo.create(window).await?)
    }

    /// Returns maintenance windows active right now for `organization_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be read.
    pub async fn get_active_maintenance_windows(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<MaintenanceWindow>> {
        Ok(self.window_repo.list_active(organization_id, Utc::now()).await?)
    }

    /// Drops expired maintenance windows and debounce state entries whose
    /// suppression has lapsed and that haven't alerted recently, keeping
    /// the in-process map from growing unboundedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository can't be written.
    pub async fn cleanup(&self) -> Result<u64> {
        let deleted = self.window_repo.delete_expired(Utc::now()).await?;
        let now = Utc::now();
        let stale_after = ChronoDuration::minutes(self.defaults.window_minutes * 4);
        self.state.retain(|_, s| now - s.last_sent_at < stale_after);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryMaintenanceWindowRepository;

    fn debouncer() -> AlertDebouncer {
        AlertDebouncer::new(
            Arc::new(InMemoryMaintenanceWindowRepository::default()),
            AlertDebounceDefaults::default(),
        )
    }

    fn org() -> OrganizationId {
        OrganizationId::try_new("org1".to_string()).unwrap()
    }

    #[tokio::test]
    async fn first_alert_is_always_permitted() {
        let debouncer = debouncer();
        let org = org();
        assert!(
            debouncer
                .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn immediate_repeat_is_debounced() {
        let debouncer = debouncer();
        let org = org();
        assert!(
            debouncer
                .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
                .await
                .unwrap()
        );
        assert!(
            !debouncer
                .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn maintenance_window_suppresses_matching_type() {
        let debouncer = debouncer();
        let org = org();
        debouncer
            .add_maintenance_window(MaintenanceWindow {
                id: crate::domain_types::MaintenanceWindowId::generate(),
                organization_id: org.clone(),
                destination_id: None,
                start_time: Utc::now() - ChronoDuration::minutes(10),
                end_time: Utc::now() + ChronoDuration::minutes(10),
                timezone: "UTC".to_string(),
                reason: "scheduled maintenance".to_string(),
                suppress_alert_types: vec![AlertType::ConsecutiveFailures],
                created_by: "operator".to_string(),
            })
            .await
            .unwrap();

        assert!(
            !debouncer
                .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
                .await
                .unwrap()
        );
        assert!(
            debouncer
                .should_send_alert(AlertType::FailureRate, None, &org)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn reset_allows_immediate_realert() {
        let debouncer = debouncer();
        let org = org();
        debouncer
            .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
            .await
            .unwrap();
        debouncer.reset_debounce_state(AlertType::ConsecutiveFailures, None, &org);
        assert!(
            debouncer
                .should_send_alert(AlertType::ConsecutiveFailures, None, &org)
                .await
                .unwrap()
        );
    }

    #[test]
    fn escalation_requires_prior_alert() {
        let debouncer = debouncer();
        let org = org();
        let decision = debouncer.should_escalate_alert(AlertType::ConsecutiveFailures, None, &org);
        assert!(!decision.should_escalate);
    }

    #[test]
    fn suppress_alerts_blocks_future_sends() {
        let debouncer = debouncer();
        let org = org();
        debouncer.suppress_alerts(AlertType::ConsecutiveFailures, None, &org, 30);
        let key = AlertDebouncer::key(AlertType::ConsecutiveFailures, None, &org);
        assert!(debouncer.state.get(&key).unwrap().suppressed_until.is_some());
    }
}
