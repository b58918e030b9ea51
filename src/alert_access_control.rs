//! Role→permission map, tenant/department/team scoping, and audit-log
//! record construction for alert operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Alert;
use crate::domain_types::OrganizationId;

/// A caller's identity and scope for alert operations, threaded through the
/// `*WithAuth` variants on [`crate::alert_manager::AlertManager`].
#[derive(Debug, Clone)]
pub struct AlertUserContext {
    /// Acting user's identifier, used for audit trails and `acknowledged_by`
    /// / `resolved_by`.
    pub user_id: String,
    /// Tenant the caller belongs to.
    pub organization_id: OrganizationId,
    /// Caller's role.
    pub role: Role,
    /// Optional department scope.
    pub department_id: Option<String>,
    /// Optional team scope.
    pub team_id: Option<String>,
}

/// Alert-system roles, in ascending order of privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// `view_alerts`.
    Viewer,
    /// `view_alerts, acknowledge_alerts`.
    Operator,
    /// Operator permissions plus `resolve_alerts, configure_thresholds,
    /// manage_maintenance_windows, suppress_alerts`.
    Admin,
    /// Admin permissions plus `escalate_alerts`.
    Owner,
}

/// A single alert-system permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read alerts.
    ViewAlerts,
    /// Transition an alert to `Acknowledged`.
    AcknowledgeAlerts,
    /// Transition an alert to `Resolved`.
    ResolveAlerts,
    /// Edit an organization's [`crate::domain::AlertConfig`].
    ConfigureThresholds,
    /// Create/list/remove maintenance windows.
    ManageMaintenanceWindows,
    /// Manually suppress an alert key.
    SuppressAlerts,
    /// Manually trigger an escalation.
    EscalateAlerts,
}

impl Role {
    fn permissions(self) -> &'static [Permission] {
        use Permission::{
            AcknowledgeAlerts, ConfigureThresholds, EscalateAlerts, ManageMaintenanceWindows,
            ResolveAlerts, SuppressAlerts, ViewAlerts,
        };
        match self {
            Role::Viewer => &[ViewAlerts],
            Role::Operator => &[ViewAlerts, AcknowledgeAlerts],
            Role::Admin => &[
                ViewAlerts,
                AcknowledgeAlerts,
                ResolveAlerts,
                ConfigureThresholds,
                ManageMaintenanceWindows,
                SuppressAlerts,
            ],
            Role::Owner => &[
                ViewAlerts,
                AcknowledgeAlerts,
                ResolveAlerts,
                ConfigureThresholds,
                ManageMaintenanceWindows,
                SuppressAlerts,
                EscalateAlerts,
            ],
        }
    }

    fn has(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Result of [`AlertAccessControl::validate_alert_operation`].
#[derive(Debug, Clone)]
pub struct OperationValidation {
    /// Whether the operation is allowed.
    pub allowed: bool,
    /// Human-readable reason, set when `allowed` is `false`.
    pub reason: Option<String>,
}

/// A structured audit record, suitable for external persistence
///.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    /// Acting user.
    pub actor: String,
    /// Acting user's tenant.
    pub organization_id: OrganizationId,
    /// Operation name, e.g. `"acknowledge_alert"`.
    pub operation: String,
    /// Type of resource acted on, e.g. `"alert"`.
    pub resource_type: String,
    /// Identifier of the resource acted on.
    pub resource_id: String,
    /// Arbitrary structured detail.
    pub details: Value,
    /// When the operation occurred.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Stateless role/scope checks over alert operations. Holds no state of its
/// own; it exists as a type so call sites read `access_control.can_access(...)`
/// rather than free functions, matching how other components in this crate
/// are organized.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlertAccessControl;

impl AlertAccessControl {
    /// Builds an access control checker. Takes no dependencies: every
    /// decision is a pure function of the context and the resource.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether `ctx` may see `alert` at all: same tenant, and the
    /// department/team scopes (if the caller carries one) are empty or
    /// match.
    #[must_use]
    pub fn can_access_alert(&self, ctx: &AlertUserContext, alert: &Alert) -> bool {
        if ctx.organization_id != alert.organization_id {
            return false;
        }
        if let Some(dept) = &ctx.department_id {
            if let Some(alert_dept) = &alert.department_id {
                if dept != alert_dept {
                    return false;
                }
            }
        }
        if let Some(team) = &ctx.team_id {
            if let Some(alert_team) = &alert.team_id {
                if team != alert_team {
                    return false;
                }
            }
        }
        true
    }

    /// Raises if `ctx`'s tenant doesn't match `organization_id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::OrchestratorError::AccessDenied`] on mismatch.
    pub fn prevent_cross_organization_access(
        &self,
        ctx: &AlertUserContext,
        organization_id: &OrganizationId,
    ) -> crate::error::Result<()> {
        if &ctx.organization_id != organization_id {
            return Err(crate::error::OrchestratorError::AccessDenied(
                "organization mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates that `ctx` is allowed to perform `permission`, optionally
    /// against a specific `alert` (checked for scope access first).
    #[must_use]
    pub fn validate_alert_operation(
        &self,
        ctx: &AlertUserContext,
        permission: Permission,
        alert: Option<&Alert>,
    ) -> OperationValidation {
        if let Some(alert) = alert {
            if !self.can_access_alert(ctx, alert) {
                return OperationValidation {
                    allowed: false,
                    reason: Some("alert is out of scope for this user".to_string()),
                };
            }
        }
        if !ctx.role.has(permission) {
            return OperationValidation {
                allowed: false,
                reason: Some(format!("role {:?} lacks required permission", ctx.role)),
            };
        }
        OperationValidation {
            allowed: true,
            reason: None,
        }
    }

    /// Strips `internal_metadata`/`system_details` keys from `alert.metadata`
    /// for non-admin roles, and returns `None` entirely for a cross-tenant
    /// caller.
    #[must_use]
    pub fn sanitize_alert_for_user(&self, ctx: &AlertUserContext, alert: &Alert) -> Option<Alert> {
        if ctx.organization_id != alert.organization_id {
            return None;
        }
        let mut sanitized = alert.clone();
        if !matches!(ctx.role, Role::Admin | Role::Owner) {
            if let Value::Object(map) = &mut sanitized.metadata {
                map.remove("internal_metadata");
                map.remove("system_details");
            }
        }
        Some(sanitized)
    }

    /// Builds a structured audit record for `operation` performed by `ctx`
    /// against `resource_id`.
    #[must_use]
    pub fn create_audit_log_entry(
        &self,
        ctx: &AlertUserContext,
        operation: &str,
        resource_type: &str,
        resource_id: &str,
        details: Value,
    ) -> AuditLogEntry {
        AuditLogEntry {
            actor: ctx.user_id.clone(),
            organization_id: ctx.organization_id.clone(),
            operation: operation.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            details,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertSeverity, AlertStatus, AlertType};
    use crate::domain_types::AlertId;
    use serde_json::json;

    fn ctx(role: Role, organization_id: &str) -> AlertUserContext {
        AlertUserContext {
            user_id: "user-1".to_string(),
            organization_id: OrganizationId::try_new(organization_id.to_string()).unwrap(),
            role,
            department_id: None,
            team_id: None,
        }
    }

    fn alert(organization_id: &str) -> Alert {
        Alert {
            id: AlertId::generate(),
            organization_id: OrganizationId::try_new(organization_id.to_string()).unwrap(),
            destination_id: None,
            alert_type: AlertType::QueueBacklog,
            severity: AlertSeverity::Medium,
            title: "backlog".to_string(),
            description: "queue backlog".to_string(),
            metadata: json!({"internal_metadata": "secret", "observed": 42}),
            status: AlertStatus::Active,
            created_at: chrono::Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            department_id: None,
            team_id: None,
        }
    }

    #[test]
    fn viewer_cannot_acknowledge() {
        let access = AlertAccessControl::new();
        let ctx = ctx(Role::Viewer, "org1");
        let validation =
            access.validate_alert_operation(&ctx, Permission::AcknowledgeAlerts, Some(&alert("org1")));
        assert!(!validation.allowed);
    }

    #[test]
    fn cross_tenant_access_denied() {
        let access = AlertAccessControl::new();
        let ctx = ctx(Role::Owner, "org1");
        assert!(!access.can_access_alert(&ctx, &alert("org2")));
    }

    #[test]
    fn sanitize_strips_internal_metadata_for_operator() {
        let access = AlertAccessControl::new();
        let ctx = ctx(Role::Operator, "org1");
        let sanitized = access.sanitize_alert_for_user(&ctx, &alert("org1")).unwrap();
        assert!(sanitized.metadata.get("internal_metadata").is_none());
        assert!(sanitized.metadata.get("observed").is_some());
    }

    #[test]
    fn sanitize_keeps_internal_metadata_for_admin() {
        let access = AlertAccessControl::new();
        let ctx = ctx(Role::Admin, "org1");
        let sanitized = access.sanitize_alert_for_user(&ctx, &alert("org1")).unwrap();
        assert!(sanitized.metadata.get("internal_metadata").is_some());
    }

    #[test]
    fn sanitize_returns_none_cross_tenant() {
        let access = AlertAccessControl::new();
        let ctx = ctx(Role::Admin, "org1");
        assert!(access.sanitize_alert_for_user(&ctx, &alert("org2")).is_none());
    }
}
