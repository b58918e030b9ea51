//! HTTP surface over [`crate::config::Container`].
//!
//! Every handler accepts and returns wire DTOs distinct from the domain
//! types they wrap, following the `parse`/`From` conversion pattern: request
//! bodies validate into a domain value or reject with `400`, responses
//! `From`-convert a domain value into its wire shape. Authentication is out
//! of scope for this surface, so tenant and operator identity are derived
//! from request headers (`X-Organization-Id`, `X-User-Id`, `X-User-Role`)
//! rather than a session layer.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alert_access_control::{AlertUserContext, Role};
use crate::config::Container;
use crate::delivery_service::{DeliveryRequest, DeliveryResponse};
use crate::destination_manager::{ConnectionTestResult, CreateDestinationInput, UpdateDestinationPatch};
use crate::domain::{
    Alert, AlertConfig, AlertType, Destination, DestinationConfig, MaintenanceWindow, DeliveryLog,
    Payload,
};
use crate::domain_types::{
    CorrelationId, DeliveryId, DestinationId, MaintenanceWindowId, OrganizationId, Priority,
};
use crate::error::{ErrorCategory, OrchestratorError};
use crate::storage::{DeliveryListFilter, DestinationListFilter};

/// Shared application state handed to every handler via [`State`].
#[derive(Clone)]
struct AppState {
    container: Arc<Container>,
}

/// Builds the full route table over `container`.
#[must_use]
pub fn create_app(container: Arc<Container>) -> Router {
    let state = AppState { container };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(queue_metrics))
        .route("/deliveries", post(create_delivery).get(list_deliveries))
        .route("/deliveries/metrics", get(delivery_metrics))
        .route(
            "/deliveries/{id}",
            get(get_delivery).delete(cancel_delivery),
        )
        .route("/deliveries/{id}/retry", post(retry_delivery))
        .route("/destinations", post(create_destination).get(list_destinations))
        .route(
            "/destinations/{id}",
            get(get_destination).patch(update_destination).delete(delete_destination),
        )
        .route("/destinations/{id}/test", post(test_destination))
        .route("/destinations/{id}/disable", post(disable_destination))
        .route("/destinations/{id}/enable", post(enable_destination))
        .route("/destinations/{id}/health", get(destination_health))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/alerts/suppress", post(suppress_alert))
        .route("/alert-configs", post(configure_alert_thresholds))
        .route("/maintenance-windows", post(create_maintenance_window))
        .with_state(state)
}

/// Starts serving `create_app`'s router on `addr` until the process is
/// signalled to stop.
///
/// # Errors
///
/// Returns an error if `addr` can't be bound.
pub async fn start_server(
    addr: &str,
    container: Arc<Container>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_app(container)).await?;
    Ok(())
}

/// JSON error body returned for every non-2xx response, matching the
/// `{error, details}` shape used elsewhere in this ecosystem.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    details: Option<Value>,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.category() {
            ErrorCategory::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

/// Extracts the caller's tenant/operator identity from request headers.
/// Missing or malformed headers reject with `400` rather than defaulting to
/// an implicit tenant.
fn user_context(headers: &HeaderMap) -> Result<AlertUserContext, OrchestratorError> {
    let header = |name: &str| -> Option<String> {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };

    let organization_id = header("x-organization-id")
        .ok_or_else(|| OrchestratorError::Validation("missing X-Organization-Id header".to_string()))?;
    let organization_id = OrganizationId::try_new(organization_id)
        .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
    let user_id = header("x-user-id")
        .ok_or_else(|| OrchestratorError::Validation("missing X-User-Id header".to_string()))?;
    let role = match header("x-user-role").as_deref() {
        Some("viewer") | None => Role::Viewer,
        Some("operator") => Role::Operator,
        Some("admin") => Role::Admin,
        Some("owner") => Role::Owner,
        Some(other) => {
            return Err(OrchestratorError::Validation(format!("unknown role {other}")));
        }
    };

    Ok(AlertUserContext {
        user_id,
        organization_id,
        role,
        department_id: header("x-department-id"),
        team_id: header("x-team-id"),
    })
}

fn organization_id(headers: &HeaderMap) -> Result<OrganizationId, OrchestratorError> {
    Ok(user_context(headers)?.organization_id)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn queue_metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let snapshot = state.container.queue_manager.snapshot_metrics().await?;
    Ok(Json(snapshot_to_json(&snapshot)))
}

fn snapshot_to_json(s: &crate::queue_manager::QueueMetricsSnapshot) -> Value {
    serde_json::json!({
        "depth": s.depth,
        "processing": s.processing,
        "completed": s.completed,
        "failed": s.failed,
        "throughput": s.throughput,
    })
}

// --- Deliveries --------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateDeliveryBody {
    payload: Payload,
    destinations: Option<Vec<String>>,
    priority: Option<u8>,
    max_retries: Option<u32>,
    correlation_id: Option<String>,
}

impl CreateDeliveryBody {
    fn parse(self, organization_id: OrganizationId) -> Result<DeliveryRequest, OrchestratorError> {
        let destinations = self
            .destinations
            .map(|ids| {
                ids.into_iter()
                    .map(|id| DestinationId::try_new(id).map_err(|e| OrchestratorError::Validation(e.to_string())))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let priority = self
            .priority
            .map(Priority::try_new)
            .transpose()
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        let correlation_id = self
            .correlation_id
            .map(CorrelationId::try_new)
            .transpose()
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        Ok(DeliveryRequest {
            organization_id,
            payload: self.payload,
            destinations,
            priority,
            max_retries: self.max_retries.unwrap_or(3),
            correlation_id,
        })
    }
}

#[derive(Debug, Serialize)]
struct DeliveryResponseBody {
    delivery_id: String,
    status: crate::domain::DeliveryStatus,
}

impl From<DeliveryResponse> for DeliveryResponseBody {
    fn from(r: DeliveryResponse) -> Self {
        Self {
            delivery_id: r.delivery_id.into_inner(),
            status: r.status,
        }
    }
}

async fn create_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDeliveryBody>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let request = body.parse(organization_id)?;
    let response = state.container.delivery_service.deliver(request).await?;
    Ok((StatusCode::CREATED, Json(DeliveryResponseBody::from(response))))
}

#[derive(Debug, Deserialize, Default)]
struct ListDeliveriesQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_deliveries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListDeliveriesQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let filter = DeliveryListFilter {
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
        ..DeliveryListFilter::default()
    };
    let logs = state
        .container
        .delivery_service
        .list_deliveries(&organization_id, &filter)
        .await?;
    Ok(Json(logs))
}

async fn delivery_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let metrics = state
        .container
        .delivery_service
        .get_delivery_metrics(&organization_id, &DeliveryListFilter::default())
        .await?;
    Ok(Json(serde_json::json!({
        "total": metrics.total,
        "successful": metrics.successful,
        "failed": metrics.failed,
        "success_rate_pct": metrics.success_rate_pct,
        "avg_delivery_time_ms": metrics.avg_delivery_time.as_millis(),
    })))
}

async fn get_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeliveryLog>, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let id = parse_delivery_id(&id)?;
    let log = state
        .container
        .delivery_service
        .get_delivery_status(&id, &organization_id)
        .await?;
    Ok(Json(log))
}

async fn cancel_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeliveryLog>, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let id = parse_delivery_id(&id)?;
    let log = state
        .container
        .delivery_service
        .cancel_delivery(&id, &organization_id)
        .await?;
    Ok(Json(log))
}

async fn retry_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeliveryLog>, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let id = parse_delivery_id(&id)?;
    let log = state
        .container
        .delivery_service
        .retry_delivery(&id, &organization_id)
        .await?;
    Ok(Json(log))
}

fn parse_delivery_id(raw: &str) -> Result<DeliveryId, OrchestratorError> {
    DeliveryId::try_new(raw.to_string()).map_err(|e| OrchestratorError::Validation(e.to_string()))
}

fn parse_destination_id(raw: &str) -> Result<DestinationId, OrchestratorError> {
    DestinationId::try_new(raw.to_string()).map_err(|e| OrchestratorError::Validation(e.to_string()))
}

// --- Destinations -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateDestinationBody {
    label: String,
    description: Option<String>,
    config: DestinationConfig,
    #[serde(default)]
    is_default: bool,
}

impl CreateDestinationBody {
    fn parse(self, organization_id: OrganizationId) -> CreateDestinationInput {
        CreateDestinationInput {
            organization_id,
            label: self.label,
            description: self.description,
            config: self.config,
            is_default: self.is_default,
        }
    }
}

async fn create_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDestinationBody>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let input = body.parse(organization_id);
    let destination = state.container.destination_manager.create(input).await?;
    Ok((StatusCode::CREATED, Json(destination)))
}

#[derive(Debug, Deserialize, Default)]
struct ListDestinationsQuery {
    disabled: Option<bool>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_destinations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListDestinationsQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let filter = DestinationListFilter {
        disabled: query.disabled,
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
        ..DestinationListFilter::default()
    };
    let destinations = state.container.destination_manager.list(&organization_id, &filter).await?;
    Ok(Json(destinations))
}

async fn get_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Destination>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let destination = state
        .container
        .destination_manager
        .get(&id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("destination {id}")))?;
    Ok(Json(destination))
}

#[derive(Debug, Deserialize, Default)]
struct UpdateDestinationBody {
    label: Option<String>,
    #[serde(default)]
    description: Option<Option<String>>,
    config: Option<DestinationConfig>,
    is_default: Option<bool>,
}

impl From<UpdateDestinationBody> for UpdateDestinationPatch {
    fn from(b: UpdateDestinationBody) -> Self {
        Self {
            label: b.label,
            description: b.description,
            config: b.config,
            is_default: b.is_default,
        }
    }
}

async fn update_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDestinationBody>,
) -> Result<Json<Destination>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let destination = state
        .container
        .destination_manager
        .update(&id, body.into())
        .await?;
    Ok(Json(destination))
}

async fn delete_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    state.container.destination_manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn test_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionTestResultBody>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let result = state.container.destination_manager.test_connection(&id).await?;
    Ok(Json(result.into()))
}

#[derive(Debug, Serialize)]
struct ConnectionTestResultBody {
    success: bool,
    response_time_ms: u128,
    error: Option<String>,
}

impl From<ConnectionTestResult> for ConnectionTestResultBody {
    fn from(r: ConnectionTestResult) -> Self {
        Self {
            success: r.success,
            response_time_ms: r.response_time.as_millis(),
            error: r.error,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DisableDestinationBody {
    actor: Option<String>,
}

async fn disable_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<DisableDestinationBody>,
) -> Result<Json<Destination>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let actor = body.actor.or_else(|| actor_header(&headers)).unwrap_or_else(|| "unknown".to_string());
    let destination = state.container.destination_manager.set_disabled(&id, true, actor).await?;
    Ok(Json(destination))
}

async fn enable_destination(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Destination>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let actor = actor_header(&headers).unwrap_or_else(|| "unknown".to_string());
    let destination = state.container.destination_manager.set_disabled(&id, false, actor).await?;
    Ok(Json(destination))
}

fn actor_header(headers: &HeaderMap) -> Option<String> {
    headers.get("x-user-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn destination_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CircuitBreakerMetricsBody>, OrchestratorError> {
    let id = parse_destination_id(&id)?;
    let metrics = state.container.circuit_breaker.get_metrics(&id).await?;
    Ok(Json(metrics.into()))
}

#[derive(Debug, Serialize)]
struct CircuitBreakerMetricsBody {
    destination_id: String,
    state: crate::domain::CircuitBreakerState,
    consecutive_failures: u32,
    total_deliveries: u64,
    total_failures: u64,
    time_in_current_state_secs: u64,
}

impl From<crate::domain::CircuitBreakerMetrics> for CircuitBreakerMetricsBody {
    fn from(m: crate::domain::CircuitBreakerMetrics) -> Self {
        Self {
            destination_id: m.destination_id.into_inner(),
            state: m.state,
            consecutive_failures: m.consecutive_failures,
            total_deliveries: m.total_deliveries,
            total_failures: m.total_failures,
            time_in_current_state_secs: m.time_in_current_state.as_secs(),
        }
    }
}

// --- Alerts --------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ListAlertsQuery {
    status: Option<crate::domain::AlertStatus>,
    alert_type: Option<AlertType>,
}

async fn list_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<Alert>>, OrchestratorError> {
    let ctx = user_context(&headers)?;
    let alerts = state
        .container
        .alert_manager
        .get_alerts_for_user(&ctx, query.status, query.alert_type)
        .await?;
    Ok(Json(alerts))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Alert>, OrchestratorError> {
    let ctx = user_context(&headers)?;
    let id = parse_alert_id(&id)?;
    let alert = state.container.alert_manager.acknowledge_alert(&id, &ctx).await?;
    Ok(Json(alert))
}

#[derive(Debug, Deserialize, Default)]
struct ResolveAlertBody {
    notes: Option<String>,
}

async fn resolve_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ResolveAlertBody>,
) -> Result<Json<Alert>, OrchestratorError> {
    let ctx = user_context(&headers)?;
    let id = parse_alert_id(&id)?;
    let alert = state
        .container
        .alert_manager
        .resolve_alert(&id, &ctx, body.notes)
        .await?;
    Ok(Json(alert))
}

fn parse_alert_id(raw: &str) -> Result<crate::domain_types::AlertId, OrchestratorError> {
    let uuid = uuid::Uuid::parse_str(raw).map_err(|e| OrchestratorError::Validation(e.to_string()))?;
    Ok(crate::domain_types::AlertId::new(uuid))
}

#[derive(Debug, Deserialize)]
struct SuppressAlertBody {
    alert_type: AlertType,
    destination_id: Option<String>,
    minutes: i64,
}

async fn suppress_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SuppressAlertBody>,
) -> Result<StatusCode, OrchestratorError> {
    let ctx = user_context(&headers)?;
    let destination_id = body
        .destination_id
        .map(|id| parse_destination_id(&id))
        .transpose()?;
    state.container.alert_manager.suppress_alerts_with_auth(
        &ctx,
        body.alert_type,
        destination_id.as_ref(),
        body.minutes,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

async fn configure_alert_thresholds(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<AlertConfig>,
) -> Result<Json<AlertConfig>, OrchestratorError> {
    let organization_id = organization_id(&headers)?;
    let config = state
        .container
        .alert_manager
        .configure_alert_thresholds(&organization_id, config)
        .await?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
struct CreateMaintenanceWindowBody {
    organization_id: String,
    destination_id: Option<String>,
    start_time: chrono::DateTime<chrono::Utc>,
    end_time: chrono::DateTime<chrono::Utc>,
    timezone: String,
    reason: String,
    suppress_alert_types: Vec<AlertType>,
}

impl CreateMaintenanceWindowBody {
    fn parse(self, created_by: String) -> Result<MaintenanceWindow, OrchestratorError> {
        let organization_id = OrganizationId::try_new(self.organization_id)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
        let destination_id = self
            .destination_id
            .map(|id| parse_destination_id(&id))
            .transpose()?;
        Ok(MaintenanceWindow {
            id: MaintenanceWindowId::generate(),
            organization_id,
            destination_id,
            start_time: self.start_time,
            end_time: self.end_time,
            timezone: self.timezone,
            reason: self.reason,
            suppress_alert_types: self.suppress_alert_types,
            created_by,
        })
    }
}

async fn create_maintenance_window(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateMaintenanceWindowBody>,
) -> Result<(StatusCode, Json<MaintenanceWindow>), OrchestratorError> {
    let ctx = user_context(&headers)?;
    let window = body.parse(ctx.user_id.clone())?;
    let window = state
        .container
        .alert_manager
        .add_maintenance_window_with_auth(&ctx, window)
        .await?;
    Ok((StatusCode::CREATED, Json(window)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn user_context_requires_organization_header() {
        let headers = headers_with(&[("x-user-id", "u1")]);
        assert!(user_context(&headers).is_err());
    }

    #[test]
    fn user_context_defaults_to_viewer() {
        let headers = headers_with(&[("x-organization-id", "org1"), ("x-user-id", "u1")]);
        let ctx = user_context(&headers).unwrap();
        assert_eq!(ctx.role, Role::Viewer);
        assert_eq!(ctx.organization_id.into_inner(), "org1");
    }

    #[test]
    fn user_context_rejects_unknown_role() {
        let headers = headers_with(&[
            ("x-organization-id", "org1"),
            ("x-user-id", "u1"),
            ("x-user-role", "superuser"),
        ]);
        assert!(user_context(&headers).is_err());
    }

    #[test]
    fn orchestrator_error_category_maps_to_expected_status() {
        let response = OrchestratorError::NotFound("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = OrchestratorError::Validation("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = OrchestratorError::AccessDenied("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
