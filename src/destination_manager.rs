//! Destination CRUD, validation, connectivity testing.

use std::sync::Arc;

use chrono::Utc;

use crate::adapter::TransportAdapter;
use crate::domain::{Destination, DestinationConfig, ValidationError, ValidationOutcome};
use crate::domain_types::{DestinationId, OrganizationId};
use crate::error::{OrchestratorError, Result};
use crate::storage::{DestinationListFilter, DestinationRepository};

/// Outcome of [`DestinationManager::test_connection`]. A successful probe
/// does not imply delivery would succeed.
#[derive(Debug, Clone)]
pub struct ConnectionTestResult {
    /// Whether the probe succeeded.
    pub success: bool,
    /// Observed round-trip latency.
    pub response_time: std::time::Duration,
    /// Error message, when `success` is `false`.
    pub error: Option<String>,
}

/// Input to [`DestinationManager::create`].
#[derive(Debug, Clone)]
pub struct CreateDestinationInput {
    /// Owning tenant.
    pub organization_id: OrganizationId,
    /// Human-readable label.
    pub label: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Typed, per-type configuration.
    pub config: DestinationConfig,
    /// Whether this destination should be a default target for its tenant.
    pub is_default: bool,
}

/// A patch applied by [`DestinationManager::update`]. `id`, `organization_id`,
/// and the destination's type tag are immutable and are not patchable
/// fields here.
#[derive(Debug, Clone, Default)]
pub struct UpdateDestinationPatch {
    /// New label, if changing.
    pub label: Option<String>,
    /// New description, if changing. `Some(None)` clears it.
    pub description: Option<Option<String>>,
    /// New typed config, if changing. Must keep the same destination type as
    /// the stored destination.
    pub config: Option<DestinationConfig>,
    /// New default flag, if changing.
    pub is_default: Option<bool>,
}

/// Validates destination configs, tests connectivity, and provides CRUD +
/// query operations over the `destinations` table.
pub struct DestinationManager {
    repo: Arc<dyn DestinationRepository>,
    adapter: Arc<dyn TransportAdapter>,
}

impl DestinationManager {
    /// Builds a destination manager over `repo`, using `adapter` for
    /// [`Self::test_connection`] probes.
    #[must_use]
    pub fn new(repo: Arc<dyn DestinationRepository>, adapter: Arc<dyn TransportAdapter>) -> Self {
        Self { repo, adapter }
    }

    /// Validates per-type config rules: webhook URLs must
    /// parse with scheme `http`/`https`, webhook `timeout` must be
    /// positive, and any per-destination `retry_config.max_retries` must be
    /// non-negative (enforced structurally by its `u32` type).
    #[must_use]
    pub fn validate(config: &DestinationConfig) -> ValidationOutcome {
        let mut errors = Vec::new();
        match config {
            DestinationConfig::Webhook(webhook) => {
                match reqwest::Url::parse(&webhook.url) {
                    Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
                    Ok(_) => errors.push(ValidationError {
                        field: "config.url".to_string(),
                        message: "webhook url must use the http or https scheme".to_string(),
                    }),
                    Err(_) => errors.push(ValidationError {
                        field: "config.url".to_string(),
                        message: "webhook url does not parse".to_string(),
                    }),
                }
                if webhook.timeout.is_zero() {
                    errors.push(ValidationError {
                        field: "config.timeout".to_string(),
                        message: "webhook timeout must be greater than zero".to_string(),
                    });
                }
            }
            DestinationConfig::Email(email) => {
                if email.to.is_empty() {
                    errors.push(ValidationError {
                        field: "config.to".to_string(),
                        message: "email destination requires at least one recipient".to_string(),
                    });
                }
            }
            DestinationConfig::Storage(storage) => {
                if storage.bucket.trim().is_empty() {
                    errors.push(ValidationError {
                        field: "config.bucket".to_string(),
                        message: "storage destination requires a bucket".to_string(),
                    });
                }
            }
        }

        if errors.is_empty() {
            ValidationOutcome::valid()
        } else {
            ValidationOutcome::invalid(errors)
        }
    }

    /// Creates a new destination after validating its config.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if `input.config` fails
    /// per-type validation, or a storage error if the write fails.
    pub async fn create(&self, input: CreateDestinationInput) -> Result<Destination> {
        let outcome = Self::validate(&input.config);
        if !outcome.is_valid {
            return Err(OrchestratorError::Validation(
                outcome
                    .errors
                    .into_iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }

        let now = Utc::now();
        let destination = Destination {
            id: DestinationId::generate(),
            organization_id: input.organization_id,
            label: input.label,
            description: input.description,
            config: input.config,
            is_default: input.is_default,
            disabled: false,
            disabled_by: None,
            disabled_at: None,
            count_usage: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        Ok(self.repo.create(destination).await?)
    }

    /// Fetches a destination by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be read.
    pub async fn get(&self, id: &DestinationId) -> Result<Option<Destination>> {
        Ok(self.repo.get(id).await?)
    }

    async fn load(&self, id: &DestinationId) -> Result<Destination> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("destination {id}")))
    }

    /// Applies `patch` to the destination at `id`. `id`, `organization_id`,
    /// and the destination's type tag are immutable; `patch.config` must
    /// keep the same type tag as the stored destination, or this returns a
    /// validation error.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] if `id` doesn't exist,
    /// [`OrchestratorError::Validation`] if the patch fails type or
    /// per-type validation, or a storage error otherwise.
    pub async fn update(&self, id: &DestinationId, patch: UpdateDestinationPatch) -> Result<Destination> {
        let mut destination = self.load(id).await?;

        if let Some(config) = patch.config {
            if config.destination_type() != destination.config.destination_type() {
                return Err(OrchestratorError::Validation(
                    "destination type is immutable".to_string(),
                ));
            }
            let outcome = Self::validate(&config);
            if !outcome.is_valid {
                return Err(OrchestratorError::Validation(
                    outcome
                        .errors
                        .into_iter()
                        .map(|e| format!("{}: {}", e.field, e.message))
                        .collect::<Vec<_>>()
                        .join("; "),
                ));
            }
            destination.config = config;
        }
        if let Some(label) = patch.label {
            destination.label = label;
        }
        if let Some(description) = patch.description {
            destination.description = description;
        }
        if let Some(is_default) = patch.is_default {
            destination.is_default = is_default;
        }
        destination.updated_at = Utc::now();

        Ok(self.repo.update(destination).await?)
    }

    /// Soft-deletes a destination.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be written.
    pub async fn delete(&self, id: &DestinationId) -> Result<()> {
        Ok(self.repo.delete(id).await?)
    }

    /// Disables or re-enables a destination, recording `actor` and the
    /// timestamp on disable.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] if `id` doesn't exist, or a
    /// storage error otherwise.
    pub async fn set_disabled(&self, id: &DestinationId, disabled: bool, actor: String) -> Result<Destination> {
        let mut destination = self.load(id).await?;
        destination.disabled = disabled;
        if disabled {
            destination.disabled_by = Some(actor);
            destination.disabled_at = Some(Utc::now());
        } else {
            destination.disabled_by = None;
            destination.disabled_at = None;
        }
        destination.updated_at = Utc::now();
        Ok(self.repo.update(destination).await?)
    }

    /// Lists destinations for one tenant, optionally filtered by type or
    /// disabled status.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be read.
    pub async fn list(
        &self,
        organization_id: &OrganizationId,
        filter: &DestinationListFilter,
    ) -> Result<Vec<Destination>> {
        Ok(self.repo.list(organization_id, filter).await?)
    }

    /// Returns the destinations marked default for `organization_id`, used
    /// when a `DeliveryRequest.destinations == "default"`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be read.
    pub async fn get_defaults(&self, organization_id: &OrganizationId) -> Result<Vec<Destination>> {
        Ok(self.repo.list_defaults(organization_id).await?)
    }

    /// Invokes the adapter's probe path against `destination`. Does not
    /// imply a real delivery would succeed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if `id` can't be read, or
    /// [`OrchestratorError::NotFound`] if it doesn't exist.
    pub async fn test_connection(&self, id: &DestinationId) -> Result<ConnectionTestResult> {
        let destination = self.load(id).await?;
        let outcome = self.adapter.probe(&destination).await;
        Ok(ConnectionTestResult {
            success: outcome.success,
            response_time: outcome.latency,
            error: outcome.error.map(|e| e.message),
        })
    }

    /// Increments `count_usage` and sets `last_used_at` for `id`, called by
    /// the delivery service on every fanout.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository can't be written.
    pub async fn record_usage(&self, id: &DestinationId) -> Result<()> {
        Ok(self.repo.record_usage(id, Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullAdapter;
    use crate::domain::{HttpMethod, WebhookConfig};
    use crate::storage::memory::InMemoryDestinationRepository;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn manager() -> DestinationManager {
        DestinationManager::new(
            Arc::new(InMemoryDestinationRepository::default()),
            Arc::new(NullAdapter {
                succeed: true,
                failure_class: None,
            }),
        )
    }

    fn webhook_config(url: &str) -> DestinationConfig {
        DestinationConfig::Webhook(WebhookConfig {
            url: url.to_string(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            retry_config: None,
        })
    }

    #[tokio::test]
    async fn create_rejects_invalid_url() {
        let manager = manager();
        let result = manager
            .create(CreateDestinationInput {
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                label: "bad".to_string(),
                description: None,
                config: webhook_config("not a url"),
                is_default: false,
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn create_accepts_valid_webhook() {
        let manager = manager();
        let destination = manager
            .create(CreateDestinationInput {
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                label: "ok".to_string(),
                description: None,
                config: webhook_config("https://example.invalid/hook"),
                is_default: true,
            })
            .await
            .unwrap();
        assert!(!destination.disabled);
        assert!(destination.is_default);
    }

    #[tokio::test]
    async fn update_rejects_type_change() {
        let manager = manager();
        let destination = manager
            .create(CreateDestinationInput {
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                label: "ok".to_string(),
                description: None,
                config: webhook_config("https://example.invalid/hook"),
                is_default: false,
            })
            .await
            .unwrap();

        let result = manager
            .update(
                &destination.id,
                UpdateDestinationPatch {
                    config: Some(DestinationConfig::Storage(crate::domain::StorageConfig {
                        bucket: "b".to_string(),
                        key_prefix: "p".to_string(),
                    })),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn set_disabled_records_actor_and_timestamp() {
        let manager = manager();
        let destination = manager
            .create(CreateDestinationInput {
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                label: "ok".to_string(),
                description: None,
                config: webhook_config("https://example.invalid/hook"),
                is_default: false,
            })
            .await
            .unwrap();

        let disabled = manager
            .set_disabled(&destination.id, true, "operator@example.com".to_string())
            .await
            .unwrap();
        assert!(disabled.disabled);
        assert_eq!(disabled.disabled_by.as_deref(), Some("operator@example.com"));
        assert!(disabled.disabled_at.is_some());
        assert!(!disabled.is_deliverable());
    }

    #[tokio::test]
    async fn test_connection_does_not_imply_delivery() {
        let manager = manager();
        let destination = manager
            .create(CreateDestinationInput {
                organization_id: OrganizationId::try_new("org1".to_string()).unwrap(),
                label: "ok".to_string(),
                description: None,
                config: webhook_config("https://example.invalid/hook"),
                is_default: false,
            })
            .await
            .unwrap();
        let result = manager.test_connection(&destination.id).await.unwrap();
        assert!(result.success);
    }
}
