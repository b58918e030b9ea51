//! Destination entity and per-type configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain_types::{DestinationId, OrganizationId};

/// A tenant-owned delivery target with a typed, per-`type` configuration.
///
/// Invariants: `config` shape matches `destination_type`;
/// `organization_id` is immutable once created; a disabled destination is
/// never a valid delivery target (enforced by `DestinationManager`/
/// `DeliveryService`, not by this struct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Unique identifier, stable across updates.
    pub id: DestinationId,
    /// Owning tenant. Immutable.
    pub organization_id: OrganizationId,
    /// Human-readable label shown to operators.
    pub label: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Typed, per-variant configuration.
    pub config: DestinationConfig,
    /// Whether this destination is a default target for its tenant, used
    /// when a `DeliveryRequest.destinations == "default"`.
    pub is_default: bool,
    /// Soft-delete / disable flag.
    pub disabled: bool,
    /// Who disabled the destination, if disabled.
    pub disabled_by: Option<String>,
    /// When the destination was disabled, if disabled.
    pub disabled_at: Option<DateTime<Utc>>,
    /// Number of deliveries attempted against this destination.
    pub count_usage: u64,
    /// Timestamp of the most recent delivery attempt.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    /// A destination is a valid delivery target only while it is neither
    /// disabled nor soft-deleted.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        !self.disabled
    }
}

/// Discriminated union of per-type destination configuration, tagged by
/// `type` on the wire, so adapter selection and validation are total
/// functions over every variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// HTTP(S) webhook destination.
    Webhook(WebhookConfig),
    /// Email destination.
    Email(EmailConfig),
    /// Object-store destination.
    Storage(StorageConfig),
}

impl DestinationConfig {
    /// The destination type tag, used for filtering (`List({type})`) and for
    /// selecting a `TransportAdapter`.
    #[must_use]
    pub fn destination_type(&self) -> DestinationType {
        match self {
            Self::Webhook(_) => DestinationType::Webhook,
            Self::Email(_) => DestinationType::Email,
            Self::Storage(_) => DestinationType::Storage,
        }
    }
}

/// Tag enum mirroring [`DestinationConfig`]'s variants, used where only the
/// type (not the full config) is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    /// HTTP(S) webhook.
    Webhook,
    /// Email mailbox.
    Email,
    /// Object-store bucket/prefix.
    Storage,
}

/// HTTP method a webhook delivery uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
}

/// Per-destination retry override. When absent the `RetryManager`'s global
/// defaults apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfigOverride {
    /// Maximum retry attempts for this destination.
    pub max_retries: u32,
}

/// Webhook destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Target URL. Must parse with scheme `http` or `https`.
    pub url: String,
    /// HTTP method used to deliver the payload.
    pub method: HttpMethod,
    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    /// Per-attempt timeout.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Optional per-destination retry override.
    pub retry_config: Option<RetryConfigOverride>,
}

/// Email destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Optional reply-to address.
    pub reply_to: Option<String>,
    /// Subject template.
    pub subject_template: String,
}

/// Object-store destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Bucket or container name.
    pub bucket: String,
    /// Key prefix under which payloads are written.
    pub key_prefix: String,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A single validation failure from [`crate::destination_manager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `config.url`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

/// Result of [`crate::destination_manager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the destination is valid.
    pub is_valid: bool,
    /// Accumulated validation errors (empty when `is_valid`).
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    /// Builds a passing outcome with no errors.
    #[must_use]
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    /// Builds a failing outcome from the accumulated errors. Panics (in
    /// debug builds, via `debug_assert!`) if `errors` is empty, since an
    /// invalid outcome must explain itself.
    #[must_use]
    pub fn invalid(errors: Vec<ValidationError>) -> Self {
        debug_assert!(!errors.is_empty(), "invalid outcome must carry errors");
        Self {
            is_valid: false,
            errors,
        }
    }
}
