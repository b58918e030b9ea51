//! Crate-wide error types
//!
//! One broad, crate-wide error enum that every component error converts
//! into via `#[from]`, plus narrower per-component errors close to where
//! they occur.

use thiserror::Error;

/// The crate-wide error type returned at module boundaries (repositories,
/// the REST API, the delivery service).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Synchronous input validation failure. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested resource does not exist (or does not exist for the
    /// caller's tenant, which is reported identically to avoid leaking
    /// cross-tenant existence).
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's access-control role/scope does not permit the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A destination, delivery, or alert belongs to a different organization
    /// than the caller's.
    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),

    /// The durable store returned an error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// A transport adapter returned an error that does not fit the
    /// retryable/non-retryable classification (e.g. the adapter itself
    /// panicked or could not be constructed).
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Anything else: programmer errors, invariant violations, or wrapped
    /// errors from dependencies without a dedicated variant.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Maps the error to the category used for HTTP status translation in
    /// `rest_api.rs`, kept as a free function so the REST layer does not
    /// need to match on every variant itself.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::BadRequest,
            Self::NotFound(_) | Self::TenantMismatch(_) => ErrorCategory::NotFound,
            Self::AccessDenied(_) => ErrorCategory::Forbidden,
            Self::Storage(_) | Self::Adapter(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

/// Coarse category an `OrchestratorError` maps to for transport-level
/// reporting (HTTP status codes, CLI exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 400-class: the caller's request was malformed.
    BadRequest,
    /// 404-class: the resource doesn't exist, or doesn't exist for this tenant.
    NotFound,
    /// 403-class: access control denied the operation.
    Forbidden,
    /// 500-class: storage or internal failure.
    Internal,
}
