//! Outbound transport adapter interface.
//!
//! The core treats every destination type as `Send`/`Probe` against this
//! trait; adapters themselves (actually talking to a webhook, mailbox, or
//! object store) are treated as external collaborators. [`WebhookAdapter`] is the
//! one concrete, network-facing implementation kept in-tree so the worker
//! loop and `TestConnection` have a real code path to exercise; email and
//! storage destinations are represented only by their config variants plus
//! [`NullAdapter`] for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::domain::destination::{Destination, DestinationConfig, HttpMethod};

/// Coarse error classification an adapter must provide so the
/// [`crate::retry_manager::RetryManager`] can decide retry eligibility
/// without understanding transport-specific error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, auth/permission failure, or other 4xx except
    /// 408/425/429 — never retried.
    NonRetryable,
    /// Timeout, connection reset, DNS failure, 408, 425, or 5xx — retried
    /// with backoff.
    Retryable,
    /// 429 with a `Retry-After`; retried, with backoff floored at
    /// `retry_after` when it's larger than the computed backoff.
    RateLimited,
}

/// An error returned by a transport adapter.
#[derive(Debug, Clone)]
pub struct AdapterError {
    /// Retry classification.
    pub class: ErrorClass,
    /// Human-readable message, surfaced as `last_error` on the delivery log.
    pub message: String,
    /// `Retry-After` duration, when the adapter's transport reported one.
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Outcome of a [`TransportAdapter::send`] call.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Opaque reference returned by the downstream system (e.g. a provider
    /// message id), recorded on the delivery log when present.
    pub cross_system_reference: Option<String>,
    /// Observed latency, used for `response_time` alert evaluation.
    pub latency: Duration,
    /// Populated when `success` is `false`.
    pub error: Option<AdapterError>,
}

/// Outcome of a [`TransportAdapter::probe`] call, used by
/// `DestinationManager::test_connection`. A successful probe does not imply
/// a real delivery would succeed.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Whether the probe succeeded.
    pub success: bool,
    /// Observed latency.
    pub latency: Duration,
    /// Populated when `success` is `false`.
    pub error: Option<AdapterError>,
}

/// The interface every destination-type-specific transport must implement.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Delivers `payload` to `destination`.
    async fn send(&self, destination: &Destination, payload: &Value) -> SendOutcome;

    /// Performs a cheap connectivity check against `destination` without
    /// attempting a real delivery.
    async fn probe(&self, destination: &Destination) -> ProbeOutcome;
}

/// Webhook transport adapter: delivers via HTTP POST/PUT, probes via an
/// empty POST to the same URL's `/test` path mirrored from
/// [`crate::domain::destination::WebhookConfig`].
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    /// Builds a new adapter backed by a shared `reqwest::Client`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for WebhookAdapter {
    async fn send(&self, destination: &Destination, payload: &Value) -> SendOutcome {
        let DestinationConfig::Webhook(cfg) = &destination.config else {
            return SendOutcome {
                success: false,
                cross_system_reference: None,
                latency: Duration::ZERO,
                error: Some(AdapterError {
                    class: ErrorClass::NonRetryable,
                    message: "webhook adapter invoked against a non-webhook destination"
                        .to_string(),
                    retry_after: None,
                }),
            };
        };

        let started = Instant::now();
        let method = match cfg.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };

        let mut request = self
            .client
            .request(method, &cfg.url)
            .timeout(cfg.timeout)
            .json(payload);
        for (name, value) in &cfg.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let latency = started.elapsed();
                let status = response.status();
                if status.is_success() {
                    SendOutcome {
                        success: true,
                        cross_system_reference: response
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                        latency,
                        error: None,
                    }
                } else {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let class = classify_http_status(status.as_u16());
                    SendOutcome {
                        success: false,
                        cross_system_reference: None,
                        latency,
                        error: Some(AdapterError {
                            class,
                            message: format!("webhook responded with status {status}"),
                            retry_after,
                        }),
                    }
                }
            }
            Err(err) => SendOutcome {
                success: false,
                cross_system_reference: None,
                latency: started.elapsed(),
                error: Some(AdapterError {
                    class: classify_reqwest_error(&err),
                    message: err.to_string(),
                    retry_after: None,
                }),
            },
        }
    }

    async fn probe(&self, destination: &Destination) -> ProbeOutcome {
        let DestinationConfig::Webhook(cfg) = &destination.config else {
            return ProbeOutcome {
                success: false,
                latency: Duration::ZERO,
                error: Some(AdapterError {
                    class: ErrorClass::NonRetryable,
                    message: "webhook adapter invoked against a non-webhook destination"
                        .to_string(),
                    retry_after: None,
                }),
            };
        };

        let started = Instant::now();
        match self
            .client
            .head(&cfg.url)
            .timeout(cfg.timeout)
            .send()
            .await
        {
            Ok(response) => ProbeOutcome {
                success: response.status().is_success() || response.status().is_redirection(),
                latency: started.elapsed(),
                error: None,
            },
            Err(err) => ProbeOutcome {
                success: false,
                latency: started.elapsed(),
                error: Some(AdapterError {
                    class: classify_reqwest_error(&err),
                    message: err.to_string(),
                    retry_after: None,
                }),
            },
        }
    }
}

/// Classifies an HTTP status code: 408/425/429 and 5xx are retryable, 429
/// specifically is rate-limited, and any other 4xx is non-retryable.
#[must_use]
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 425 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        400..=499 => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

/// Classifies a `reqwest::Error`. Timeouts, connection resets, and DNS
/// failures are all retryable transport errors; `reqwest`
/// does not report a 4xx-style "don't retry this" condition as an `Error`
/// (those arrive as non-error responses), so every transport-level error
/// here is retryable.
fn classify_reqwest_error(_err: &reqwest::Error) -> ErrorClass {
    ErrorClass::Retryable
}

/// A no-op adapter used by tests and by destination types
/// (email/storage) that have no real transport implementation in this
/// crate.
#[derive(Default)]
pub struct NullAdapter {
    /// When `false`, every `send`/`probe` call reports failure with this
    /// class.
    pub succeed: bool,
    /// Class reported on failure.
    pub failure_class: Option<ErrorClass>,
}

#[async_trait]
impl TransportAdapter for NullAdapter {
    async fn send(&self, _destination: &Destination, _payload: &Value) -> SendOutcome {
        if self.succeed {
            SendOutcome {
                success: true,
                cross_system_reference: None,
                latency: Duration::from_millis(1),
                error: None,
            }
        } else {
            SendOutcome {
                success: false,
                cross_system_reference: None,
                latency: Duration::from_millis(1),
                error: Some(AdapterError {
                    class: self.failure_class.unwrap_or(ErrorClass::Retryable),
                    message: "null adapter configured to fail".to_string(),
                    retry_after: None,
                }),
            }
        }
    }

    async fn probe(&self, _destination: &Destination) -> ProbeOutcome {
        ProbeOutcome {
            success: self.succeed,
            latency: Duration::from_millis(1),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limited() {
        assert_eq!(classify_http_status(429), ErrorClass::RateLimited);
    }

    #[test]
    fn classifies_retryable_5xx() {
        assert_eq!(classify_http_status(503), ErrorClass::Retryable);
    }

    #[test]
    fn classifies_non_retryable_4xx() {
        assert_eq!(classify_http_status(401), ErrorClass::NonRetryable);
        assert_eq!(classify_http_status(403), ErrorClass::NonRetryable);
        assert_eq!(classify_http_status(404), ErrorClass::NonRetryable);
    }

    #[test]
    fn classifies_retryable_408_and_425() {
        assert_eq!(classify_http_status(408), ErrorClass::Retryable);
        assert_eq!(classify_http_status(425), ErrorClass::Retryable);
    }
}
