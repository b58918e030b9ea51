//! `deliverd`: a multi-tenant reliable delivery orchestrator.
//!
//! Accepts a payload, fans it out to one or more per-tenant destinations,
//! and tracks delivery through a durable priority queue with retries,
//! per-destination circuit breaking, and threshold-based alerting.

// Core modules
pub mod adapter;
pub mod alert_access_control;
pub mod alert_debouncer;
pub mod alert_manager;
pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod delivery_service;
pub mod destination_manager;
pub mod domain;
pub mod domain_types;
pub mod error;
pub mod observability;
pub mod queue_manager;
pub mod retry_manager;
pub mod rest_api;
pub mod storage;

pub use crate::adapter::*;
pub use crate::alert_access_control::*;
pub use crate::alert_debouncer::*;
pub use crate::alert_manager::*;
pub use crate::circuit_breaker::*;
pub use crate::config::*;
pub use crate::database::*;
pub use crate::delivery_service::*;
pub use crate::destination_manager::*;
pub use crate::domain::*;
pub use crate::domain_types::*;
pub use crate::error::*;
pub use crate::observability::*;
pub use crate::queue_manager::*;
pub use crate::retry_manager::*;

// Common imports, re-exported for binaries and integration tests.
pub use anyhow;
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::Duration;
pub use thiserror::Error;
pub use tracing::{debug, error, info, instrument, warn};
pub use uuid::Uuid;
