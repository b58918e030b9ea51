//! Embedded SQLite connection management.
//!
//! Functional core / imperative shell split: pure configuration validation
//! and connect-option building on one side, pool creation and migration
//! running (actual I/O) on the other.

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::storage::StorageError;

/// Embedded migrations baked into the binary at compile time.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Database configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file, or `:memory:` for an ephemeral
    /// in-process database (used by tests).
    pub path: PathBuf,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// Whether to enable WAL mode (disabled for `:memory:`).
    pub enable_wal_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("deliverd.db"),
            max_connections: 10,
            enable_wal_mode: true,
        }
    }
}

impl DatabaseConfig {
    /// Builds a config pointing at an ephemeral in-memory database, for
    /// tests and the CLI's `--ephemeral` flag.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
            enable_wal_mode: false,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }

    /// Generates the `SQLx` connect options for this config (functional
    /// core — no I/O).
    fn connect_options(&self) -> Result<SqliteConnectOptions, StorageError> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
        };
        let mut options = options.disable_statement_logging();
        if self.enable_wal_mode && !self.is_in_memory() {
            options = options.pragma("journal_mode", "WAL");
        }
        options = options.pragma("foreign_keys", "ON");
        Ok(options)
    }
}

/// A connected, migrated database pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connects to the configured database, running any pending migrations
    /// (imperative shell).
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the parent directory can't be created,
    /// the connection pool can't be established, or a migration fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        if let Some(parent) = parent_directory(&config.path) {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| StorageError::Backend(format!("creating {}: {e}", parent.display())))?;
        }

        let options = config.connect_options()?;
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| StorageError::Backend(format!("connecting to database: {e}")))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("running migrations: {e}")))?;

        Ok(Self { pool })
    }

    /// Returns the underlying pool for use by the `storage::sqlite`
    /// repository implementations.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn parent_directory(path: &Path) -> Option<PathBuf> {
    if path.as_os_str() == ":memory:" {
        None
    } else {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}
