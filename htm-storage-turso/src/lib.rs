//! # HTM Storage - Turso
//!
//! Turso/libSQL [`Store`] backend for the HTM memory engine.
//!
//! This crate provides:
//! - Connection management for local and remote Turso databases
//! - SQL schema creation with partial soft-delete indices
//! - FTS5 full-text search over node content (porter stemming)
//! - Brute-force cosine ranking over stored embeddings
//! - A polled notification table implementing the pub/sub contract across
//!   processes sharing one database
//!
//! ## Example
//!
//! ```no_run
//! use htm_storage_turso::TursoStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = TursoStore::new_local("htm.db").await?;
//! store.initialize_schema().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use htm_core::{Error, Result};
use libsql::{Builder, Connection, Database};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod fts;
pub mod schema;

mod nodes;
mod notify;
mod robots;
mod sources;
mod store_impl;
mod tags;

/// Configuration for the Turso backend.
#[derive(Debug, Clone)]
pub struct TursoConfig {
    /// Maximum retry attempts for schema statements.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// How often notification subscribers poll for new payloads.
    pub notification_poll_interval: Duration,
}

impl Default for TursoConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            notification_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Turso/libSQL storage backend.
pub struct TursoStore {
    db: Arc<Database>,
    config: TursoConfig,
}

impl TursoStore {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &str) -> Result<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| Error::Storage(format!("Failed to open local database: {e}")))?;
        Ok(Self::from_database(db))
    }

    /// Connect to a remote Turso database.
    pub async fn new_remote(url: &str, token: &str) -> Result<Self> {
        if !url.starts_with("libsql://") {
            return Err(Error::Configuration(format!(
                "remote Turso URLs must use the libsql:// protocol, got {url:?}"
            )));
        }
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to remote database: {e}")))?;
        Ok(Self::from_database(db))
    }

    /// Wrap an existing libSQL database.
    #[must_use]
    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            config: TursoConfig::default(),
        }
    }

    /// Override the backend configuration.
    #[must_use]
    pub fn with_config(mut self, config: TursoConfig) -> Self {
        self.config = config;
        self
    }

    /// Create tables, indices, the FTS5 mirror, and its triggers.
    pub async fn initialize_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        for statement in [
            schema::CREATE_NODES_TABLE,
            schema::CREATE_TAGS_TABLE,
            schema::CREATE_NODE_TAGS_TABLE,
            schema::CREATE_ROBOTS_TABLE,
            schema::CREATE_ROBOT_NODES_TABLE,
            schema::CREATE_FILE_SOURCES_TABLE,
            schema::CREATE_NOTIFICATIONS_TABLE,
        ] {
            self.execute_with_retry(&conn, statement).await?;
        }
        self.batch_with_retry(&conn, schema::CREATE_INDICES).await?;

        debug!("Initializing FTS5 schema");
        self.execute_with_retry(&conn, fts::CREATE_NODES_FTS_TABLE)
            .await?;
        self.batch_with_retry(&conn, fts::CREATE_NODES_FTS_TRIGGERS)
            .await?;

        info!("Schema initialization complete");
        Ok(())
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| Error::Storage(format!("Failed to open connection: {e}")))
    }

    pub(crate) fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    pub(crate) fn config(&self) -> &TursoConfig {
        &self.config
    }

    async fn execute_with_retry(&self, conn: &Connection, sql: &str) -> Result<()> {
        self.retry(|| async { conn.execute(sql, ()).await.map(|_| ()) })
            .await
    }

    async fn batch_with_retry(&self, conn: &Connection, sql: &str) -> Result<()> {
        self.retry(|| async { conn.execute_batch(sql).await.map(|_| ()) })
            .await
    }

    async fn retry<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), libsql::Error>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(attempt, error = %e, "schema statement failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(Error::Storage(format!("Schema statement failed: {e}"))),
            }
        }
    }
}

// ============================================================================
// Shared row helpers
// ============================================================================

pub(crate) fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| Error::Storage(format!("timestamp {value} out of range")))
}

pub(crate) fn opt_from_micros(value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(from_micros).transpose()
}

pub(crate) fn storage_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{context}: {e}"))
}
