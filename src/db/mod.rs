//! Database - shared store connection and schema bootstrap
//!
//! ## Responsibilities
//!
//! - Open the shared store pool (MySQL in production, SQLite for tests
//!   and single-host installs) through the sqlx `Any` driver
//! - Create tables and indexes idempotently

mod schema;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::time::Duration;

/// Stored timestamp representation
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Store backend, derived from the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    MySql,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Backend::MySql)
        } else if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            Err(Error::Config(format!("unsupported database url scheme: {}", url)))
        }
    }
}

/// Connected pool plus backend kind
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    backend: Backend,
}

impl Database {
    /// Connect and bootstrap the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let backend = Backend::from_url(url)?;

        let mut options = AnyPoolOptions::new().acquire_timeout(Duration::from_secs(10));
        options = if url.contains(":memory:") {
            // an in-memory SQLite database lives and dies with its one connection
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(max_connections.max(1))
        };

        let pool = options
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("connect failed: {}", e)))?;

        let db = Self { pool, backend };
        db.migrate().await?;

        tracing::info!(backend = ?backend, "Database connected");
        Ok(db)
    }

    /// In-memory SQLite store for tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    async fn migrate(&self) -> Result<()> {
        for statement in schema::statements(self.backend) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("schema bootstrap failed: {}", e)))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
