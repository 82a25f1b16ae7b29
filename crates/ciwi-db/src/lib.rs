//! SQLite store for ciwi.
//!
//! One file holds every durable entity. Writers take [`Database::write_lock`]
//! before opening a transaction so that read-modify-write sequences (leasing,
//! status updates, maintenance) are serialized against each other.

pub mod repositories;

pub use repositories::*;

use chrono::{DateTime, Utc};
use ciwi_core::{Error, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Database connection pool plus the process-wide write guard.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(db_err)?;

        tracing::debug!(path = %path.display(), "opened sqlite database");

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Open the database and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::connect(path).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Acquire the write guard. Hold it for the whole transaction.
    pub async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Database(ref inner) if inner.is_unique_violation() => {
            Error::invalid(format!("duplicate entry: {}", inner.message()))
        }
        other => Error::Database(other.to_string()),
    }
}

pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    /// Fresh migrated database in a temporary directory. Keep the
    /// directory alive for the duration of the test.
    pub async fn temp_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Database::open(dir.path().join("ciwi.db"))
            .await
            .expect("open database");
        (db, dir)
    }
}
