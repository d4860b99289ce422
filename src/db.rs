//! Database connection and schema management for the shared-status store.
//!
//! - Connection pool management
//! - WAL mode for concurrent readers
//! - Automatic migration execution

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connections wait this long before a write returns `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Connection pool wrapper backing FSA, FRA, MDB, the DEMCD queue and the
/// dup-check CRC store.
#[derive(Debug, Clone)]
pub struct AfdDb {
    pool: SqlitePool,
}

impl AfdDb {
    /// Opens (creating if absent) the status database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails, or
    /// `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing. WAL mode is not enabled
    /// for in-memory databases as it provides no benefit.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails, or
    /// `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks whether WAL mode is active.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.to_lowercase() == "wal")
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_in_memory_succeeds() {
        let db = AfdDb::new_in_memory().await;
        assert!(db.is_ok(), "failed to create in-memory database");
    }

    #[tokio::test]
    async fn migrations_create_fsa_table() {
        let db = AfdDb::new_in_memory().await.unwrap();

        let result = sqlx::query("INSERT INTO fsa_hosts (pos, host_alias) VALUES (0, 'alpha')")
            .execute(db.pool())
            .await;

        assert!(result.is_ok(), "fsa_hosts table should exist after migration");
    }

    #[tokio::test]
    async fn migrations_create_demcd_queue_table() {
        let db = AfdDb::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO demcd_queue (de_mail_privat_id, file_name, alias_name, log_time, file_size, jid)
             VALUES ('id1', 'f', 'a', 0, 0, 0)",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "demcd_queue table should exist after migration");
    }

    #[tokio::test]
    async fn with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = AfdDb::new(&db_path).await.unwrap();
        let is_wal = db.is_wal_enabled().await.unwrap();
        assert!(is_wal, "WAL mode should be enabled for file-based database");
    }

    #[tokio::test]
    async fn host_alias_is_unique() {
        let db = AfdDb::new_in_memory().await.unwrap();

        sqlx::query("INSERT INTO fsa_hosts (pos, host_alias) VALUES (0, 'alpha')")
            .execute(db.pool())
            .await
            .unwrap();

        let result = sqlx::query("INSERT INTO fsa_hosts (pos, host_alias) VALUES (1, 'alpha')")
            .execute(db.pool())
            .await;

        assert!(result.is_err(), "duplicate host_alias should be rejected");
    }

    #[tokio::test]
    async fn close_works() {
        let db = AfdDb::new_in_memory().await.unwrap();
        db.close().await;
    }
}
