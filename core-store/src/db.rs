//! # Database Connection Pool Module
//!
//! SQLite connection pooling for the local store.
//!
//! ## Features
//!
//! - **WAL Mode**: Readers never block the single writer
//! - **Automatic Migrations**: Outbox, cursors, sync history and the farm family tables
//! - **Health Checks**: Connection validation on startup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_store::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("/data/farm.db")).await?;
//! ```
//!
//! ## Testing
//!
//! ```rust,ignore
//! let pool = create_test_pool().await?;
//! ```
//!
//! ## Write transactions
//!
//! Transactions that read before they write must be opened with
//! [`begin_write`] (`BEGIN IMMEDIATE`). A deferred transaction that has already
//! read cannot wait for another connection's write lock: SQLite answers the
//! upgrade with `SQLITE_BUSY` without consulting the busy timeout.
//!
//! Every connection to `sqlite::memory:` opens a separate database, so the test
//! pool is pinned to one connection that is never recycled. Code running against
//! it must not hold a transaction while acquiring another connection.

use crate::error::{Result, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database configuration for SQLite connection pool
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (`sqlite:<path>` or `sqlite::memory:`)
    pub database_url: String,

    pub min_connections: u32,

    pub max_connections: u32,

    /// Maximum time to wait for a connection from the pool
    pub acquire_timeout: Duration,

    /// SQLite busy timeout while another connection holds the write lock
    pub busy_timeout: Duration,

    pub max_lifetime: Option<Duration>,

    pub idle_timeout: Option<Duration>,

    /// Number of prepared statements cached per connection
    pub statement_cache_capacity: usize,
}

impl DatabaseConfig {
    /// Create a configuration for the database file at `database_path`.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        let path = database_path.into();
        let database_url = format!("sqlite:{}", path.display());

        Self {
            database_url,
            min_connections: 1,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            max_lifetime: Some(Duration::from_secs(1800)),
            idle_timeout: Some(Duration::from_secs(600)),
            statement_cache_capacity: 100,
        }
    }

    /// A single long-lived connection to a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            max_lifetime: None,
            idle_timeout: None,
            statement_cache_capacity: 100,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Create a configured SQLite connection pool, run migrations and check health.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, a migration fails or
/// the health check query fails.
pub async fn create_pool(config: DatabaseConfig) -> Result<SqlitePool> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Creating database connection pool"
    );

    let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout)
        .statement_cache_capacity(config.statement_cache_capacity);

    let pool = SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to create connection pool");
            StoreError::Database(e)
        })?;

    run_migrations(&pool).await?;
    health_check(&pool).await?;

    info!(connections = pool.size(), "Database ready");
    Ok(pool)
}

/// In-memory pool with migrations applied.
pub async fn create_test_pool() -> Result<SqlitePool> {
    create_pool(DatabaseConfig::in_memory()).await
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    debug!("Running database migrations");

    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        warn!(error = %e, "Migration failed");
        StoreError::Migration(e.to_string())
    })?;

    Ok(())
}

/// Begin a transaction holding the database write lock from its first
/// statement. Waits up to the busy timeout while another connection writes.
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    pool.begin_with("BEGIN IMMEDIATE").await.map_err(|e| {
        warn!(error = %e, "Failed to begin write transaction");
        StoreError::Database(e)
    })
}

/// Execute a trivial query to verify the pool is usable.
pub async fn health_check(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!(error = %e, "Database health check failed");
        StoreError::Database(e)
    })?;

    debug!("Database health check passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_pool_runs_migrations() {
        let pool = create_test_pool().await.unwrap();

        for table in ["outbox", "sync_cursors", "sync_jobs", "tasks", "daily_logs", "transfers"] {
            let found: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_optional(&pool)
                    .await
                    .unwrap();
            assert!(found.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let pool = create_test_pool().await.unwrap();
        assert!(health_check(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn test_file_database_persists_between_pools() {
        let path = std::env::temp_dir().join(format!("farmsync-{}.db", uuid::Uuid::new_v4()));

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        sqlx::query("INSERT INTO sync_cursors VALUES ('d', 'task', 5, 5)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        let (ts,): (i64,) = sqlx::query_as("SELECT last_synced_at FROM sync_cursors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(ts, 5);
        pool.close().await;

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_concurrent_read_then_write_transactions_serialize() {
        let path = std::env::temp_dir().join(format!("farmsync-{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(DatabaseConfig::new(&path)).await.unwrap();
        sqlx::query("INSERT INTO sync_cursors VALUES ('d', 'task', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();

        let bump = |pool: SqlitePool| async move {
            for _ in 0..25 {
                let mut tx = begin_write(&pool).await.unwrap();
                let (ts,): (i64,) =
                    sqlx::query_as("SELECT last_synced_at FROM sync_cursors WHERE family = 'task'")
                        .fetch_one(&mut *tx)
                        .await
                        .unwrap();
                tokio::task::yield_now().await;
                sqlx::query("UPDATE sync_cursors SET last_synced_at = ? WHERE family = 'task'")
                    .bind(ts + 1)
                    .execute(&mut *tx)
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
            }
        };

        let workers: Vec<_> = (0..4).map(|_| tokio::spawn(bump(pool.clone()))).collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let (ts,): (i64,) = sqlx::query_as("SELECT last_synced_at FROM sync_cursors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(ts, 100);
        pool.close().await;

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_database_config_builder() {
        let config = DatabaseConfig::new("/data/farm.db")
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(60))
            .busy_timeout(Duration::from_secs(1))
            .statement_cache_capacity(200);

        assert_eq!(config.database_url, "sqlite:/data/farm.db");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert_eq!(config.statement_cache_capacity, 200);
        assert_eq!(DatabaseConfig::in_memory().max_connections, 1);
    }
}
