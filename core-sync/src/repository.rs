//! # Sync Job Repository
//!
//! Persistence for sync run history.
//!
//! ## Overview
//!
//! Every run of the orchestrator is recorded as a [`SyncJob`] row, updated at
//! each phase change. The history backs status screens and lets a restarted
//! process close out runs that were interrupted by a crash.

use crate::{Result, SyncError, SyncJob, SyncJobId, SyncJobStats, SyncStatus};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for sync job persistence
#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    /// Insert a new sync job
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn insert(&self, job: &SyncJob) -> Result<()>;

    /// Update an existing sync job
    ///
    /// # Errors
    ///
    /// Returns an error if the job doesn't exist or the database operation fails
    async fn update(&self, job: &SyncJob) -> Result<()>;

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>>;

    /// Get sync jobs by status, most recent first
    async fn find_by_status(&self, status: SyncStatus) -> Result<Vec<SyncJob>>;

    /// Jobs not yet in a terminal state
    async fn find_active(&self) -> Result<Vec<SyncJob>>;

    /// Most recent jobs first
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of jobs to return
    async fn history(&self, limit: u32) -> Result<Vec<SyncJob>>;

    /// Delete a sync job
    ///
    /// # Errors
    ///
    /// Returns an error if the job doesn't exist or the database operation fails
    async fn delete(&self, id: &SyncJobId) -> Result<()>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of SyncJobRepository
pub struct SqliteSyncJobRepository {
    pool: SqlitePool,
}

impl SqliteSyncJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a sync job
#[derive(Debug, FromRow)]
struct SyncJobRow {
    id: String,
    status: String,
    pushed_count: i64,
    pulled_count: i64,
    conflict_count: i64,
    failure_count: i64,
    error_message: Option<String>,
    error_details: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: SyncJobRow) -> Result<Self> {
        let count = |v: i64| u64::try_from(v).unwrap_or(0);

        Ok(SyncJob {
            id: SyncJobId::from_string(&row.id)?,
            status: row.status.parse()?,
            stats: SyncJobStats {
                pushed: count(row.pushed_count),
                pulled: count(row.pulled_count),
                conflicts: count(row.conflict_count),
                failures: count(row.failure_count),
            },
            error_message: row.error_message,
            error_details: row.error_details,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, status, pushed_count, pulled_count, conflict_count, failure_count, \
     error_message, error_details, started_at, completed_at, created_at, updated_at";

fn count_param(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[async_trait]
impl SyncJobRepository for SqliteSyncJobRepository {
    async fn insert(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, status, pushed_count, pulled_count, conflict_count, failure_count,
                error_message, error_details, started_at, completed_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.status.as_str())
        .bind(count_param(job.stats.pushed))
        .bind(count_param(job.stats.pulled))
        .bind(count_param(job.stats.conflicts))
        .bind(count_param(job.stats.failures))
        .bind(&job.error_message)
        .bind(&job.error_details)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, job: &SyncJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                status = ?,
                pushed_count = ?,
                pulled_count = ?,
                conflict_count = ?,
                failure_count = ?,
                error_message = ?,
                error_details = ?,
                started_at = ?,
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(count_param(job.stats.pushed))
        .bind(count_param(job.stats.pulled))
        .bind(count_param(job.stats.conflicts))
        .bind(count_param(job.stats.failures))
        .bind(&job.error_message)
        .bind(&job.error_details)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: job.id.to_string(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?");
        let row = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        row.map(SyncJob::try_from).transpose()
    }

    async fn find_by_status(&self, status: SyncStatus) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = ? ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn find_active(&self) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs
             WHERE status IN ('PENDING', 'PUSHING', 'PULLING')
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn history(&self, limit: u32) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, SyncJobRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn delete(&self, id: &SyncJobId) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core_store::db::create_test_pool;

    async fn repo() -> SqliteSyncJobRepository {
        SqliteSyncJobRepository::new(create_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_find_by_id() {
        let repo = repo().await;

        let job = SyncJob::new();
        let job_id = job.id;
        repo.insert(&job).await.unwrap();

        let found = repo.find_by_id(&job_id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(repo.find_by_id(&SyncJobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_tracks_phases_and_counts() {
        let repo = repo().await;

        let job = SyncJob::new();
        let job_id = job.id;
        repo.insert(&job).await.unwrap();

        let mut job = job.begin_push().unwrap();
        job.record_push(4, 1).unwrap();
        repo.update(&job).await.unwrap();

        let found = repo.find_by_id(&job_id).await.unwrap().unwrap();
        assert_eq!(found.status, SyncStatus::Pushing);
        assert_eq!(found.stats.pushed, 4);
        assert_eq!(found.stats.failures, 1);

        let mut job = job.begin_pull().unwrap();
        job.record_pull(9, 2).unwrap();
        let job = job.complete().unwrap();
        repo.update(&job).await.unwrap();

        let found = repo.find_by_id(&job_id).await.unwrap().unwrap();
        assert_eq!(found, job);
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let repo = repo().await;
        assert!(matches!(
            repo.update(&SyncJob::new()).await,
            Err(SyncError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_by_status_and_active() {
        let repo = repo().await;

        let pending = SyncJob::new();
        let pushing = SyncJob::new().begin_push().unwrap();
        let failed = SyncJob::new().fail("offline".to_string(), None).unwrap();

        repo.insert(&pending).await.unwrap();
        repo.insert(&pushing).await.unwrap();
        repo.insert(&failed).await.unwrap();

        assert_eq!(repo.find_by_status(SyncStatus::Failed).await.unwrap().len(), 1);
        assert_eq!(repo.find_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let repo = repo().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut job = SyncJob::new();
            job.created_at = 1_000 + i;
            ids.push(job.id);
            repo.insert(&job).await.unwrap();
        }

        let history = repo.history(3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, ids[4]);
        for pair in history.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn test_delete_job() {
        let repo = repo().await;

        let job = SyncJob::new();
        repo.insert(&job).await.unwrap();
        repo.delete(&job.id).await.unwrap();

        assert!(repo.find_by_id(&job.id).await.unwrap().is_none());
        assert!(repo.delete(&job.id).await.is_err());
    }
}
