//! # Outbox Queue
//!
//! Durable FIFO of local mutations awaiting delivery to the remote store.
//!
//! ## Overview
//!
//! Every local mutation appends (or coalesces into) an outbox entry in the same
//! transaction as the record write. The push phase drains entries in creation
//! order, marks them `IN_PROGRESS`, and resolves each one as completed, retried
//! or failed. Entries abandoned `IN_PROGRESS` by a crash are returned to
//! `PENDING` by [`OutboxQueue::reap_stale`].
//!
//! ## Coalescing
//!
//! At most one active (`PENDING` or `IN_PROGRESS`) entry exists per
//! `(entity_type, entity_id)`, enforced by a partial unique index:
//! - a second CREATE/UPDATE replaces the pending payload (CREATE followed by
//!   UPDATE stays a CREATE)
//! - a DELETE discards the pending entry and queues a single DELETE
//! - a mutation arriving while the entry is `IN_PROGRESS` rewrites it and
//!   flags it `superseded`; when the in-flight attempt resolves, the entry
//!   goes back to `PENDING` with a fresh retry budget instead of completing
//!
//! ## Retries
//!
//! A transient failure returns the entry to `PENDING` with exponential backoff
//! (`next_attempt_at`) until `max_retries` is reached, after which it stays
//! `FAILED` until [`OutboxQueue::retry_failed`] is called.

use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_store::db::begin_write;
use core_store::record::{from_millis, to_millis, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

// ============================================================================
// Types
// ============================================================================

/// Unique identifier for an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxEntryId(Uuid);

impl OutboxEntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SyncError::InvalidId(s.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OutboxEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery status of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting to be drained
    Pending,
    /// Drained by a push pass and not yet resolved
    InProgress,
    /// Acknowledged by the remote store
    Completed,
    /// Rejected or out of retries
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::InProgress => "IN_PROGRESS",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl FromStr for OutboxStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "IN_PROGRESS" => Ok(OutboxStatus::InProgress),
            "COMPLETED" => Ok(OutboxStatus::Completed),
            "FAILED" => Ok(OutboxStatus::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Snapshot of the record when the mutation was committed
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the entry may be drained again
    pub next_attempt_at: DateTime<Utc>,
    /// Rewritten by a newer mutation while in flight
    pub superseded: bool,
}

/// Result of reporting a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `PENDING`, eligible again at `next_attempt_at`
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The entry carries a newer mutation and went back to `PENDING`, due now
    Superseded,
    /// Parked as `FAILED`
    Failed { retry_count: u32 },
}

impl FailureOutcome {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureOutcome::Failed { .. })
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            FailureOutcome::Retrying { retry_count, .. } | FailureOutcome::Failed { retry_count } => {
                *retry_count
            }
            FailureOutcome::Superseded => 0,
        }
    }
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl OutboxStats {
    /// Entries not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress + self.failed
    }
}

/// Retry policy of the queue.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Failed attempts after which an entry is parked as `FAILED`
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further failure
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: String,
    user_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    last_attempt_at: Option<i64>,
    next_attempt_at: i64,
    superseded: i64,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = SyncError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(OutboxEntry {
            id: OutboxEntryId::from_string(&row.id)?,
            user_id: row.user_id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            operation: row
                .operation
                .parse()
                .map_err(|e: String| SyncError::InvalidInput {
                    field: "operation".to_string(),
                    message: e,
                })?,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse()?,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
            last_attempt_at: row.last_attempt_at.map(from_millis),
            next_attempt_at: from_millis(row.next_attempt_at),
            superseded: row.superseded != 0,
        })
    }
}

const ENTRY_COLUMNS: &str = "id, user_id, entity_type, entity_id, operation, payload, status, \
     retry_count, last_error, created_at, last_attempt_at, next_attempt_at, superseded";

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::LocalStorage(e.to_string())
}

// ============================================================================
// Queue
// ============================================================================

/// SQLite-backed outbox queue.
pub struct OutboxQueue {
    pool: SqlitePool,
    user_id: String,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
}

impl OutboxQueue {
    pub fn new(
        pool: SqlitePool,
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            pool,
            user_id: user_id.into(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Queue a mutation in its own transaction.
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: &Value,
    ) -> Result<OutboxEntryId> {
        let mut tx = begin_write(&self.pool).await?;
        let id = self
            .enqueue_with(&mut tx, entity_type, entity_id, operation, payload)
            .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    /// Queue a mutation on the caller's connection, typically inside the
    /// transaction that wrote the record.
    ///
    /// Returns the id of the entry now carrying the mutation, which may be the
    /// record's existing active entry it was coalesced into.
    pub async fn enqueue_with(
        &self,
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: &Value,
    ) -> Result<OutboxEntryId> {
        let now = to_millis(self.clock.now());
        let payload_json = serde_json::to_string(payload)?;

        let active: Option<(String, String, String)> = sqlx::query_as(
            "SELECT id, operation, status FROM outbox
             WHERE entity_type = ? AND entity_id = ? AND status IN ('PENDING', 'IN_PROGRESS')",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        match active {
            Some((existing_id, _, status)) if status == "PENDING" && operation.is_delete() => {
                sqlx::query("DELETE FROM outbox WHERE id = ?")
                    .bind(&existing_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;

                debug!(entry_id = %existing_id, entity_type, entity_id, "Delete superseded pending outbox entry");
            }
            Some((existing_id, existing_op, status)) => {
                let merged = match (existing_op.as_str(), operation) {
                    ("CREATE", Operation::Update) => Operation::Create,
                    _ => operation,
                };
                let in_flight = status == "IN_PROGRESS";

                sqlx::query(
                    "UPDATE outbox SET operation = ?, payload = ?, superseded = superseded OR ?
                     WHERE id = ?",
                )
                .bind(merged.as_str())
                .bind(&payload_json)
                .bind(in_flight)
                .bind(&existing_id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;

                debug!(
                    entry_id = %existing_id,
                    entity_type,
                    entity_id,
                    operation = %merged,
                    in_flight,
                    "Coalesced mutation into active outbox entry"
                );
                return OutboxEntryId::from_string(&existing_id);
            }
            None => {}
        }

        let id = OutboxEntryId::new();
        sqlx::query(
            "INSERT INTO outbox (id, user_id, entity_type, entity_id, operation, payload, status,
                                 retry_count, created_at, next_attempt_at)
             VALUES (?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?)",
        )
        .bind(id.as_str())
        .bind(&self.user_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(operation.as_str())
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        debug!(entry_id = %id, entity_type, entity_id, operation = %operation, "Enqueued outbox entry");
        Ok(id)
    }

    /// Take up to `limit` due `PENDING` entries in creation order and mark them
    /// `IN_PROGRESS`.
    pub async fn drain_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let now = self.clock.now();
        let now_ms = to_millis(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = begin_write(&self.pool).await?;

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE status = 'PENDING' AND next_attempt_at <= ?
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(now_ms)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entry = OutboxEntry::try_from(row)?;

            sqlx::query(
                "UPDATE outbox SET status = 'IN_PROGRESS', last_attempt_at = ? WHERE id = ?",
            )
            .bind(now_ms)
            .bind(entry.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            entry.status = OutboxStatus::InProgress;
            entry.last_attempt_at = Some(from_millis(now_ms));
            entries.push(entry);
        }

        tx.commit().await.map_err(db_err)?;

        if !entries.is_empty() {
            debug!(count = entries.len(), "Drained outbox batch");
        }
        Ok(entries)
    }

    /// Mark an in-flight entry as delivered. Returns the entry's new status:
    /// `COMPLETED`, or `PENDING` when a newer mutation was coalesced into it
    /// while in flight.
    pub async fn mark_complete(&self, id: OutboxEntryId) -> Result<OutboxStatus> {
        let mut tx = begin_write(&self.pool).await?;
        let status = self.mark_complete_with(&mut tx, id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    /// Same as [`mark_complete`](Self::mark_complete) on the caller's
    /// connection.
    pub async fn mark_complete_with(
        &self,
        conn: &mut SqliteConnection,
        id: OutboxEntryId,
    ) -> Result<OutboxStatus> {
        let entry = self.in_progress_entry(conn, id, "COMPLETED").await?;

        if entry.superseded {
            let now = self.clock.now();
            self.release_with(conn, &entry, 0, None, now).await?;
            debug!(entry_id = %id, "Delivered outbox entry requeued for a newer mutation");
            return Ok(OutboxStatus::Pending);
        }

        sqlx::query("UPDATE outbox SET status = 'COMPLETED', last_error = NULL WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        debug!(entry_id = %id, "Outbox entry completed");
        Ok(OutboxStatus::Completed)
    }

    /// Record a transient delivery failure.
    ///
    /// The entry returns to `PENDING` with backoff while retries remain, and is
    /// parked as `FAILED` once `max_retries` attempts have failed.
    pub async fn mark_failed(&self, id: OutboxEntryId, error: &str) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let mut tx = begin_write(&self.pool).await?;

        let entry = self.in_progress_entry(&mut tx, id, "PENDING").await?;
        let retry_count = entry.retry_count.saturating_add(1);

        let outcome = if entry.superseded {
            self.release_with(&mut tx, &entry, 0, None, now).await?;
            FailureOutcome::Superseded
        } else if retry_count >= self.config.max_retries {
            sqlx::query(
                "UPDATE outbox SET status = 'FAILED', retry_count = ?, last_error = ? WHERE id = ?",
            )
            .bind(i64::from(retry_count))
            .bind(error)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            FailureOutcome::Failed { retry_count }
        } else {
            let next_attempt_at = now + self.retry_delay(retry_count);
            self.release_with(&mut tx, &entry, retry_count, Some(error), next_attempt_at)
                .await?;
            FailureOutcome::Retrying {
                retry_count,
                next_attempt_at: from_millis(to_millis(next_attempt_at)),
            }
        };

        tx.commit().await.map_err(db_err)?;

        match &outcome {
            FailureOutcome::Failed { retry_count } => warn!(
                entry_id = %id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                retry_count,
                error,
                "Outbox entry out of retries"
            ),
            _ => debug!(entry_id = %id, retry_count, error, ?outcome, "Outbox entry will retry"),
        }

        Ok(outcome)
    }

    /// Park an in-flight entry the remote store refused. Not retried
    /// automatically, unless a newer mutation was coalesced into the entry
    /// while it was in flight; that mutation is queued again.
    pub async fn mark_rejected(&self, id: OutboxEntryId, error: &str) -> Result<FailureOutcome> {
        let mut tx = begin_write(&self.pool).await?;

        let entry = self.in_progress_entry(&mut tx, id, "FAILED").await?;

        if entry.superseded {
            let now = self.clock.now();
            self.release_with(&mut tx, &entry, 0, None, now).await?;
            tx.commit().await.map_err(db_err)?;

            debug!(entry_id = %id, error, "Rejected outbox entry requeued for a newer mutation");
            return Ok(FailureOutcome::Superseded);
        }

        let retry_count = entry.retry_count.saturating_add(1);
        sqlx::query(
            "UPDATE outbox SET status = 'FAILED', retry_count = ?, last_error = ? WHERE id = ?",
        )
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        warn!(
            entry_id = %id,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            error,
            "Outbox entry rejected by remote store"
        );
        Ok(FailureOutcome::Failed { retry_count })
    }

    /// Return entries stuck `IN_PROGRESS` for longer than `timeout` to
    /// `PENDING`. Their retry count is left unchanged unless a newer mutation
    /// was coalesced into them.
    pub async fn reap_stale(&self, timeout: Duration) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = to_millis(now) - i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let mut tx = begin_write(&self.pool).await?;

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE status = 'IN_PROGRESS' AND COALESCE(last_attempt_at, created_at) <= ?
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

        let mut reaped = 0u64;
        for row in rows {
            let entry = OutboxEntry::try_from(row)?;
            let retry_count = if entry.superseded { 0 } else { entry.retry_count };
            let last_error = entry.last_error.clone();
            self.release_with(&mut tx, &entry, retry_count, last_error.as_deref(), now)
                .await?;
            reaped += 1;
        }

        tx.commit().await.map_err(db_err)?;

        if reaped > 0 {
            info!(reaped, timeout_secs = timeout.as_secs(), "Reaped stale in-progress outbox entries");
        }
        Ok(reaped)
    }

    /// Give a `FAILED` entry a fresh retry budget.
    pub async fn retry_failed(&self, id: OutboxEntryId) -> Result<()> {
        let now = self.clock.now();
        let mut tx = begin_write(&self.pool).await?;

        let entry = self
            .find_with(&mut tx, id)
            .await?
            .ok_or_else(|| SyncError::EntryNotFound {
                entry_id: id.to_string(),
            })?;

        if entry.status != OutboxStatus::Failed {
            return Err(SyncError::InvalidStateTransition {
                from: entry.status.to_string(),
                to: OutboxStatus::Pending.to_string(),
                reason: "Only failed entries can be retried".to_string(),
            });
        }

        let carrier = self.release_with(&mut tx, &entry, 0, None, now).await?;
        tx.commit().await.map_err(db_err)?;

        info!(
            entry_id = %id,
            carried_by = %carrier,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "Failed outbox entry requeued"
        );
        Ok(())
    }

    /// Delete `COMPLETED` entries whose last attempt is older than `older_than`.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64> {
        let cutoff =
            to_millis(self.clock.now()) - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);

        let purged = sqlx::query(
            "DELETE FROM outbox
             WHERE status = 'COMPLETED' AND COALESCE(last_attempt_at, created_at) < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if purged > 0 {
            debug!(purged, "Purged completed outbox entries");
        }
        Ok(purged)
    }

    /// Remove the pending entry of a record, if any. Used when a pulled remote
    /// version replaces the local change it carried.
    pub async fn discard_pending_with(
        &self,
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM outbox WHERE entity_type = ? AND entity_id = ? AND status = 'PENDING'",
        )
        .bind(entity_type)
        .bind(entity_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();

        Ok(removed > 0)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn find(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.find_with(&mut conn, id).await
    }

    /// The pending entry of a record, if one is queued.
    pub async fn pending_for(&self, entity_type: &str, entity_id: &str) -> Result<Option<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE entity_type = ? AND entity_id = ? AND status = 'PENDING'"
        );
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(OutboxEntry::try_from).transpose()
    }

    /// Entries parked as `FAILED`, most recent attempt first.
    pub async fn failed_entries(&self) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE status = 'FAILED'
             ORDER BY COALESCE(last_attempt_at, created_at) DESC"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::InProgress => stats.in_progress = count,
                OutboxStatus::Completed => stats.completed = count,
                OutboxStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn find_with(
        &self,
        conn: &mut SqliteConnection,
        id: OutboxEntryId,
    ) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = ?");
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;

        row.map(OutboxEntry::try_from).transpose()
    }

    async fn in_progress_entry(
        &self,
        conn: &mut SqliteConnection,
        id: OutboxEntryId,
        target: &str,
    ) -> Result<OutboxEntry> {
        let entry = self
            .find_with(conn, id)
            .await?
            .ok_or_else(|| SyncError::EntryNotFound {
                entry_id: id.to_string(),
            })?;

        if entry.status != OutboxStatus::InProgress {
            return Err(SyncError::InvalidStateTransition {
                from: entry.status.to_string(),
                to: target.to_string(),
                reason: "Entry is not in flight".to_string(),
            });
        }
        Ok(entry)
    }

    /// Put `entry` back in the queue. If another active entry for the same
    /// record exists (only possible for an entry leaving `FAILED`), that entry
    /// takes over and `entry` is dropped; a CREATE that never reached the
    /// remote is carried over to it. Returns the id of the entry now carrying
    /// the record's mutation.
    async fn release_with(
        &self,
        conn: &mut SqliteConnection,
        entry: &OutboxEntry,
        retry_count: u32,
        last_error: Option<&str>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<OutboxEntryId> {
        let sibling: Option<(String, String)> = sqlx::query_as(
            "SELECT id, operation FROM outbox
             WHERE entity_type = ? AND entity_id = ? AND id != ?
               AND status IN ('PENDING', 'IN_PROGRESS')",
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        if let Some((sibling_id, sibling_op)) = sibling {
            if entry.operation == Operation::Create && sibling_op == Operation::Update.as_str() {
                sqlx::query("UPDATE outbox SET operation = 'CREATE' WHERE id = ?")
                    .bind(&sibling_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
            }

            sqlx::query("DELETE FROM outbox WHERE id = ?")
                .bind(entry.id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;

            debug!(
                entry_id = %entry.id,
                superseded_by = %sibling_id,
                "Outbox entry folded into newer active entry"
            );
            return OutboxEntryId::from_string(&sibling_id);
        }

        sqlx::query(
            "UPDATE outbox
             SET status = 'PENDING', retry_count = ?, last_error = ?, next_attempt_at = ?,
                 superseded = 0
             WHERE id = ?",
        )
        .bind(i64::from(retry_count))
        .bind(last_error)
        .bind(to_millis(next_attempt_at))
        .bind(entry.id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(entry.id)
    }

    fn retry_delay(&self, retry_count: u32) -> chrono::Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        let delay = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.retry_max_delay);

        chrono::Duration::milliseconds(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
    }
}
