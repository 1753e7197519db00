//! # Family Record Store
//!
//! Generic access to the per-family record tables.
//!
//! ## Overview
//!
//! All family tables share one layout (JSON payload plus dirty-tracking
//! columns), so a single store serves every family. Methods ending in `_with`
//! take a connection instead of using the pool; the sync engine uses them to
//! compose record writes with outbox and cursor writes inside one transaction.
//!
//! ## Usage
//!
//! ```ignore
//! use core_store::records::SqliteRecordStore;
//! use core_store::models::Task;
//!
//! let store = SqliteRecordStore::new(pool.clone());
//! let open: Vec<Task> = store.list_entities().await?;
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::record::{from_millis, to_millis, EntityFamily, SyncRecord, SyncState, Synchronizable};

/// Raw row of a family table.
#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    payload: String,
    deleted: bool,
    dirty: bool,
    updated_at: i64,
    synced_at: Option<i64>,
    merged_at: Option<i64>,
    merge_count: i64,
}

impl TryFrom<RecordRow> for SyncRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(SyncRecord {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            state: SyncState {
                dirty: row.dirty,
                updated_at: from_millis(row.updated_at),
                synced_at: row.synced_at.map(from_millis),
                merged_at: row.merged_at.map(from_millis),
                merge_count: row.merge_count,
                deleted: row.deleted,
            },
        })
    }
}

const RECORD_COLUMNS: &str =
    "id, payload, deleted, dirty, updated_at, synced_at, merged_at, merge_count";

/// SQLite-backed store for synchronized records.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the family table if it does not exist yet.
    pub async fn ensure_table(&self, family: EntityFamily) -> Result<()> {
        family.validate()?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY NOT NULL,
                payload TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                dirty INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                synced_at INTEGER,
                merged_at INTEGER,
                merge_count INTEGER NOT NULL DEFAULT 0
            )",
            table = family.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_dirty ON {table} (dirty)",
            table = family.table
        );
        sqlx::query(&index).execute(&self.pool).await?;

        debug!(family = %family, table = family.table, "Family table ready");
        Ok(())
    }

    // ========================================================================
    // Connection-level operations
    // ========================================================================

    pub async fn find_with(
        &self,
        conn: &mut SqliteConnection,
        family: EntityFamily,
        id: &str,
    ) -> Result<Option<SyncRecord>> {
        family.validate()?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE id = ?",
            table = family.table
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(SyncRecord::try_from).transpose()
    }

    /// Insert or fully replace a record.
    pub async fn put_with(
        &self,
        conn: &mut SqliteConnection,
        family: EntityFamily,
        record: &SyncRecord,
    ) -> Result<()> {
        family.validate()?;

        let sql = format!(
            "INSERT INTO {table} ({RECORD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                deleted = excluded.deleted,
                dirty = excluded.dirty,
                updated_at = excluded.updated_at,
                synced_at = excluded.synced_at,
                merged_at = excluded.merged_at,
                merge_count = excluded.merge_count",
            table = family.table
        );

        sqlx::query(&sql)
            .bind(&record.id)
            .bind(serde_json::to_string(&record.payload)?)
            .bind(record.state.deleted)
            .bind(record.state.dirty)
            .bind(to_millis(record.state.updated_at))
            .bind(record.state.synced_at.map(to_millis))
            .bind(record.state.merged_at.map(to_millis))
            .bind(record.state.merge_count)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Record a remote acknowledgment for the version written at
    /// `pushed_updated_at`.
    ///
    /// `dirty` is cleared only if no newer local write happened since; the
    /// acknowledgment time is recorded either way. Returns whether the record
    /// is now clean.
    pub async fn mark_synced_with(
        &self,
        conn: &mut SqliteConnection,
        family: EntityFamily,
        id: &str,
        pushed_updated_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<bool> {
        family.validate()?;

        let sql = format!(
            "UPDATE {table} SET dirty = 0, synced_at = ? WHERE id = ? AND updated_at = ?",
            table = family.table
        );
        let cleared = sqlx::query(&sql)
            .bind(to_millis(synced_at))
            .bind(id)
            .bind(to_millis(pushed_updated_at))
            .execute(&mut *conn)
            .await?
            .rows_affected()
            > 0;

        if !cleared {
            let sql = format!(
                "UPDATE {table} SET synced_at = ? WHERE id = ?",
                table = family.table
            );
            sqlx::query(&sql)
                .bind(to_millis(synced_at))
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(cleared)
    }

    // ========================================================================
    // Pool-level operations
    // ========================================================================

    pub async fn find(&self, family: EntityFamily, id: &str) -> Result<Option<SyncRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.find_with(&mut conn, family, id).await
    }

    pub async fn put(&self, family: EntityFamily, record: &SyncRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.put_with(&mut conn, family, record).await
    }

    /// Records with unsent local changes, oldest write first.
    pub async fn list_dirty(&self, family: EntityFamily) -> Result<Vec<SyncRecord>> {
        family.validate()?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE dirty = 1 ORDER BY updated_at ASC",
            table = family.table
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncRecord::try_from).collect()
    }

    pub async fn count_dirty(&self, family: EntityFamily) -> Result<i64> {
        family.validate()?;

        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE dirty = 1",
            table = family.table
        );
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// All records of a family, optionally including tombstones.
    pub async fn list(&self, family: EntityFamily, include_deleted: bool) -> Result<Vec<SyncRecord>> {
        family.validate()?;

        let filter = if include_deleted { "" } else { "WHERE deleted = 0" };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {table} {filter} ORDER BY id",
            table = family.table
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncRecord::try_from).collect()
    }

    // ========================================================================
    // Typed access
    // ========================================================================

    /// Load a live entity; tombstones read as `None`.
    pub async fn get_entity<T: Synchronizable>(&self, id: &str) -> Result<Option<T>> {
        match self.find(T::family(), id).await? {
            Some(record) if !record.is_tombstone() => Ok(Some(record.into_entity()?)),
            _ => Ok(None),
        }
    }

    /// All live entities of `T`'s family.
    pub async fn list_entities<T: Synchronizable>(&self) -> Result<Vec<T>> {
        self.list(T::family(), false)
            .await?
            .into_iter()
            .map(SyncRecord::into_entity)
            .collect()
    }

    /// Live entities of `T`'s family with unsent local changes.
    pub async fn list_dirty_entities<T: Synchronizable>(&self) -> Result<Vec<T>> {
        self.list_dirty(T::family())
            .await?
            .into_iter()
            .filter(|record| !record.is_tombstone())
            .map(SyncRecord::into_entity)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::{Task, TASKS};
    use serde_json::json;

    async fn store() -> SqliteRecordStore {
        SqliteRecordStore::new(create_test_pool().await.unwrap())
    }

    fn record(id: &str, updated_at: i64, dirty: bool) -> SyncRecord {
        SyncRecord::new(
            id,
            json!({"id": id, "farm_id": "farm-1", "title": "Weed rows", "status": "OPEN"}),
            SyncState {
                dirty,
                updated_at: from_millis(updated_at),
                ..SyncState::default()
            },
        )
    }

    #[tokio::test]
    async fn test_put_and_find() {
        let store = store().await;
        store.put(TASKS, &record("t-1", 100, true)).await.unwrap();

        let found = store.find(TASKS, "t-1").await.unwrap().unwrap();
        assert_eq!(found, record("t-1", 100, true));
        assert!(store.find(TASKS, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let store = store().await;
        store.put(TASKS, &record("t-1", 100, true)).await.unwrap();

        let mut newer = record("t-1", 200, false);
        newer.state.merge_count = 2;
        newer.state.merged_at = Some(from_millis(210));
        store.put(TASKS, &newer).await.unwrap();

        assert_eq!(store.find(TASKS, "t-1").await.unwrap().unwrap(), newer);
    }

    #[tokio::test]
    async fn test_mark_synced_clears_dirty_for_same_version() {
        let store = store().await;
        store.put(TASKS, &record("t-1", 100, true)).await.unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        let cleared = store
            .mark_synced_with(&mut conn, TASKS, "t-1", from_millis(100), from_millis(150))
            .await
            .unwrap();
        drop(conn);

        assert!(cleared);
        let found = store.find(TASKS, "t-1").await.unwrap().unwrap();
        assert!(!found.state.dirty);
        assert_eq!(found.state.synced_at, Some(from_millis(150)));
    }

    #[tokio::test]
    async fn test_mark_synced_keeps_newer_write_dirty() {
        let store = store().await;
        store.put(TASKS, &record("t-1", 300, true)).await.unwrap();

        let mut conn = store.pool().acquire().await.unwrap();
        let cleared = store
            .mark_synced_with(&mut conn, TASKS, "t-1", from_millis(100), from_millis(150))
            .await
            .unwrap();
        drop(conn);

        assert!(!cleared);
        let found = store.find(TASKS, "t-1").await.unwrap().unwrap();
        assert!(found.state.dirty);
        assert_eq!(found.state.synced_at, Some(from_millis(150)));
    }

    #[tokio::test]
    async fn test_dirty_listing_and_count() {
        let store = store().await;
        store.put(TASKS, &record("t-2", 200, true)).await.unwrap();
        store.put(TASKS, &record("t-1", 100, true)).await.unwrap();
        store.put(TASKS, &record("t-3", 300, false)).await.unwrap();

        let dirty = store.list_dirty(TASKS).await.unwrap();
        let ids: Vec<_> = dirty.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t-1", "t-2"]);
        assert_eq!(store.count_dirty(TASKS).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tombstones_hidden_from_entities() {
        let store = store().await;
        store.put(TASKS, &record("t-1", 100, false)).await.unwrap();

        let mut gone = record("t-2", 100, true);
        gone.state.deleted = true;
        store.put(TASKS, &gone).await.unwrap();

        let tasks: Vec<Task> = store.list_entities().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id.to_string(), "t-1");
        assert!(store.get_entity::<Task>("t-2").await.unwrap().is_none());
        assert_eq!(store.list(TASKS, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_table_for_new_family() {
        let store = store().await;
        let family = EntityFamily::new("harvest", "harvests");

        store.ensure_table(family).await.unwrap();
        store.ensure_table(family).await.unwrap();
        store.put(family, &record("h-1", 1, true)).await.unwrap();
        assert_eq!(store.count_dirty(family).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_family_is_rejected() {
        let store = store().await;
        let family = EntityFamily::new("bad", "tasks WHERE 1=1 --");
        assert!(matches!(
            store.find(family, "x").await,
            Err(StoreError::InvalidFamily(_))
        ));
    }
}
