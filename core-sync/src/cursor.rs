//! # Sync Cursor Store
//!
//! Per-family pull watermarks. A cursor holds the highest server-side
//! timestamp fully applied locally; the next pull asks for records strictly
//! newer than it. Cursors only move forward, and only inside the transaction
//! that applied the batch they cover.

use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_store::record::{from_millis, to_millis};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::LocalStorage(e.to_string())
}

/// Cursor table access for one device.
pub struct SyncCursorStore {
    pool: SqlitePool,
    device_id: String,
    clock: Arc<dyn Clock>,
}

impl SyncCursorStore {
    pub fn new(pool: SqlitePool, device_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            device_id: device_id.into(),
            clock,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current cursor of `family`; `None` when it has never been pulled.
    pub async fn get(&self, family: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.get_with(&mut conn, family).await
    }

    pub async fn get_with(
        &self,
        conn: &mut SqliteConnection,
        family: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = sqlx::query_scalar(
            "SELECT last_synced_at FROM sync_cursors WHERE device_id = ? AND family = ?",
        )
        .bind(&self.device_id)
        .bind(family)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(millis.map(from_millis))
    }

    /// Move the cursor of `family` to `to` unless it is already further ahead.
    /// Returns the cursor value after the call.
    pub async fn advance_with(
        &self,
        conn: &mut SqliteConnection,
        family: &str,
        to: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let now = to_millis(self.clock.now());

        sqlx::query(
            "INSERT INTO sync_cursors (device_id, family, last_synced_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id, family) DO UPDATE SET
                last_synced_at = MAX(sync_cursors.last_synced_at, excluded.last_synced_at),
                updated_at = excluded.updated_at",
        )
        .bind(&self.device_id)
        .bind(family)
        .bind(to_millis(to))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        let current = self.get_with(conn, family).await?.unwrap_or(to);
        debug!(family, cursor = %current, "Sync cursor advanced");
        Ok(current)
    }

    pub async fn advance(&self, family: &str, to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.advance_with(&mut conn, family, to).await
    }

    /// Every cursor of this device, keyed by family.
    pub async fn all(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT family, last_synced_at FROM sync_cursors WHERE device_id = ? ORDER BY family",
        )
        .bind(&self.device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(family, millis)| (family, from_millis(millis)))
            .collect())
    }

    /// Forget the cursor of `family`, forcing a full pull next time.
    pub async fn reset(&self, family: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM sync_cursors WHERE device_id = ? AND family = ?")
            .bind(&self.device_id)
            .bind(family)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();

        if removed > 0 {
            info!(family, "Sync cursor reset");
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use core_store::db::create_test_pool;

    async fn store() -> SyncCursorStore {
        let pool = create_test_pool().await.unwrap();
        SyncCursorStore::new(pool, "device-1", Arc::new(ManualClock::at_millis(10)))
    }

    #[tokio::test]
    async fn test_missing_cursor_is_none() {
        let store = store().await;
        assert!(store.get("task").await.unwrap().is_none());
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = store().await;

        assert_eq!(store.advance("task", from_millis(500)).await.unwrap(), from_millis(500));
        assert_eq!(store.advance("task", from_millis(300)).await.unwrap(), from_millis(500));
        assert_eq!(store.advance("task", from_millis(700)).await.unwrap(), from_millis(700));
        assert_eq!(store.get("task").await.unwrap(), Some(from_millis(700)));
    }

    #[tokio::test]
    async fn test_cursors_are_per_family_and_device() {
        let pool = create_test_pool().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_millis(10));
        let phone = SyncCursorStore::new(pool.clone(), "phone", clock.clone());
        let tablet = SyncCursorStore::new(pool, "tablet", clock);

        phone.advance("task", from_millis(100)).await.unwrap();
        phone.advance("transfer", from_millis(200)).await.unwrap();
        tablet.advance("task", from_millis(50)).await.unwrap();

        let all = phone.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["transfer"], from_millis(200));
        assert_eq!(tablet.get("task").await.unwrap(), Some(from_millis(50)));
    }

    #[tokio::test]
    async fn test_advance_rolls_back_with_transaction() {
        let store = store().await;
        let mut tx = store.pool.begin().await.unwrap();
        store.advance_with(&mut tx, "task", from_millis(900)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get("task").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset() {
        let store = store().await;
        store.advance("task", from_millis(100)).await.unwrap();

        assert!(store.reset("task").await.unwrap());
        assert!(!store.reset("task").await.unwrap());
        assert!(store.get("task").await.unwrap().is_none());
    }
}
