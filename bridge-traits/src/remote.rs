//! Remote Store Abstraction
//!
//! The shared backend every device reconciles with. The core never talks to a
//! concrete backend; hosts inject an implementation of [`RemoteStore`].
//!
//! All three operations are keyed by the record's primary key, so repeating a
//! call (for example after a crash between send and acknowledgment) must leave
//! the remote in the same state as a single call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Acknowledgment returned by the remote store for a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    /// Server-side modification timestamp assigned to the write.
    pub remote_updated_at: DateTime<Utc>,
}

/// A record returned by [`RemoteStore::query_changed_since`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Primary key of the record
    pub id: String,
    /// Record body; `None` for a tombstone
    pub payload: Option<Value>,
    /// Write time recorded by the device that authored this version
    pub updated_at: DateTime<Utc>,
    /// Server-side modification timestamp (drives the pull cursor)
    pub remote_updated_at: DateTime<Utc>,
}

impl RemoteRecord {
    /// Build a live (non-deleted) remote record.
    pub fn live(
        id: impl Into<String>,
        payload: Value,
        updated_at: DateTime<Utc>,
        remote_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload),
            updated_at,
            remote_updated_at,
        }
    }

    /// Build a tombstone for a record deleted remotely.
    pub fn tombstone(
        id: impl Into<String>,
        updated_at: DateTime<Utc>,
        remote_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: None,
            updated_at,
            remote_updated_at,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Remote store contract.
///
/// Implementations must map an explicit refusal (validation failure, forbidden
/// write) to [`BridgeError::Rejected`](crate::BridgeError::Rejected) and
/// everything that may succeed later to a transient error, see
/// [`BridgeError::is_transient`](crate::BridgeError::is_transient).
///
/// # Example
///
/// ```ignore
/// use bridge_traits::remote::RemoteStore;
///
/// async fn push(remote: &dyn RemoteStore, payload: serde_json::Value) -> Result<()> {
///     let ack = remote.upsert("task", "t-1", &payload, chrono::Utc::now()).await?;
///     println!("stored at {}", ack.remote_updated_at);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create or replace the record `family/id`.
    async fn upsert(
        &self,
        family: &str,
        id: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> Result<RemoteAck>;

    /// Delete `family/id`, leaving a tombstone other devices can pull.
    /// Deleting an unknown id is acknowledged.
    async fn delete(&self, family: &str, id: &str, updated_at: DateTime<Utc>) -> Result<RemoteAck>;

    /// Records of `family` whose server-side timestamp is strictly greater than
    /// `since`, or every record when `since` is `None`.
    async fn query_changed_since(
        &self,
        family: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tombstone_detection() {
        let at = Utc.timestamp_millis_opt(1_000).unwrap();
        let live = RemoteRecord::live("a", serde_json::json!({"title": "Plough"}), at, at);
        let gone = RemoteRecord::tombstone("a", at, at);

        assert!(!live.is_tombstone());
        assert!(gone.is_tombstone());
    }

    #[test]
    fn test_remote_record_serialization() {
        let at = Utc.timestamp_millis_opt(5_000).unwrap();
        let record = RemoteRecord::live("t-1", serde_json::json!({"n": 1}), at, at);

        let json = serde_json::to_string(&record).unwrap();
        let back: RemoteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
