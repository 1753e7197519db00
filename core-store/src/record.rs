//! # Dirty Tracking
//!
//! The per-record bookkeeping every synchronized entity carries, and the
//! family-agnostic envelope the sync engine works with.
//!
//! ## Overview
//!
//! Entities embed a [`SyncState`] and implement [`Synchronizable`]. Every local
//! write goes through [`Synchronizable::mark_dirty`] (or `mark_deleted`), which
//! sets `dirty` and bumps `updated_at` without ever moving it backwards. The
//! engine never sees concrete entity types: it converts them to a
//! [`SyncRecord`] (JSON payload plus state) and stores that in the family table.
//!
//! ## Usage
//!
//! ```ignore
//! use core_store::record::{Synchronizable, SyncRecord};
//!
//! task.title = "Spray orchard block C".to_string();
//! task.mark_dirty(clock.now());
//!
//! let record = SyncRecord::from_entity(&task)?;
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StoreError};

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamps are persisted as Unix milliseconds.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_millis`]; out-of-range values collapse to the epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

/// Drop sub-millisecond precision so in-memory values compare equal to
/// what was stored.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(ts))
}

// ============================================================================
// Entity Families
// ============================================================================

/// A synchronized entity family and the local table backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityFamily {
    /// Name used on the wire and in the outbox (`entity_type`)
    pub name: &'static str,
    /// Local table holding the family's records
    pub table: &'static str,
}

impl EntityFamily {
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self { name, table }
    }

    /// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed.
    pub fn validate(&self) -> Result<()> {
        let valid = !self.table.is_empty()
            && !self.table.starts_with(|c: char| c.is_ascii_digit())
            && self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if valid && !self.name.trim().is_empty() {
            Ok(())
        } else {
            Err(StoreError::InvalidFamily(self.table.to_string()))
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Kind of local mutation recorded in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sync State
// ============================================================================

/// Dirty/version bookkeeping embedded in every synchronized record.
///
/// A record with `dirty == false` and no pending outbox entry matches the last
/// version pushed to or pulled from the remote store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Locally mutated since the last acknowledged push
    pub dirty: bool,
    /// Device write time, monotonic per device
    pub updated_at: DateTime<Utc>,
    /// Last remote acknowledgment
    pub synced_at: Option<DateTime<Utc>>,
    /// Last conflict resolution touching this record
    pub merged_at: Option<DateTime<Utc>>,
    /// Number of conflict resolutions applied to this record
    pub merge_count: i64,
    /// Tombstone flag
    pub deleted: bool,
}

impl SyncState {
    /// State of a record just written locally at `now`.
    pub fn dirty_at(now: DateTime<Utc>) -> Self {
        Self {
            dirty: true,
            updated_at: truncate_millis(now),
            ..Self::default()
        }
    }

    /// Record a local write. `updated_at` never moves backwards, even when the
    /// device clock does.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let now = truncate_millis(now);
        let floor = self.updated_at + Duration::milliseconds(1);
        self.updated_at = if now > floor { now } else { floor };
        self.dirty = true;
    }
}

/// Implemented by every entity the engine synchronizes.
///
/// Serialization of the entity is its remote payload; the embedded
/// [`SyncState`] must be excluded from it (`#[serde(skip)]`).
pub trait Synchronizable: Serialize + DeserializeOwned + Send + Sync {
    /// Family this entity belongs to
    fn family() -> EntityFamily;

    /// Primary key, globally unique and client-generated
    fn id(&self) -> String;

    fn sync_state(&self) -> &SyncState;

    fn sync_state_mut(&mut self) -> &mut SyncState;

    /// Domain validation run before a local mutation is committed.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Flag a local write of a synchronized field.
    fn mark_dirty(&mut self, now: DateTime<Utc>) {
        self.sync_state_mut().touch(now);
    }

    /// Turn the record into a dirty tombstone.
    fn mark_deleted(&mut self, now: DateTime<Utc>) {
        let state = self.sync_state_mut();
        state.touch(now);
        state.deleted = true;
    }

    fn is_dirty(&self) -> bool {
        self.sync_state().dirty
    }
}

// ============================================================================
// Sync Record
// ============================================================================

/// Family-agnostic record envelope stored in a family table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    /// Entity body; `Value::Null` for a tombstone that was never seen alive
    pub payload: Value,
    pub state: SyncState,
}

impl SyncRecord {
    pub fn new(id: impl Into<String>, payload: Value, state: SyncState) -> Self {
        Self {
            id: id.into(),
            payload,
            state,
        }
    }

    pub fn from_entity<T: Synchronizable>(entity: &T) -> Result<Self> {
        Ok(Self {
            id: entity.id(),
            payload: serde_json::to_value(entity)?,
            state: entity.sync_state().clone(),
        })
    }

    pub fn into_entity<T: Synchronizable>(self) -> Result<T> {
        let mut entity: T = serde_json::from_value(self.payload)?;
        *entity.sync_state_mut() = self.state;
        Ok(entity)
    }

    pub fn is_tombstone(&self) -> bool {
        self.state.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
        #[serde(skip)]
        sync: SyncState,
    }

    impl Synchronizable for Note {
        fn family() -> EntityFamily {
            EntityFamily::new("note", "notes")
        }

        fn id(&self) -> String {
            self.id.clone()
        }

        fn sync_state(&self) -> &SyncState {
            &self.sync
        }

        fn sync_state_mut(&mut self) -> &mut SyncState {
            &mut self.sync
        }
    }

    fn note() -> Note {
        Note {
            id: "n-1".to_string(),
            body: "check irrigation".to_string(),
            sync: SyncState::default(),
        }
    }

    #[test]
    fn test_mark_dirty_sets_flag_and_timestamp() {
        let mut note = note();
        note.mark_dirty(from_millis(1_000));

        assert!(note.is_dirty());
        assert_eq!(to_millis(note.sync.updated_at), 1_000);
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let mut note = note();
        note.mark_dirty(from_millis(5_000));
        note.mark_dirty(from_millis(4_000));
        assert_eq!(to_millis(note.sync.updated_at), 5_001);

        note.mark_dirty(from_millis(5_001));
        assert_eq!(to_millis(note.sync.updated_at), 5_002);
    }

    #[test]
    fn test_mark_deleted_is_dirty_tombstone() {
        let mut note = note();
        note.mark_deleted(from_millis(10));
        assert!(note.sync.deleted);
        assert!(note.sync.dirty);
    }

    #[test]
    fn test_sync_record_excludes_state_from_payload() {
        let mut note = note();
        note.mark_dirty(from_millis(10));

        let record = SyncRecord::from_entity(&note).unwrap();
        assert_eq!(record.payload, json!({"id": "n-1", "body": "check irrigation"}));
        assert!(record.state.dirty);

        let back: Note = record.into_entity().unwrap();
        assert_eq!(back.body, "check irrigation");
        assert_eq!(to_millis(back.sync.updated_at), 10);
    }

    #[test]
    fn test_family_validation() {
        assert!(EntityFamily::new("task", "tasks").validate().is_ok());
        assert!(EntityFamily::new("task", "tasks; DROP TABLE outbox").validate().is_err());
        assert!(EntityFamily::new("task", "").validate().is_err());
        assert!(EntityFamily::new("task", "1tasks").validate().is_err());
    }

    #[test]
    fn test_operation_round_trip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("UPSERT".parse::<Operation>().is_err());
        assert_eq!(serde_json::to_value(Operation::Delete).unwrap(), json!("DELETE"));
    }

    #[test]
    fn test_millis_helpers() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
        assert_eq!(truncate_millis(ts), ts);
    }
}
