//! Conflict Resolution for Sync Operations
//!
//! Decides which version survives when a pulled remote record meets a local
//! record that still carries unsent changes.
//!
//! ## Rules
//!
//! Applied in order:
//! 1. A remote tombstone wins; deletions are never resurrected.
//! 2. A dirty local tombstone wins; the pending DELETE is pushed later.
//! 3. Last writer wins on `updated_at`; a tie goes to the remote version.
//!
//! Whichever side wins, the result records the merge: `merge_count` is
//! incremented and `merged_at` set to the resolution time. The resolver is a
//! pure function of its inputs, so every device applying the same pair reaches
//! the same outcome.
//!
//! ## Usage
//!
//! ```ignore
//! use core_sync::conflict_resolver::{resolve_conflict, Winner};
//!
//! let resolution = resolve_conflict(&local, &remote, clock.now());
//! if resolution.winner == Winner::Remote {
//!     outbox.discard_pending_with(&mut tx, family.name, &local.id).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use core_store::record::{truncate_millis, SyncRecord, SyncState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side whose version survived a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Record to store locally
    pub record: SyncRecord,
    pub winner: Winner,
}

/// Resolve a conflict between a dirty local record and a remote version of
/// the same record.
///
/// When the remote side wins the stored record is clean (`dirty == false`) and
/// byte-identical to the remote payload. When the local side wins it stays
/// dirty so its pending outbox entry overwrites the remote on the next push.
pub fn resolve_conflict(local: &SyncRecord, remote: &SyncRecord, now: DateTime<Utc>) -> Resolution {
    let winner = if remote.state.deleted {
        Winner::Remote
    } else if local.state.deleted {
        Winner::Local
    } else if remote.state.updated_at >= local.state.updated_at {
        Winner::Remote
    } else {
        Winner::Local
    };

    let merged_at = Some(truncate_millis(now));
    let merge_count = local.state.merge_count + 1;

    let record = match winner {
        Winner::Remote => SyncRecord {
            id: local.id.clone(),
            payload: remote.payload.clone(),
            state: SyncState {
                dirty: false,
                updated_at: remote.state.updated_at,
                synced_at: local.state.synced_at,
                merged_at,
                merge_count,
                deleted: remote.state.deleted,
            },
        },
        Winner::Local => {
            let mut record = local.clone();
            record.state.merged_at = merged_at;
            record.state.merge_count = merge_count;
            record
        }
    };

    Resolution { record, winner }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_store::record::from_millis;
    use serde_json::json;

    fn local(updated_at: i64) -> SyncRecord {
        SyncRecord::new(
            "t-1",
            json!({"title": "local"}),
            SyncState {
                dirty: true,
                updated_at: from_millis(updated_at),
                ..SyncState::default()
            },
        )
    }

    fn remote(updated_at: i64) -> SyncRecord {
        SyncRecord::new(
            "t-1",
            json!({"title": "remote"}),
            SyncState {
                updated_at: from_millis(updated_at),
                ..SyncState::default()
            },
        )
    }

    fn tombstone(mut record: SyncRecord) -> SyncRecord {
        record.state.deleted = true;
        record
    }

    #[test]
    fn test_newer_remote_overwrites_dirty_local() {
        let resolution = resolve_conflict(&local(100), &remote(150), from_millis(200));

        assert_eq!(resolution.winner, Winner::Remote);
        assert_eq!(resolution.record.payload, json!({"title": "remote"}));
        assert!(!resolution.record.state.dirty);
        assert_eq!(resolution.record.state.updated_at, from_millis(150));
        assert_eq!(resolution.record.state.merge_count, 1);
        assert_eq!(resolution.record.state.merged_at, Some(from_millis(200)));
    }

    #[test]
    fn test_newer_local_survives_and_stays_dirty() {
        let resolution = resolve_conflict(&local(300), &remote(150), from_millis(400));

        assert_eq!(resolution.winner, Winner::Local);
        assert_eq!(resolution.record.payload, json!({"title": "local"}));
        assert!(resolution.record.state.dirty);
        assert_eq!(resolution.record.state.updated_at, from_millis(300));
        assert_eq!(resolution.record.state.merge_count, 1);
    }

    #[test]
    fn test_tie_goes_to_remote() {
        let resolution = resolve_conflict(&local(100), &remote(100), from_millis(100));
        assert_eq!(resolution.winner, Winner::Remote);
    }

    #[test]
    fn test_remote_tombstone_beats_newer_local_edit() {
        let resolution = resolve_conflict(&local(900), &tombstone(remote(100)), from_millis(1_000));

        assert_eq!(resolution.winner, Winner::Remote);
        assert!(resolution.record.state.deleted);
        assert!(!resolution.record.state.dirty);
    }

    #[test]
    fn test_dirty_local_delete_beats_newer_remote_edit() {
        let resolution = resolve_conflict(&tombstone(local(100)), &remote(900), from_millis(1_000));

        assert_eq!(resolution.winner, Winner::Local);
        assert!(resolution.record.state.deleted);
        assert!(resolution.record.state.dirty);
    }

    #[test]
    fn test_merge_count_accumulates() {
        let mut record = local(100);
        record.state.merge_count = 4;

        let resolution = resolve_conflict(&record, &remote(50), from_millis(60));
        assert_eq!(resolution.record.state.merge_count, 5);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let a = resolve_conflict(&local(120), &remote(120), from_millis(500));
        let b = resolve_conflict(&local(120), &remote(120), from_millis(500));
        assert_eq!(a, b);
    }
}
