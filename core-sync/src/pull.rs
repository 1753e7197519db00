//! # Pull Synchronizer
//!
//! Applies remote changes newer than a family's cursor.
//!
//! ## Overview
//!
//! For one family: fetch every remote record changed since the cursor, then in
//! a single transaction apply each record and advance the cursor to the
//! highest `remote_updated_at` in the batch. If any record fails to apply the
//! transaction rolls back, leaving both records and cursor untouched, so the
//! next run fetches the same batch again.
//!
//! Fetching ([`PullSynchronizer::fetch`]) and applying
//! ([`PullSynchronizer::apply`]) are separate steps so callers can check for
//! cancellation in between. Fetches of different families may overlap; apply
//! transactions run one at a time.
//!
//! Applying a record:
//! - no local copy, or a clean local copy: store the remote version
//! - a dirty local copy: resolve with
//!   [`resolve_conflict`](crate::conflict_resolver::resolve_conflict); when the
//!   remote version wins, the record's pending outbox entry is dropped with it

use bridge_traits::{Clock, RemoteRecord, RemoteStore};
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, RecordEvent, SyncEvent};
use core_store::db::begin_write;
use core_store::record::{to_millis, truncate_millis};
use core_store::{EntityFamily, SqliteRecordStore, SyncRecord, SyncState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::conflict_resolver::{resolve_conflict, Winner};
use crate::cursor::SyncCursorStore;
use crate::error::{Result, SyncError};
use crate::outbox::OutboxQueue;

/// Result of pulling one family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub family: String,
    /// Remote records returned by the change query
    pub fetched: u64,
    /// Remote versions stored locally
    pub applied: u64,
    /// Dirty local records that met a remote version
    pub conflicts: u64,
    /// Conflicts the local version won
    pub local_wins: u64,
    /// Cursor after the pull
    pub cursor: Option<DateTime<Utc>>,
}

/// Remote changes of one family, fetched but not yet applied.
#[derive(Debug, Clone)]
pub struct FetchedChanges {
    pub family: EntityFamily,
    /// Cursor the changes were fetched after
    pub since: Option<DateTime<Utc>>,
    pub changes: Vec<RemoteRecord>,
}

pub struct PullSynchronizer {
    records: SqliteRecordStore,
    outbox: Arc<OutboxQueue>,
    cursors: Arc<SyncCursorStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    remote_timeout: Duration,
    event_bus: Arc<EventBus>,
    apply_lock: Mutex<()>,
}

impl PullSynchronizer {
    pub fn new(
        records: SqliteRecordStore,
        outbox: Arc<OutboxQueue>,
        cursors: Arc<SyncCursorStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        remote_timeout: Duration,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            records,
            outbox,
            cursors,
            remote,
            clock,
            remote_timeout,
            event_bus,
            apply_lock: Mutex::new(()),
        }
    }

    /// Pull and apply the remote changes of one family.
    ///
    /// # Errors
    ///
    /// Remote failures and records that cannot be applied abort the family
    /// with nothing written; local storage failures are fatal.
    pub async fn pull_family(&self, job_id: &str, family: EntityFamily) -> Result<PullOutcome> {
        let fetched = self.fetch(family).await?;
        self.apply(job_id, fetched).await
    }

    /// Query the remote store for changes after the family's cursor.
    #[instrument(skip(self), fields(family = %family))]
    pub async fn fetch(&self, family: EntityFamily) -> Result<FetchedChanges> {
        let since = self.cursors.get(family.name).await?;

        let changes = match tokio::time::timeout(
            self.remote_timeout,
            self.remote.query_changed_since(family.name, since),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Remote(format!(
                    "Change query for {} timed out after {} ms",
                    family.name,
                    self.remote_timeout.as_millis()
                )))
            }
        };

        debug!(fetched = changes.len(), since = ?since, "Fetched remote changes");
        Ok(FetchedChanges {
            family,
            since,
            changes,
        })
    }

    /// Apply a fetched batch and advance the cursor in one transaction.
    #[instrument(skip(self, fetched), fields(family = %fetched.family))]
    pub async fn apply(&self, job_id: &str, fetched: FetchedChanges) -> Result<PullOutcome> {
        let FetchedChanges {
            family,
            since,
            changes,
        } = fetched;

        let mut outcome = PullOutcome {
            family: family.name.to_string(),
            fetched: changes.len() as u64,
            cursor: since,
            ..PullOutcome::default()
        };

        if changes.is_empty() {
            debug!("No remote changes");
            return Ok(outcome);
        }

        let _applying = self.apply_lock.lock().await;

        let now = self.clock.now();
        let mut applied = Vec::with_capacity(changes.len());
        let mut conflicts = Vec::new();
        let mut high_water = since;

        let mut tx = begin_write(self.records.pool()).await?;

        for change in &changes {
            let remote = remote_to_record(family, change)?;
            let local = self.records.find_with(&mut tx, family, &change.id).await?;

            let (stored, winner) = match local {
                Some(local) if local.state.dirty => {
                    let resolution = resolve_conflict(&local, &remote, now);
                    outcome.conflicts += 1;
                    if resolution.winner == Winner::Remote {
                        self.outbox
                            .discard_pending_with(&mut tx, family.name, &change.id)
                            .await?;
                    } else {
                        outcome.local_wins += 1;
                    }
                    conflicts.push((change.id.clone(), resolution.winner));
                    (resolution.record, resolution.winner)
                }
                Some(local) => {
                    let record = SyncRecord {
                        state: SyncState {
                            synced_at: local.state.synced_at,
                            merged_at: local.state.merged_at,
                            merge_count: local.state.merge_count,
                            ..remote.state
                        },
                        ..remote
                    };
                    (record, Winner::Remote)
                }
                None => (remote, Winner::Remote),
            };

            self.records.put_with(&mut tx, family, &stored).await?;

            if winner == Winner::Remote {
                outcome.applied += 1;
                applied.push((change.id.clone(), stored.state.deleted));
            }

            let remote_ts = truncate_millis(change.remote_updated_at);
            high_water = Some(match high_water {
                Some(current) if current >= remote_ts => current,
                _ => remote_ts,
            });
        }

        if let Some(cursor) = high_water {
            outcome.cursor = Some(self.cursors.advance_with(&mut tx, family.name, cursor).await?);
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        info!(
            fetched = outcome.fetched,
            applied = outcome.applied,
            conflicts = outcome.conflicts,
            cursor = ?outcome.cursor,
            "Applied remote changes"
        );

        self.emit_applied(job_id, family, &outcome, applied, conflicts);
        Ok(outcome)
    }

    fn emit_applied(
        &self,
        job_id: &str,
        family: EntityFamily,
        outcome: &PullOutcome,
        applied: Vec<(String, bool)>,
        conflicts: Vec<(String, Winner)>,
    ) {
        for (entity_id, winner) in conflicts {
            self.event_bus
                .emit(CoreEvent::Sync(SyncEvent::ConflictResolved {
                    entity_type: family.name.to_string(),
                    entity_id,
                    winner: winner.to_string(),
                }))
                .ok();
        }

        for (entity_id, deleted) in applied {
            self.event_bus
                .emit(CoreEvent::Record(RecordEvent::RemoteApplied {
                    entity_type: family.name.to_string(),
                    entity_id,
                    deleted,
                }))
                .ok();
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::FamilyPulled {
                job_id: job_id.to_string(),
                entity_type: family.name.to_string(),
                applied: outcome.applied,
                cursor_millis: outcome.cursor.map(to_millis),
            }))
            .ok();
    }
}

/// Clean local representation of a remote record.
fn remote_to_record(family: EntityFamily, change: &RemoteRecord) -> Result<SyncRecord> {
    let payload = change.payload.clone().unwrap_or(Value::Null);

    if !change.is_tombstone() && !payload.is_object() {
        return Err(SyncError::InvalidInput {
            field: "payload".to_string(),
            message: format!(
                "Remote {} {} has a non-object payload",
                family.name, change.id
            ),
        });
    }

    Ok(SyncRecord::new(
        change.id.clone(),
        payload,
        SyncState {
            dirty: false,
            updated_at: truncate_millis(change.updated_at),
            deleted: change.is_tombstone(),
            ..SyncState::default()
        },
    ))
}
