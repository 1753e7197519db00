//! # Local Mutations
//!
//! The single write path for synchronized entities. Committing a mutation
//! marks the entity dirty, stores it and queues (or coalesces) its outbox entry
//! in one transaction, so a record is never dirty without something to push
//! and never queued without the write it describes.
//!
//! ```ignore
//! let mut task = Task::new("farm-1", "Repair irrigation pump");
//! committer.commit(&mut task, Operation::Create).await?;
//!
//! task.status = TaskStatus::Done;
//! committer.commit(&mut task, Operation::Update).await?;
//! ```

use bridge_traits::Clock;
use core_runtime::events::{CoreEvent, EventBus, RecordEvent};
use core_store::db::begin_write;
use core_store::{Operation, SqliteRecordStore, SyncRecord, Synchronizable};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};
use crate::outbox::{OutboxEntryId, OutboxQueue};

#[derive(Clone)]
pub struct LocalMutationCommitter {
    records: SqliteRecordStore,
    outbox: Arc<OutboxQueue>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
}

impl LocalMutationCommitter {
    pub fn new(
        records: SqliteRecordStore,
        outbox: Arc<OutboxQueue>,
        clock: Arc<dyn Clock>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            records,
            outbox,
            clock,
            event_bus,
        }
    }

    /// Persist a local write of `entity` and queue it for push.
    ///
    /// `entity`'s sync state is updated in place: it comes back dirty, with a
    /// `updated_at` later than any version previously stored for it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidInput`] when the entity fails validation
    ///   (deletes are not validated)
    /// - [`SyncError::EntityNotFound`] when deleting a record that was never
    ///   stored
    #[instrument(skip(self, entity), fields(entity_type = %T::family(), entity_id = %entity.id(), operation = %operation))]
    pub async fn commit<T: Synchronizable>(
        &self,
        entity: &mut T,
        operation: Operation,
    ) -> Result<OutboxEntryId> {
        let family = T::family();
        let id = entity.id();

        if !operation.is_delete() {
            entity.validate().map_err(|message| SyncError::InvalidInput {
                field: family.name.to_string(),
                message,
            })?;
        }

        let mut tx = begin_write(self.records.pool()).await?;

        let stored = self.records.find_with(&mut tx, family, &id).await?;
        if operation.is_delete() && stored.is_none() {
            return Err(SyncError::EntityNotFound {
                entity_type: family.name.to_string(),
                entity_id: id,
            });
        }

        if let Some(stored) = &stored {
            // Carry bookkeeping the caller's copy may not have seen
            let state = entity.sync_state_mut();
            if state.updated_at < stored.state.updated_at {
                state.updated_at = stored.state.updated_at;
            }
            state.synced_at = stored.state.synced_at;
            state.merged_at = stored.state.merged_at;
            state.merge_count = stored.state.merge_count;
        }

        let now = self.clock.now();
        if operation.is_delete() {
            entity.mark_deleted(now);
        } else {
            entity.mark_dirty(now);
            entity.sync_state_mut().deleted = false;
        }

        let record = SyncRecord::from_entity(entity)?;
        self.records.put_with(&mut tx, family, &record).await?;
        let entry_id = self
            .outbox
            .enqueue_with(&mut tx, family.name, &id, operation, &record.payload)
            .await?;

        tx.commit()
            .await
            .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

        debug!(entry_id = %entry_id, updated_at = %record.state.updated_at, "Local mutation committed");

        self.event_bus
            .emit(CoreEvent::Record(RecordEvent::Committed {
                entity_type: family.name.to_string(),
                entity_id: id,
                operation: operation.to_string(),
            }))
            .ok();

        Ok(entry_id)
    }
}
