//! # Push Synchronizer
//!
//! Delivers drained outbox entries to the remote store.
//!
//! ## Overview
//!
//! A drained batch is split by entity family. Families are pushed
//! concurrently; entries of one family are pushed one at a time in outbox
//! order. For each entry the current local record is sent (the entry payload
//! is only a fallback when the record is gone), so a coalesced entry always
//! delivers the latest write.
//!
//! On acknowledgment the record's `dirty` flag is cleared and the entry is
//! completed in one transaction. A record written again while the push was in
//! flight keeps `dirty` set, and its entry (which the write coalesced into)
//! returns to the queue to deliver the newer version. Transient failures go
//! back to the queue with backoff; rejections are parked as `FAILED`.

use bridge_traits::{BridgeError, Clock, RemoteStore};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_store::db::begin_write;
use core_store::{EntityFamily, SqliteRecordStore};
use futures::future::join_all;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{Result, SyncError};
use crate::outbox::{FailureOutcome, OutboxEntry, OutboxQueue, OutboxStatus};

/// Counts from pushing one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Entries acknowledged by the remote store
    pub pushed: u64,
    /// Entries returned to the queue for a later attempt
    pub retrying: u64,
    /// Entries parked as `FAILED`
    pub failed: u64,
    /// Entries requeued because a newer local write coalesced into them while
    /// they were in flight
    pub superseded: u64,
}

impl PushOutcome {
    /// Entries that did not reach the remote store in this pass.
    pub fn failures(&self) -> u64 {
        self.retrying + self.failed
    }
}

impl AddAssign for PushOutcome {
    fn add_assign(&mut self, other: Self) {
        self.pushed += other.pushed;
        self.retrying += other.retrying;
        self.failed += other.failed;
        self.superseded += other.superseded;
    }
}

enum EntryResult {
    Pushed { requeued: bool },
    Failure(FailureOutcome),
}

pub struct PushSynchronizer {
    records: SqliteRecordStore,
    outbox: Arc<OutboxQueue>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    families: HashMap<&'static str, EntityFamily>,
    remote_timeout: Duration,
    event_bus: Arc<EventBus>,
}

impl PushSynchronizer {
    pub fn new(
        records: SqliteRecordStore,
        outbox: Arc<OutboxQueue>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        families: &[EntityFamily],
        remote_timeout: Duration,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            records,
            outbox,
            remote,
            clock,
            families: families.iter().map(|f| (f.name, *f)).collect(),
            remote_timeout,
            event_bus,
        }
    }

    /// Push a drained batch. Only local storage failures are returned as
    /// errors; remote failures are recorded on the entries.
    pub async fn push_batch(&self, job_id: &str, entries: Vec<OutboxEntry>) -> Result<PushOutcome> {
        let mut groups: Vec<(String, Vec<OutboxEntry>)> = Vec::new();
        for entry in entries {
            match groups.iter_mut().find(|(family, _)| *family == entry.entity_type) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.entity_type.clone(), vec![entry])),
            }
        }

        let results = join_all(
            groups
                .into_iter()
                .map(|(_, entries)| self.push_family(job_id, entries)),
        )
        .await;

        let mut outcome = PushOutcome::default();
        for result in results {
            outcome += result?;
        }
        Ok(outcome)
    }

    async fn push_family(&self, job_id: &str, entries: Vec<OutboxEntry>) -> Result<PushOutcome> {
        let mut outcome = PushOutcome::default();

        for entry in entries {
            match self.push_entry(job_id, &entry).await? {
                EntryResult::Pushed { requeued } => {
                    outcome.pushed += 1;
                    if requeued {
                        outcome.superseded += 1;
                    }
                }
                EntryResult::Failure(FailureOutcome::Retrying { .. }) => outcome.retrying += 1,
                EntryResult::Failure(FailureOutcome::Failed { .. }) => outcome.failed += 1,
                EntryResult::Failure(FailureOutcome::Superseded) => outcome.superseded += 1,
            }
        }

        Ok(outcome)
    }

    #[instrument(
        skip(self, entry),
        fields(entry_id = %entry.id, entity_type = %entry.entity_type, entity_id = %entry.entity_id)
    )]
    async fn push_entry(&self, job_id: &str, entry: &OutboxEntry) -> Result<EntryResult> {
        let Some(family) = self.families.get(entry.entity_type.as_str()).copied() else {
            let message = format!("Unknown entity family: {}", entry.entity_type);
            let outcome = self.outbox.mark_rejected(entry.id, &message).await?;
            self.emit_failure(job_id, entry, &outcome, &message);
            return Ok(EntryResult::Failure(outcome));
        };

        let local = self.records.find(family, &entry.entity_id).await?;
        let (deleted, payload, updated_at) = match &local {
            Some(record) => (
                record.is_tombstone(),
                record.payload.clone(),
                record.state.updated_at,
            ),
            None => (
                entry.operation.is_delete(),
                entry.payload.clone(),
                entry.created_at,
            ),
        };

        let call = async {
            if deleted {
                self.remote
                    .delete(family.name, &entry.entity_id, updated_at)
                    .await
            } else {
                self.remote
                    .upsert(family.name, &entry.entity_id, &payload, updated_at)
                    .await
            }
        };

        let result = match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(
                u64::try_from(self.remote_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match result {
            Ok(ack) => {
                let now = self.clock.now();
                let mut tx = begin_write(self.records.pool()).await?;

                let clean = if local.is_some() {
                    self.records
                        .mark_synced_with(&mut tx, family, &entry.entity_id, updated_at, now)
                        .await?
                } else {
                    false
                };
                let status = self.outbox.mark_complete_with(&mut tx, entry.id).await?;

                tx.commit()
                    .await
                    .map_err(|e| SyncError::LocalStorage(e.to_string()))?;

                debug!(
                    remote_updated_at = %ack.remote_updated_at,
                    clean,
                    deleted,
                    ?status,
                    "Outbox entry pushed"
                );
                Ok(EntryResult::Pushed {
                    requeued: status == OutboxStatus::Pending,
                })
            }
            Err(e) if e.is_transient() => {
                let message = e.to_string();
                let outcome = self.outbox.mark_failed(entry.id, &message).await?;
                self.emit_failure(job_id, entry, &outcome, &message);
                Ok(EntryResult::Failure(outcome))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "Remote store rejected outbox entry");
                let outcome = self.outbox.mark_rejected(entry.id, &message).await?;
                self.emit_failure(job_id, entry, &outcome, &message);
                Ok(EntryResult::Failure(outcome))
            }
        }
    }

    fn emit_failure(&self, job_id: &str, entry: &OutboxEntry, outcome: &FailureOutcome, message: &str) {
        if matches!(outcome, FailureOutcome::Superseded) {
            return;
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::EntryFailed {
                job_id: job_id.to_string(),
                entity_type: entry.entity_type.clone(),
                entity_id: entry.entity_id.clone(),
                retry_count: outcome.retry_count(),
                permanent: outcome.is_permanent(),
                message: message.to_string(),
            }))
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::{ManualClock, RemoteAck, RemoteRecord};
    use chrono::{DateTime, Utc};
    use core_store::db::create_test_pool;
    use core_store::record::from_millis;
    use core_store::{Operation, SyncRecord, SyncState, TASKS};
    use mockall::mock;
    use serde_json::{json, Value};

    use crate::outbox::OutboxConfig;

    mock! {
        Remote {}

        #[async_trait]
        impl RemoteStore for Remote {
            async fn upsert(&self, family: &str, id: &str, payload: &Value, updated_at: DateTime<Utc>) -> bridge_traits::error::Result<RemoteAck>;
            async fn delete(&self, family: &str, id: &str, updated_at: DateTime<Utc>) -> bridge_traits::error::Result<RemoteAck>;
            async fn query_changed_since(&self, family: &str, since: Option<DateTime<Utc>>) -> bridge_traits::error::Result<Vec<RemoteRecord>>;
        }
    }

    struct Fixture {
        push: PushSynchronizer,
        records: SqliteRecordStore,
        outbox: Arc<OutboxQueue>,
    }

    async fn fixture(remote: MockRemote) -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_millis(10_000));
        let records = SqliteRecordStore::new(pool.clone());
        let outbox = Arc::new(OutboxQueue::new(
            pool,
            "user-1",
            clock.clone(),
            OutboxConfig::default(),
        ));
        let push = PushSynchronizer::new(
            records.clone(),
            outbox.clone(),
            Arc::new(remote),
            clock,
            &[TASKS],
            Duration::from_secs(5),
            Arc::new(EventBus::new(16)),
        );

        Fixture {
            push,
            records,
            outbox,
        }
    }

    fn ack() -> bridge_traits::error::Result<RemoteAck> {
        Ok(RemoteAck {
            remote_updated_at: from_millis(20_000),
        })
    }

    async fn dirty_task(f: &Fixture, title: &str, deleted: bool) {
        let record = SyncRecord::new(
            "t-1",
            json!({ "id": "t-1", "title": title }),
            SyncState {
                dirty: true,
                updated_at: from_millis(9_000),
                deleted,
                ..SyncState::default()
            },
        );
        f.records.put(TASKS, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_sends_current_record_rather_than_entry_payload() {
        let mut remote = MockRemote::new();
        remote
            .expect_upsert()
            .withf(|family, id, payload, updated_at| {
                family.to_string() == "task"
                    && id.to_string() == "t-1"
                    && payload["title"] == "latest"
                    && *updated_at == from_millis(9_000)
            })
            .times(1)
            .returning(|_, _, _, _| ack());
        remote.expect_delete().never();

        let f = fixture(remote).await;
        dirty_task(&f, "latest", false).await;
        let entry_id = f
            .outbox
            .enqueue("task", "t-1", Operation::Update, &json!({ "title": "stale" }))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert_eq!(outcome.failures(), 0);

        let stored = f.records.find(TASKS, "t-1").await.unwrap().unwrap();
        assert!(!stored.state.dirty);
        assert_eq!(stored.state.synced_at, Some(from_millis(10_000)));
        assert_eq!(
            f.outbox.find(entry_id).await.unwrap().unwrap().status,
            OutboxStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_missing_local_record_pushes_entry_payload() {
        let mut remote = MockRemote::new();
        remote
            .expect_upsert()
            .withf(|_, id, payload, updated_at| {
                id.to_string() == "t-1"
                    && payload["title"] == "queued"
                    && *updated_at == from_millis(10_000)
            })
            .times(1)
            .returning(|_, _, _, _| ack());
        remote.expect_delete().never();

        let f = fixture(remote).await;
        let entry_id = f
            .outbox
            .enqueue("task", "t-1", Operation::Create, &json!({ "title": "queued" }))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.pushed, 1);

        assert!(f.records.find(TASKS, "t-1").await.unwrap().is_none());
        assert_eq!(
            f.outbox.find(entry_id).await.unwrap().unwrap().status,
            OutboxStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_tombstone_is_pushed_as_delete() {
        let mut remote = MockRemote::new();
        remote.expect_upsert().never();
        remote
            .expect_delete()
            .withf(|family, id, _| family.to_string() == "task" && id.to_string() == "t-1")
            .times(1)
            .returning(|_, _, _| ack());

        let f = fixture(remote).await;
        dirty_task(&f, "gone", true).await;
        f.outbox
            .enqueue("task", "t-1", Operation::Delete, &json!({}))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.pushed, 1);
    }

    #[tokio::test]
    async fn test_rejection_parks_entry_and_keeps_record_dirty() {
        let mut remote = MockRemote::new();
        remote
            .expect_upsert()
            .times(1)
            .returning(|_, _, _, _| Err(BridgeError::Rejected("schema mismatch".to_string())));

        let f = fixture(remote).await;
        dirty_task(&f, "bad", false).await;
        let entry_id = f
            .outbox
            .enqueue("task", "t-1", Operation::Create, &json!({}))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.retrying, 0);

        let entry = f.outbox.find(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert!(entry.last_error.unwrap().contains("schema mismatch"));
        assert!(f.records.find(TASKS, "t-1").await.unwrap().unwrap().state.dirty);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_later() {
        let mut remote = MockRemote::new();
        remote
            .expect_upsert()
            .times(1)
            .returning(|_, _, _, _| Err(BridgeError::Network("connection reset".to_string())));

        let f = fixture(remote).await;
        dirty_task(&f, "flaky", false).await;
        let entry_id = f
            .outbox
            .enqueue("task", "t-1", Operation::Create, &json!({}))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.retrying, 1);

        let entry = f.outbox.find(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.next_attempt_at, from_millis(12_000));
    }

    #[tokio::test]
    async fn test_unknown_family_is_rejected_without_remote_call() {
        let mut remote = MockRemote::new();
        remote.expect_upsert().never();
        remote.expect_delete().never();

        let f = fixture(remote).await;
        f.outbox
            .enqueue("barn", "b-1", Operation::Create, &json!({}))
            .await
            .unwrap();

        let batch = f.outbox.drain_batch(10).await.unwrap();
        let outcome = f.push.push_batch("job-1", batch).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(f.outbox.failed_entries().await.unwrap().len(), 1);
    }
}
