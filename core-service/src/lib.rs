//! Core service façade and bootstrap helpers.
//!
//! This crate wires the host configuration and bridge implementations
//! (remote store, network monitor, background executor, clock) into the local
//! store and the sync engine. Host applications talk to [`FarmSyncService`]
//! only: they commit local mutations through it, trigger or schedule sync
//! runs and inspect changes that could not be saved remotely.
//!
//! Desktop apps typically enable the `desktop-shims` feature (which depends on
//! `bridge-desktop`) to get an HTTP remote store from `remote_endpoint` and a
//! Tokio background executor.
//!
//! ```ignore
//! let config = CoreConfig::builder()
//!     .database_path("/data/farm.db")
//!     .device_id(device_id)
//!     .user_id(user_id)
//!     .remote_endpoint("https://sync.example.com/v1")
//!     .build()?;
//!
//! let service = FarmSyncService::bootstrap(config).await?;
//! let mut task = Task::new(farm_id, "Check irrigation");
//! service.commit_local_mutation(&mut task, Operation::Create).await?;
//! let report = service.run_sync().await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{
    background::{BackoffPolicy, TaskConstraints, TaskId},
    error::{BridgeError, Result as BridgeResult},
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus};
use core_store::db::{create_pool, DatabaseConfig};
use core_store::{Operation, Synchronizable, FARM_FAMILIES};
use core_sync::{
    OutboxEntry, OutboxEntryId, OutboxStats, SyncConfig, SyncError, SyncJob, SyncOrchestrator,
    SyncPhase, SyncReport,
};
use futures::future::BoxFuture;
use sqlx::SqlitePool;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, info, warn};

/// Task id under which the recurring sync is registered with the host
/// scheduler.
pub const SYNC_TASK_ID: &str = "farm-sync";

const EVENT_BUS_CAPACITY: usize = 256;

/// Longest the scheduler may stretch the sync interval, as a multiple of the
/// configured interval.
const MAX_INTERVAL_FACTOR: u32 = 8;

struct ServiceInner {
    config: CoreConfig,
    orchestrator: SyncOrchestrator,
    event_bus: Arc<EventBus>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct FarmSyncService {
    inner: Arc<ServiceInner>,
}

impl FarmSyncService {
    /// Open the database at `config.database_path`, wire the engine and run
    /// startup recovery.
    pub async fn bootstrap(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = create_pool(DatabaseConfig::new(&config.database_path)).await?;
        Self::with_pool(config, pool).await
    }

    /// Wire the engine over an existing pool (migrations must already be
    /// applied) and run startup recovery.
    pub async fn with_pool(config: CoreConfig, pool: SqlitePool) -> Result<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let mut orchestrator = SyncOrchestrator::new(
            SyncConfig::from_core(&config),
            pool,
            Arc::clone(&config.remote_store),
            Arc::clone(&config.clock),
            Arc::clone(&event_bus),
            &FARM_FAMILIES,
        )?;

        if config.features.enable_network_awareness {
            let monitor = config.network_monitor.clone().ok_or_else(|| CoreError::CapabilityMissing {
                capability: "NetworkMonitor".to_string(),
                message: "Network awareness enabled without a NetworkMonitor".to_string(),
            })?;
            orchestrator = orchestrator.with_network_monitor(monitor);
        }

        let requeued = orchestrator.recover().await?;
        info!(
            device_id = %config.device_id,
            requeued,
            network_aware = config.features.enable_network_awareness,
            "Farm sync service ready"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                orchestrator,
                event_bus,
            }),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.inner.orchestrator
    }

    // ========================================================================
    // Local data
    // ========================================================================

    /// Write `entity` locally and queue it for sync, atomically.
    pub async fn commit_local_mutation<T: Synchronizable>(
        &self,
        entity: &mut T,
        operation: Operation,
    ) -> Result<OutboxEntryId> {
        Ok(self
            .inner
            .orchestrator
            .committer()
            .commit(entity, operation)
            .await?)
    }

    /// Load a live entity by id.
    pub async fn get<T: Synchronizable>(&self, id: &str) -> Result<Option<T>> {
        Ok(self.inner.orchestrator.records().get_entity(id).await?)
    }

    /// All live entities of one family.
    pub async fn list<T: Synchronizable>(&self) -> Result<Vec<T>> {
        Ok(self.inner.orchestrator.records().list_entities().await?)
    }

    // ========================================================================
    // Sync control
    // ========================================================================

    pub async fn run_sync(&self) -> Result<SyncReport> {
        Ok(self.inner.orchestrator.run_sync().await?)
    }

    /// Request cancellation of the active run.
    pub fn cancel_sync(&self) -> bool {
        self.inner.orchestrator.cancel()
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.orchestrator.phase()
    }

    pub async fn sync_history(&self, limit: u32) -> Result<Vec<SyncJob>> {
        Ok(self.inner.orchestrator.history(limit).await?)
    }

    pub fn subscribe_events(&self) -> Receiver<CoreEvent> {
        self.inner.event_bus.subscribe()
    }

    /// Scheduler entry point: run one pass and report whether it succeeded.
    ///
    /// A run already in progress counts as success so the scheduler does not
    /// back off because of its own overlap.
    pub async fn sync_now(&self) -> BridgeResult<()> {
        match self.inner.orchestrator.run_sync().await {
            Ok(report) if report.success => Ok(()),
            Ok(report) if report.cancelled => {
                Err(BridgeError::OperationFailed("Sync cancelled".to_string()))
            }
            Ok(report) => Err(BridgeError::OperationFailed(format!(
                "{} changes failed to sync",
                report.partial_failure_count
            ))),
            Err(SyncError::SyncInProgress { .. }) => {
                debug!("Scheduled sync skipped, a run is already active");
                Ok(())
            }
            Err(SyncError::Offline) => Err(BridgeError::Network("Device is offline".to_string())),
            Err(e) => Err(BridgeError::OperationFailed(e.to_string())),
        }
    }

    /// Handler to register with a background executor under [`SYNC_TASK_ID`].
    pub fn sync_task_handler(&self) -> impl Fn() -> BoxFuture<'static, BridgeResult<()>> + Send + Sync + 'static {
        let service = self.clone();
        move || {
            let service = service.clone();
            Box::pin(async move { service.sync_now().await })
        }
    }

    /// Backoff policy for the recurring sync, from `sync_interval_secs`.
    pub fn sync_policy(&self) -> BackoffPolicy {
        let interval = Duration::from_secs(self.inner.config.sync_interval_secs);
        BackoffPolicy {
            base_interval: interval,
            max_interval: interval.saturating_mul(MAX_INTERVAL_FACTOR),
            lengthen_on_success: true,
        }
    }

    /// Schedule the recurring sync with the configured background executor.
    ///
    /// The executor must already know the [`SYNC_TASK_ID`] handler (see
    /// [`sync_task_handler`](Self::sync_task_handler)). Returns `None` when
    /// background sync is disabled.
    pub async fn start_background_sync(&self) -> Result<Option<TaskId>> {
        if !self.inner.config.features.enable_background_sync {
            debug!("Background sync disabled");
            return Ok(None);
        }

        let executor = self
            .inner
            .config
            .background_executor
            .as_ref()
            .ok_or_else(|| CoreError::CapabilityMissing {
                capability: "BackgroundExecutor".to_string(),
                message: "Background sync enabled without a BackgroundExecutor".to_string(),
            })?;

        let policy = self.sync_policy();
        let task_id = executor
            .schedule_task(SYNC_TASK_ID, policy, TaskConstraints::default())
            .await?;

        info!(
            task_id = %task_id.0,
            interval_secs = policy.base_interval.as_secs(),
            "Background sync scheduled"
        );
        Ok(Some(task_id))
    }

    pub async fn stop_background_sync(&self) -> Result<()> {
        if let Some(executor) = &self.inner.config.background_executor {
            if let Err(e) = executor.cancel_task(&TaskId::new(SYNC_TASK_ID)).await {
                warn!(error = %e, "Background sync was not scheduled");
            }
        }
        Ok(())
    }

    /// Register the sync handler with the desktop executor.
    #[cfg(feature = "desktop-shims")]
    pub async fn register_sync_handler(
        &self,
        executor: &bridge_desktop::TokioBackgroundExecutor,
    ) -> Result<()> {
        let handler = self.sync_task_handler();
        executor
            .register_task_handler(SYNC_TASK_ID, move || handler())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Pending and failed changes
    // ========================================================================

    pub async fn pending_changes(&self) -> Result<OutboxStats> {
        Ok(self.inner.orchestrator.outbox().stats().await?)
    }

    /// Number of records per family whose local changes have not been
    /// acknowledged by the remote store, tombstones included.
    pub async fn unsynced_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let records = self.inner.orchestrator.records();
        let mut counts = Vec::with_capacity(FARM_FAMILIES.len());
        for family in FARM_FAMILIES {
            counts.push((family.name, records.count_dirty(family).await?));
        }
        Ok(counts)
    }

    /// Live entities of one family still waiting to be pushed.
    pub async fn unsynced<T: Synchronizable>(&self) -> Result<Vec<T>> {
        Ok(self.inner.orchestrator.records().list_dirty_entities().await?)
    }

    /// Local changes the remote store refused or that ran out of retries.
    pub async fn failed_changes(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.inner.orchestrator.outbox().failed_entries().await?)
    }

    /// Queue a failed change for another attempt on the next run.
    pub async fn retry_failed_change(&self, entry_id: &str) -> Result<()> {
        let id = OutboxEntryId::from_string(entry_id)?;
        self.inner.orchestrator.outbox().retry_failed(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::{
        background::{BackgroundExecutor, TaskStatus},
        ManualClock, RemoteAck, RemoteRecord, RemoteStore,
    };
    use chrono::{DateTime, Utc};
    use core_runtime::config::FeatureFlags;
    use core_store::db::create_test_pool;
    use core_store::models::Task;
    use mockall::mock;
    use serde_json::Value;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryRemote {
        records: Mutex<HashMap<(String, String), RemoteRecord>>,
        reject_writes: Mutex<bool>,
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn upsert(&self, family: &str, id: &str, payload: &Value, updated_at: DateTime<Utc>) -> BridgeResult<RemoteAck> {
            if *self.reject_writes.lock().await {
                return Err(BridgeError::Rejected("read-only account".to_string()));
            }
            let mut records = self.records.lock().await;
            let remote_updated_at = updated_at;
            records.insert(
                (family.to_string(), id.to_string()),
                RemoteRecord::live(id, payload.clone(), updated_at, remote_updated_at),
            );
            Ok(RemoteAck { remote_updated_at })
        }

        async fn delete(&self, family: &str, id: &str, updated_at: DateTime<Utc>) -> BridgeResult<RemoteAck> {
            let mut records = self.records.lock().await;
            records.insert(
                (family.to_string(), id.to_string()),
                RemoteRecord::tombstone(id, updated_at, updated_at),
            );
            Ok(RemoteAck {
                remote_updated_at: updated_at,
            })
        }

        async fn query_changed_since(&self, family: &str, since: Option<DateTime<Utc>>) -> BridgeResult<Vec<RemoteRecord>> {
            let records = self.records.lock().await;
            let mut changed: Vec<RemoteRecord> = records
                .iter()
                .filter(|((f, _), r)| f == family && since.map_or(true, |s| r.remote_updated_at > s))
                .map(|(_, r)| r.clone())
                .collect();
            changed.sort_by_key(|r| r.remote_updated_at);
            Ok(changed)
        }
    }

    mock! {
        Executor {}

        #[async_trait]
        impl BackgroundExecutor for Executor {
            async fn schedule_task(&self, task_id: &str, policy: BackoffPolicy, constraints: TaskConstraints) -> BridgeResult<TaskId>;
            async fn schedule_once(&self, task_id: &str, delay: Duration, constraints: TaskConstraints) -> BridgeResult<TaskId>;
            async fn cancel_task(&self, task_id: &TaskId) -> BridgeResult<()>;
            async fn get_task_status(&self, task_id: &TaskId) -> BridgeResult<TaskStatus>;
            async fn list_tasks(&self) -> BridgeResult<Vec<TaskId>>;
            async fn next_execution_time(&self, task_id: &TaskId) -> BridgeResult<Option<Duration>>;
        }
    }

    async fn service_with(remote: Arc<MemoryRemote>, executor: Option<Arc<dyn BackgroundExecutor>>) -> FarmSyncService {
        let mut builder = CoreConfig::builder()
            .database_path(":memory:")
            .device_id("device-1")
            .user_id("user-1")
            .remote_store(remote)
            .clock(Arc::new(ManualClock::at_millis(1_700_000_000_000)))
            .sync_interval_secs(60);

        if let Some(executor) = executor {
            builder = builder
                .background_executor(executor)
                .features(FeatureFlags {
                    enable_background_sync: true,
                    enable_network_awareness: false,
                });
        }

        let config = builder.build().unwrap();
        FarmSyncService::with_pool(config, create_test_pool().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_sync_round_trip() {
        let remote = Arc::new(MemoryRemote::default());
        let service = service_with(remote.clone(), None).await;

        let mut task = Task::new("farm-1", "Feed the pigs");
        let id = task.id.to_string();
        service
            .commit_local_mutation(&mut task, Operation::Create)
            .await
            .unwrap();
        assert_eq!(service.pending_changes().await.unwrap().pending, 1);

        let report = service.run_sync().await.unwrap();
        assert!(report.success);
        assert_eq!(report.pushed_count, 1);

        let stored: Task = service.get(&id).await.unwrap().unwrap();
        assert!(!stored.sync.dirty);
        assert_eq!(service.list::<Task>().await.unwrap().len(), 1);
        assert!(remote.records.lock().await.contains_key(&("task".to_string(), id)));
        assert_eq!(service.sync_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_changes_can_be_retried() {
        let remote = Arc::new(MemoryRemote::default());
        *remote.reject_writes.lock().await = true;
        let service = service_with(remote.clone(), None).await;

        let mut task = Task::new("farm-1", "Sell heifers");
        service
            .commit_local_mutation(&mut task, Operation::Create)
            .await
            .unwrap();

        assert!(service.sync_now().await.is_err());
        let failed = service.failed_changes().await.unwrap();
        assert_eq!(failed.len(), 1);

        *remote.reject_writes.lock().await = false;
        service
            .retry_failed_change(&failed[0].id.to_string())
            .await
            .unwrap();
        assert!(service.sync_now().await.is_ok());
        assert!(service.failed_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_changes_are_reported_until_pushed() {
        let remote = Arc::new(MemoryRemote::default());
        let service = service_with(remote, None).await;

        let mut kept = Task::new("farm-1", "Mend the fence");
        let mut dropped = Task::new("farm-1", "Order seed");
        for task in [&mut kept, &mut dropped] {
            service
                .commit_local_mutation(task, Operation::Create)
                .await
                .unwrap();
        }
        service
            .commit_local_mutation(&mut dropped, Operation::Delete)
            .await
            .unwrap();

        let counts = service.unsynced_counts().await.unwrap();
        assert_eq!(counts, vec![("task", 2), ("daily_log", 0), ("transfer", 0)]);

        let unsynced: Vec<Task> = service.unsynced().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, kept.id);

        assert!(service.run_sync().await.unwrap().success);
        let counts = service.unsynced_counts().await.unwrap();
        assert!(counts.iter().all(|(_, count)| *count == 0));
        assert!(service.unsynced::<Task>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_entry_id_is_rejected() {
        let service = service_with(Arc::new(MemoryRemote::default()), None).await;
        let result = service.retry_failed_change("not-a-uuid").await;
        assert!(matches!(result, Err(CoreError::Sync(_))));
    }

    #[tokio::test]
    async fn test_background_sync_disabled_schedules_nothing() {
        let service = service_with(Arc::new(MemoryRemote::default()), None).await;
        assert!(service.start_background_sync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_background_sync_schedules_with_policy() {
        let mut executor = MockExecutor::new();
        executor
            .expect_schedule_task()
            .withf(|task_id, policy, constraints| {
                task_id.to_string() == SYNC_TASK_ID
                    && policy.base_interval == Duration::from_secs(60)
                    && policy.max_interval == Duration::from_secs(480)
                    && policy.lengthen_on_success
                    && constraints.requires_network
            })
            .times(1)
            .returning(|task_id, _, _| Ok(TaskId::new(task_id)));

        let service = service_with(Arc::new(MemoryRemote::default()), Some(Arc::new(executor) as Arc<dyn BackgroundExecutor>)).await;
        let task_id = service.start_background_sync().await.unwrap();
        assert_eq!(task_id, Some(TaskId::new(SYNC_TASK_ID)));
    }

    #[tokio::test]
    async fn test_sync_task_handler_runs_a_pass() {
        let remote = Arc::new(MemoryRemote::default());
        let service = service_with(remote.clone(), None).await;
        let mut task = Task::new("farm-1", "Count bales");
        service
            .commit_local_mutation(&mut task, Operation::Create)
            .await
            .unwrap();

        let handler = service.sync_task_handler();
        handler().await.unwrap();

        assert_eq!(remote.records.lock().await.len(), 1);
        assert_eq!(service.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_events_are_forwarded_to_subscribers() {
        let service = service_with(Arc::new(MemoryRemote::default()), None).await;
        let mut events = service.subscribe_events();

        let mut task = Task::new("farm-1", "Walk boundary");
        service
            .commit_local_mutation(&mut task, Operation::Create)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::Record(_)));
    }
}
