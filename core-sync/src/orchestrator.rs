//! # Sync Orchestrator
//!
//! Runs push-then-pull sync passes for every registered entity family.
//!
//! ## Overview
//!
//! A run:
//! 1. Skips immediately when the network monitor reports no connectivity
//! 2. Claims the single run slot; a concurrent call fails with
//!    [`SyncError::SyncInProgress`]
//! 3. Returns stale `IN_PROGRESS` outbox entries to the queue
//! 4. **Push**: drains the outbox in batches and delivers them
//! 5. **Pull**: fetches every family concurrently, then applies each batch in
//!    its own transaction, one family at a time
//! 6. Records the run as a [`SyncJob`] and emits progress events
//!
//! All local changes are pushed before anything is pulled, so push and pull of
//! the same family never overlap. Cancellation is cooperative: it is checked
//! between push batches and before each family's pull, and whatever was in
//! flight is finished or left for the reaper. A family whose changes were
//! fetched when the cancel arrived is not applied. The whole run is bounded by
//! `sync_timeout`; every remote call by `remote_timeout`.
//!
//! Failures of single entries or families make the run a partial success
//! (`success == false`, `partial_failure_count > 0`). A local storage failure
//! aborts the run and moves the orchestrator to [`SyncPhase::Failed`] until
//! the next run starts.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncConfig, SyncOrchestrator};
//! use core_store::FARM_FAMILIES;
//!
//! let orchestrator = SyncOrchestrator::new(
//!     SyncConfig::new("device-1", "user-1"),
//!     pool,
//!     remote,
//!     clock,
//!     event_bus,
//!     &FARM_FAMILIES,
//! )?;
//! orchestrator.recover().await?;
//!
//! let report = orchestrator.run_sync().await?;
//! println!("pushed {} pulled {}", report.pushed_count, report.pulled_count);
//! ```

use crate::{
    cursor::SyncCursorStore,
    job::{SyncJob, SyncJobId},
    mutation::LocalMutationCommitter,
    outbox::{OutboxConfig, OutboxQueue},
    pull::PullSynchronizer,
    push::{PushOutcome, PushSynchronizer},
    repository::{SqliteSyncJobRepository, SyncJobRepository},
    Result, SyncError,
};
use bridge_traits::{network::NetworkMonitor, Clock, RemoteStore};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use core_store::{EntityFamily, SqliteRecordStore};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub device_id: String,
    pub user_id: String,

    /// Outbox entries drained per push batch
    pub batch_size: usize,

    /// Failed attempts before an outbox entry is parked as `FAILED`
    pub max_retries: u32,

    /// Timeout for a single remote call
    pub remote_timeout: Duration,

    /// Timeout for an entire run
    pub sync_timeout: Duration,

    /// Age after which an `IN_PROGRESS` entry is considered abandoned
    pub in_progress_timeout: Duration,

    pub retry_base_delay: Duration,

    pub retry_max_delay: Duration,

    /// Upper bound on push batches per run
    pub max_push_batches: usize,

    /// How long acknowledged outbox entries are kept
    pub completed_retention: Duration,
}

impl SyncConfig {
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            batch_size: 50,
            max_retries: 3,
            remote_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(15 * 60),
            in_progress_timeout: Duration::from_secs(5 * 60),
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(10 * 60),
            max_push_batches: 20,
            completed_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Engine settings carried by the host configuration.
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            remote_timeout: Duration::from_secs(config.remote_timeout_secs),
            sync_timeout: Duration::from_secs(config.sync_timeout_secs),
            in_progress_timeout: Duration::from_secs(config.in_progress_timeout_secs),
            ..Self::new(config.device_id.clone(), config.user_id.clone())
        }
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            max_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Observable state of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    /// The last run hit a fatal error
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "IDLE",
            SyncPhase::Pushing => "PUSHING",
            SyncPhase::Pulling => "PULLING",
            SyncPhase::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub job_id: SyncJobId,
    /// No entry or family failed and the run was not cancelled
    pub success: bool,
    /// Outbox entries and families that failed in this run
    pub partial_failure_count: u64,
    pub pushed_count: u64,
    pub pulled_count: u64,
    pub conflict_count: u64,
    pub cancelled: bool,
}

impl SyncReport {
    fn from_job(job: &SyncJob, cancelled: bool) -> Self {
        Self {
            job_id: job.id,
            success: !cancelled && job.stats.is_clean(),
            partial_failure_count: job.stats.failures,
            pushed_count: job.stats.pushed,
            pulled_count: job.stats.pulled,
            conflict_count: job.stats.conflicts,
            cancelled,
        }
    }
}

/// Active run tracking
#[derive(Clone)]
struct ActiveSync {
    job_id: SyncJobId,
    cancellation_token: CancellationToken,
}

/// Releases the run slot when the run ends, including when its future is
/// dropped.
struct ActiveSyncGuard<'a> {
    slot: &'a Mutex<Option<ActiveSync>>,
    job_id: SyncJobId,
}

impl Drop for ActiveSyncGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|active| active.job_id) == Some(self.job_id) {
            *slot = None;
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct SyncOrchestrator {
    config: SyncConfig,
    families: Vec<EntityFamily>,
    records: SqliteRecordStore,
    outbox: Arc<OutboxQueue>,
    cursors: Arc<SyncCursorStore>,
    push: PushSynchronizer,
    pull: PullSynchronizer,
    committer: LocalMutationCommitter,
    job_repository: Arc<dyn SyncJobRepository>,
    event_bus: Arc<EventBus>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    active_sync: Mutex<Option<ActiveSync>>,
    phase: RwLock<SyncPhase>,
}

impl SyncOrchestrator {
    /// Create an orchestrator for `families`.
    ///
    /// # Errors
    ///
    /// Returns an error if a family name is unusable or registered twice.
    pub fn new(
        config: SyncConfig,
        pool: SqlitePool,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        event_bus: Arc<EventBus>,
        families: &[EntityFamily],
    ) -> Result<Self> {
        for (i, family) in families.iter().enumerate() {
            family.validate()?;
            if families[..i].iter().any(|f| f.name == family.name) {
                return Err(SyncError::InvalidInput {
                    field: "families".to_string(),
                    message: format!("Family {} registered twice", family.name),
                });
            }
        }

        let records = SqliteRecordStore::new(pool.clone());
        let outbox = Arc::new(OutboxQueue::new(
            pool.clone(),
            config.user_id.clone(),
            clock.clone(),
            config.outbox_config(),
        ));
        let cursors = Arc::new(SyncCursorStore::new(
            pool.clone(),
            config.device_id.clone(),
            clock.clone(),
        ));

        let push = PushSynchronizer::new(
            records.clone(),
            outbox.clone(),
            remote.clone(),
            clock.clone(),
            families,
            config.remote_timeout,
            event_bus.clone(),
        );
        let pull = PullSynchronizer::new(
            records.clone(),
            outbox.clone(),
            cursors.clone(),
            remote,
            clock.clone(),
            config.remote_timeout,
            event_bus.clone(),
        );
        let committer =
            LocalMutationCommitter::new(records.clone(), outbox.clone(), clock, event_bus.clone());

        Ok(Self {
            config,
            families: families.to_vec(),
            records,
            outbox,
            cursors,
            push,
            pull,
            committer,
            job_repository: Arc::new(SqliteSyncJobRepository::new(pool)),
            event_bus,
            network_monitor: None,
            active_sync: Mutex::new(None),
            phase: RwLock::new(SyncPhase::Idle),
        })
    }

    /// Skip runs while the monitor reports no connectivity.
    pub fn with_network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn families(&self) -> &[EntityFamily] {
        &self.families
    }

    pub fn outbox(&self) -> &Arc<OutboxQueue> {
        &self.outbox
    }

    pub fn cursors(&self) -> &Arc<SyncCursorStore> {
        &self.cursors
    }

    pub fn records(&self) -> &SqliteRecordStore {
        &self.records
    }

    /// Write path for local mutations sharing this orchestrator's outbox.
    pub fn committer(&self) -> &LocalMutationCommitter {
        &self.committer
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Recent runs, most recent first.
    pub async fn history(&self, limit: u32) -> Result<Vec<SyncJob>> {
        self.job_repository.history(limit).await
    }

    /// Startup recovery: create missing family tables, close out runs left
    /// active by a previous process and requeue every `IN_PROGRESS` outbox
    /// entry.
    ///
    /// Must not be called while a run is in progress.
    pub async fn recover(&self) -> Result<u64> {
        if self.is_running() {
            return Err(SyncError::SyncInProgress {
                device_id: self.config.device_id.clone(),
            });
        }

        for family in &self.families {
            self.records.ensure_table(*family).await?;
        }

        for job in self.job_repository.find_active().await? {
            let job_id = job.id;
            let failed = job.fail("Interrupted before completion".to_string(), None)?;
            self.job_repository.update(&failed).await?;
            warn!(job_id = %job_id, "Closed out interrupted sync job");
        }

        let reaped = self.outbox.reap_stale(Duration::ZERO).await?;
        info!(reaped, families = self.families.len(), "Sync engine recovered");
        Ok(reaped)
    }

    /// Run one sync pass.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Offline`] when the network monitor reports no connectivity
    /// - [`SyncError::SyncInProgress`] when another run is active
    /// - [`SyncError::Timeout`] when the run exceeds `sync_timeout`
    /// - [`SyncError::LocalStorage`] on a fatal local store failure
    ///
    /// Remote failures of single entries or families are not errors; they are
    /// reported through [`SyncReport::partial_failure_count`].
    #[instrument(skip(self), fields(device_id = %self.config.device_id))]
    pub async fn run_sync(&self) -> Result<SyncReport> {
        if let Some(monitor) = &self.network_monitor {
            if !monitor.is_connected().await {
                info!("Skipping sync while offline");
                return Err(SyncError::Offline);
            }
        }

        let job = SyncJob::new();
        let job_id = job.id;
        let cancellation_token = CancellationToken::new();
        let _guard = self.claim(job_id, cancellation_token.clone())?;

        self.job_repository.insert(&job).await?;
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::Started {
                job_id: job_id.to_string(),
            }))
            .ok();
        info!(job_id = %job_id, "Sync started");

        let run = self.execute(job, cancellation_token);

        match timeout(self.config.sync_timeout, run).await {
            Ok(Ok(report)) => {
                self.set_phase(SyncPhase::Idle);
                Ok(report)
            }
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "Sync failed");
                self.set_phase(SyncPhase::Failed);
                self.fail_job(job_id, &e.to_string(), !e.is_fatal()).await;
                Err(e)
            }
            Err(_) => {
                let secs = self.config.sync_timeout.as_secs();
                error!(job_id = %job_id, timeout_secs = secs, "Sync timed out");
                self.set_phase(SyncPhase::Failed);
                self.fail_job(job_id, &format!("Timeout after {} seconds", secs), true)
                    .await;
                Err(SyncError::Timeout(secs))
            }
        }
    }

    /// Request cancellation of the active run. Returns `false` when no run is
    /// active.
    pub fn cancel(&self) -> bool {
        match self.lock_slot().as_ref() {
            Some(active) => {
                active.cancellation_token.cancel();
                info!(job_id = %active.job_id, "Sync cancellation requested");
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Run internals
    // ========================================================================

    async fn execute(&self, job: SyncJob, token: CancellationToken) -> Result<SyncReport> {
        let job_id = job.id.to_string();

        self.outbox.reap_stale(self.config.in_progress_timeout).await?;

        // Push
        let mut job = job.begin_push()?;
        self.job_repository.update(&job).await?;
        self.enter_phase(&job_id, SyncPhase::Pushing);

        let mut pushed = PushOutcome::default();
        for _ in 0..self.config.max_push_batches {
            if token.is_cancelled() {
                break;
            }

            let batch = self.outbox.drain_batch(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let outcome = self.push.push_batch(&job_id, batch).await?;
            job.record_push(outcome.pushed, outcome.failures())?;
            pushed += outcome;
        }
        self.job_repository.update(&job).await?;
        debug!(
            pushed = pushed.pushed,
            retrying = pushed.retrying,
            failed = pushed.failed,
            "Push phase finished"
        );

        if token.is_cancelled() {
            return self.finish_cancelled(job).await;
        }

        // Pull
        let mut job = job.begin_pull()?;
        self.job_repository.update(&job).await?;
        self.enter_phase(&job_id, SyncPhase::Pulling);

        let pulls = self.families.iter().map(|family| {
            let token = token.clone();
            let job_id = job_id.as_str();
            async move {
                if token.is_cancelled() {
                    return None;
                }
                let fetched = match self.pull.fetch(*family).await {
                    Ok(fetched) => fetched,
                    Err(e) => return Some((*family, Err(e))),
                };
                if token.is_cancelled() {
                    debug!(family = %family, "Pull cancelled before applying");
                    return None;
                }
                Some((*family, self.pull.apply(job_id, fetched).await))
            }
        });

        let mut skipped = false;
        for result in join_all(pulls).await {
            match result {
                None => skipped = true,
                Some((_, Ok(outcome))) => job.record_pull(outcome.applied, outcome.conflicts)?,
                Some((_, Err(e))) if e.is_fatal() => return Err(e),
                Some((family, Err(e))) => {
                    warn!(family = %family, error = %e, "Pull failed for family");
                    job.record_pull_failure()?;
                }
            }
        }

        if skipped {
            return self.finish_cancelled(job).await;
        }

        let job = job.complete()?;
        self.job_repository.update(&job).await?;

        let report = SyncReport::from_job(&job, false);
        info!(
            job_id = %job_id,
            pushed = report.pushed_count,
            pulled = report.pulled_count,
            conflicts = report.conflict_count,
            partial_failures = report.partial_failure_count,
            "Sync completed"
        );

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::Completed {
                job_id: job_id.clone(),
                pushed: report.pushed_count,
                pulled: report.pulled_count,
                partial_failures: report.partial_failure_count,
                duration_secs: job.duration_secs().unwrap_or(0),
            }))
            .ok();

        if let Err(e) = self
            .outbox
            .purge_completed(self.config.completed_retention)
            .await
        {
            warn!(error = %e, "Failed to purge completed outbox entries");
        }

        Ok(report)
    }

    async fn finish_cancelled(&self, job: SyncJob) -> Result<SyncReport> {
        let job = job.cancel()?;
        self.job_repository.update(&job).await?;

        let report = SyncReport::from_job(&job, true);
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::Cancelled {
                job_id: job.id.to_string(),
                pushed: report.pushed_count,
                pulled: report.pulled_count,
            }))
            .ok();

        info!(job_id = %job.id, "Sync cancelled");
        Ok(report)
    }

    /// Record a failed run in its job row and emit the failure.
    async fn fail_job(&self, job_id: SyncJobId, message: &str, recoverable: bool) {
        if let Ok(Some(job)) = self.job_repository.find_by_id(&job_id).await {
            if let Ok(failed_job) = job.fail(message.to_string(), None) {
                if let Err(e) = self.job_repository.update(&failed_job).await {
                    warn!(job_id = %job_id, error = %e, "Failed to record sync failure");
                }
            }
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::Failed {
                job_id: job_id.to_string(),
                message: message.to_string(),
                recoverable,
            }))
            .ok();
    }

    fn claim(&self, job_id: SyncJobId, cancellation_token: CancellationToken) -> Result<ActiveSyncGuard<'_>> {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return Err(SyncError::SyncInProgress {
                device_id: self.config.device_id.clone(),
            });
        }

        *slot = Some(ActiveSync {
            job_id,
            cancellation_token,
        });

        Ok(ActiveSyncGuard {
            slot: &self.active_sync,
            job_id,
        })
    }

    fn enter_phase(&self, job_id: &str, phase: SyncPhase) {
        self.set_phase(phase);
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::PhaseChanged {
                job_id: job_id.to_string(),
                phase: phase.to_string(),
            }))
            .ok();
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveSync>> {
        self.active_sync.lock().unwrap_or_else(|e| e.into_inner())
    }
}
