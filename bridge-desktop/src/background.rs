//! Background Task Execution Implementation
//!
//! In-process scheduler for desktop hosts. Recurring tasks are driven by a
//! [`BackoffPolicy`]: the delay before the next run depends on whether the
//! previous run succeeded, so a failing sync backs off instead of hammering
//! an unreachable remote store.

use async_trait::async_trait;
use bridge_traits::{
    background::{BackgroundExecutor, BackoffPolicy, TaskConstraints, TaskId, TaskStatus},
    error::{BridgeError, Result},
    network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
    time::{Clock, SystemClock},
};
use futures_util::{future::BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type TaskTable = Arc<RwLock<HashMap<TaskId, TaskInfo>>>;

/// How long a one-time task waits before re-checking unmet constraints.
const CONSTRAINT_RECHECK: Duration = Duration::from_secs(5);

/// Tokio-based background executor for desktop.
///
/// ```ignore
/// let executor = TokioBackgroundExecutor::with_network_monitor(Some(monitor));
/// executor
///     .register_task_handler("farm-sync", move || {
///         let service = service.clone();
///         async move { service.sync_now().await }
///     })
///     .await?;
/// executor
///     .schedule_task("farm-sync", BackoffPolicy::default(), TaskConstraints::default())
///     .await?;
/// ```
pub struct TokioBackgroundExecutor {
    tasks: TaskTable,
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
}

struct TaskInfo {
    status: TaskStatus,
    handle: Option<JoinHandle<()>>,
    cancel: Option<oneshot::Sender<()>>,
    last_run: Option<i64>,
    next_run: Option<i64>,
}

/// Everything a spawned task loop needs.
struct TaskContext {
    tasks: TaskTable,
    id: TaskId,
    handler: TaskHandler,
    constraints: TaskConstraints,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    async fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut TaskInfo),
    {
        let mut tasks = self.tasks.write().await;
        if let Some(info) = tasks.get_mut(&self.id) {
            update(info);
        }
    }

    async fn mark_cancelled(&self) {
        self.update(|info| {
            info.status = TaskStatus::Cancelled;
            info.next_run = None;
        })
        .await;
    }

    async fn schedule_next(&self, delay: Duration) {
        let next = TokioBackgroundExecutor::schedule_after(self.clock.as_ref(), delay);
        self.update(|info| info.next_run = Some(next)).await;
    }

    /// Run the handler once and record the outcome.
    async fn run_handler(&self, previous_failures: u32) -> Result<()> {
        self.update(|info| info.status = TaskStatus::Running).await;

        let result = (self.handler)().await;
        let now = TokioBackgroundExecutor::now_millis(self.clock.as_ref());

        let status = match &result {
            Ok(()) => TaskStatus::Completed,
            Err(err) => {
                warn!(task_id = %self.id.0, error = %err, "Background task failed");
                TaskStatus::Failed {
                    consecutive_failures: previous_failures.saturating_add(1),
                }
            }
        };

        self.update(|info| {
            info.last_run = Some(now);
            info.status = status;
        })
        .await;

        result
    }
}

impl TokioBackgroundExecutor {
    /// Create a new background executor with no network monitoring.
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_network_monitor_and_clock(None, clock)
    }

    /// Create a background executor with an optional network monitor.
    pub fn with_network_monitor(monitor: Option<Arc<dyn NetworkMonitor>>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_network_monitor_and_clock(monitor, clock)
    }

    /// Create a background executor with an optional network monitor and custom clock.
    pub fn with_network_monitor_and_clock(
        monitor: Option<Arc<dyn NetworkMonitor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            network_monitor: monitor,
            clock,
        }
    }

    fn now_millis(clock: &dyn Clock) -> i64 {
        clock.unix_timestamp_millis()
    }

    fn duration_to_millis(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }

    fn schedule_after(clock: &dyn Clock, delay: Duration) -> i64 {
        let now = Self::now_millis(clock);
        now.saturating_add(Self::duration_to_millis(delay))
    }

    fn millis_to_duration(millis: i64) -> Duration {
        u64::try_from(millis)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
    }

    /// Register a handler that will be invoked when the task executes.
    ///
    /// The handler's `Err` counts as a failed run for backoff purposes.
    pub async fn register_task_handler<F, Fut>(&self, task_id: &str, handler: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(task_id.to_string(), Arc::new(move || handler().boxed()));
        Ok(())
    }

    async fn handler_for(&self, task_id: &str) -> Result<TaskHandler> {
        let handlers = self.handlers.read().await;
        handlers.get(task_id).cloned().ok_or_else(|| {
            BridgeError::OperationFailed(format!("No handler registered for task: {}", task_id))
        })
    }

    async fn remove_task(&self, id: &TaskId) -> Option<TaskInfo> {
        let mut tasks = self.tasks.write().await;
        tasks.remove(id)
    }

    /// Register the task and spawn its loop. Rescheduling an id replaces the
    /// previous loop.
    async fn spawn_task<F, Fut>(
        &self,
        task_id: &str,
        first_delay: Duration,
        constraints: TaskConstraints,
        run: F,
    ) -> Result<TaskId>
    where
        F: FnOnce(TaskContext, oneshot::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = TaskId::new(task_id);
        let handler = self.handler_for(task_id).await?;

        if let Some(mut previous) = self.remove_task(&id).await {
            debug!(task_id, "Replacing scheduled task");
            if let Some(cancel) = previous.cancel.take() {
                let _ = cancel.send(());
            }
            if let Some(handle) = previous.handle.take() {
                handle.abort();
            }
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let context = TaskContext {
            tasks: Arc::clone(&self.tasks),
            id: id.clone(),
            handler,
            constraints,
            monitor: self.network_monitor.clone(),
            clock: Arc::clone(&self.clock),
        };

        // Hold the table lock across spawn so the loop cannot observe a
        // missing entry.
        let mut tasks = self.tasks.write().await;
        let handle = tokio::spawn(run(context, cancel_rx));
        tasks.insert(
            id.clone(),
            TaskInfo {
                status: TaskStatus::Scheduled,
                handle: Some(handle),
                cancel: Some(cancel_tx),
                last_run: None,
                next_run: Some(Self::schedule_after(self.clock.as_ref(), first_delay)),
            },
        );

        Ok(id)
    }

    async fn constraints_satisfied(
        monitor: Option<&Arc<dyn NetworkMonitor>>,
        constraints: &TaskConstraints,
    ) -> bool {
        if !(constraints.requires_network || constraints.requires_wifi) {
            return true;
        }

        let Some(monitor) = monitor else {
            warn!("Network constraints requested but no monitor provided; assuming constraint satisfied");
            return true;
        };

        match monitor.get_network_info().await {
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                network_type,
                ..
            }) => {
                !constraints.requires_wifi
                    || matches!(network_type, Some(NetworkType::WiFi | NetworkType::Ethernet))
            }
            Ok(info) if !constraints.requires_wifi => info.is_reachable(),
            Ok(_) => false,
            Err(err) => {
                warn!(error = %err, "Network monitor error");
                false
            }
        }
    }

    async fn run_recurring_task(
        context: TaskContext,
        policy: BackoffPolicy,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut delay = policy.base_interval;
        let mut interval = policy.base_interval;
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    context.mark_cancelled().await;
                    break;
                }
                _ = sleep(delay) => {}
            }

            if !Self::constraints_satisfied(context.monitor.as_ref(), &context.constraints).await {
                debug!(task_id = %context.id.0, "Constraints not satisfied; skipping run");
                delay = policy.base_interval;
                context.schedule_next(delay).await;
                continue;
            }

            match context.run_handler(consecutive_failures).await {
                Ok(()) => {
                    consecutive_failures = 0;
                    interval = policy.after_success(interval);
                    delay = interval;
                }
                Err(_) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    interval = policy.base_interval;
                    delay = policy.after_failure(consecutive_failures);
                }
            }

            debug!(
                task_id = %context.id.0,
                consecutive_failures,
                next_run_ms = delay.as_millis() as u64,
                "Recurring task rescheduled"
            );
            context.schedule_next(delay).await;
        }
    }

    async fn run_one_time_task(
        context: TaskContext,
        delay: Duration,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut wait = delay;
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    context.mark_cancelled().await;
                    return;
                }
                _ = sleep(wait) => {}
            }

            if Self::constraints_satisfied(context.monitor.as_ref(), &context.constraints).await {
                break;
            }
            wait = CONSTRAINT_RECHECK;
            context.schedule_next(wait).await;
        }

        let _ = context.run_handler(0).await;
        context.update(|info| info.next_run = None).await;
    }
}

impl Default for TokioBackgroundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackgroundExecutor for TokioBackgroundExecutor {
    async fn schedule_task(
        &self,
        task_id: &str,
        policy: BackoffPolicy,
        constraints: TaskConstraints,
    ) -> Result<TaskId> {
        debug!(
            task_id,
            base_interval_secs = policy.base_interval.as_secs(),
            max_interval_secs = policy.max_interval.as_secs(),
            "Scheduling recurring task"
        );

        self.spawn_task(task_id, policy.base_interval, constraints, move |context, cancel_rx| {
            Self::run_recurring_task(context, policy, cancel_rx)
        })
        .await
    }

    async fn schedule_once(
        &self,
        task_id: &str,
        delay: Duration,
        constraints: TaskConstraints,
    ) -> Result<TaskId> {
        debug!(task_id, delay_ms = delay.as_millis() as u64, "Scheduling one-time task");

        self.spawn_task(task_id, delay, constraints, move |context, cancel_rx| {
            Self::run_one_time_task(context, delay, cancel_rx)
        })
        .await
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        debug!(task_id = %task_id.0, "Cancelling task");

        if let Some(mut info) = self.remove_task(task_id).await {
            if let Some(cancel) = info.cancel.take() {
                let _ = cancel.send(());
            }
            if let Some(handle) = info.handle.take() {
                handle.abort();
            }
            return Ok(());
        }

        Err(BridgeError::OperationFailed(format!(
            "Task not found: {}",
            task_id.0
        )))
    }

    async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|info| info.status.clone())
            .ok_or_else(|| BridgeError::OperationFailed(format!("Task not found: {}", task_id.0)))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskId>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.keys().cloned().collect())
    }

    async fn next_execution_time(&self, task_id: &TaskId) -> Result<Option<Duration>> {
        let tasks = self.tasks.read().await;
        let info = tasks
            .get(task_id)
            .ok_or_else(|| BridgeError::OperationFailed(format!("Task not found: {}", task_id.0)))?;

        Ok(info.next_run.map(|next| {
            let now = Self::now_millis(self.clock.as_ref());
            Self::millis_to_duration(next - now)
        }))
    }
}
