//! Background Execution and Task Scheduling
//!
//! The contract through which a host scheduler drives periodic sync. The core
//! registers a handler ("sync now") and reports whether the run succeeded;
//! the executor decides when the next run happens using a [`BackoffPolicy`].

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Task execution constraints
#[derive(Debug, Clone)]
pub struct TaskConstraints {
    /// Require WiFi connection
    pub requires_wifi: bool,
    /// Require any network connection
    pub requires_network: bool,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            requires_wifi: false,
            requires_network: true,
        }
    }
}

/// Scheduling policy for recurring tasks.
///
/// After a successful run the interval doubles until `max_interval`; after a
/// failed run the delay restarts at `base_interval * 2^consecutive_failures`,
/// also capped at `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay used right after scheduling and after a failure streak ends
    pub base_interval: Duration,
    /// Upper bound for both success lengthening and failure backoff
    pub max_interval: Duration,
    /// Lengthen the interval while runs keep succeeding
    pub lengthen_on_success: bool,
}

impl BackoffPolicy {
    /// Fixed interval, no lengthening, failures back off up to 32x.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base_interval: interval,
            max_interval: interval.saturating_mul(32),
            lengthen_on_success: false,
        }
    }

    /// Delay before the next run after a success, given the current interval.
    pub fn after_success(&self, current: Duration) -> Duration {
        if self.lengthen_on_success {
            current.saturating_mul(2).min(self.max_interval)
        } else {
            self.base_interval
        }
    }

    /// Delay before the next run after `consecutive_failures` failed runs.
    pub fn after_failure(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.base_interval
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_interval)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(60 * 60),
            lengthen_on_success: true,
        }
    }
}

/// Scheduled task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Task execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for its next run
    Scheduled,
    Running,
    /// Last run succeeded
    Completed,
    /// Last run failed; `consecutive_failures` runs in a row have failed
    Failed { consecutive_failures: u32 },
    Cancelled,
}

/// Background task executor trait
///
/// - **iOS**: BGTaskScheduler
/// - **Android**: WorkManager
/// - **Desktop**: Tokio timers in-process
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::{BackgroundExecutor, BackoffPolicy, TaskConstraints};
///
/// executor
///     .schedule_task("farm-sync", BackoffPolicy::default(), TaskConstraints::default())
///     .await?;
/// ```
#[async_trait]
pub trait BackgroundExecutor: Send + Sync {
    /// Schedule a recurring task whose handler has been registered under
    /// `task_id`.
    async fn schedule_task(
        &self,
        task_id: &str,
        policy: BackoffPolicy,
        constraints: TaskConstraints,
    ) -> Result<TaskId>;

    /// Schedule a one-time delayed run ("sync now" with a debounce).
    async fn schedule_once(
        &self,
        task_id: &str,
        delay: Duration,
        constraints: TaskConstraints,
    ) -> Result<TaskId>;

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()>;

    async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus>;

    async fn list_tasks(&self) -> Result<Vec<TaskId>>;

    /// Time until the next run, `None` when nothing is scheduled.
    async fn next_execution_time(&self, task_id: &TaskId) -> Result<Option<Duration>>;
}
