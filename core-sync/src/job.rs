//! # Sync Job State Machine
//!
//! Lifecycle of a single sync run, persisted so the history of runs survives
//! restarts.
//!
//! ## State Machine
//!
//! ```text
//! Pending → Pushing → Pulling → Completed
//!    │         │         │
//!    └─────────┴─────────┴──→ Failed
//!    └─────────┴─────────┴──→ Cancelled
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncJob, SyncJobStats};
//!
//! let job = SyncJob::new().begin_push()?;
//! let mut job = job.begin_pull()?;
//! job.record_pull(12, 1)?;
//! let job = job.complete()?;
//! ```

use crate::{Result, SyncError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJobId(Uuid);

impl SyncJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a sync job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SyncJobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// The current status of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Created, not started
    Pending,
    /// Delivering outbox entries
    Pushing,
    /// Applying remote changes
    Pulling,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::Pushing | SyncStatus::Pulling
        )
    }

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Pushing => "PUSHING",
            SyncStatus::Pulling => "PULLING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(SyncStatus::Pending),
            "PUSHING" => Ok(SyncStatus::Pushing),
            "PULLING" => Ok(SyncStatus::Pulling),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "FAILED" => Ok(SyncStatus::Failed),
            "CANCELLED" => Ok(SyncStatus::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters collected while a job runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobStats {
    /// Outbox entries acknowledged by the remote store
    pub pushed: u64,
    /// Remote records applied locally
    pub pulled: u64,
    /// Conflicts resolved during pull
    pub conflicts: u64,
    /// Entries or families that failed in this run
    pub failures: u64,
}

impl SyncJobStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

// ============================================================================
// Sync Job Entity
// ============================================================================

/// A sync run with validated state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: SyncJobId,
    pub status: SyncStatus,
    pub stats: SyncJobStats,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Additional error details
    pub error_details: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl SyncJob {
    /// Create a new sync job in pending state
    pub fn new() -> Self {
        let now = current_timestamp_millis();
        Self {
            id: SyncJobId::new(),
            status: SyncStatus::Pending,
            stats: SyncJobStats::new(),
            error_message: None,
            error_details: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Enter the push phase
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `Pending` state
    pub fn begin_push(mut self) -> Result<Self> {
        self.validate_transition(SyncStatus::Pushing)?;
        let now = current_timestamp_millis();
        self.status = SyncStatus::Pushing;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    /// Enter the pull phase
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `Pushing` state
    pub fn begin_pull(mut self) -> Result<Self> {
        self.validate_transition(SyncStatus::Pulling)?;
        self.status = SyncStatus::Pulling;
        self.updated_at = current_timestamp_millis();
        Ok(self)
    }

    /// Add push results to the job counters
    pub fn record_push(&mut self, pushed: u64, failures: u64) -> Result<()> {
        self.require_status(SyncStatus::Pushing, "record_push")?;
        self.stats.pushed += pushed;
        self.stats.failures += failures;
        self.updated_at = current_timestamp_millis();
        Ok(())
    }

    /// Add pull results to the job counters
    pub fn record_pull(&mut self, pulled: u64, conflicts: u64) -> Result<()> {
        self.require_status(SyncStatus::Pulling, "record_pull")?;
        self.stats.pulled += pulled;
        self.stats.conflicts += conflicts;
        self.updated_at = current_timestamp_millis();
        Ok(())
    }

    /// Count a family that could not be pulled
    pub fn record_pull_failure(&mut self) -> Result<()> {
        self.require_status(SyncStatus::Pulling, "record_pull_failure")?;
        self.stats.failures += 1;
        self.updated_at = current_timestamp_millis();
        Ok(())
    }

    /// Mark the job as completed
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `Pulling` state
    pub fn complete(mut self) -> Result<Self> {
        self.validate_transition(SyncStatus::Completed)?;
        self.finish(SyncStatus::Completed);
        Ok(self)
    }

    /// Mark the job as failed with an error message
    ///
    /// # Errors
    ///
    /// Returns an error if the job is already in a terminal state
    pub fn fail(mut self, error_message: String, error_details: Option<String>) -> Result<Self> {
        self.validate_transition(SyncStatus::Failed)?;
        self.finish(SyncStatus::Failed);
        self.error_message = Some(error_message);
        self.error_details = error_details;
        Ok(self)
    }

    /// Cancel the job
    ///
    /// # Errors
    ///
    /// Returns an error if the job is already in a terminal state
    pub fn cancel(mut self) -> Result<Self> {
        self.validate_transition(SyncStatus::Cancelled)?;
        self.finish(SyncStatus::Cancelled);
        Ok(self)
    }

    /// Wall time of a finished job in seconds
    pub fn duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(u64::try_from((end - start) / 1000).unwrap_or(0)),
            _ => None,
        }
    }

    fn finish(&mut self, status: SyncStatus) {
        let now = current_timestamp_millis();
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    fn require_status(&self, expected: SyncStatus, action: &str) -> Result<()> {
        if self.status != expected {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: action.to_string(),
                reason: format!("Job must be {} to {}", expected.as_str(), action),
            });
        }
        Ok(())
    }

    /// Validate a state transition
    fn validate_transition(&self, to: SyncStatus) -> Result<()> {
        let valid = match (self.status, to) {
            (SyncStatus::Pending, SyncStatus::Pushing) => true,
            (SyncStatus::Pushing, SyncStatus::Pulling) => true,
            (SyncStatus::Pulling, SyncStatus::Completed) => true,

            (from, SyncStatus::Failed) | (from, SyncStatus::Cancelled) => from.is_active(),

            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.status.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

impl Default for SyncJob {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Tests
// ============================================================================
