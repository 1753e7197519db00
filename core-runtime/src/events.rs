//! # Event Bus System
//!
//! Typed events broadcast by the sync engine using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: [`SyncEvent`] for orchestrator progress and [`RecordEvent`] for
//!   local mutations committed by the app
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ```text
//! ┌──────────────────┐   emit   ┌───────────┐  subscribe  ┌────────────┐
//! │ SyncOrchestrator ├─────────>│           ├────────────>│ UI badge   │
//! └──────────────────┘          │ EventBus  │             └────────────┘
//! ┌──────────────────┐   emit   │           │  subscribe  ┌────────────┐
//! │ MutationCommitter├─────────>│           ├────────────>│ Scheduler  │
//! └──────────────────┘          └───────────┘             └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Sync(SyncEvent::Started {
//!         job_id: "job-1".to_string(),
//!     }))
//!     .ok();
//!
//! assert!(matches!(receiver.try_recv(), Ok(CoreEvent::Sync(_))));
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events and can keep going.
//! - **`RecvError::Closed`**: every sender was dropped; treat it as shutdown.
//!
//! Emitting with no subscribers returns an error that publishers ignore with
//! `.ok()`: events are advisory and never part of the sync outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Orchestrator progress
    Sync(SyncEvent),
    /// Local record changes
    Record(RecordEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Record(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::EntryFailed {
                permanent: true, ..
            }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed {
                partial_failures, ..
            }) if *partial_failures > 0 => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::Cancelled { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted by a sync run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// A run acquired the single-flight slot.
    Started {
        job_id: String,
    },
    /// The orchestrator moved to another phase ("PUSHING", "PULLING", "IDLE", "FAILED").
    PhaseChanged {
        job_id: String,
        phase: String,
    },
    /// An outbox entry could not be pushed.
    EntryFailed {
        job_id: String,
        entity_type: String,
        entity_id: String,
        retry_count: u32,
        /// `true` when the entry reached FAILED and needs user attention
        permanent: bool,
        message: String,
    },
    /// A pulled record collided with a dirty local edit.
    ConflictResolved {
        entity_type: String,
        entity_id: String,
        /// "local" or "remote"
        winner: String,
    },
    /// All remote changes of one family were applied and the cursor moved.
    FamilyPulled {
        job_id: String,
        entity_type: String,
        applied: u64,
        cursor_millis: Option<i64>,
    },
    /// The run finished; `partial_failures > 0` means some work is left for a later run.
    Completed {
        job_id: String,
        pushed: u64,
        pulled: u64,
        partial_failures: u64,
        duration_secs: u64,
    },
    /// The run aborted on a local error or timeout.
    Failed {
        job_id: String,
        message: String,
        recoverable: bool,
    },
    /// The run stopped at a family boundary after a cancellation request.
    Cancelled {
        job_id: String,
        pushed: u64,
        pulled: u64,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::PhaseChanged { .. } => "Sync phase changed",
            SyncEvent::EntryFailed { .. } => "Outbox entry failed",
            SyncEvent::ConflictResolved { .. } => "Conflict resolved",
            SyncEvent::FamilyPulled { .. } => "Remote changes applied",
            SyncEvent::Completed { .. } => "Sync completed",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::Cancelled { .. } => "Sync cancelled",
        }
    }
}

// ============================================================================
// Record Events
// ============================================================================

/// Events about local records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum RecordEvent {
    /// A local write and its outbox entry were committed together.
    Committed {
        entity_type: String,
        entity_id: String,
        /// "CREATE", "UPDATE" or "DELETE"
        operation: String,
    },
    /// A remote change replaced or created a local record during pull.
    RemoteApplied {
        entity_type: String,
        entity_id: String,
        deleted: bool,
    },
}

impl RecordEvent {
    fn description(&self) -> &str {
        match self {
            RecordEvent::Committed { .. } => "Local change committed",
            RecordEvent::RemoteApplied { .. } => "Remote change applied",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel.
///
/// Cheap to clone; clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a receiver for all future events. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let sync_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Sync(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events
    /// and `RecvError::Closed` once all senders are dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
