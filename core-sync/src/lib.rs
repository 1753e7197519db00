//! # Sync Engine
//!
//! Offline-first synchronization of local records with a shared remote store.
//!
//! ## Overview
//!
//! Local writes always succeed against the local store. Each write marks its
//! record dirty and queues an outbox entry; sync runs later push the outbox
//! and pull remote changes, resolving conflicts deterministically.
//!
//! ## Components
//!
//! - **Outbox** (`outbox`): Durable, coalescing FIFO of local mutations with retry and crash recovery
//! - **Sync Cursors** (`cursor`): Monotonic per-family pull watermarks
//! - **Conflict Resolver** (`conflict_resolver`): Last-writer-wins with tombstone precedence
//! - **Push / Pull** (`push`, `pull`): Delivery of outbox entries and application of remote changes
//! - **Local Mutations** (`mutation`): Transactional record write plus outbox enqueue
//! - **Sync Job State Machine** (`job`): Lifecycle of a run with validated state transitions
//! - **Repository** (`repository`): Persistence for sync run history
//! - **Sync Orchestrator** (`orchestrator`): Single-flight push-then-pull runs

pub mod conflict_resolver;
pub mod cursor;
pub mod error;
pub mod job;
pub mod mutation;
pub mod orchestrator;
pub mod outbox;
pub mod pull;
pub mod push;
pub mod repository;

pub use conflict_resolver::{resolve_conflict, Resolution, Winner};
pub use cursor::SyncCursorStore;
pub use error::{Result, SyncError};
pub use job::{SyncJob, SyncJobId, SyncJobStats, SyncStatus};
pub use mutation::LocalMutationCommitter;
pub use orchestrator::{SyncConfig, SyncOrchestrator, SyncPhase, SyncReport};
pub use outbox::{
    FailureOutcome, OutboxConfig, OutboxEntry, OutboxEntryId, OutboxQueue, OutboxStats,
    OutboxStatus,
};
pub use pull::{PullOutcome, PullSynchronizer};
pub use push::{PushOutcome, PushSynchronizer};
pub use repository::{SqliteSyncJobRepository, SyncJobRepository};
