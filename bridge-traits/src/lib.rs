//! # Host Bridge Traits
//!
//! Contracts between the sync core and the host platform.
//!
//! ## Overview
//!
//! The core owns the local store and the reconciliation rules. Everything it
//! needs from the outside world is expressed here as a trait that each host
//! implements (desktop adapters live in `bridge-desktop`).
//!
//! ## Traits
//!
//! ### Remote reconciliation
//! - [`RemoteStore`](remote::RemoteStore) - Idempotent upsert/delete and change queries against the shared backend
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity detection to skip offline passes
//! - [`BackgroundExecutor`](background::BackgroundExecutor) - Periodic "sync now" scheduling with backoff
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! must keep the transient/permanent distinction intact: the outbox retries
//! transient failures and parks rejected entries for the user.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across the
//! tasks the orchestrator spawns per entity family.

pub mod background;
pub mod error;
pub mod network;
pub mod remote;
pub mod time;

pub use error::BridgeError;

pub use background::{BackgroundExecutor, BackoffPolicy, TaskConstraints, TaskId, TaskStatus};
pub use network::{NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType};
pub use remote::{RemoteAck, RemoteRecord, RemoteStore};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
