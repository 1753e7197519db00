//! # Local Store
//!
//! The device-local relational store the sync engine reconciles.
//!
//! ## Overview
//!
//! - [`db`] - SQLite pool and migrations
//! - [`record`] - Dirty-tracking convention ([`Synchronizable`], [`SyncState`], [`SyncRecord`])
//! - [`records`] - Generic access to the per-family tables
//! - [`models`] - Farm entity families (tasks, daily logs, transfers)
//!
//! Records are never physically deleted by local writes: a delete is a dirty
//! tombstone so it can be pushed and so a pull cannot resurrect it.

pub mod db;
pub mod error;
pub mod models;
pub mod record;
pub mod records;

pub use error::{Result, StoreError};
pub use models::{DailyLog, Task, Transfer, DAILY_LOGS, FARM_FAMILIES, TASKS, TRANSFERS};
pub use record::{EntityFamily, Operation, SyncRecord, SyncState, Synchronizable};
pub use records::SqliteRecordStore;
