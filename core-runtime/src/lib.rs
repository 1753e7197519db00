//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the sync engine crates:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! Nothing in here knows about outboxes or cursors. The crate fixes the
//! conventions the engine relies on: how it is configured, how it logs and
//! how it tells the host application what happened during a sync pass.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
