//! Workspace umbrella crate.
//!
//! Host applications can depend on `farmsync-workspace` and pick the platform
//! shims through features instead of wiring `core-service` and the bridge
//! crates individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
