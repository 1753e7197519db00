//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `RemoteStore` using `reqwest` against the sync backend's HTTP API
//! - `NetworkMonitor` using a TCP probe of the remote store host
//! - `BackgroundExecutor` using Tokio timers with success-lengthened,
//!   failure-backoff scheduling
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, HttpRemoteStore, TokioBackgroundExecutor};
//! use std::time::Duration;
//!
//! let endpoint = "https://sync.example.com/v1";
//! let remote = HttpRemoteStore::new(endpoint, Duration::from_secs(30))?;
//! let monitor = Arc::new(DesktopNetworkMonitor::for_endpoint(endpoint));
//! let executor = TokioBackgroundExecutor::with_network_monitor(Some(monitor.clone()));
//! ```

mod background;
mod network;
mod remote;

pub use background::TokioBackgroundExecutor;
pub use network::DesktopNetworkMonitor;
pub use remote::HttpRemoteStore;
