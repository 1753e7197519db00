//! # Core Configuration Module
//!
//! Configuration for the farm sync engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder to construct a [`CoreConfig`] that
//! holds every host bridge and tuning value the engine needs. Validation is
//! fail-fast: a missing bridge or an out-of-range value is reported by
//! [`CoreConfigBuilder::build`] with an actionable message, never later in the
//! middle of a sync run.
//!
//! ## Required Settings
//!
//! - `database_path` - SQLite file holding records, outbox and cursors
//! - `device_id` - Stable identifier of this installation (keys the sync cursors)
//! - `user_id` - Owner recorded on every outbox entry
//! - `RemoteStore` - The shared backend (desktop default: HTTP, from `remote_endpoint`)
//!
//! ## Optional Bridges
//!
//! - `NetworkMonitor` - Skip passes while offline
//! - `BackgroundExecutor` - Periodic background sync
//! - `Clock` - Time source (defaults to the system clock)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/data/farm.db")
//!     .device_id("tablet-7")
//!     .user_id("farmer-42")
//!     .remote_endpoint("https://sync.example.com/v1")
//!     .batch_size(100)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{BackgroundExecutor, Clock, NetworkMonitor, RemoteStore, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

/// Default number of outbox entries drained per push batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Default attempts before an outbox entry is parked as FAILED.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default bound on a single remote call.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;
/// Default bound on a whole sync run.
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 15 * 60;
/// Default age after which an IN_PROGRESS entry is considered abandoned.
pub const DEFAULT_IN_PROGRESS_TIMEOUT_SECS: u64 = 5 * 60;
/// Default background sync interval.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15 * 60;

const MAX_BATCH_SIZE: usize = 1_000;

/// Core configuration for the sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Stable identifier of this device
    pub device_id: String,

    /// User that owns the local changes
    pub user_id: String,

    /// Base URL of the remote store, used for the desktop default
    pub remote_endpoint: Option<String>,

    /// Remote store the engine reconciles with (required)
    pub remote_store: Arc<dyn RemoteStore>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Background task executor (optional)
    pub background_executor: Option<Arc<dyn BackgroundExecutor>>,

    /// Time source for every timestamp the engine writes
    pub clock: Arc<dyn Clock>,

    /// Outbox entries drained per push batch
    pub batch_size: usize,

    /// Attempts before an entry is marked FAILED
    pub max_retries: u32,

    /// Bound on each remote call, in seconds
    pub remote_timeout_secs: u64,

    /// Bound on a whole run, in seconds
    pub sync_timeout_secs: u64,

    /// Age at which IN_PROGRESS entries are reclaimed, in seconds
    pub in_progress_timeout_secs: u64,

    /// Interval between background runs, in seconds
    pub sync_interval_secs: u64,

    /// Features flags
    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("device_id", &self.device_id)
            .field("user_id", &self.user_id)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("remote_store", &"RemoteStore { ... }")
            .field(
                "network_monitor",
                &self.network_monitor.as_ref().map(|_| "NetworkMonitor { ... }"),
            )
            .field(
                "background_executor",
                &self
                    .background_executor
                    .as_ref()
                    .map(|_| "BackgroundExecutor { ... }"),
            )
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("remote_timeout_secs", &self.remote_timeout_secs)
            .field("sync_timeout_secs", &self.sync_timeout_secs)
            .field("in_progress_timeout_secs", &self.in_progress_timeout_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags for optional engine behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Register a recurring background sync with the `BackgroundExecutor`
    pub enable_background_sync: bool,

    /// Consult the `NetworkMonitor` and skip runs while offline
    pub enable_network_awareness: bool,
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path and identities are not empty
    /// - Batch size, retries and timeouts are within range
    /// - Feature flags are consistent with available bridges
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.device_id.trim().is_empty() {
            return Err(Error::Config("Device id cannot be empty".to_string()));
        }

        if self.user_id.trim().is_empty() {
            return Err(Error::Config("User id cannot be empty".to_string()));
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "Batch size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.max_retries == 0 {
            return Err(Error::Config(
                "Max retries must be at least 1".to_string(),
            ));
        }

        if self.remote_timeout_secs == 0 || self.sync_timeout_secs == 0 {
            return Err(Error::Config(
                "Remote and sync timeouts must be greater than 0 seconds".to_string(),
            ));
        }

        if self.remote_timeout_secs > self.sync_timeout_secs {
            return Err(Error::Config(
                "Remote timeout cannot exceed the sync timeout".to_string(),
            ));
        }

        if self.in_progress_timeout_secs < self.remote_timeout_secs {
            return Err(Error::Config(
                "In-progress timeout must be at least the remote timeout, otherwise \
                 entries still being pushed would be reclaimed"
                    .to_string(),
            ));
        }

        if self.sync_interval_secs == 0 {
            return Err(Error::Config(
                "Sync interval must be greater than 0 seconds".to_string(),
            ));
        }

        if self.features.enable_background_sync && self.background_executor.is_none() {
            return Err(Error::Config(
                "Background sync enabled but no BackgroundExecutor provided. \
                 Disable the feature or inject a BackgroundExecutor implementation."
                    .to_string(),
            ));
        }

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn remote_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RemoteStore".to_string(),
        message: "RemoteStore implementation is required to reconcile with the shared backend. \
                 Desktop: enable the 'desktop-shims' feature and set .remote_endpoint() to use the \
                 default HttpRemoteStore. Mobile: inject the platform's remote store."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_remote_store(
    remote_endpoint: Option<&str>,
    remote_timeout_secs: u64,
) -> Result<Arc<dyn RemoteStore>> {
    use bridge_desktop::HttpRemoteStore;
    use std::time::Duration;

    let endpoint = remote_endpoint.ok_or_else(|| Error::CapabilityMissing {
        capability: "RemoteStore".to_string(),
        message: "No RemoteStore injected and no remote endpoint configured. \
                 Use .remote_endpoint() for the default HttpRemoteStore or .remote_store() \
                 to inject one."
            .to_string(),
    })?;

    let store = HttpRemoteStore::new(endpoint, Duration::from_secs(remote_timeout_secs))
        .map_err(|e| Error::Internal(format!("Failed to create default RemoteStore: {}", e)))?;

    let store: Arc<dyn RemoteStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_remote_store(
    _remote_endpoint: Option<&str>,
    _remote_timeout_secs: u64,
) -> Result<Arc<dyn RemoteStore>> {
    Err(remote_store_missing_error())
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    device_id: Option<String>,
    user_id: Option<String>,
    remote_endpoint: Option<String>,
    remote_store: Option<Arc<dyn RemoteStore>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    background_executor: Option<Arc<dyn BackgroundExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    remote_timeout_secs: Option<u64>,
    sync_timeout_secs: Option<u64>,
    in_progress_timeout_secs: Option<u64>,
    sync_interval_secs: Option<u64>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().database_path("/data/farm.db");
    /// ```
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Base URL for the default HTTP remote store.
    ///
    /// Ignored when a store is injected with [`remote_store`](Self::remote_store).
    pub fn remote_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.remote_endpoint = Some(endpoint.into());
        self
    }

    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn background_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.background_executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn remote_timeout_secs(mut self, secs: u64) -> Self {
        self.remote_timeout_secs = Some(secs);
        self
    }

    pub fn sync_timeout_secs(mut self, secs: u64) -> Self {
        self.sync_timeout_secs = Some(secs);
        self
    }

    pub fn in_progress_timeout_secs(mut self, secs: u64) -> Self {
        self.in_progress_timeout_secs = Some(secs);
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = Some(secs);
        self
    }

    pub fn enable_background_sync(mut self, enabled: bool) -> Self {
        self.features.enable_background_sync = enabled;
        self
    }

    pub fn enable_network_awareness(mut self, enabled: bool) -> Self {
        self.features.enable_network_awareness = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds and validates the final `CoreConfig`.
    ///
    /// # Errors
    ///
    /// - Required settings are missing (database path, device id, user id)
    /// - No `RemoteStore` was injected and no default can be provided
    /// - Values are out of range or feature flags lack their bridge
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let device_id = self.device_id.ok_or_else(|| {
            Error::Config("Device id is required. Use .device_id() to set it.".to_string())
        })?;

        let user_id = self.user_id.ok_or_else(|| {
            Error::Config("User id is required. Use .user_id() to set it.".to_string())
        })?;

        let remote_timeout_secs = self
            .remote_timeout_secs
            .unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS);

        let remote_store = match self.remote_store {
            Some(store) => store,
            None => provide_default_remote_store(
                self.remote_endpoint.as_deref(),
                remote_timeout_secs,
            )?,
        };

        let config = CoreConfig {
            database_path,
            device_id,
            user_id,
            remote_endpoint: self.remote_endpoint,
            remote_store,
            network_monitor: self.network_monitor,
            background_executor: self.background_executor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            remote_timeout_secs,
            sync_timeout_secs: self.sync_timeout_secs.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS),
            in_progress_timeout_secs: self
                .in_progress_timeout_secs
                .unwrap_or(DEFAULT_IN_PROGRESS_TIMEOUT_SECS),
            sync_interval_secs: self
                .sync_interval_secs
                .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}
