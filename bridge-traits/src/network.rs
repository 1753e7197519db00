//! Network Monitoring Abstraction
//!
//! Connectivity information used to skip sync passes while the device is
//! offline. Skipping is an optimisation only: a pass attempted offline fails
//! with transient errors and leaves every outbox entry and cursor retryable.

use async_trait::async_trait;

use crate::error::Result;

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Cellular,
    WiFi,
    Ethernet,
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    /// Status could not be determined
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: matches!(network_type, NetworkType::Cellular),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }

    /// An indeterminate status counts as reachable; the remote call itself
    /// is the authoritative probe.
    pub fn is_reachable(&self) -> bool {
        !matches!(self.status, NetworkStatus::Disconnected)
    }
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: TCP probe against the remote store host
/// - **iOS**: Network framework path monitor
/// - **Android**: ConnectivityManager
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if the remote store is likely reachable
    async fn is_connected(&self) -> bool {
        match self.get_network_info().await {
            Ok(info) => info.is_reachable(),
            Err(_) => false,
        }
    }

    /// Subscribe to network status changes
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of network status changes
#[async_trait]
pub trait NetworkChangeStream: Send {
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_info_constructors() {
        let wifi = NetworkInfo::connected(NetworkType::WiFi);
        assert_eq!(wifi.status, NetworkStatus::Connected);
        assert!(!wifi.is_metered);
        assert!(wifi.is_reachable());

        let cellular = NetworkInfo::connected(NetworkType::Cellular);
        assert!(cellular.is_metered);

        assert!(!NetworkInfo::disconnected().is_reachable());
    }

    #[test]
    fn test_indeterminate_counts_as_reachable() {
        let info = NetworkInfo {
            status: NetworkStatus::Indeterminate,
            network_type: None,
            is_metered: false,
        };
        assert!(info.is_reachable());
    }
}
