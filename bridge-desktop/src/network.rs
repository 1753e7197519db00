//! Network Monitoring Implementation

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_PROBE_ADDR: &str = "1.1.1.1:443";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Desktop network monitor implementation
///
/// Connectivity is a TCP connect probe against the remote store host (or a
/// public resolver when none is configured). A refused or timed-out probe
/// reads as disconnected.
///
/// Note: Platform-specific implementations (Linux netlink, macOS SystemConfiguration,
/// Windows WinAPI) would be more robust but require additional dependencies.
#[derive(Clone)]
pub struct DesktopNetworkMonitor {
    probe_addr: String,
    probe_timeout: Duration,
    cached_info: Arc<Mutex<Option<NetworkInfo>>>,
}

impl DesktopNetworkMonitor {
    /// Create a monitor probing a public resolver.
    pub fn new() -> Self {
        Self::with_probe(DEFAULT_PROBE_ADDR)
    }

    /// Create a monitor probing `host:port`, normally the remote store.
    pub fn with_probe(probe_addr: impl Into<String>) -> Self {
        Self {
            probe_addr: probe_addr.into(),
            probe_timeout: PROBE_TIMEOUT,
            cached_info: Arc::new(Mutex::new(None)),
        }
    }

    /// Probe the host of an `http(s)://` endpoint URL.
    pub fn for_endpoint(endpoint: &str) -> Self {
        match probe_addr_for(endpoint) {
            Some(addr) => Self::with_probe(addr),
            None => Self::new(),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }

    /// Last observed network info, if any probe has run.
    pub async fn cached_info(&self) -> Option<NetworkInfo> {
        self.cached_info.lock().await.clone()
    }

    async fn check_connectivity(&self) -> NetworkStatus {
        match tokio::time::timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(self.probe_addr.as_str()),
        )
        .await
        {
            Ok(Ok(_)) => NetworkStatus::Connected,
            Ok(Err(_)) => NetworkStatus::Disconnected,
            Err(_) => NetworkStatus::Disconnected,
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// `host:port` of an `http(s)://` URL, with the scheme's default port.
fn probe_addr_for(endpoint: &str) -> Option<String> {
    let (rest, default_port) = if let Some(rest) = endpoint.strip_prefix("https://") {
        (rest, 443)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        (rest, 80)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    let has_port = match authority.rfind(':') {
        Some(idx) => !authority.ends_with(']') && authority[idx + 1..].parse::<u16>().is_ok(),
        None => false,
    };

    Some(if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default_port)
    })
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let status = self.check_connectivity().await;

        let info = match status {
            // Desktop cannot tell Ethernet from WiFi without platform APIs
            NetworkStatus::Connected => NetworkInfo::connected(NetworkType::Other),
            _ => NetworkInfo::disconnected(),
        };

        *self.cached_info.lock().await = Some(info.clone());
        debug!(status = ?status, probe = %self.probe_addr, "Network info updated");

        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(DesktopNetworkChangeStream {
            monitor: self.clone(),
            last_status: None,
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    monitor: DesktopNetworkMonitor,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if let Ok(info) = self.monitor.get_network_info().await {
                if self.last_status.as_ref() != Some(&info.status) {
                    self.last_status = Some(info.status);
                    return Some(info);
                }
            }
        }
    }
}
