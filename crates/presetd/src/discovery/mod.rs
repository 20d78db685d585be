//! Finding speakers on the LAN.
//!
//! Three interchangeable backends implement [`DiscoveryProvider`]:
//! - [`SsdpDiscovery`]: multicast M-SEARCH, the normal mode
//! - [`ManualDiscovery`]: probe a configured list of addresses
//! - [`FixtureDiscovery`]: a fixed device set for tests and offline demos
//!
//! The backend is chosen from configuration by [`from_config`]; nothing downstream knows
//! which one is active.

mod fixture;
mod manual;
pub mod ssdp;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use fixture::FixtureDevice;
pub use fixture::FixtureDiscovery;
pub use fixture::FIXTURE_DEVICES;
pub use manual::ManualDiscovery;
pub use ssdp::SsdpDiscovery;

use crate::config::DiscoveryBackend;
use crate::config::DiscoveryConfig;
use crate::device::DeviceClient;

/// A device seen during one discovery scan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Address the device answered from
    pub address: IpAddr,

    /// Base URL of the device's local control API
    pub base_url: String,

    /// Advertised friendly name, if the backend learned one
    pub name: Option<String>,

    /// Advertised model string, if the backend learned one
    pub model: Option<String>,

    /// Advertised unique identifier (e.g. the SSDP USN)
    pub unique_id: Option<String>,
}

/// Errors that prevent a scan from happening at all.
///
/// Individual unresponsive or malformed devices are never reported through this type.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to send discovery query: {0}")]
    Send(#[source] std::io::Error),

    #[error("discovery did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("discovery backend is misconfigured: {0}")]
    Misconfigured(String),
}

/// A way of finding devices.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Scan for devices, returning whatever was found before `timeout` elapsed.
    ///
    /// Per-device failures are dropped from the result, not returned as errors.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError>;
}

/// Build the configured discovery backend.
///
/// The manual backend probes through `client`, so it sees devices the same way
/// enrichment will.
pub fn from_config(
    config: &DiscoveryConfig,
    device_port: u16,
    client: Arc<dyn DeviceClient>,
) -> Result<Arc<dyn DiscoveryProvider>, DiscoveryError> {
    let provider: Arc<dyn DiscoveryProvider> = match config.backend {
        DiscoveryBackend::Ssdp => Arc::new(
            SsdpDiscovery::new(config.bind, config.search_target.clone(), device_port)
                .map_err(|e| DiscoveryError::Misconfigured(e.to_string()))?,
        ),
        DiscoveryBackend::Manual => {
            if config.manual_ips.is_empty() {
                return Err(DiscoveryError::Misconfigured(
                    "manual discovery needs at least one address".to_string(),
                ));
            }
            Arc::new(ManualDiscovery::new(
                config.manual_ips.clone(),
                device_port,
                client,
            ))
        }
        DiscoveryBackend::Fixture => Arc::new(FixtureDiscovery::new(device_port)),
    };
    Ok(provider)
}
