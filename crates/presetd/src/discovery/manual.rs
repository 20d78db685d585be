use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::debug;
use tracing::info;

use super::DiscoveredDevice;
use super::DiscoveryError;
use super::DiscoveryProvider;
use crate::device::base_url;
use crate::device::DeviceClient;

/// Discovery over a fixed address list, for networks where multicast does not work.
pub struct ManualDiscovery {
    addresses: Vec<IpAddr>,
    device_port: u16,
    client: Arc<dyn DeviceClient>,
}

impl ManualDiscovery {
    pub fn new(addresses: Vec<IpAddr>, device_port: u16, client: Arc<dyn DeviceClient>) -> Self {
        Self {
            addresses,
            device_port,
            client,
        }
    }

    async fn probe(&self, address: IpAddr, timeout: Duration) -> Option<DiscoveredDevice> {
        let base_url = base_url(address, self.device_port);
        match tokio::time::timeout(timeout, self.client.get_info(&base_url)).await {
            Ok(Ok(info)) => Some(DiscoveredDevice {
                address,
                base_url,
                name: Some(info.name),
                model: Some(info.model),
                unique_id: Some(info.id),
            }),
            Ok(Err(e)) => {
                debug!("No device at {}: {}", address, e);
                None
            }
            Err(_) => {
                debug!("No answer from {} within {:?}", address, timeout);
                None
            }
        }
    }
}

#[async_trait]
impl DiscoveryProvider for ManualDiscovery {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let probes = self
            .addresses
            .iter()
            .map(|address| self.probe(*address, timeout));
        let found: Vec<DiscoveredDevice> = join_all(probes).await.into_iter().flatten().collect();

        info!(
            "Manual discovery: {} of {} address(es) answered",
            found.len(),
            self.addresses.len()
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FixtureDeviceClient;

    #[tokio::test]
    async fn test_unresponsive_addresses_are_omitted() {
        let client = Arc::new(
            FixtureDeviceClient::new().with_unreachable("192.0.2.12".parse().unwrap()),
        );
        let discovery = ManualDiscovery::new(
            vec![
                "192.0.2.11".parse().unwrap(),
                "192.0.2.12".parse().unwrap(),
                "198.51.100.7".parse().unwrap(),
            ],
            8090,
            client,
        );

        let found = discovery.discover(Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "192.0.2.11".parse::<IpAddr>().unwrap());
        assert_eq!(found[0].unique_id.as_deref(), Some("F1X7C0DE0001"));
        assert_eq!(found[0].base_url, "http://192.0.2.11:8090");
    }

    #[tokio::test]
    async fn test_empty_list() {
        let discovery = ManualDiscovery::new(Vec::new(), 8090, Arc::new(FixtureDeviceClient::new()));
        assert!(discovery
            .discover(Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());
    }
}
