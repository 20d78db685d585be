use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

use super::DiscoveredDevice;
use super::DiscoveryError;
use super::DiscoveryProvider;
use crate::device::base_url;

/// A simulated speaker used by the fixture backend.
#[derive(Debug, Clone, Copy)]
pub struct FixtureDevice {
    pub id: &'static str,
    pub name: &'static str,
    pub model: &'static str,
    pub firmware_version: &'static str,
    pub address: Ipv4Addr,
}

/// The fixed device set, on TEST-NET-1 addresses so it never collides with a real LAN.
pub const FIXTURE_DEVICES: &[FixtureDevice] = &[
    FixtureDevice {
        id: "F1X7C0DE0001",
        name: "Kitchen",
        model: "SoundTouch 10",
        firmware_version: "27.0.6.46330.5043500",
        address: Ipv4Addr::new(192, 0, 2, 11),
    },
    FixtureDevice {
        id: "F1X7C0DE0002",
        name: "Living Room",
        model: "SoundTouch 300",
        firmware_version: "27.0.6.46330.5043500",
        address: Ipv4Addr::new(192, 0, 2, 12),
    },
    FixtureDevice {
        id: "F1X7C0DE0003",
        name: "Bedroom",
        model: "SoundTouch 20",
        firmware_version: "25.1.4.41102.4410541",
        address: Ipv4Addr::new(192, 0, 2, 13),
    },
];

/// Discovery backend returning [`FIXTURE_DEVICES`], for tests and offline demos.
#[derive(Debug, Clone)]
pub struct FixtureDiscovery {
    device_port: u16,
}

impl FixtureDiscovery {
    pub fn new(device_port: u16) -> Self {
        Self { device_port }
    }
}

#[async_trait]
impl DiscoveryProvider for FixtureDiscovery {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        Ok(FIXTURE_DEVICES
            .iter()
            .map(|d| {
                let address = IpAddr::V4(d.address);
                DiscoveredDevice {
                    address,
                    base_url: base_url(address, self.device_port),
                    name: Some(d.name.to_string()),
                    model: Some(d.model.to_string()),
                    unique_id: Some(format!("uuid:{}", d.id)),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_is_deterministic() {
        let discovery = FixtureDiscovery::new(8090);
        let first = discovery.discover(Duration::from_millis(1)).await.unwrap();
        let second = discovery.discover(Duration::from_millis(1)).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(first[0].base_url, "http://192.0.2.11:8090");
        assert_eq!(first[1].model.as_deref(), Some("SoundTouch 300"));
    }
}
