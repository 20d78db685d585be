use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::endpoint;
use super::client::host_ip;
use super::client::DeviceClient;
use super::client::DeviceError;
use super::client::DeviceInfo;
use super::client::DevicePreset;
use super::client::NowPlaying;
use super::xml::LOCAL_RADIO_SOURCE;
use crate::discovery::FixtureDevice;
use crate::discovery::FIXTURE_DEVICES;
use crate::presets::PresetSlot;

#[derive(Debug, Default)]
struct FixtureState {
    presets: BTreeMap<(IpAddr, PresetSlot), DevicePreset>,
    playing: BTreeMap<IpAddr, NowPlaying>,
    presses: Vec<(IpAddr, PresetSlot)>,
}

/// In-memory device client answering for [`FIXTURE_DEVICES`].
///
/// Pairs with the fixture discovery backend so the daemon can run without real speakers.
/// Addresses can be marked unreachable to exercise partial-failure paths.
#[derive(Debug, Default)]
pub struct FixtureDeviceClient {
    unreachable: BTreeSet<IpAddr>,
    state: Mutex<FixtureState>,
}

impl FixtureDeviceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request to `address` fail as if the device were powered off.
    pub fn with_unreachable(mut self, address: IpAddr) -> Self {
        self.unreachable.insert(address);
        self
    }

    /// Preset slot contents as last written through [`DeviceClient::store_preset`].
    pub fn stored_preset(&self, address: IpAddr, slot: PresetSlot) -> Option<DevicePreset> {
        self.lock().presets.get(&(address, slot)).cloned()
    }

    /// Simulated button presses in the order they happened.
    pub fn presses(&self) -> Vec<(IpAddr, PresetSlot)> {
        self.lock().presses.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        // State is plain data; a panic elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(
        &self,
        base_url: &str,
        path: &str,
    ) -> Result<(IpAddr, &'static FixtureDevice), DeviceError> {
        let url = endpoint(base_url, path);
        let address = host_ip(base_url).ok_or_else(|| DeviceError::Unreachable {
            url: url.clone(),
            reason: "not a fixture address".to_string(),
        })?;

        if self.unreachable.contains(&address) {
            return Err(DeviceError::Unreachable {
                url,
                reason: "connection refused".to_string(),
            });
        }

        FIXTURE_DEVICES
            .iter()
            .find(|d| IpAddr::V4(d.address) == address)
            .map(|d| (address, d))
            .ok_or(DeviceError::Unreachable {
                url,
                reason: "no fixture device at this address".to_string(),
            })
    }
}

#[async_trait]
impl DeviceClient for FixtureDeviceClient {
    async fn get_info(&self, base_url: &str) -> Result<DeviceInfo, DeviceError> {
        let (address, device) = self.lookup(base_url, "info")?;
        Ok(DeviceInfo {
            id: device.id.to_string(),
            name: device.name.to_string(),
            model: device.model.to_string(),
            firmware_version: Some(device.firmware_version.to_string()),
            ip_address: Some(address.to_string()),
        })
    }

    async fn get_now_playing(&self, base_url: &str) -> Result<Option<NowPlaying>, DeviceError> {
        let (address, _) = self.lookup(base_url, "now_playing")?;
        let playing = self
            .lock()
            .playing
            .get(&address)
            .cloned()
            .unwrap_or_else(|| NowPlaying {
                source: "STANDBY".to_string(),
                ..NowPlaying::default()
            });
        Ok(Some(playing))
    }

    async fn list_presets(&self, base_url: &str) -> Result<Vec<DevicePreset>, DeviceError> {
        let (address, _) = self.lookup(base_url, "presets")?;
        Ok(self
            .lock()
            .presets
            .iter()
            .filter(|((ip, _), _)| *ip == address)
            .map(|(_, preset)| preset.clone())
            .collect())
    }

    async fn store_preset(
        &self,
        base_url: &str,
        slot: PresetSlot,
        display_name: &str,
        descriptor_url: &str,
    ) -> Result<(), DeviceError> {
        let (address, _) = self.lookup(base_url, "storePreset")?;
        self.lock().presets.insert(
            (address, slot),
            DevicePreset {
                slot,
                name: Some(display_name.to_string()),
                source: Some(LOCAL_RADIO_SOURCE.to_string()),
                location: Some(descriptor_url.to_string()),
            },
        );
        Ok(())
    }

    async fn simulate_button(&self, base_url: &str, slot: PresetSlot) -> Result<(), DeviceError> {
        let (address, _) = self.lookup(base_url, "key")?;
        let mut state = self.lock();
        state.presses.push((address, slot));

        let preset = state.presets.get(&(address, slot)).cloned();
        if let Some(preset) = preset {
            state.playing.insert(
                address,
                NowPlaying {
                    source: LOCAL_RADIO_SOURCE.to_string(),
                    item_name: preset.name.clone(),
                    station_name: preset.name,
                    play_status: Some("PLAY_STATE".to_string()),
                    ..NowPlaying::default()
                },
            );
        }
        Ok(())
    }
}
