use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use reqwest::Url;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use tracing::warn;

use super::PresetSlot;
use crate::capabilities::Capability;
use crate::device::DeviceClient;
use crate::device::DeviceError;
use crate::store::Device;
use crate::store::DeviceRepository;
use crate::store::PersistenceError;
use crate::store::Preset;
use crate::store::PresetRepository;

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("invalid preset: {0}")]
    Invalid(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The device refused or could not be reached
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Assigns streams to hardware preset buttons.
///
/// The repository is the source of truth: an assignment is saved first and then pushed to
/// the device, whose slot is pointed at our descriptor endpoint. Writes to one slot are
/// serialised across the save and the push, so the device label follows the last save.
#[derive(Clone)]
pub struct PresetService {
    devices: DeviceRepository,
    presets: PresetRepository,
    client: Arc<dyn DeviceClient>,
    public_url: Url,
    slot_locks: Arc<Mutex<HashMap<(String, PresetSlot), Arc<AsyncMutex<()>>>>>,
}

impl PresetService {
    /// `public_url` is the base URL speakers use to reach this daemon.
    pub fn new(
        devices: DeviceRepository,
        presets: PresetRepository,
        client: Arc<dyn DeviceClient>,
        public_url: Url,
    ) -> Result<Self, PresetError> {
        if public_url.cannot_be_a_base() {
            return Err(PresetError::Invalid(format!(
                "public URL {} cannot be used as a base",
                public_url
            )));
        }
        Ok(Self {
            devices,
            presets,
            client,
            public_url,
            slot_locks: Arc::default(),
        })
    }

    fn slot_lock(&self, device_id: &str, slot: PresetSlot) -> Arc<AsyncMutex<()>> {
        let mut locks = self.slot_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((device_id.to_string(), slot))
            .or_default()
            .clone()
    }

    /// URL the device fetches for `(device_id, slot)`.
    pub fn descriptor_url(&self, device_id: &str, slot: PresetSlot) -> String {
        let mut url = self.public_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["descriptor", device_id, slot.to_string().as_str()]);
        }
        url.to_string()
    }

    fn device(&self, device_id: &str) -> Result<Device, PresetError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| PresetError::UnknownDevice(device_id.to_string()))
    }

    /// Bind `slot` on `device_id` to a stream and program the device.
    ///
    /// If the device cannot be reached the assignment is still kept and this returns
    /// [`PresetError::Device`]; assigning again retries the push.
    pub async fn assign_preset(
        &self,
        device_id: &str,
        slot: PresetSlot,
        name: &str,
        url: &str,
    ) -> Result<Preset, PresetError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PresetError::Invalid("name must not be empty".to_string()));
        }
        validate_stream_url(url)?;

        let device = self.device(device_id)?;
        if !device.capabilities.contains(Capability::Presets) {
            warn!(
                "Assigning preset to {} ({}), which is not known to support presets",
                device.id, device.model
            );
        }

        let lock = self.slot_lock(&device.id, slot);
        let _writing = lock.lock().await;

        let preset = Preset {
            device_id: device.id.clone(),
            slot,
            name: name.to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
        };
        self.presets.upsert(preset.clone()).await?;

        let descriptor_url = self.descriptor_url(&device.id, slot);
        self.client
            .store_preset(&device.base_url, slot, name, &descriptor_url)
            .await
            .inspect_err(|e| warn!("Preset {} saved but not pushed to {}: {}", slot, device.id, e))?;

        info!("Assigned preset {} on {} to {}", slot, device.id, preset.name);
        Ok(preset)
    }

    /// Remove an assignment. The device's slot then resolves to the empty descriptor.
    pub async fn clear_preset(
        &self,
        device_id: &str,
        slot: PresetSlot,
    ) -> Result<Option<Preset>, PresetError> {
        let lock = self.slot_lock(device_id, slot);
        let _writing = lock.lock().await;

        let removed = self.presets.remove(device_id, slot).await?;
        if removed.is_some() {
            info!("Cleared preset {} on {}", slot, device_id);
        }
        Ok(removed)
    }

    pub fn list_presets(&self, device_id: &str) -> Result<Vec<Preset>, PresetError> {
        self.device(device_id)?;
        Ok(self.presets.list_for_device(device_id))
    }

    /// Press the hardware button remotely to check the whole chain end to end.
    pub async fn press_preset(&self, device_id: &str, slot: PresetSlot) -> Result<(), PresetError> {
        let device = self.device(device_id)?;
        self.client.simulate_button(&device.base_url, slot).await?;
        Ok(())
    }
}

fn validate_stream_url(url: &str) -> Result<(), PresetError> {
    let parsed = Url::parse(url).map_err(|e| PresetError::Invalid(format!("stream URL: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(PresetError::Invalid(format!(
            "stream URL scheme {} is not supported",
            other
        ))),
    }
}
