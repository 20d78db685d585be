use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::PersistenceError;
use super::Record;
use super::Table;
use crate::presets::PresetSlot;

/// A stream assigned to one hardware preset button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub device_id: String,
    pub slot: PresetSlot,
    /// Display name shown on the device
    pub name: String,
    /// Stream the device plays when the button is pressed
    pub url: String,
    /// When this assignment was made
    pub created_at: DateTime<Utc>,
}

impl Record for Preset {
    type Key = (String, PresetSlot);

    fn key(&self) -> Self::Key {
        (self.device_id.clone(), self.slot)
    }
}

/// Preset assignments keyed by `(device, slot)`.
#[derive(Clone)]
pub struct PresetRepository {
    table: Table<Preset>,
}

impl PresetRepository {
    pub fn new(table: Table<Preset>) -> Self {
        Self { table }
    }

    pub fn in_memory() -> Self {
        Self::new(Table::in_memory())
    }

    /// Store an assignment, replacing any previous one for the same slot.
    pub async fn upsert(&self, preset: Preset) -> Result<(), PersistenceError> {
        self.table
            .commit(move |rows| {
                rows.insert(preset.key(), preset);
            })
            .await
    }

    pub fn get(&self, device_id: &str, slot: PresetSlot) -> Option<Preset> {
        self.table.get(&(device_id.to_string(), slot))
    }

    /// A device's assignments in slot order.
    pub fn list_for_device(&self, device_id: &str) -> Vec<Preset> {
        self.table
            .snapshot()
            .values()
            .filter(|p| p.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Preset> {
        self.table.snapshot().values().cloned().collect()
    }

    pub async fn remove(
        &self,
        device_id: &str,
        slot: PresetSlot,
    ) -> Result<Option<Preset>, PersistenceError> {
        let key = (device_id.to_string(), slot);
        self.table.commit(move |rows| rows.remove(&key)).await
    }

    /// Drop every assignment for a device, returning how many there were.
    pub async fn remove_device(&self, device_id: &str) -> Result<usize, PersistenceError> {
        let device_id = device_id.to_string();
        self.table
            .commit(move |rows| {
                let before = rows.len();
                rows.retain(|(id, _), _| *id != device_id);
                before - rows.len()
            })
            .await
    }
}
