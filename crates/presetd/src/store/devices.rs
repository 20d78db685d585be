use std::net::IpAddr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::PersistenceError;
use super::Record;
use super::Table;
use crate::capabilities::CapabilitySet;

/// A speaker we have successfully enriched at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable hardware identifier reported by the device
    pub id: String,

    /// Most recently seen address
    pub ip: IpAddr,

    /// Control API base URL at that address
    pub base_url: String,

    pub name: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub capabilities: CapabilitySet,

    /// When the enrichment that produced this record succeeded
    pub last_seen: DateTime<Utc>,

    /// Managed by [`DeviceRepository::upsert`]
    pub created_at: DateTime<Utc>,

    /// Managed by [`DeviceRepository::upsert`]
    pub updated_at: DateTime<Utc>,
}

impl Record for Device {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored record was seen more recently; nothing was written
    Stale,
}

/// Device records keyed by hardware identifier.
#[derive(Clone)]
pub struct DeviceRepository {
    table: Table<Device>,
}

impl DeviceRepository {
    pub fn new(table: Table<Device>) -> Self {
        Self { table }
    }

    pub fn in_memory() -> Self {
        Self::new(Table::in_memory())
    }

    /// Insert or update by `device.id`.
    ///
    /// `created_at` is kept from the stored record and `updated_at` is set to now. A
    /// record whose `last_seen` is older than the stored one is ignored, so a slow
    /// enrichment can never overwrite a newer one.
    pub async fn upsert(&self, mut device: Device) -> Result<UpsertOutcome, PersistenceError> {
        self.table
            .commit(move |rows| {
                let now = Utc::now();
                let outcome = match rows.get(&device.id) {
                    Some(stored) if device.last_seen < stored.last_seen => {
                        return UpsertOutcome::Stale;
                    }
                    Some(stored) => {
                        device.created_at = stored.created_at;
                        UpsertOutcome::Updated
                    }
                    None => {
                        device.created_at = now;
                        UpsertOutcome::Inserted
                    }
                };
                device.updated_at = now;
                rows.insert(device.id.clone(), device);
                outcome
            })
            .await
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.table.get(&id.to_string())
    }

    /// All devices ordered by identifier.
    pub fn list(&self) -> Vec<Device> {
        self.table.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Delete a device. Only ever called on explicit user request.
    pub async fn remove(&self, id: &str) -> Result<Option<Device>, PersistenceError> {
        let id = id.to_string();
        self.table.commit(move |rows| rows.remove(&id)).await
    }
}
