//! Durable device and preset records.
//!
//! Both repositories are thin typed wrappers over [`Table`], which gives lock-free readers
//! and one writer at a time. Optionally backed by JSON files in the data directory.

mod devices;
mod presets;
mod table;

use std::path::Path;
use std::path::PathBuf;

pub use devices::Device;
pub use devices::DeviceRepository;
pub use devices::UpsertOutcome;
pub use presets::Preset;
pub use presets::PresetRepository;
pub use table::Record;
pub use table::Table;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode records for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Open both repositories, file-backed under `data_dir` or in memory when it is `None`.
pub fn open(
    data_dir: Option<&Path>,
) -> Result<(DeviceRepository, PresetRepository), PersistenceError> {
    match data_dir {
        Some(dir) => Ok((
            DeviceRepository::new(Table::open(dir.join("devices.json"))?),
            PresetRepository::new(Table::open(dir.join("presets.json"))?),
        )),
        None => Ok((
            DeviceRepository::new(Table::in_memory()),
            PresetRepository::new(Table::in_memory()),
        )),
    }
}
