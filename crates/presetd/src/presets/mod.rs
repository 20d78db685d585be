//! Preset buttons: slot numbers, assignments, and the descriptor the device fetches.

mod descriptor;
mod service;
mod slot;

pub use descriptor::Descriptor;
pub use descriptor::PresetDescriptorService;
pub use descriptor::Resolved;
pub use service::PresetError;
pub use service::PresetService;
pub use slot::InvalidPresetSlot;
pub use slot::PresetSlot;
pub use slot::MAX_SLOT;
pub use slot::MIN_SLOT;
