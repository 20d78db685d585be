use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Lowest hardware preset button number.
pub const MIN_SLOT: u32 = 1;

/// Highest hardware preset button number.
pub const MAX_SLOT: u32 = 6;

/// A hardware preset button, guaranteed to be in `1..=6`.
///
/// Out-of-range numbers are rejected when the slot is constructed, so everything past the
/// API boundary can take a `PresetSlot` without re-checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PresetSlot(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("preset slot {0} is out of range (expected 1..=6)")]
pub struct InvalidPresetSlot(pub u32);

impl PresetSlot {
    pub fn get(self) -> u8 {
        self.0
    }

    /// All slots in button order.
    pub fn all() -> impl Iterator<Item = PresetSlot> {
        (MIN_SLOT..=MAX_SLOT).map(|n| PresetSlot(n as u8))
    }
}

impl TryFrom<u32> for PresetSlot {
    type Error = InvalidPresetSlot;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if (MIN_SLOT..=MAX_SLOT).contains(&value) {
            Ok(PresetSlot(value as u8))
        } else {
            Err(InvalidPresetSlot(value))
        }
    }
}

impl From<PresetSlot> for u32 {
    fn from(slot: PresetSlot) -> Self {
        u32::from(slot.0)
    }
}

impl fmt::Display for PresetSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
