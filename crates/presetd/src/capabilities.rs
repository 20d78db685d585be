//! Capability detection for speaker models.
//!
//! Devices only report an opaque model string (e.g. "SoundTouch 300"). This module maps that
//! string to a set of feature flags using a declarative, ordered table. Adding support for a
//! new model means adding a row to [`CAPABILITY_TABLE`], never branching in calling code.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

/// A single feature a speaker may support.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// Hardware preset buttons that can be written over the local API.
    Presets,
    Bluetooth,
    AuxInput,
    HdmiInput,
    OpticalInput,
    BassControl,
    /// Can join multi-room zones.
    Multiroom,
    Battery,
}

/// Set of capabilities detected for a device.
///
/// The default value is the all-false set used for unrecognized models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn from_flags(flags: &[Capability]) -> Self {
        Self(flags.iter().copied().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

/// One row of the capability table.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityRule {
    /// Case-insensitive substring matched against the model string.
    pub pattern: &'static str,

    /// Minimum firmware major version for this row to apply. Rows with an unmet (or
    /// unknown) firmware requirement fall through to the next matching row.
    pub min_firmware_major: Option<u32>,

    pub flags: &'static [Capability],
}

use Capability::*;

/// Model table, most specific pattern first.
///
/// "SoundTouch 300" must precede "SoundTouch 30", and the bare "SoundTouch" catch-all
/// must stay last.
pub const CAPABILITY_TABLE: &[CapabilityRule] = &[
    CapabilityRule {
        pattern: "SoundTouch 300",
        min_firmware_major: None,
        flags: &[Presets, Bluetooth, HdmiInput, OpticalInput, BassControl, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch Portable",
        min_firmware_major: None,
        flags: &[Presets, Bluetooth, AuxInput, Multiroom, Battery],
    },
    CapabilityRule {
        pattern: "Wave SoundTouch",
        min_firmware_major: None,
        flags: &[Presets, AuxInput, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch SA-5",
        min_firmware_major: None,
        flags: &[Presets, AuxInput, Multiroom],
    },
    CapabilityRule {
        pattern: "Wireless Link",
        min_firmware_major: None,
        flags: &[Presets, AuxInput, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch 30",
        min_firmware_major: None,
        flags: &[Presets, Bluetooth, AuxInput, BassControl, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch 20",
        min_firmware_major: None,
        flags: &[Presets, Bluetooth, AuxInput, BassControl, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch 10",
        min_firmware_major: None,
        flags: &[Presets, Bluetooth, AuxInput, Multiroom],
    },
    CapabilityRule {
        pattern: "SoundTouch",
        min_firmware_major: None,
        flags: &[Presets, Multiroom],
    },
];

/// Detect capabilities for a model using the built-in table.
pub fn detect(model: &str, firmware_version: Option<&str>) -> CapabilitySet {
    detect_with(CAPABILITY_TABLE, model, firmware_version)
}

/// Detect capabilities using an explicit table. The first row that matches wins.
pub fn detect_with(
    table: &[CapabilityRule],
    model: &str,
    firmware_version: Option<&str>,
) -> CapabilitySet {
    let model = model.to_ascii_lowercase();
    let firmware_major = firmware_version.and_then(firmware_major);

    table
        .iter()
        .filter(|rule| model.contains(&rule.pattern.to_ascii_lowercase()))
        .find(|rule| match (rule.min_firmware_major, firmware_major) {
            (None, _) => true,
            (Some(min), Some(major)) => major >= min,
            (Some(_), None) => false,
        })
        .map(|rule| CapabilitySet::from_flags(rule.flags))
        .unwrap_or_default()
}

/// Extract the leading major version from strings like "27.0.6.46330.5043500 epdbuild...".
fn firmware_major(version: &str) -> Option<u32> {
    let digits: String = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
