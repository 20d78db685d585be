//! The document a speaker fetches when one of its preset buttons is pressed.
//!
//! The shape is fixed by the speaker firmware, which silently ignores anything it does
//! not recognise. Field names, order and the constant values below must not change.

use serde::Deserialize;
use serde::Serialize;

use super::PresetSlot;
use crate::store::PresetRepository;

const STREAM_TYPE: &str = "liveRadio";
const MAX_TIMEOUT_SECS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorAudio {
    has_playlist: bool,
    is_realtime: bool,
    max_timeout: u32,
    stream_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    audio: DescriptorAudio,
    image_url: String,
    name: String,
    stream_type: String,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            audio: DescriptorAudio {
                has_playlist: false,
                is_realtime: true,
                max_timeout: MAX_TIMEOUT_SECS,
                stream_url: stream_url.into(),
            },
            image_url: String::new(),
            name: name.into(),
            stream_type: STREAM_TYPE.to_string(),
        }
    }

    /// Answer for an unassigned slot: same schema, nothing to play.
    pub fn empty() -> Self {
        Self::new("", "")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_url(&self) -> &str {
        &self.audio.stream_url
    }

    pub fn is_empty(&self) -> bool {
        self.audio.stream_url.is_empty()
    }
}

/// Result of looking up a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Assigned(Descriptor),
    NotAssigned,
}

impl Resolved {
    /// The document to send to the device: the empty descriptor when unassigned.
    pub fn into_descriptor(self) -> Descriptor {
        match self {
            Resolved::Assigned(descriptor) => descriptor,
            Resolved::NotAssigned => Descriptor::empty(),
        }
    }
}

/// Answers descriptor requests from a single repository lookup.
#[derive(Clone)]
pub struct PresetDescriptorService {
    presets: PresetRepository,
}

impl PresetDescriptorService {
    pub fn new(presets: PresetRepository) -> Self {
        Self { presets }
    }

    /// Look up the stream for `(device_id, slot)`. Never blocks and never fails.
    pub fn resolve(&self, device_id: &str, slot: PresetSlot) -> Resolved {
        match self.presets.get(device_id, slot) {
            Some(preset) => Resolved::Assigned(Descriptor::new(preset.name, preset.url)),
            None => Resolved::NotAssigned,
        }
    }
}
