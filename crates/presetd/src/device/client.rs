use std::net::IpAddr;
use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Serialize;

use crate::presets::PresetSlot;

/// Errors from a single device's local control surface.
///
/// These are always scoped to one device. Callers aggregate them rather than aborting
/// work on other devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Connection refused, timed out, or dropped mid-response
    #[error("device at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// The device answered, but not in the shape we expect
    #[error("device at {url} sent an unexpected response: {reason}")]
    Protocol { url: String, reason: String },

    /// The device has no writable preset slots
    #[error("device at {url} does not support presets")]
    PresetsUnsupported { url: String },

    /// The device understood the request and refused it
    #[error("device at {url} rejected the request: {reason}")]
    Rejected { url: String, reason: String },
}

/// Identity reported by a device's `/info` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stable hardware identifier
    pub id: String,
    pub name: String,
    pub model: String,
    pub firmware_version: Option<String>,
    /// Address the device reports for itself, if any
    pub ip_address: Option<String>,
}

/// What a device is currently playing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub source: String,
    pub item_name: Option<String>,
    pub track: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub station_name: Option<String>,
    pub play_status: Option<String>,
}

impl NowPlaying {
    pub fn is_standby(&self) -> bool {
        self.source.eq_ignore_ascii_case("STANDBY")
    }
}

/// A preset slot as stored on the device itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePreset {
    pub slot: PresetSlot,
    pub name: Option<String>,
    pub source: Option<String>,
    pub location: Option<String>,
}

/// Local HTTP control surface of a speaker.
///
/// Every operation is bounded by the implementation's request timeout. Implementations
/// must be cheap to share across tasks.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Fetch the device's identity.
    async fn get_info(&self, base_url: &str) -> Result<DeviceInfo, DeviceError>;

    /// Fetch what is playing. Returns `None` if the model has no now-playing endpoint.
    async fn get_now_playing(&self, base_url: &str) -> Result<Option<NowPlaying>, DeviceError>;

    /// List the presets stored on the device.
    async fn list_presets(&self, base_url: &str) -> Result<Vec<DevicePreset>, DeviceError>;

    /// Point a hardware preset slot at `descriptor_url`.
    ///
    /// Repeating the call with the same arguments leaves the device in the same state.
    async fn store_preset(
        &self,
        base_url: &str,
        slot: PresetSlot,
        display_name: &str,
        descriptor_url: &str,
    ) -> Result<(), DeviceError>;

    /// Press and release a preset button. Only used for verification.
    async fn simulate_button(&self, base_url: &str, slot: PresetSlot) -> Result<(), DeviceError>;
}

/// Build the control API base URL for a device address.
pub fn base_url(ip: IpAddr, port: u16) -> String {
    format!("http://{}", SocketAddr::new(ip, port))
}

/// Join an endpoint path onto a base URL.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Extract the IP address from a URL whose host is a literal address.
pub(crate) fn host_ip(url: &str) -> Option<IpAddr> {
    let url = reqwest::Url::parse(url).ok()?;
    url.host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(
            base_url("192.168.1.20".parse().unwrap(), 8090),
            "http://192.168.1.20:8090"
        );
        assert_eq!(base_url("fe80::1".parse().unwrap(), 8090), "http://[fe80::1]:8090");
    }

    #[test]
    fn test_endpoint_trims_slash() {
        assert_eq!(endpoint("http://a:8090/", "info"), "http://a:8090/info");
        assert_eq!(endpoint("http://a:8090", "info"), "http://a:8090/info");
    }

    #[test]
    fn test_host_ip() {
        assert_eq!(
            host_ip("http://192.168.1.20:8091/XD/desc.xml"),
            Some("192.168.1.20".parse().unwrap())
        );
        assert_eq!(host_ip("http://[fe80::1]:8090"), Some("fe80::1".parse().unwrap()));
        assert_eq!(host_ip("http://speaker.local:8090"), None);
        assert_eq!(host_ip("not a url"), None);
    }
}
