use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use tracing::info;

use super::client::endpoint;
use super::client::DeviceClient;
use super::client::DeviceError;
use super::client::DeviceInfo;
use super::client::DevicePreset;
use super::client::NowPlaying;
use super::xml;
use crate::presets::PresetSlot;

/// Error names the firmware uses when a source or preset write is not available.
const UNSUPPORTED_ERRORS: &[&str] = &["UNSUPPORTED", "INVALID_SOURCE", "UNKNOWN_SOURCE_ERROR"];

/// Device client speaking the speaker's local HTTP/XML API.
#[derive(Debug, Clone)]
pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    /// Create a client whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    async fn get(&self, url: &str) -> Result<(StatusCode, String), DeviceError> {
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| unreachable(url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| unreachable(url, e))?;
        Ok((status, body))
    }

    async fn post(&self, url: &str, body: String) -> Result<(StatusCode, String), DeviceError> {
        debug!("POST {}: {}", url, body);
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| unreachable(url, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| unreachable(url, e))?;
        Ok((status, body))
    }

    async fn press_key(
        &self,
        url: &str,
        slot: PresetSlot,
        state: xml::KeyState,
    ) -> Result<(), DeviceError> {
        let (status, body) = self.post(url, xml::key_body(slot, state)).await?;
        if !status.is_success() {
            return Err(DeviceError::Rejected {
                url: url.to_string(),
                reason: format!("HTTP {}: {}", status, body.trim()),
            });
        }
        if let Some(errors) = xml::parse_errors(&body) {
            return Err(rejected(url, &errors));
        }
        Ok(())
    }
}

fn unreachable(url: &str, error: reqwest::Error) -> DeviceError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.to_string()
    };
    DeviceError::Unreachable {
        url: url.to_string(),
        reason,
    }
}

fn protocol(url: &str, reason: impl Into<String>) -> DeviceError {
    DeviceError::Protocol {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn rejected(url: &str, errors: &[xml::ApiError]) -> DeviceError {
    let reason = errors
        .iter()
        .map(|e| format!("{}: {}", e.name, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    DeviceError::Rejected {
        url: url.to_string(),
        reason,
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn get_info(&self, base_url: &str) -> Result<DeviceInfo, DeviceError> {
        let url = endpoint(base_url, "info");
        let (status, body) = self.get(&url).await?;
        if !status.is_success() {
            return Err(protocol(&url, format!("HTTP {}", status)));
        }
        xml::parse_info(&body).map_err(|e| protocol(&url, e))
    }

    async fn get_now_playing(&self, base_url: &str) -> Result<Option<NowPlaying>, DeviceError> {
        let url = endpoint(base_url, "now_playing");
        let (status, body) = self.get(&url).await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(protocol(&url, format!("HTTP {}", status)));
        }
        xml::parse_now_playing(&body)
            .map(Some)
            .map_err(|e| protocol(&url, e))
    }

    async fn list_presets(&self, base_url: &str) -> Result<Vec<DevicePreset>, DeviceError> {
        let url = endpoint(base_url, "presets");
        let (status, body) = self.get(&url).await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
            return Err(DeviceError::PresetsUnsupported { url });
        }
        if !status.is_success() {
            return Err(protocol(&url, format!("HTTP {}", status)));
        }
        xml::parse_presets(&body).map_err(|e| protocol(&url, e))
    }

    async fn store_preset(
        &self,
        base_url: &str,
        slot: PresetSlot,
        display_name: &str,
        descriptor_url: &str,
    ) -> Result<(), DeviceError> {
        let url = endpoint(base_url, "storePreset");
        let body = xml::store_preset_body(slot, display_name, descriptor_url);
        let (status, reply) = self.post(&url, body).await?;

        if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
            return Err(DeviceError::PresetsUnsupported { url });
        }

        if let Some(errors) = xml::parse_errors(&reply) {
            if errors
                .iter()
                .any(|e| UNSUPPORTED_ERRORS.contains(&e.name.as_str()))
            {
                return Err(DeviceError::PresetsUnsupported { url });
            }
            return Err(rejected(&url, &errors));
        }

        if !status.is_success() {
            return Err(DeviceError::Rejected {
                url,
                reason: format!("HTTP {}", status),
            });
        }

        info!("Stored preset {} ({}) on {}", slot, display_name, base_url);
        Ok(())
    }

    async fn simulate_button(&self, base_url: &str, slot: PresetSlot) -> Result<(), DeviceError> {
        let url = endpoint(base_url, "key");
        self.press_key(&url, slot, xml::KeyState::Press).await?;
        self.press_key(&url, slot, xml::KeyState::Release).await
    }
}
