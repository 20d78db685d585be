//! SSDP (UPnP) multicast discovery.
//!
//! One scan sends an `M-SEARCH` query to the SSDP group, collects unicast replies until
//! the deadline, and fetches each new device's description document while still
//! listening. Anything still in flight at the deadline is dropped.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use roxmltree::Document;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DiscoveredDevice;
use super::DiscoveryError;
use super::DiscoveryProvider;
use crate::device::base_url;
use crate::device::host_ip;

/// The SSDP multicast group and port.
pub const SSDP_MULTICAST: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));

/// Search target matching the speakers' UPnP renderer.
pub const DEFAULT_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

/// Seconds devices may wait before answering.
const SEARCH_MX: u32 = 1;

/// UDP is lossy; every query goes out this many times.
const QUERY_REPEATS: usize = 2;

const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Build an `M-SEARCH` request for `search_target`.
pub fn build_search_request(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_MULTICAST, SEARCH_MX, search_target
    )
}

/// The headers we use from an `M-SEARCH` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub location: String,
    pub usn: Option<String>,
    pub search_target: Option<String>,
    pub server: Option<String>,
}

impl SearchResponse {
    /// Key used to collapse repeated replies from one device.
    ///
    /// The USN's `uuid:...` prefix when present, otherwise the location.
    pub fn unique_key(&self) -> String {
        match &self.usn {
            Some(usn) => usn.split("::").next().unwrap_or(usn).to_string(),
            None => self.location.clone(),
        }
    }
}

/// Parse a unicast reply to `M-SEARCH`. Returns `None` for anything that isn't a
/// successful reply carrying a `LOCATION`.
pub fn parse_search_response(text: &str) -> Option<SearchResponse> {
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    let mut parts = status.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") || parts.next()? != "200" {
        return None;
    }

    let mut location = None;
    let mut usn = None;
    let mut search_target = None;
    let mut server = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match name.trim().to_ascii_uppercase().as_str() {
            "LOCATION" => &mut location,
            "USN" => &mut usn,
            "ST" => &mut search_target,
            "SERVER" => &mut server,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }

    Some(SearchResponse {
        location: location?,
        usn,
        search_target,
        server,
    })
}

/// Fields from a UPnP device description document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub udn: Option<String>,
}

/// Parse a device description (`<root><device>...</device></root>`).
pub fn parse_device_description(xml: &str) -> Result<DeviceDescription, String> {
    let doc = Document::parse(xml).map_err(|e| format!("XML parse error: {}", e))?;
    let device = doc
        .root_element()
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "device")
        .ok_or_else(|| "missing <device> element".to_string())?;

    let text = |name: &str| {
        device
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    };

    Ok(DeviceDescription {
        friendly_name: text("friendlyName"),
        manufacturer: text("manufacturer"),
        model_name: text("modelName"),
        udn: text("UDN"),
    })
}

#[derive(Debug)]
enum DescriptionOutcome {
    Described(DeviceDescription),
    /// Fetch failed; the device may still answer on its control port
    Unavailable(String),
    /// The device answered with garbage; drop it
    Malformed(String),
}

async fn fetch_description(http: &reqwest::Client, location: &str) -> DescriptionOutcome {
    let response = match http.get(location).send().await {
        Ok(r) => r,
        Err(e) => return DescriptionOutcome::Unavailable(e.to_string()),
    };
    if !response.status().is_success() {
        return DescriptionOutcome::Unavailable(format!("HTTP {}", response.status()));
    }
    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => return DescriptionOutcome::Unavailable(e.to_string()),
    };
    match parse_device_description(&body) {
        Ok(description) => DescriptionOutcome::Described(description),
        Err(e) => DescriptionOutcome::Malformed(e),
    }
}

/// Discovery over SSDP multicast.
#[derive(Debug, Clone)]
pub struct SsdpDiscovery {
    bind: SocketAddr,
    target: SocketAddr,
    search_target: String,
    device_port: u16,
    http: reqwest::Client,
}

impl SsdpDiscovery {
    pub fn new(
        bind: SocketAddr,
        search_target: String,
        device_port: u16,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(DESCRIPTION_TIMEOUT)
            .connect_timeout(DESCRIPTION_TIMEOUT)
            .build()?;
        Ok(Self {
            bind,
            target: SSDP_MULTICAST,
            search_target,
            device_port,
            http,
        })
    }

    /// Send queries somewhere other than the multicast group.
    #[cfg(test)]
    fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    async fn send_queries(&self, socket: &UdpSocket) -> Result<(), DiscoveryError> {
        let request = build_search_request(&self.search_target);
        let mut sent = 0;
        let mut last_error = None;
        for _ in 0..QUERY_REPEATS {
            match socket.send_to(request.as_bytes(), self.target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!("M-SEARCH to {} failed: {}", self.target, e);
                    last_error = Some(e);
                }
            }
        }
        match (sent, last_error) {
            (0, Some(e)) => Err(DiscoveryError::Send(e)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DiscoveryProvider for SsdpDiscovery {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let deadline = Instant::now() + timeout;

        let socket = match UdpSocket::bind(self.bind).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Cannot bind SSDP socket on {}: {}", self.bind, e);
                return Ok(Vec::new());
            }
        };
        self.send_queries(&socket).await?;

        // Slots are cleared when a device's description turns out to be malformed.
        let mut found: Vec<Option<DiscoveredDevice>> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut fetches = FuturesUnordered::new();
        let mut listening = true;
        let mut buf = vec![0u8; 4096];

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                _ = &mut expired => break,
                received = socket.recv_from(&mut buf), if listening => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("SSDP receive failed, no longer listening: {}", e);
                            listening = false;
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&buf[..len]);
                    let Some(response) = parse_search_response(&text) else {
                        debug!("Ignoring malformed SSDP reply from {}", from);
                        continue;
                    };
                    let key = response.unique_key();
                    if seen.contains_key(&key) {
                        continue;
                    }

                    let address = host_ip(&response.location).unwrap_or(from.ip());
                    debug!("SSDP reply from {} ({}) at {}", address, key, response.location);
                    let index = found.len();
                    seen.insert(key, index);
                    found.push(Some(DiscoveredDevice {
                        address,
                        base_url: base_url(address, self.device_port),
                        name: None,
                        model: None,
                        unique_id: response.usn.clone(),
                    }));

                    let http = self.http.clone();
                    let location = response.location;
                    fetches.push(async move { (index, fetch_description(&http, &location).await) });
                }
                Some((index, outcome)) = fetches.next(), if !fetches.is_empty() => {
                    let Some(device) = found[index].as_mut() else {
                        continue;
                    };
                    match outcome {
                        DescriptionOutcome::Described(description) => {
                            device.name = description.friendly_name;
                            device.model = description.model_name;
                            if device.unique_id.is_none() {
                                device.unique_id = description.udn;
                            }
                        }
                        DescriptionOutcome::Unavailable(reason) => {
                            debug!("No description for {}: {}", device.address, reason);
                        }
                        DescriptionOutcome::Malformed(reason) => {
                            warn!("Skipping {}: malformed description: {}", device.address, reason);
                            found[index] = None;
                        }
                    }
                }
            }
        }

        if !fetches.is_empty() {
            debug!(
                "Dropping {} description fetch(es) still running at the deadline",
                fetches.len()
            );
        }

        let devices: Vec<DiscoveredDevice> = found.into_iter().flatten().collect();
        info!("SSDP discovery found {} device(s)", devices.len());
        Ok(devices)
    }
}
