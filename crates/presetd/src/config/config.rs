use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use toml::Spanned;
use tracing_subscriber::filter::LevelFilter;

use super::diagnostics::{
    format_diagnostics, Diagnostic, Error, FieldLocation, LoadError, ValidationError, Warning,
};
use super::partial::PartialConfig;
use crate::discovery::ssdp::DEFAULT_SEARCH_TARGET;

/// Fully validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

// LogLevel needs Deserialize because it's used in PartialLoggingConfig with toml::Spanned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"presetd::discovery" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: IpAddr,
    pub port: u16,

    /// Base URL speakers use to reach the descriptor endpoint
    pub public_url: Url,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscoveryBackend {
    #[default]
    Ssdp,
    Manual,
    Fixture,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub backend: DiscoveryBackend,
    pub timeout: Duration,
    pub search_target: String,
    pub manual_ips: Vec<IpAddr>,
    /// Local address for the SSDP socket
    pub bind: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Port of the speakers' local control API
    pub port: u16,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub concurrency: usize,
    pub enrich_timeout: Duration,
    /// Run a sync in the background this often
    pub interval: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
pub struct StorageConfig {
    /// Where repositories are saved; in memory when unset
    pub data_dir: Option<PathBuf>,
}

pub const DEFAULT_LISTEN: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_DEVICE_PORT: u16 = 8090;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_ENRICH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Failure to produce a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Merge or validation errors, already formatted for display
    #[error("{0}")]
    Invalid(String),
}

/// Collects validation errors while converting partial values.
struct Validator<'a> {
    origins: &'a HashMap<String, FieldLocation>,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl Validator<'_> {
    fn error(&mut self, field_path: &str, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::Error(Error::Validation(ValidationError {
                field_path: field_path.to_string(),
                message: message.into(),
                location: self.origins.get(field_path).cloned(),
            })));
    }

    fn warn(&mut self, warning: Warning) {
        self.diagnostics.push(Diagnostic::Warning(warning));
    }

    /// Parse a string field, recording an error and returning `None` if it is invalid.
    fn parse<T>(&mut self, field_path: &str, value: &Spanned<String>, what: &str) -> Option<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match value.get_ref().trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.error(field_path, format!("not a valid {}: {}", what, e));
                None
            }
        }
    }

    /// A millisecond duration that must be non-zero.
    fn millis(&mut self, field_path: &str, value: Option<Spanned<u64>>, default: u64) -> Duration {
        let millis = value.map(Spanned::into_inner).unwrap_or(default);
        if millis == 0 {
            self.error(field_path, "must be greater than zero");
            return Duration::from_millis(default);
        }
        Duration::from_millis(millis)
    }
}

impl Config {
    /// Load configuration from multiple TOML files with import resolution
    ///
    /// Supports several files (e.g. base + site overrides), `imports` within files,
    /// conflict detection across all sources, and validation with every error and warning
    /// reported together.
    ///
    /// Returns the config plus any warnings. Fails if there is at least one error.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Load configuration from a single in-memory document without imports.
    pub fn from_toml_str(content: &str) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let partial = PartialConfig::parse(content, Path::new("<inline>"))?;
        let (partial, diagnostics) = PartialConfig::merge([partial]);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig to a Config, validating all fields
    ///
    /// Adds validation diagnostics to those from the merge step.
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut v = Validator {
            origins: &partial.origins,
            diagnostics: &mut diagnostics,
        };

        let logging = partial
            .logging
            .map(|logging| LoggingConfig {
                level: logging.level.map(Spanned::into_inner).unwrap_or_default(),
                overrides: logging
                    .overrides
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(target, level)| (target, level.into_inner()))
                    .collect(),
            })
            .unwrap_or_default();

        let server = partial.server.unwrap_or_default();
        let listen = server
            .listen
            .and_then(|s| v.parse::<IpAddr>("server.listen", &s, "IP address"))
            .unwrap_or(DEFAULT_LISTEN);
        let port = server
            .port
            .map(Spanned::into_inner)
            .unwrap_or(DEFAULT_PORT);
        let public_url = match server.public_url {
            Some(url) => v
                .parse::<Url>("server.public_url", &url, "URL")
                .and_then(|url| {
                    if matches!(url.scheme(), "http" | "https") && !url.cannot_be_a_base() {
                        Some(url)
                    } else {
                        v.error("server.public_url", "must be an http:// or https:// URL");
                        None
                    }
                }),
            None => match derive_public_url(listen, port) {
                Ok(url) => {
                    v.warn(Warning::DerivedPublicUrl {
                        url: url.to_string(),
                    });
                    Some(url)
                }
                Err(e) => {
                    v.error(
                        "server.public_url",
                        format!("cannot derive a default, set it explicitly: {}", e),
                    );
                    None
                }
            },
        };

        let discovery = partial.discovery.unwrap_or_default();
        let backend = discovery
            .backend
            .map(Spanned::into_inner)
            .unwrap_or_default();
        let discovery_timeout = v.millis(
            "discovery.timeout_ms",
            discovery.timeout_ms,
            DEFAULT_DISCOVERY_TIMEOUT_MS,
        );
        let search_target = discovery
            .search_target
            .map(Spanned::into_inner)
            .unwrap_or_else(|| DEFAULT_SEARCH_TARGET.to_string());
        let mut manual_ips: Vec<IpAddr> = Vec::new();
        if let Some(ips) = &discovery.manual_ips {
            for ip in ips.get_ref() {
                match ip.trim().parse::<IpAddr>() {
                    Ok(ip) => manual_ips.push(ip),
                    Err(_) => v.error(
                        "discovery.manual_ips",
                        format!("'{}' is not a valid IP address", ip),
                    ),
                }
            }
        }
        if backend == DiscoveryBackend::Manual && discovery.manual_ips.is_none() {
            v.error(
                "discovery.manual_ips",
                "at least one address is required when backend = \"manual\"",
            );
        } else if backend == DiscoveryBackend::Manual && manual_ips.is_empty() {
            v.error("discovery.manual_ips", "must not be empty when backend = \"manual\"");
        }
        let bind = discovery
            .bind
            .and_then(|s| v.parse::<SocketAddr>("discovery.bind", &s, "socket address"))
            .unwrap_or(DEFAULT_BIND);

        let device = partial.device.unwrap_or_default();
        let device_port = device
            .port
            .map(Spanned::into_inner)
            .unwrap_or(DEFAULT_DEVICE_PORT);
        let device_timeout =
            v.millis("device.timeout_ms", device.timeout_ms, DEFAULT_DEVICE_TIMEOUT_MS);

        let sync = partial.sync.unwrap_or_default();
        let concurrency = sync
            .concurrency
            .map(Spanned::into_inner)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            v.error("sync.concurrency", "must be at least 1");
        }
        let enrich_timeout = v.millis(
            "sync.enrich_timeout_ms",
            sync.enrich_timeout_ms,
            DEFAULT_ENRICH_TIMEOUT_MS,
        );
        let interval = match sync.interval_secs.map(Spanned::into_inner) {
            Some(0) => {
                v.error("sync.interval_secs", "must be greater than zero");
                None
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        let data_dir = partial
            .storage
            .and_then(|storage| storage.data_dir)
            .map(|dir| PathBuf::from(dir.into_inner()));

        // Every path that leaves public_url unset has recorded an error.
        let public_url = match public_url {
            Some(url) if !diagnostics.iter().any(|d| d.is_error()) => url,
            _ => return Err(ConfigError::Invalid(format_diagnostics(&diagnostics))),
        };

        let config = Config {
            logging,
            server: ServerConfig {
                listen,
                port,
                public_url,
            },
            discovery: DiscoveryConfig {
                backend,
                timeout: discovery_timeout,
                search_target,
                manual_ips,
                bind,
            },
            device: DeviceConfig {
                port: device_port,
                timeout: device_timeout,
            },
            sync: SyncConfig {
                concurrency: concurrency.max(1),
                enrich_timeout,
                interval,
            },
            storage: StorageConfig { data_dir },
        };

        Ok((config, diagnostics))
    }
}

/// Best guess at an address speakers can reach us on.
///
/// A wildcard listen address is useless to a speaker, so the host name stands in for it.
fn derive_public_url(listen: IpAddr, port: u16) -> Result<Url, String> {
    let authority = if listen.is_unspecified() {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        format!("{}:{}", host, port)
    } else {
        SocketAddr::new(listen, port).to_string()
    };
    Url::parse(&format!("http://{}/", authority)).map_err(|e| e.to_string())
}
