use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use toml::Spanned;

use super::diagnostics::{
    Diagnostic, Error, FieldLocation, LoadError, MergeError, SourceInfo, Warning,
};
use super::{DiscoveryBackend, LogLevel};

/// One config file as written, before merging and validation.
///
/// Every scalar keeps its source span so conflicts and validation errors can point at it.
#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub server: Option<PartialServerConfig>,
    pub discovery: Option<PartialDiscoveryConfig>,
    pub device: Option<PartialDeviceConfig>,
    pub sync: Option<PartialSyncConfig>,
    pub storage: Option<PartialStorageConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,

    /// Where each merged field was set, keyed by dotted field path
    #[serde(skip)]
    pub origins: HashMap<String, FieldLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialServerConfig {
    pub listen: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
    pub public_url: Option<Spanned<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialDiscoveryConfig {
    pub backend: Option<Spanned<DiscoveryBackend>>,
    pub timeout_ms: Option<Spanned<u64>>,
    pub search_target: Option<Spanned<String>>,
    pub manual_ips: Option<Spanned<Vec<String>>>,
    pub bind: Option<Spanned<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialDeviceConfig {
    pub port: Option<Spanned<u16>>,
    pub timeout_ms: Option<Spanned<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialSyncConfig {
    pub concurrency: Option<Spanned<usize>>,
    pub enrich_timeout_ms: Option<Spanned<u64>>,
    pub interval_secs: Option<Spanned<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialStorageConfig {
    pub data_dir: Option<Spanned<String>>,
}

/// First-wins field merging that records every conflict instead of stopping at the first.
struct Merger {
    diagnostics: Vec<Diagnostic>,
    origins: HashMap<String, FieldLocation>,
}

impl Merger {
    fn field<T>(
        &mut self,
        field_path: &str,
        source: &SourceInfo,
        into: &mut Option<Spanned<T>>,
        value: Option<Spanned<T>>,
    ) {
        let Some(value) = value else {
            return;
        };
        let location = FieldLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };

        if let Some(first) = self.origins.get(field_path) {
            self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                field_path: field_path.to_string(),
                message: format!("'{}' is defined in multiple config files", field_path),
                conflicts: vec![first.clone(), location],
            })));
        } else {
            *into = Some(value);
            self.origins.insert(field_path.to_string(), location);
        }
    }
}

impl PartialConfig {
    /// Parse one config document. `path` is only used for diagnostics.
    pub fn parse(content: &str, path: &Path) -> Result<Self, LoadError> {
        let mut config: PartialConfig = toml::from_str(content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content: content.to_string(),
        });

        Ok(config)
    }

    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        Self::parse(&content, path)
    }

    /// Load config files with import resolution
    ///
    /// Returns all loaded configs in order (imports first, then the importing file).
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path.clone(),
                cycle: visited.iter().cloned().collect(),
            });
        }

        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        // Imports are relative to the importing file
        for import_path in &config.imports {
            let import_path_buf = PathBuf::from(import_path);
            let resolved_path = if import_path_buf.is_absolute() {
                import_path_buf
            } else {
                let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
                parent_dir.join(import_path_buf)
            };

            Self::load_recursive(&resolved_path, visited, configs)?;
        }

        configs.push(config);

        // Sibling branches may import the same file
        visited.remove(&canonical_path);

        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.imports.is_empty()
            && self.logging.is_none()
            && self.server.is_none()
            && self.discovery.is_none()
            && self.device.is_none()
            && self.sync.is_none()
            && self.storage.is_none()
    }

    /// Merge multiple partial configs together
    ///
    /// First-wins: the first file to set a field keeps it. Every conflict is collected so
    /// they can all be reported at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger {
            diagnostics: Vec::new(),
            origins: HashMap::new(),
        };

        for config in configs {
            result.imports.extend(config.imports.iter().cloned());

            let source = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            if config.is_empty() {
                merger.diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                    file_path: source.file_path.clone(),
                }));
            }

            if let Some(logging) = config.logging {
                let into = result.logging.get_or_insert_with(Default::default);
                merger.field("logging.level", &source, &mut into.level, logging.level);

                for (target, level) in logging.overrides.unwrap_or_default() {
                    let overrides = into.overrides.get_or_insert_with(HashMap::new);
                    let mut slot = overrides.remove(&target);
                    merger.field(
                        &format!("logging.overrides.{}", target),
                        &source,
                        &mut slot,
                        Some(level),
                    );
                    if let Some(level) = slot {
                        overrides.insert(target, level);
                    }
                }
            }

            if let Some(server) = config.server {
                let into = result.server.get_or_insert_with(Default::default);
                merger.field("server.listen", &source, &mut into.listen, server.listen);
                merger.field("server.port", &source, &mut into.port, server.port);
                merger.field(
                    "server.public_url",
                    &source,
                    &mut into.public_url,
                    server.public_url,
                );
            }

            if let Some(discovery) = config.discovery {
                let into = result.discovery.get_or_insert_with(Default::default);
                merger.field(
                    "discovery.backend",
                    &source,
                    &mut into.backend,
                    discovery.backend,
                );
                merger.field(
                    "discovery.timeout_ms",
                    &source,
                    &mut into.timeout_ms,
                    discovery.timeout_ms,
                );
                merger.field(
                    "discovery.search_target",
                    &source,
                    &mut into.search_target,
                    discovery.search_target,
                );
                merger.field(
                    "discovery.manual_ips",
                    &source,
                    &mut into.manual_ips,
                    discovery.manual_ips,
                );
                merger.field("discovery.bind", &source, &mut into.bind, discovery.bind);
            }

            if let Some(device) = config.device {
                let into = result.device.get_or_insert_with(Default::default);
                merger.field("device.port", &source, &mut into.port, device.port);
                merger.field(
                    "device.timeout_ms",
                    &source,
                    &mut into.timeout_ms,
                    device.timeout_ms,
                );
            }

            if let Some(sync) = config.sync {
                let into = result.sync.get_or_insert_with(Default::default);
                merger.field(
                    "sync.concurrency",
                    &source,
                    &mut into.concurrency,
                    sync.concurrency,
                );
                merger.field(
                    "sync.enrich_timeout_ms",
                    &source,
                    &mut into.enrich_timeout_ms,
                    sync.enrich_timeout_ms,
                );
                merger.field(
                    "sync.interval_secs",
                    &source,
                    &mut into.interval_secs,
                    sync.interval_secs,
                );
            }

            if let Some(storage) = config.storage {
                let into = result.storage.get_or_insert_with(Default::default);
                merger.field(
                    "storage.data_dir",
                    &source,
                    &mut into.data_dir,
                    storage.data_dir,
                );
            }
        }

        result.origins = merger.origins;
        (result, merger.diagnostics)
    }
}
