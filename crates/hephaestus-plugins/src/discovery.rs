//! Configuration-driven plugin discovery.
//!
//! Reads `.hephaestus/plugins.toml`: a `[builtin]` table of enable flags (or
//! `{enabled, config}` tables) and `[[external]]` entries naming exactly one
//! source, `path` (a gate descriptor file), `module` (a compiled-in module),
//! or `marketplace` (a curated, signed reference). Enabled built-ins register
//! first; a bad external entry fails the whole discovery pass closed.

use crate::builtins::{self, CommandPlugin};
use crate::marketplace::{Marketplace, MarketplaceError};
use hephaestus_core::release::sigstore::SigstoreVerifier;
use hephaestus_core::{
    GateSpec, Plugin, PluginCategory, PluginError, PluginMetadata, PluginRegistry,
};
use semver::Version;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use toml::Value as TomlValue;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to read plugin configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse plugin configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("external plugin '{0}' must set exactly one of path, module, marketplace")]
    ConflictingSource(String),

    #[error("external plugin '{0}' names no source")]
    MissingSource(String),

    #[error("external plugin '{name}' path does not exist: {path}")]
    BadPath { name: String, path: PathBuf },

    #[error("external plugin '{name}' descriptor is invalid: {reason}")]
    BadDescriptor { name: String, reason: String },

    #[error("external plugin '{0}' names an unknown module")]
    UnknownModule(String),

    #[error(transparent)]
    Marketplace(#[from] MarketplaceError),

    #[error(transparent)]
    Registry(#[from] PluginError),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BuiltinEntry {
    Flag(bool),
    Detailed {
        enabled: bool,
        #[serde(default)]
        config: Option<TomlValue>,
    },
}

impl BuiltinEntry {
    fn enabled(&self) -> bool {
        match self {
            BuiltinEntry::Flag(flag) => *flag,
            BuiltinEntry::Detailed { enabled, .. } => *enabled,
        }
    }

    fn config(&self) -> JsonValue {
        match self {
            BuiltinEntry::Flag(_) => JsonValue::Object(Default::default()),
            BuiltinEntry::Detailed { config, .. } => config
                .as_ref()
                .map(toml_to_json)
                .unwrap_or_else(|| JsonValue::Object(Default::default())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExternalEntry {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    marketplace: Option<String>,
    #[serde(default)]
    config: Option<TomlValue>,
    #[serde(flatten)]
    unknown: BTreeMap<String, TomlValue>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct PluginsFile {
    #[serde(default)]
    builtin: BTreeMap<String, BuiltinEntry>,
    #[serde(default)]
    external: Vec<ExternalEntry>,
    #[serde(flatten)]
    unknown: BTreeMap<String, TomlValue>,
}

/// `path`-sourced externals point at a descriptor file of this shape.
#[derive(Debug, Deserialize)]
struct GateDescriptor {
    name: String,
    #[serde(default = "default_descriptor_version")]
    version: Version,
    #[serde(default)]
    description: String,
    #[serde(default)]
    author: String,
    #[serde(default = "default_descriptor_category")]
    category: PluginCategory,
    #[serde(default = "default_descriptor_order")]
    order: i32,
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn default_descriptor_version() -> Version {
    Version::new(0, 0, 0)
}

fn default_descriptor_category() -> PluginCategory {
    PluginCategory::Custom
}

fn default_descriptor_order() -> i32 {
    100
}

/// The outcome of one discovery pass: an ordered registry plus the per-plugin
/// configuration objects.
#[derive(Debug)]
pub struct DiscoveredPlugins {
    pub registry: PluginRegistry,
    configs: HashMap<String, JsonValue>,
}

impl DiscoveredPlugins {
    /// Gate specs in `(order, name)` order, each carrying its config.
    pub fn gate_specs(&self) -> Vec<GateSpec> {
        self.registry
            .all_plugins()
            .into_iter()
            .map(|plugin| {
                let config = self
                    .configs
                    .get(&plugin.metadata().name)
                    .cloned()
                    .unwrap_or_else(|| JsonValue::Object(Default::default()));
                GateSpec::new(plugin).with_config(config)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

pub struct Discovery {
    config_path: PathBuf,
    marketplace_dir: PathBuf,
    verifier: Arc<dyn SigstoreVerifier>,
}

impl Discovery {
    /// Standard locations under a workspace: `.hephaestus/plugins.toml` and
    /// `.hephaestus/marketplace/`.
    pub fn for_workspace(workspace: &Path, verifier: Arc<dyn SigstoreVerifier>) -> Self {
        Self {
            config_path: workspace.join(".hephaestus").join("plugins.toml"),
            marketplace_dir: workspace.join(".hephaestus").join("marketplace"),
            verifier,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn with_marketplace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.marketplace_dir = dir.into();
        self
    }

    /// Run the discovery pass. A missing configuration file registers the
    /// full built-in set with defaults.
    pub async fn discover(&self) -> Result<DiscoveredPlugins, DiscoveryError> {
        let file = if self.config_path.exists() {
            let raw =
                std::fs::read_to_string(&self.config_path).map_err(|source| DiscoveryError::Read {
                    path: self.config_path.clone(),
                    source,
                })?;
            toml::from_str::<PluginsFile>(&raw)?
        } else {
            PluginsFile::default()
        };
        for key in file.unknown.keys() {
            tracing::warn!(target: "hephaestus::plugins", key = %key, "unknown key in plugins.toml ignored");
        }

        let mut registry = PluginRegistry::new();
        let mut configs: HashMap<String, JsonValue> = HashMap::new();

        // Built-ins first: enabled unless explicitly disabled.
        for plugin in builtins::builtin_plugins() {
            let name = plugin.metadata().name.clone();
            match file.builtin.get(&name) {
                Some(entry) if !entry.enabled() => {
                    tracing::debug!(target: "hephaestus::plugins", plugin = %name, "builtin disabled by configuration");
                    continue;
                }
                Some(entry) => {
                    configs.insert(name.clone(), entry.config());
                    registry.register(plugin)?;
                }
                None => {
                    registry.register(plugin)?;
                }
            }
        }

        // Externals fail the pass closed.
        for entry in &file.external {
            for key in entry.unknown.keys() {
                tracing::warn!(
                    target: "hephaestus::plugins",
                    plugin = %entry.name,
                    key = %key,
                    "unknown key on external plugin entry ignored"
                );
            }
            if !entry.enabled {
                continue;
            }
            let sources = [
                entry.path.is_some(),
                entry.module.is_some(),
                entry.marketplace.is_some(),
            ]
            .iter()
            .filter(|set| **set)
            .count();
            match sources {
                0 => return Err(DiscoveryError::MissingSource(entry.name.clone())),
                1 => {}
                _ => return Err(DiscoveryError::ConflictingSource(entry.name.clone())),
            }

            let config = entry
                .config
                .as_ref()
                .map(toml_to_json)
                .unwrap_or_else(|| JsonValue::Object(Default::default()));

            if let Some(path) = &entry.path {
                let plugin = self.load_descriptor(&entry.name, path)?;
                configs.insert(plugin.metadata().name.clone(), config);
                registry.register(plugin)?;
            } else if let Some(module) = &entry.module {
                let plugin = resolve_module(module)
                    .ok_or_else(|| DiscoveryError::UnknownModule(entry.name.clone()))?;
                configs.insert(plugin.metadata().name.clone(), config);
                registry.register(plugin)?;
            } else if let Some(reference) = &entry.marketplace {
                let marketplace =
                    Marketplace::new(&self.marketplace_dir, Arc::clone(&self.verifier));
                for resolved in marketplace.resolve(reference).await? {
                    let name = resolved.manifest.name.clone();
                    // The referenced plugin gets the entry's config;
                    // dependencies run with defaults.
                    if &name == reference {
                        configs.insert(name.clone(), config.clone());
                    }
                    registry.register(resolved.plugin)?;
                }
            }
        }

        tracing::info!(
            target: "hephaestus::plugins",
            count = registry.len(),
            config = %self.config_path.display(),
            "plugin discovery complete"
        );
        Ok(DiscoveredPlugins { registry, configs })
    }

    fn load_descriptor(
        &self,
        entry_name: &str,
        path: &Path,
    ) -> Result<Arc<dyn Plugin>, DiscoveryError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(path)
        };
        if !path.exists() {
            return Err(DiscoveryError::BadPath {
                name: entry_name.to_string(),
                path,
            });
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| DiscoveryError::Read {
            path: path.clone(),
            source,
        })?;
        let descriptor: GateDescriptor =
            toml::from_str(&raw).map_err(|e| DiscoveryError::BadDescriptor {
                name: entry_name.to_string(),
                reason: e.to_string(),
            })?;
        let metadata = PluginMetadata {
            name: descriptor.name,
            version: descriptor.version,
            description: descriptor.description,
            author: descriptor.author,
            category: descriptor.category,
            requires: Vec::new(),
            order: descriptor.order,
        };
        Ok(Arc::new(CommandPlugin::new(
            metadata,
            descriptor.program,
            descriptor.args,
        )))
    }
}

/// Compiled-in module table for `module`-sourced externals. There is no
/// dynamic code loading; a module reference selects a factory baked into this
/// crate.
fn resolve_module(module: &str) -> Option<Arc<dyn Plugin>> {
    match module {
        "hephaestus_plugins.builtin.ruff_check" => Some(builtins::ruff_check()),
        "hephaestus_plugins.builtin.ruff_format" => Some(builtins::ruff_format()),
        "hephaestus_plugins.builtin.yamllint" => Some(builtins::yamllint()),
        "hephaestus_plugins.builtin.mypy" => Some(builtins::mypy()),
        "hephaestus_plugins.builtin.pytest" => Some(builtins::pytest()),
        "hephaestus_plugins.builtin.pip_audit" => Some(builtins::pip_audit()),
        _ => None,
    }
}

fn toml_to_json(value: &TomlValue) -> JsonValue {
    match value {
        TomlValue::String(s) => JsonValue::String(s.clone()),
        TomlValue::Integer(i) => JsonValue::from(*i),
        TomlValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        TomlValue::Boolean(b) => JsonValue::Bool(*b),
        TomlValue::Datetime(dt) => JsonValue::String(dt.to_string()),
        TomlValue::Array(items) => JsonValue::Array(items.iter().map(toml_to_json).collect()),
        TomlValue::Table(table) => JsonValue::Object(
            table
                .iter()
                .map(|(key, value)| (key.clone(), toml_to_json(value)))
                .collect(),
        ),
    }
}
