//! Plugin contract and registry for the guard-rails pipeline.
//!
//! A plugin is a named unit with a metadata/validate/setup/run/teardown
//! lifecycle producing a [`PluginResult`]. The registry is an ordered
//! collection keyed by name; duplicates are rejected and iteration order is
//! `(order, name)`.

use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin already registered: {0}")]
    Duplicate(String),

    #[error("unknown plugin: {0}")]
    Unknown(String),

    #[error("invalid configuration for plugin {0}")]
    InvalidConfig(String),

    #[error("plugin {plugin} setup failed: {reason}")]
    Setup { plugin: String, reason: String },

    #[error("plugin {plugin} teardown failed: {reason}")]
    Teardown { plugin: String, reason: String },
}

/// Where a quality gate sits in the pipeline taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginCategory {
    Linting,
    Formatting,
    TypeChecking,
    Testing,
    Security,
    Workspace,
    Custom,
}

/// A dependency on another plugin, pinned by a semver range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub version: VersionReq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub author: String,
    pub category: PluginCategory,
    #[serde(default)]
    pub requires: Vec<DependencySpec>,
    /// Lower runs earlier; ties broken by name.
    pub order: i32,
}

/// Outcome of one plugin run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub exit_code: i32,
}

impl PluginResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
            exit_code: 0,
        }
    }

    pub fn failed(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: None,
            exit_code,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The plugin lifecycle contract. Implementations are trusted, resolved at
/// discovery time, and owned exclusively by the registry.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    /// Reject unusable configuration before any side effect.
    fn validate_config(&self, _config: &Value) -> bool {
        true
    }

    async fn setup(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    async fn run(
        &self,
        config: &Value,
    ) -> Result<PluginResult, Box<dyn std::error::Error + Send + Sync>>;

    async fn teardown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Run one plugin through its full lifecycle, folding every failure mode into
/// a `PluginResult` so the orchestrator has a single shape to pattern-match.
pub async fn execute_plugin(plugin: &dyn Plugin, config: &Value) -> PluginResult {
    let name = plugin.metadata().name.clone();
    if !plugin.validate_config(config) {
        return PluginResult::failed(format!("{name}: configuration rejected"), 2);
    }
    if let Err(e) = plugin.setup().await {
        return PluginResult::failed(format!("{name}: setup failed: {e}"), 1);
    }
    let result = match plugin.run(config).await {
        Ok(result) => result,
        Err(e) => PluginResult::failed(format!("{name}: {e}"), 1),
    };
    if let Err(e) = plugin.teardown().await {
        tracing::warn!(target: "hephaestus::plugins", plugin = %name, error = %e, "teardown failed");
    }
    result
}

/// Ordered plugin collection keyed by name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.metadata().name.clone();
        if self.plugins.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Members sorted by `(order, name)`.
    pub fn all_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        let mut plugins: Vec<Arc<dyn Plugin>> = self.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| {
            let am = a.metadata();
            let bm = b.metadata();
            am.order.cmp(&bm.order).then_with(|| am.name.cmp(&bm.name))
        });
        plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.all_plugins()
            .iter()
            .map(|p| p.metadata().name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubPlugin {
        metadata: PluginMetadata,
        succeed: bool,
    }

    impl StubPlugin {
        fn new(name: &str, order: i32, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                metadata: PluginMetadata {
                    name: name.to_string(),
                    version: Version::new(1, 0, 0),
                    description: String::new(),
                    author: "tests".to_string(),
                    category: PluginCategory::Custom,
                    requires: Vec::new(),
                    order,
                },
                succeed,
            })
        }
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn run(
            &self,
            _config: &Value,
        ) -> Result<PluginResult, Box<dyn std::error::Error + Send + Sync>> {
            if self.succeed {
                Ok(PluginResult::ok("fine"))
            } else {
                Err("tool exploded".into())
            }
        }
    }

    #[test]
    fn iteration_order_is_order_then_name() {
        let mut registry = PluginRegistry::new();
        registry.register(StubPlugin::new("zeta", 10, true)).unwrap();
        registry.register(StubPlugin::new("alpha", 10, true)).unwrap();
        registry.register(StubPlugin::new("omega", 5, true)).unwrap();
        assert_eq!(registry.plugin_names(), vec!["omega", "alpha", "zeta"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(StubPlugin::new("ruff-check", 10, true)).unwrap();
        let err = registry
            .register(StubPlugin::new("ruff-check", 20, true))
            .unwrap_err();
        assert!(matches!(err, PluginError::Duplicate(name) if name == "ruff-check"));
    }

    #[tokio::test]
    async fn run_errors_become_failed_results() {
        let plugin = StubPlugin::new("mypy", 30, false);
        let result = execute_plugin(plugin.as_ref(), &json!({})).await;
        assert!(!result.success);
        assert!(result.message.contains("tool exploded"));
    }
}
