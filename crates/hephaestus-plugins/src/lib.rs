//! Hephaestus plugin subsystem: built-in quality gates, configuration-driven
//! discovery, and the signed marketplace layer.

mod builtins;
mod command;
mod discovery;
mod marketplace;

pub use builtins::{
    builtin_plugins, legacy_gates, mypy, pip_audit, pytest, ruff_check, ruff_format, yamllint,
    CommandPlugin,
};
pub use command::{CommandResult, CommandRunner, ExecutionError};
pub use discovery::{DiscoveredPlugins, Discovery, DiscoveryError};
pub use marketplace::{
    DependencyReq, Marketplace, MarketplaceError, MarketplaceManifest, ResolvedPlugin, TrustPolicy,
};

use hephaestus_core::{GateProvider, GateSpec, GuardRailsOptions};

/// Gate provider backed by a completed discovery pass: the discovered plugin
/// set when `use_plugins` is on, the legacy fixed sequence otherwise.
pub struct DiscoveryGateProvider {
    plugin_specs: Vec<GateSpec>,
}

impl DiscoveryGateProvider {
    pub fn new(discovered: &DiscoveredPlugins) -> Self {
        Self {
            plugin_specs: discovered.gate_specs(),
        }
    }

    /// Run discovery and capture its gate specs.
    pub async fn from_discovery(discovery: &Discovery) -> Result<Self, DiscoveryError> {
        Ok(Self::new(&discovery.discover().await?))
    }
}

impl GateProvider for DiscoveryGateProvider {
    fn gates(&self, options: &GuardRailsOptions) -> Result<Vec<GateSpec>, String> {
        if options.use_plugins {
            Ok(self.plugin_specs.clone())
        } else {
            Ok(legacy_gates())
        }
    }
}
