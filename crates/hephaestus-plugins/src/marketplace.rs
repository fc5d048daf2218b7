//! Marketplace resolution: curated `{plugin}.toml` manifests with Sigstore
//! bundles, gated by a trust policy.
//!
//! A marketplace reference resolves offline and deterministically: parse the
//! manifest, check host compatibility, verify the entrypoint digest and its
//! Sigstore bundle against the trust policy, then resolve dependencies
//! recursively with cycle detection. Any verification failure is a hard stop;
//! the plugin is not registered.

use crate::builtins::CommandPlugin;
use hephaestus_core::release::checksum::sha256_file;
use hephaestus_core::release::sigstore::{identities_match, SigstoreVerifier};
use hephaestus_core::{Plugin, PluginCategory, PluginMetadata};
use semver::{Version, VersionReq};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("marketplace manifest missing for plugin '{0}'")]
    MissingManifest(String),

    #[error("sigstore bundle missing for plugin '{0}'")]
    MissingBundle(String),

    #[error("entrypoint missing for plugin '{plugin}': {path}")]
    MissingEntrypoint { plugin: String, path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("plugin '{plugin}' requires hephaestus {requires}, host is {host}")]
    Incompatible {
        plugin: String,
        requires: VersionReq,
        host: Version,
    },

    #[error("digest mismatch for plugin '{plugin}': manifest {declared}, computed {computed}")]
    DigestMismatch {
        plugin: String,
        declared: String,
        computed: String,
    },

    #[error("signature rejected for plugin '{plugin}': {reason}")]
    SignatureRejected { plugin: String, reason: String },

    #[error("trust policy violation for plugin '{plugin}': {reason}")]
    PolicyViolation { plugin: String, reason: String },

    #[error("plugin '{plugin}' dependency '{dependency}' {required} cannot be satisfied (found {found})")]
    UnsatisfiableDependency {
        plugin: String,
        dependency: String,
        required: VersionReq,
        found: String,
    },

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyReq {
    pub name: String,
    pub version: VersionReq,
}

/// `{plugin}.toml` in the curated registry directory.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default = "default_category")]
    pub category: PluginCategory,
    #[serde(default = "default_order")]
    pub order: i32,
    /// SHA-256 of the entrypoint, attested by the bundle.
    pub digest: String,
    /// Path to the gate executable, relative to the registry directory.
    pub entrypoint: String,
    /// Host version range this plugin supports.
    pub compatibility: VersionReq,
    #[serde(default)]
    pub dependencies: Vec<DependencyReq>,
}

fn default_category() -> PluginCategory {
    PluginCategory::Custom
}

fn default_order() -> i32 {
    100
}

/// `trust-policy.toml`: who may sign marketplace plugins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrustPolicy {
    #[serde(default)]
    pub allowed_identities: Vec<String>,
    #[serde(default)]
    pub allowed_issuers: Vec<String>,
    #[serde(default)]
    pub minimum_version: Option<Version>,
}

/// A manifest that cleared every check, with its executable plugin.
pub struct ResolvedPlugin {
    pub manifest: MarketplaceManifest,
    pub plugin: Arc<dyn Plugin>,
}

impl std::fmt::Debug for ResolvedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPlugin")
            .field("manifest", &self.manifest)
            .field("plugin", &self.plugin.metadata())
            .finish()
    }
}

pub struct Marketplace {
    registry_dir: PathBuf,
    verifier: Arc<dyn SigstoreVerifier>,
    host_version: Version,
}

impl Marketplace {
    pub fn new(registry_dir: impl Into<PathBuf>, verifier: Arc<dyn SigstoreVerifier>) -> Self {
        let host_version = Version::parse(env!("CARGO_PKG_VERSION"))
            .unwrap_or_else(|_| Version::new(0, 1, 0));
        Self {
            registry_dir: registry_dir.into(),
            verifier,
            host_version,
        }
    }

    pub fn with_host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    fn load_toml<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, MarketplaceError> {
        let raw = std::fs::read_to_string(path).map_err(|source| MarketplaceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| MarketplaceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load_manifest(&self, name: &str) -> Result<MarketplaceManifest, MarketplaceError> {
        let path = self.registry_dir.join(format!("{name}.toml"));
        if !path.exists() {
            return Err(MarketplaceError::MissingManifest(name.to_string()));
        }
        self.load_toml(&path)
    }

    fn load_policy(&self) -> Result<TrustPolicy, MarketplaceError> {
        let path = self.registry_dir.join("trust-policy.toml");
        if !path.exists() {
            // No policy means nothing can be trusted: fail closed.
            return Err(MarketplaceError::PolicyViolation {
                plugin: "*".to_string(),
                reason: "trust-policy.toml missing from registry".to_string(),
            });
        }
        self.load_toml(&path)
    }

    /// Resolve a plugin and its transitive dependencies, dependency-first.
    pub async fn resolve(&self, name: &str) -> Result<Vec<ResolvedPlugin>, MarketplaceError> {
        let policy = self.load_policy()?;
        let mut resolved = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        self.resolve_inner(name, None, &policy, &mut resolved, &mut done, &mut stack)
            .await?;
        Ok(resolved)
    }

    /// Iterative depth-first resolution (recursion with an async fn would
    /// need boxing; the explicit stack keeps cycle detection obvious too).
    async fn resolve_inner(
        &self,
        root: &str,
        root_req: Option<&VersionReq>,
        policy: &TrustPolicy,
        resolved: &mut Vec<ResolvedPlugin>,
        done: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Result<(), MarketplaceError> {
        // Work items: (name, version requirement from the dependent, expanded?).
        let mut work: Vec<(String, Option<VersionReq>, bool)> =
            vec![(root.to_string(), root_req.cloned(), false)];

        while let Some((name, requirement, expanded)) = work.pop() {
            if expanded {
                // Children are resolved; verify and emit this node.
                stack.retain(|entry| entry != &name);
                if done.contains(&name) {
                    continue;
                }
                let manifest = self.load_manifest(&name)?;
                let plugin = self.verify(&manifest, policy).await?;
                resolved.push(ResolvedPlugin { manifest, plugin });
                done.insert(name);
                continue;
            }

            if done.contains(&name) {
                continue;
            }
            if stack.contains(&name) {
                let mut chain = stack.clone();
                chain.push(name.clone());
                return Err(MarketplaceError::DependencyCycle(chain.join(" -> ")));
            }

            let manifest = self.load_manifest(&name)?;
            if let Some(required) = &requirement {
                if !required.matches(&manifest.version) {
                    return Err(MarketplaceError::UnsatisfiableDependency {
                        plugin: stack.last().cloned().unwrap_or_else(|| root.to_string()),
                        dependency: name.clone(),
                        required: required.clone(),
                        found: manifest.version.to_string(),
                    });
                }
            }

            stack.push(name.clone());
            work.push((name.clone(), requirement, true));
            for dependency in &manifest.dependencies {
                work.push((dependency.name.clone(), Some(dependency.version.clone()), false));
            }
        }
        Ok(())
    }

    async fn verify(
        &self,
        manifest: &MarketplaceManifest,
        policy: &TrustPolicy,
    ) -> Result<Arc<dyn Plugin>, MarketplaceError> {
        if !manifest.compatibility.matches(&self.host_version) {
            return Err(MarketplaceError::Incompatible {
                plugin: manifest.name.clone(),
                requires: manifest.compatibility.clone(),
                host: self.host_version.clone(),
            });
        }
        if let Some(minimum) = &policy.minimum_version {
            if manifest.version < *minimum {
                return Err(MarketplaceError::PolicyViolation {
                    plugin: manifest.name.clone(),
                    reason: format!(
                        "version {} is below the policy minimum {minimum}",
                        manifest.version
                    ),
                });
            }
        }

        let entrypoint = self.registry_dir.join(&manifest.entrypoint);
        if !entrypoint.exists() {
            return Err(MarketplaceError::MissingEntrypoint {
                plugin: manifest.name.clone(),
                path: entrypoint,
            });
        }
        let computed = sha256_file(&entrypoint).map_err(|e| MarketplaceError::SignatureRejected {
            plugin: manifest.name.clone(),
            reason: e.to_string(),
        })?;
        if computed != manifest.digest.to_ascii_lowercase() {
            return Err(MarketplaceError::DigestMismatch {
                plugin: manifest.name.clone(),
                declared: manifest.digest.clone(),
                computed,
            });
        }

        let bundle = self.registry_dir.join(format!("{}.sigstore", manifest.name));
        if !bundle.exists() {
            return Err(MarketplaceError::MissingBundle(manifest.name.clone()));
        }
        let verdict = self
            .verifier
            .verify(&entrypoint, &bundle)
            .await
            .map_err(|e| MarketplaceError::SignatureRejected {
                plugin: manifest.name.clone(),
                reason: e.to_string(),
            })?;

        if !identities_match(&policy.allowed_identities, &verdict.identities) {
            return Err(MarketplaceError::PolicyViolation {
                plugin: manifest.name.clone(),
                reason: format!(
                    "signer identities {:?} are not allowed by policy",
                    verdict.identities
                ),
            });
        }
        let issuer = vec![verdict.issuer.clone()];
        if !identities_match(&policy.allowed_issuers, &issuer) {
            return Err(MarketplaceError::PolicyViolation {
                plugin: manifest.name.clone(),
                reason: format!("issuer {} is not allowed by policy", verdict.issuer),
            });
        }

        let metadata = PluginMetadata {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            category: manifest.category,
            requires: Vec::new(),
            order: manifest.order,
        };
        Ok(Arc::new(CommandPlugin::new(
            metadata,
            entrypoint.display().to_string(),
            Vec::new(),
        )))
    }
}
