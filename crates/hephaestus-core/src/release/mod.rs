//! Release acquisition pipeline: fetch metadata, select and sanitize an
//! asset, download with bounded retries, verify SHA-256 and Sigstore
//! attestations, extract the wheelhouse, and install wheels.
//!
//! Every verification failure is fatal and deletes the downloaded bytes.
//! Cancellation is observed between stages.

pub mod archive;
pub mod checksum;
pub mod host;
pub mod sigstore;

use crate::context::RunContext;
use crate::retry::{backoff_delay, BackoffConfig};
use crate::tasks::{CancelToken, Progress};
use crate::telemetry::TelemetrySink;
use host::{HostError, ReleaseAsset, ReleaseHost, ReleaseMetadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sigstore::{SigstoreError, SigstoreVerdict, SigstoreVerifier};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("invalid release request: {0}")]
    Config(String),

    #[error("release host rejected the token (expired or revoked)")]
    TokenExpired,

    #[error("release not found: {repository}@{tag}")]
    ReleaseNotFound { repository: String, tag: String },

    #[error("no release asset matches pattern '{0}'")]
    AssetNotFound(String),

    #[error("no checksum manifest matches pattern '{0}'")]
    ManifestMissing(String),

    #[error("checksum manifest has no entry for asset '{0}'")]
    ManifestEntryMissing(String),

    #[error("checksum mismatch for {asset}: manifest {expected}, computed {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("no sigstore bundle matches pattern '{0}' and attestation is required")]
    SigstoreMissing(String),

    #[error("sigstore verification failed: {0}")]
    SigstoreVerifyFailed(String),

    #[error("network failed after {attempts} attempt(s): {last}")]
    NetworkFailed { attempts: u32, last: String },

    #[error("release host error: {0}")]
    Host(String),

    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),

    #[error("wheel installation failed with exit code {code}: {stderr}")]
    Install { code: i32, stderr: String },

    #[error("release install cancelled")]
    Cancelled,

    #[error("i/o error during release install: {0}")]
    Io(#[from] std::io::Error),
}

/// What to install and how strictly to verify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// `owner/name`.
    pub repository: String,
    /// A tag name, or `latest`.
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,
    #[serde(default = "default_manifest_pattern")]
    pub manifest_pattern: String,
    #[serde(default = "default_sigstore_pattern")]
    pub sigstore_pattern: String,
    #[serde(default)]
    pub require_sigstore: bool,
    /// Glob patterns the verified identities must intersect (empty = any).
    #[serde(default)]
    pub sigstore_identities: Vec<String>,
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_asset_pattern() -> String {
    "*wheelhouse*.tar.gz".to_string()
}

fn default_manifest_pattern() -> String {
    "*wheelhouse*.sha256".to_string()
}

fn default_sigstore_pattern() -> String {
    "*.sigstore".to_string()
}

fn default_timeout_s() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    3
}

impl ReleaseRequest {
    pub fn new(repository: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            tag: default_tag(),
            asset_pattern: default_asset_pattern(),
            manifest_pattern: default_manifest_pattern(),
            sigstore_pattern: default_sigstore_pattern(),
            require_sigstore: false,
            sigstore_identities: Vec::new(),
            allow_unsigned: false,
            timeout_s: default_timeout_s(),
            max_retries: default_max_retries(),
            destination: destination.into(),
            token: None,
        }
    }
}

/// A downloaded asset that has cleared every requested verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedAsset {
    pub name: String,
    pub bytes_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigstore_bundle: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigstore_verdict: Option<SigstoreVerdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRelease {
    pub tag: String,
    pub asset: VerifiedAsset,
    pub wheelhouse: PathBuf,
    pub wheels_installed: usize,
}

/// The pipeline. Host and Sigstore verifier are injected so every stage is
/// exercisable offline.
pub struct ReleasePipeline {
    host: Arc<dyn ReleaseHost>,
    verifier: Arc<dyn SigstoreVerifier>,
    telemetry: Arc<TelemetrySink>,
    backoff: BackoffConfig,
    pip_command: Vec<String>,
}

impl ReleasePipeline {
    pub fn new(
        host: Arc<dyn ReleaseHost>,
        verifier: Arc<dyn SigstoreVerifier>,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        let pip = if cfg!(windows) { "python" } else { "python3" };
        Self {
            host,
            verifier,
            telemetry,
            backoff: BackoffConfig::default(),
            pip_command: vec![pip.to_string(), "-m".to_string(), "pip".to_string()],
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the wheel-installation command (tests, hermetic installs).
    pub fn with_pip_command(mut self, command: Vec<String>) -> Self {
        self.pip_command = command;
        self
    }

    /// Run the full pipeline.
    pub async fn install(
        &self,
        ctx: &RunContext,
        request: &ReleaseRequest,
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<InstalledRelease, ReleaseError> {
        validate_request(request)?;
        let timeout = Duration::from_secs_f64(request.timeout_s);
        let token = request.token.as_deref();

        // Stage 1: metadata.
        checkpoint(cancel)?;
        let metadata = self
            .with_retries(ctx, request, || {
                self.host
                    .fetch_release(&request.repository, &request.tag, token, timeout)
            })
            .await
            .map_err(|e| match e {
                ReleaseError::Host(msg) if msg.starts_with("not found") => {
                    ReleaseError::ReleaseNotFound {
                        repository: request.repository.clone(),
                        tag: request.tag.clone(),
                    }
                }
                other => other,
            })?;
        progress(0.1, "release metadata fetched");

        // Stage 2: asset selection.
        let asset = select_asset(&metadata, &request.asset_pattern)
            .ok_or_else(|| ReleaseError::AssetNotFound(request.asset_pattern.clone()))?;
        let asset_name = self.sanitized_name(ctx, &asset.name);

        // Stage 3: checksum manifest.
        checkpoint(cancel)?;
        self.telemetry.emit_or_log(
            ctx,
            "release.manifest.locate",
            json!({"pattern": request.manifest_pattern}),
        );
        let manifest_asset = select_asset(&metadata, &request.manifest_pattern);
        let manifest_entries = match manifest_asset {
            Some(manifest_asset) => {
                self.telemetry.emit_or_log(
                    ctx,
                    "release.manifest.download",
                    json!({"asset": manifest_asset.name}),
                );
                let text = self
                    .with_retries(ctx, request, || {
                        self.host
                            .fetch_text(&manifest_asset.browser_download_url, token, timeout)
                    })
                    .await?;
                Some(checksum::parse_manifest(&text))
            }
            None if request.allow_unsigned => {
                self.telemetry.emit_or_log(
                    ctx,
                    "release.manifest.skipped",
                    json!({"reason": "no manifest asset, unsigned allowed"}),
                );
                None
            }
            None => return Err(ReleaseError::ManifestMissing(request.manifest_pattern.clone())),
        };
        progress(0.25, "checksum manifest ready");

        // Stage 4: asset download.
        checkpoint(cancel)?;
        std::fs::create_dir_all(&request.destination)?;
        let final_path = request.destination.join(&asset_name);
        let partial_path = request.destination.join(format!(".{asset_name}.partial"));
        self.telemetry.emit_or_log(
            ctx,
            "release.download.start",
            json!({"asset": asset_name, "size": asset.size}),
        );
        let size = {
            let result = self
                .with_retries(ctx, request, || {
                    self.host
                        .download(&asset.browser_download_url, token, timeout, &partial_path)
                })
                .await;
            match result {
                Ok(size) => size,
                Err(e) => {
                    let _ = std::fs::remove_file(&partial_path);
                    return Err(e);
                }
            }
        };
        std::fs::rename(&partial_path, &final_path)?;
        self.telemetry.emit_or_log(
            ctx,
            "release.download.complete",
            json!({"asset": asset_name, "size": size}),
        );
        progress(0.55, "asset downloaded");

        // Stage 5: checksum verify.
        checkpoint(cancel)?;
        let sha256 = checksum::sha256_file(&final_path)
            .map_err(|e| ReleaseError::Host(e.to_string()))?;
        if let Some(entries) = &manifest_entries {
            let entry = checksum::entry_for(entries, &asset_name).ok_or_else(|| {
                let _ = std::fs::remove_file(&final_path);
                ReleaseError::ManifestEntryMissing(asset_name.clone())
            })?;
            if entry.sha256 != sha256 {
                let _ = std::fs::remove_file(&final_path);
                return Err(ReleaseError::ChecksumMismatch {
                    asset: asset_name,
                    expected: entry.sha256.clone(),
                    actual: sha256,
                });
            }
            self.telemetry.emit_or_log(
                ctx,
                "release.manifest.verified",
                json!({"asset": asset_name, "sha256": sha256}),
            );
        }
        progress(0.65, "checksum verified");

        // Stage 6: sigstore verify.
        checkpoint(cancel)?;
        let (sigstore_bundle, sigstore_verdict) = self
            .verify_sigstore(ctx, request, &metadata, &final_path, &asset_name, token, timeout)
            .await
            .map_err(|e| {
                let _ = std::fs::remove_file(&final_path);
                e
            })?;
        progress(0.8, "attestation checked");

        // Stage 7: extract & install.
        checkpoint(cancel)?;
        let wheelhouse = archive::extract_wheelhouse(&final_path, &request.destination)?;
        let wheels = archive::collect_wheels(&wheelhouse);
        self.telemetry.emit_or_log(
            ctx,
            "release.install.start",
            json!({"wheel_count": wheels.len()}),
        );
        if !wheels.is_empty() {
            self.install_wheels(ctx, &wheels).await?;
        }
        self.telemetry.emit_or_log(
            ctx,
            "release.install.complete",
            json!({"wheel_count": wheels.len()}),
        );
        progress(1.0, "release installed");

        Ok(InstalledRelease {
            tag: metadata.tag_name.clone(),
            asset: VerifiedAsset {
                name: asset_name,
                bytes_path: final_path,
                size,
                sha256,
                sigstore_bundle,
                sigstore_verdict,
            },
            wheelhouse,
            wheels_installed: wheels.len(),
        })
    }

    fn sanitized_name(&self, ctx: &RunContext, original: &str) -> String {
        let sanitized = sanitize_asset_name(original);
        if sanitized != original {
            self.telemetry.emit_or_log(
                ctx,
                "release.asset.sanitised",
                json!({"original": original, "sanitised": sanitized}),
            );
        }
        sanitized
    }

    #[allow(clippy::too_many_arguments)]
    async fn verify_sigstore(
        &self,
        ctx: &RunContext,
        request: &ReleaseRequest,
        metadata: &ReleaseMetadata,
        artifact: &Path,
        asset_name: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<(Option<PathBuf>, Option<SigstoreVerdict>), ReleaseError> {
        self.telemetry.emit_or_log(
            ctx,
            "release.sigstore.locate",
            json!({"pattern": request.sigstore_pattern}),
        );
        let bundle_asset = match select_asset(metadata, &request.sigstore_pattern) {
            Some(asset) => asset,
            None => {
                if request.require_sigstore {
                    return Err(ReleaseError::SigstoreMissing(request.sigstore_pattern.clone()));
                }
                self.telemetry.emit_or_log(
                    ctx,
                    "release.sigstore.missing",
                    json!({"pattern": request.sigstore_pattern}),
                );
                return Ok((None, None));
            }
        };

        self.telemetry.emit_or_log(
            ctx,
            "release.sigstore.download",
            json!({"asset": bundle_asset.name}),
        );
        let bundle_text = self
            .with_retries(ctx, request, || {
                self.host
                    .fetch_text(&bundle_asset.browser_download_url, token, timeout)
            })
            .await?;
        let bundle_path = request
            .destination
            .join(sanitize_asset_name(&bundle_asset.name));
        std::fs::write(&bundle_path, &bundle_text)?;

        // A bundle that is present but fails verification is always fatal;
        // a bad signature never degrades to "missing".
        let verdict = self
            .verifier
            .verify(artifact, &bundle_path)
            .await
            .map_err(|e| match e {
                SigstoreError::VerifierMissing(msg) => ReleaseError::SigstoreVerifyFailed(msg),
                SigstoreError::VerifyFailed(msg) => ReleaseError::SigstoreVerifyFailed(msg),
                SigstoreError::BadOutput(msg) => ReleaseError::SigstoreVerifyFailed(msg),
            })?;

        if !sigstore::identities_match(&request.sigstore_identities, &verdict.identities) {
            return Err(ReleaseError::SigstoreVerifyFailed(format!(
                "verified identities {:?} do not intersect the pinned patterns {:?}",
                verdict.identities, request.sigstore_identities
            )));
        }
        self.telemetry.emit_or_log(
            ctx,
            "release.sigstore.verified",
            json!({
                "asset": asset_name,
                "subject": verdict.subject,
                "issuer": verdict.issuer,
                "identities": verdict.identities,
            }),
        );
        Ok((Some(bundle_path), Some(verdict)))
    }

    async fn install_wheels(&self, ctx: &RunContext, wheels: &[PathBuf]) -> Result<(), ReleaseError> {
        let mut command = tokio::process::Command::new(&self.pip_command[0]);
        command.args(&self.pip_command[1..]).arg("install").arg("--no-deps");
        for wheel in wheels {
            command.arg(wheel);
        }
        let rendered = format!(
            "{} install --no-deps <{} wheels>",
            self.pip_command.join(" "),
            wheels.len()
        );
        self.telemetry
            .emit_or_log(ctx, "release.install.invoke", json!({"command": rendered}));
        let output = command
            .output()
            .await
            .map_err(|e| ReleaseError::Host(format!("failed to spawn installer: {e}")))?;
        if !output.status.success() {
            return Err(ReleaseError::Install {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Retry a host call with exponential backoff. Transient errors consume
    /// attempts; hard failures surface immediately.
    async fn with_retries<T, F, Fut>(
        &self,
        ctx: &RunContext,
        request: &ReleaseRequest,
        op: F,
    ) -> Result<T, ReleaseError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, HostError>>,
    {
        let timeout = Duration::from_secs_f64(request.timeout_s);
        let mut last_error = String::new();
        for attempt in 1..=request.max_retries {
            let outcome = tokio::time::timeout(timeout, op())
                .await
                .unwrap_or_else(|_| Err(HostError::Transient("attempt timed out".to_string())));
            match outcome {
                Ok(value) => return Ok(value),
                Err(HostError::TokenExpired) => return Err(ReleaseError::TokenExpired),
                Err(HostError::NotFound(what)) => {
                    return Err(ReleaseError::Host(format!("not found: {what}")))
                }
                Err(HostError::Fatal(msg)) => return Err(ReleaseError::Host(msg)),
                Err(HostError::Transient(msg)) => {
                    last_error = msg;
                    if attempt < request.max_retries {
                        let delay = backoff_delay(&self.backoff, attempt);
                        let event = if last_error.starts_with("HTTP") {
                            "release.http.retry"
                        } else {
                            "release.network.retry"
                        };
                        self.telemetry.emit_or_log(
                            ctx,
                            event,
                            json!({
                                "attempt": attempt,
                                "max_retries": request.max_retries,
                                "backoff_s": delay.as_secs_f64(),
                                "reason": last_error,
                            }),
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(ReleaseError::NetworkFailed {
            attempts: request.max_retries,
            last: last_error,
        })
    }
}

fn validate_request(request: &ReleaseRequest) -> Result<(), ReleaseError> {
    if request.timeout_s <= 0.0 {
        return Err(ReleaseError::Config("timeout_s must be positive".to_string()));
    }
    if request.max_retries < 1 {
        return Err(ReleaseError::Config("max_retries must be at least 1".to_string()));
    }
    if request.repository.split('/').filter(|s| !s.is_empty()).count() != 2 {
        return Err(ReleaseError::Config(format!(
            "repository must be owner/name, got '{}'",
            request.repository
        )));
    }
    if let Some(token) = &request.token {
        if !host::validate_token_format(token) {
            return Err(ReleaseError::Config(
                "token does not match any recognized format".to_string(),
            ));
        }
    }
    Ok(())
}

fn checkpoint(cancel: &CancelToken) -> Result<(), ReleaseError> {
    if cancel.is_cancelled() {
        Err(ReleaseError::Cancelled)
    } else {
        Ok(())
    }
}

fn select_asset<'a>(metadata: &'a ReleaseMetadata, pattern: &str) -> Option<&'a ReleaseAsset> {
    let compiled = glob::Pattern::new(pattern).ok()?;
    metadata.assets.iter().find(|asset| compiled.matches(&asset.name))
}

/// Strip path separators and traversal components; the surviving final
/// segment is the asset's on-disk name.
fn sanitize_asset_name(name: &str) -> String {
    name.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .next_back()
        .unwrap_or("asset")
        .to_string()
}
