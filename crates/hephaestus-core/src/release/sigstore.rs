//! Sigstore attestation verification, delegated to an external verifier.
//!
//! The core never parses bundles itself: it invokes a verifier over
//! `(artifact, bundle)` and reads back `{subject, issuer, identities}`. The
//! verdict's identities are then matched against caller-supplied pin patterns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum SigstoreError {
    #[error("sigstore verifier not available: {0}")]
    VerifierMissing(String),

    #[error("sigstore verification failed: {0}")]
    VerifyFailed(String),

    #[error("sigstore verifier produced unreadable output: {0}")]
    BadOutput(String),
}

/// What a verified bundle attests to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigstoreVerdict {
    pub subject: String,
    pub issuer: String,
    #[serde(default)]
    pub identities: Vec<String>,
}

/// Opaque external verifier contract.
#[async_trait]
pub trait SigstoreVerifier: Send + Sync {
    async fn verify(&self, artifact: &Path, bundle: &Path) -> Result<SigstoreVerdict, SigstoreError>;
}

/// Shells out to the configured verifier program, which must exit zero and
/// print a JSON `{subject, issuer, identities}` object on success.
///
/// The program defaults to `hephaestus-sigstore-verify` and can be overridden
/// with `HEPHAESTUS_SIGSTORE_VERIFIER` (e.g. a cosign wrapper script).
pub struct ExternalSigstoreVerifier {
    program: PathBuf,
}

impl ExternalSigstoreVerifier {
    pub fn from_env() -> Self {
        let program = std::env::var("HEPHAESTUS_SIGSTORE_VERIFIER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hephaestus-sigstore-verify"));
        Self { program }
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl SigstoreVerifier for ExternalSigstoreVerifier {
    async fn verify(&self, artifact: &Path, bundle: &Path) -> Result<SigstoreVerdict, SigstoreError> {
        let output = Command::new(&self.program)
            .arg("--artifact")
            .arg(artifact)
            .arg("--bundle")
            .arg(bundle)
            .output()
            .await
            .map_err(|e| SigstoreError::VerifierMissing(format!("{}: {e}", self.program.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SigstoreError::VerifyFailed(stderr.trim().to_string()));
        }
        serde_json::from_slice::<SigstoreVerdict>(&output.stdout)
            .map_err(|e| SigstoreError::BadOutput(e.to_string()))
    }
}

/// True when any verified identity matches any pin pattern. Patterns are
/// globs, so `https://github.com/org/*` pins a whole organization.
pub fn identities_match(pins: &[String], identities: &[String]) -> bool {
    if pins.is_empty() {
        return true;
    }
    pins.iter()
        .filter_map(|pin| glob::Pattern::new(pin).ok())
        .any(|pattern| identities.iter().any(|identity| pattern.matches(identity)))
}
