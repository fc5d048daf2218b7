//! Integration test: release pipeline verification and retry behavior,
//! driven through an in-memory release host and a scripted Sigstore verifier.
//!
//! ## Scenarios
//! 1. Happy path: checksum and attestation verify, wheelhouse installs,
//!    `release.sigstore.verified` is emitted.
//! 2. Checksum mismatch: fatal before any install, archive deleted.
//! 3. Missing manifest: fatal unless `allow_unsigned`.
//! 4. Missing bundle with `require_sigstore`: fatal.
//! 5. Identity pin that does not intersect: fatal.
//! 6. Transient failures retry with backoff, then surface `NetworkFailed`
//!    with no partial file left behind; `max_retries = 1` means one attempt.
//! 7. Malformed token fails fast without touching the host.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use hephaestus_core::release::host::{HostError, ReleaseAsset, ReleaseHost, ReleaseMetadata};
use hephaestus_core::release::sigstore::{SigstoreError, SigstoreVerdict, SigstoreVerifier};
use hephaestus_core::release::{ReleaseError, ReleasePipeline, ReleaseRequest};
use hephaestus_core::{BackoffConfig, CancelToken, RunContext, TelemetrySink};
use sha2::Digest;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Fixture: an in-memory release host
// ---------------------------------------------------------------------------

struct FakeHost {
    metadata: ReleaseMetadata,
    files: HashMap<String, Vec<u8>>,
    fail_first_downloads: u32,
    download_attempts: AtomicU32,
    metadata_calls: AtomicU32,
}

impl FakeHost {
    fn attempts(&self) -> u32 {
        self.download_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseHost for FakeHost {
    async fn fetch_release(
        &self,
        _repository: &str,
        _tag: &str,
        _token: Option<&str>,
        _timeout: Duration,
    ) -> Result<ReleaseMetadata, HostError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReleaseMetadata {
            tag_name: self.metadata.tag_name.clone(),
            assets: self.metadata.assets.clone(),
        })
    }

    async fn fetch_text(
        &self,
        url: &str,
        _token: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, HostError> {
        self.files
            .get(url)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .ok_or_else(|| HostError::NotFound(url.to_string()))
    }

    async fn download(
        &self,
        url: &str,
        _token: Option<&str>,
        _timeout: Duration,
        dest: &Path,
    ) -> Result<u64, HostError> {
        let attempt = self.download_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first_downloads {
            // Leave a partial file behind to prove the pipeline cleans up.
            std::fs::write(dest, b"partial").ok();
            return Err(HostError::Transient(format!("connection reset (attempt {attempt})")));
        }
        let bytes = self
            .files
            .get(url)
            .ok_or_else(|| HostError::NotFound(url.to_string()))?;
        std::fs::write(dest, bytes).map_err(|e| HostError::Fatal(e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}

struct ScriptedVerifier {
    identities: Vec<String>,
    fail: bool,
}

#[async_trait]
impl SigstoreVerifier for ScriptedVerifier {
    async fn verify(
        &self,
        _artifact: &Path,
        _bundle: &Path,
    ) -> Result<SigstoreVerdict, SigstoreError> {
        if self.fail {
            return Err(SigstoreError::VerifyFailed("signature invalid".to_string()));
        }
        Ok(SigstoreVerdict {
            subject: "x-wheelhouse.tar.gz".to_string(),
            issuer: "https://token.actions.githubusercontent.com".to_string(),
            identities: self.identities.clone(),
        })
    }
}

fn wheelhouse_bytes() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let data = b"wheel-bytes";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "pkg-1.0-py3-none-any.whl", data.as_slice())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

struct Fixture {
    host: Arc<FakeHost>,
    telemetry: Arc<TelemetrySink>,
    pipeline: ReleasePipeline,
    request: ReleaseRequest,
    _destination: tempfile::TempDir,
}

fn fixture(tamper_manifest: bool, fail_first_downloads: u32) -> Fixture {
    let archive = wheelhouse_bytes();
    let mut digest = hex::encode(sha2::Sha256::digest(&archive));
    if tamper_manifest {
        digest = format!("{:0<64}", "deadbeef");
    }
    let manifest = format!("{digest}  x-wheelhouse.tar.gz\n");

    let assets = vec![
        ReleaseAsset {
            name: "x-wheelhouse.tar.gz".to_string(),
            size: archive.len() as u64,
            browser_download_url: "mem://archive".to_string(),
            content_type: "application/gzip".to_string(),
        },
        ReleaseAsset {
            name: "x-wheelhouse.tar.gz.sha256".to_string(),
            size: manifest.len() as u64,
            browser_download_url: "mem://manifest".to_string(),
            content_type: "text/plain".to_string(),
        },
        ReleaseAsset {
            name: "x-wheelhouse.tar.gz.sigstore".to_string(),
            size: 2,
            browser_download_url: "mem://bundle".to_string(),
            content_type: "application/json".to_string(),
        },
    ];
    let mut files = HashMap::new();
    files.insert("mem://archive".to_string(), archive);
    files.insert("mem://manifest".to_string(), manifest.into_bytes());
    files.insert("mem://bundle".to_string(), b"{}".to_vec());

    let host = Arc::new(FakeHost {
        metadata: ReleaseMetadata {
            tag_name: "v1.0.0".to_string(),
            assets,
        },
        files,
        fail_first_downloads,
        download_attempts: AtomicU32::new(0),
        metadata_calls: AtomicU32::new(0),
    });
    let telemetry = Arc::new(TelemetrySink::new(true));
    let verifier = Arc::new(ScriptedVerifier {
        identities: vec![
            "https://github.com/org/.github/workflows/release.yml@refs/heads/main".to_string(),
        ],
        fail: false,
    });
    let destination = tempfile::tempdir().unwrap();
    let mut request = ReleaseRequest::new("org/tool", destination.path());
    request.tag = "v1.0.0".to_string();
    request.require_sigstore = true;
    request.sigstore_identities = vec!["https://github.com/org/*".to_string()];

    let pipeline = ReleasePipeline::new(
        Arc::clone(&host) as Arc<dyn ReleaseHost>,
        verifier,
        Arc::clone(&telemetry),
    )
    .with_backoff(BackoffConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    })
    .with_pip_command(vec!["true".to_string()]);

    Fixture {
        host,
        telemetry,
        pipeline,
        request,
        _destination: destination,
    }
}

async fn install(fixture: &Fixture) -> Result<hephaestus_core::release::InstalledRelease, ReleaseError> {
    fixture
        .pipeline
        .install(
            &RunContext::new("release-install"),
            &fixture.request,
            &CancelToken::new(),
            &|_fraction, _detail| {},
        )
        .await
}

// ===========================================================================
// Scenario 1: happy path
// ===========================================================================

#[tokio::test]
async fn happy_path_verifies_and_installs() {
    let fixture = fixture(false, 0);
    let installed = install(&fixture).await.unwrap();

    assert_eq!(installed.tag, "v1.0.0");
    assert_eq!(installed.wheels_installed, 1);
    assert_eq!(installed.asset.name, "x-wheelhouse.tar.gz");
    let verdict = installed.asset.sigstore_verdict.as_ref().unwrap();
    assert!(verdict.identities[0].starts_with("https://github.com/org/"));
    assert!(installed.wheelhouse.join("pkg-1.0-py3-none-any.whl").exists());
    assert_eq!(fixture.telemetry.counter_value("release.sigstore.verified"), 1);
    assert_eq!(fixture.telemetry.counter_value("release.download.complete"), 1);
}

// ===========================================================================
// Scenario 2: checksum mismatch
// ===========================================================================

#[tokio::test]
async fn checksum_mismatch_is_fatal_and_deletes_the_archive() {
    let fixture = fixture(true, 0);
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::ChecksumMismatch { .. }));
    assert!(!fixture
        .request
        .destination
        .join("x-wheelhouse.tar.gz")
        .exists());
    assert!(!fixture.request.destination.join("wheelhouse").exists());
}

// ===========================================================================
// Scenario 3: manifest missing
// ===========================================================================

#[tokio::test]
async fn missing_manifest_is_fatal_unless_unsigned_allowed() {
    let mut fixture = fixture(false, 0);
    fixture.request.manifest_pattern = "*.no-such-manifest".to_string();
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::ManifestMissing(_)));

    fixture.request.allow_unsigned = true;
    let installed = install(&fixture).await.unwrap();
    assert_eq!(installed.wheels_installed, 1);
}

// ===========================================================================
// Scenario 4: sigstore missing
// ===========================================================================

#[tokio::test]
async fn missing_bundle_is_fatal_when_required() {
    let mut fixture = fixture(false, 0);
    fixture.request.sigstore_pattern = "*.no-such-bundle".to_string();
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::SigstoreMissing(_)));

    fixture.request.require_sigstore = false;
    fixture.request.sigstore_identities.clear();
    let installed = install(&fixture).await.unwrap();
    assert!(installed.asset.sigstore_verdict.is_none());
    assert_eq!(fixture.telemetry.counter_value("release.sigstore.missing"), 1);
}

// ===========================================================================
// Scenario 5: identity pin mismatch
// ===========================================================================

#[tokio::test]
async fn non_intersecting_identity_pin_is_fatal() {
    let mut fixture = fixture(false, 0);
    fixture.request.sigstore_identities = vec!["https://github.com/other-org/*".to_string()];
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::SigstoreVerifyFailed(_)));
    // Verification failures delete the downloaded bytes.
    assert!(!fixture
        .request
        .destination
        .join("x-wheelhouse.tar.gz")
        .exists());
}

// ===========================================================================
// Scenario 6: retries
// ===========================================================================

#[tokio::test]
async fn transient_failures_retry_then_surface_network_failed() {
    let mut fixture = fixture(false, 10);
    fixture.request.max_retries = 3;
    let err = install(&fixture).await.unwrap_err();
    match err {
        ReleaseError::NetworkFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.host.attempts(), 3);
    assert_eq!(fixture.telemetry.counter_value("release.network.retry"), 2);
    // No partial download survives the failure.
    assert!(!fixture
        .request
        .destination
        .join(".x-wheelhouse.tar.gz.partial")
        .exists());
}

#[tokio::test]
async fn max_retries_one_means_exactly_one_attempt() {
    let mut fixture = fixture(false, 10);
    fixture.request.max_retries = 1;
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NetworkFailed { attempts: 1, .. }));
    assert_eq!(fixture.host.attempts(), 1);
    assert_eq!(fixture.telemetry.counter_value("release.network.retry"), 0);
}

#[tokio::test]
async fn downloads_recover_within_the_retry_budget() {
    let mut fixture = fixture(false, 1);
    fixture.request.max_retries = 3;
    let installed = install(&fixture).await.unwrap();
    assert_eq!(installed.wheels_installed, 1);
    assert_eq!(fixture.host.attempts(), 2);
}

// ===========================================================================
// Scenario 7: token fast-fail
// ===========================================================================

#[tokio::test]
async fn malformed_token_fails_before_any_network_call() {
    let mut fixture = fixture(false, 0);
    fixture.request.token = Some("not-a-recognized-token".to_string());
    let err = install(&fixture).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Config(_)));
    assert_eq!(fixture.host.metadata_calls.load(Ordering::SeqCst), 0);
}
