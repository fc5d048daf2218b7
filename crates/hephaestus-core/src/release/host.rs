//! Release host access: metadata fetch and asset download over HTTPS.
//!
//! The trait keeps the pipeline testable offline; the HTTP implementation
//! talks to a GitHub-style release API. Errors are classified so the retry
//! loop can tell transient network trouble from hard failures.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum HostError {
    /// Worth retrying: connect failures, timeouts, 5xx, throttling.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 401: the supplied token was rejected.
    #[error("release host rejected the token")]
    TokenExpired,

    /// 404: release or asset does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-retryable failure.
    #[error("release host error: {0}")]
    Fatal(String),
}

/// The release metadata subset the pipeline consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseMetadata {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub browser_download_url: String,
    #[serde(default)]
    pub content_type: String,
}

/// Remote release hosting service, by interface.
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    async fn fetch_release(
        &self,
        repository: &str,
        tag: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ReleaseMetadata, HostError>;

    /// Small text assets: checksum manifests, Sigstore bundles.
    async fn fetch_text(
        &self,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<String, HostError>;

    /// Stream a large asset to `dest`; returns the byte count written.
    async fn download(
        &self,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
        dest: &Path,
    ) -> Result<u64, HostError>;
}

/// GitHub-style HTTPS implementation.
pub struct HttpReleaseHost {
    client: reqwest::Client,
    api_base: String,
}

impl HttpReleaseHost {
    pub fn new() -> Self {
        Self::with_api_base("https://api.github.com")
    }

    /// Point at a different API root (mirrors, test servers).
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("hephaestus-release")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    fn request(
        &self,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .timeout(timeout)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }

    fn classify_status(status: reqwest::StatusCode, url: &str) -> Option<HostError> {
        if status.is_success() {
            return None;
        }
        Some(match status.as_u16() {
            401 => HostError::TokenExpired,
            404 => HostError::NotFound(url.to_string()),
            408 | 429 => HostError::Transient(format!("HTTP {status} from {url}")),
            code if code >= 500 => HostError::Transient(format!("HTTP {status} from {url}")),
            _ => HostError::Fatal(format!("HTTP {status} from {url}")),
        })
    }

    fn classify_error(e: reqwest::Error) -> HostError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            HostError::Transient(e.to_string())
        } else {
            HostError::Fatal(e.to_string())
        }
    }
}

impl Default for HttpReleaseHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseHost for HttpReleaseHost {
    async fn fetch_release(
        &self,
        repository: &str,
        tag: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<ReleaseMetadata, HostError> {
        let url = if tag == "latest" {
            format!("{}/repos/{}/releases/latest", self.api_base, repository)
        } else {
            format!("{}/repos/{}/releases/tags/{}", self.api_base, repository, tag)
        };
        let response = self
            .request(&url, token, timeout)
            .send()
            .await
            .map_err(Self::classify_error)?;
        if let Some(err) = Self::classify_status(response.status(), &url) {
            return Err(err);
        }
        response
            .json::<ReleaseMetadata>()
            .await
            .map_err(|e| HostError::Fatal(format!("invalid release metadata: {e}")))
    }

    async fn fetch_text(
        &self,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<String, HostError> {
        let response = self
            .request(url, token, timeout)
            .header("Accept", "application/octet-stream")
            .send()
            .await
            .map_err(Self::classify_error)?;
        if let Some(err) = Self::classify_status(response.status(), url) {
            return Err(err);
        }
        response.text().await.map_err(Self::classify_error)
    }

    async fn download(
        &self,
        url: &str,
        token: Option<&str>,
        timeout: Duration,
        dest: &Path,
    ) -> Result<u64, HostError> {
        let mut response = self
            .request(url, token, timeout)
            .header("Accept", "application/octet-stream")
            .send()
            .await
            .map_err(Self::classify_error)?;
        if let Some(err) = Self::classify_status(response.status(), url) {
            return Err(err);
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| HostError::Fatal(format!("cannot create {}: {e}", dest.display())))?;
        let mut written = 0u64;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    written += chunk.len() as u64;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| HostError::Fatal(format!("write failed: {e}")))?;
                }
                Ok(None) => break,
                Err(e) => return Err(Self::classify_error(e)),
            }
        }
        file.flush()
            .await
            .map_err(|e| HostError::Fatal(format!("flush failed: {e}")))?;
        Ok(written)
    }
}

/// Recognized token prefixes. A token that matches none of them is malformed
/// and fails before any network call.
const TOKEN_PREFIXES: &[&str] = &["ghp_", "gho_", "ghu_", "ghs_", "ghr_", "github_pat_"];

pub fn validate_token_format(token: &str) -> bool {
    let token = token.trim();
    !token.is_empty()
        && TOKEN_PREFIXES.iter().any(|prefix| token.starts_with(prefix))
        && token.len() > TOKEN_PREFIXES[0].len()
}
