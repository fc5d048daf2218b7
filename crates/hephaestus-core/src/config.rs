//! Process configuration loaded from `HEPHAESTUS_*` environment variables.
//!
//! Everything here changes behavior without code edits: telemetry on/off,
//! keystore and audit locations, task-manager bounds, and network limits.

use std::path::PathBuf;
use std::time::Duration;

/// Process configuration loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | HEPHAESTUS_TELEMETRY_ENABLED | true | Emit telemetry events, counters, and histograms. |
/// | HEPHAESTUS_SERVICE_ACCOUNT_KEYS_PATH | .hephaestus/service-accounts.json | Service-account keystore file. |
/// | HEPHAESTUS_AUDIT_LOG_DIR | .hephaestus/audit | Append-only audit log directory. |
/// | HEPHAESTUS_GITHUB_TOKEN | (unset) | Bearer token for release-host requests. |
/// | HEPHAESTUS_MAX_TASKS | 100 | Maximum live background tasks before submissions are refused. |
/// | HEPHAESTUS_TASK_RETENTION_SECS | 3600 | How long terminal tasks stay visible before eviction. |
/// | HEPHAESTUS_TASK_TIMEOUT_SECS | 300 | Default per-task deadline. |
/// | HEPHAESTUS_NETWORK_TIMEOUT_SECS | 30 | Per-attempt network timeout for release downloads. |
/// | HEPHAESTUS_MAX_RETRIES | 3 | Download retry budget (attempts, including the first). |
/// | HEPHAESTUS_GATEWAY_ADDR | 127.0.0.1:8460 | Gateway bind address. |
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub telemetry_enabled: bool,
    pub service_account_keys_path: PathBuf,
    pub audit_log_dir: PathBuf,
    pub github_token: Option<String>,
    pub max_tasks: usize,
    pub task_retention: Duration,
    pub task_timeout: Duration,
    pub network_timeout: Duration,
    pub max_retries: u32,
    pub gateway_addr: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            telemetry_enabled: true,
            service_account_keys_path: PathBuf::from(".hephaestus/service-accounts.json"),
            audit_log_dir: PathBuf::from(".hephaestus/audit"),
            github_token: None,
            max_tasks: 100,
            task_retention: Duration::from_secs(3600),
            task_timeout: Duration::from_secs(300),
            network_timeout: Duration::from_secs(30),
            max_retries: 3,
            gateway_addr: "127.0.0.1:8460".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load from environment. Unset or invalid values fall back to defaults
    /// (see the struct-level table).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            telemetry_enabled: env_bool("HEPHAESTUS_TELEMETRY_ENABLED", true),
            service_account_keys_path: env_path(
                "HEPHAESTUS_SERVICE_ACCOUNT_KEYS_PATH",
                defaults.service_account_keys_path,
            ),
            audit_log_dir: env_path("HEPHAESTUS_AUDIT_LOG_DIR", defaults.audit_log_dir),
            github_token: std::env::var("HEPHAESTUS_GITHUB_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            max_tasks: env_parse("HEPHAESTUS_MAX_TASKS", defaults.max_tasks),
            task_retention: Duration::from_secs(env_parse(
                "HEPHAESTUS_TASK_RETENTION_SECS",
                defaults.task_retention.as_secs(),
            )),
            task_timeout: Duration::from_secs(env_parse(
                "HEPHAESTUS_TASK_TIMEOUT_SECS",
                defaults.task_timeout.as_secs(),
            )),
            network_timeout: Duration::from_secs(env_parse(
                "HEPHAESTUS_NETWORK_TIMEOUT_SECS",
                defaults.network_timeout.as_secs(),
            )),
            max_retries: env_parse("HEPHAESTUS_MAX_RETRIES", defaults.max_retries).max(1),
            gateway_addr: std::env::var("HEPHAESTUS_GATEWAY_ADDR")
                .unwrap_or(defaults.gateway_addr),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
