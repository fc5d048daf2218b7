//! Hephaestus core: guard-rails orchestration, workspace cleanup, release
//! acquisition with cryptographic verification, and the shared service layer
//! (auth, audit, telemetry, background tasks) behind the CLI and gateway.

mod audit;
mod auth;
mod cleanup;
mod config;
mod context;
mod drift;
mod facade;
mod guard_rails;
mod plugin;
mod retry;
mod tasks;
mod telemetry;

pub mod release;

pub use audit::{
    parse_timestamp, AuditError, AuditLog, AuditOutcome, AuditProtocol, AuditRecord,
    DEFAULT_REDACTED_KEYS,
};
pub use auth::{
    issue_token, AccessClaims, AuthError, Keystore, KeystoreError, Principal, Role,
    ServiceAccountKey, Verifier,
};
pub use cleanup::{
    dangerous_paths, is_protected, AssumeYes, CleanupAction, CleanupEngine, CleanupEntry,
    CleanupError, CleanupOptions, CleanupReport, ConfirmationSource, DenyConfirmation,
};
pub use config::CoreConfig;
pub use context::RunContext;
pub use drift::{detect_drift, DriftEntry, DriftError, DriftReport, DriftStatus};
pub use facade::{EmptyGateProvider, FacadeError, GateProvider, ServiceState};
pub use guard_rails::{
    GateReport, GateSpec, GuardRailsError, GuardRailsOptions, GuardRailsPipeline, GuardRailsResult,
};
pub use plugin::{
    execute_plugin, DependencySpec, Plugin, PluginCategory, PluginError, PluginMetadata,
    PluginRegistry, PluginResult,
};
pub use release::{
    InstalledRelease, ReleaseError, ReleasePipeline, ReleaseRequest, VerifiedAsset,
};
pub use retry::{backoff_delay, BackoffConfig};
pub use tasks::{
    noop_progress, CancelToken, Progress, ProgressFn, TaskError, TaskKind, TaskManager,
    TaskManagerConfig, TaskSnapshot, TaskStatus,
};
pub use telemetry::{EventSchema, HistogramSummary, Severity, TelemetryError, TelemetrySink};
