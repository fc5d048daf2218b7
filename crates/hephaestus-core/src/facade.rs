//! Service facade: one shared in-process handler per operation.
//!
//! The CLI calls `execute_*` directly; the gateway routes the same calls
//! through the task manager. Both transports therefore share one
//! implementation per operation, and authorization, audit, and telemetry
//! behavior cannot diverge between them.

use crate::audit::{AuditError, AuditLog, AuditOutcome, AuditProtocol, AuditRecord};
use crate::auth::{Keystore, Verifier};
use crate::cleanup::{
    AssumeYes, CleanupEngine, CleanupError, CleanupOptions, CleanupReport, ConfirmationSource,
    DenyConfirmation,
};
use crate::config::CoreConfig;
use crate::context::RunContext;
use crate::guard_rails::{
    GateSpec, GuardRailsError, GuardRailsOptions, GuardRailsPipeline, GuardRailsResult,
};
use crate::release::{InstalledRelease, ReleaseError, ReleasePipeline, ReleaseRequest};
use crate::tasks::{CancelToken, Progress, TaskError, TaskKind, TaskManager};
use crate::telemetry::TelemetrySink;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacadeError {
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    GuardRails(#[from] GuardRailsError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// Audit writes must succeed before an operation is acknowledged; a
    /// failed write becomes an internal error.
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("gate discovery failed: {0}")]
    GateDiscovery(String),
}

impl FacadeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            FacadeError::Cleanup(CleanupError::Cancelled)
                | FacadeError::GuardRails(GuardRailsError::Cancelled { .. })
                | FacadeError::Release(ReleaseError::Cancelled)
        )
    }

    /// CLI exit code mapping: 2 invalid input, 3 safety refusal, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            FacadeError::Cleanup(CleanupError::DangerousPath(_))
            | FacadeError::Cleanup(CleanupError::InvalidRoot { .. })
            | FacadeError::Release(ReleaseError::Config(_))
            | FacadeError::GateDiscovery(_) => 2,
            FacadeError::Cleanup(CleanupError::Aborted) => 3,
            _ => 1,
        }
    }
}

/// Supplies the gate sequence for a guard-rails run: the discovered plugin
/// set when `use_plugins` is on, the legacy fixed sequence otherwise.
pub trait GateProvider: Send + Sync {
    fn gates(&self, options: &GuardRailsOptions) -> Result<Vec<GateSpec>, String>;
}

/// Everything the transports share. Constructed once per process.
pub struct ServiceState {
    pub config: CoreConfig,
    pub telemetry: Arc<TelemetrySink>,
    pub audit: Arc<AuditLog>,
    pub keystore: Arc<Keystore>,
    pub verifier: Arc<Verifier>,
    pub tasks: Arc<TaskManager>,
    pub release: Arc<ReleasePipeline>,
    pub gate_provider: Arc<dyn GateProvider>,
}

impl ServiceState {
    // -----------------------------------------------------------------------
    // Shared operation handlers
    // -----------------------------------------------------------------------

    /// Run guard-rails to completion.
    pub async fn execute_guard_rails(
        &self,
        ctx: &RunContext,
        principal: &str,
        protocol: AuditProtocol,
        options: &GuardRailsOptions,
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<GuardRailsResult, FacadeError> {
        let gates = self
            .gate_provider
            .gates(options)
            .map_err(FacadeError::GateDiscovery)?;
        let pipeline = GuardRailsPipeline::new(Arc::clone(&self.telemetry));
        let outcome = pipeline.run(ctx, options, &gates, cancel, progress).await;

        let (audit_outcome, detail) = match &outcome {
            Ok(result) if result.success => (AuditOutcome::Success, None),
            Ok(result) => {
                let failed = result
                    .gates
                    .iter()
                    .find(|gate| !gate.success)
                    .map(|gate| gate.gate.clone())
                    .unwrap_or_default();
                (AuditOutcome::Failure, Some(format!("gate failed: {failed}")))
            }
            Err(e) => (AuditOutcome::Failure, Some(e.to_string())),
        };
        let mut record = AuditRecord::new(
            ctx,
            principal,
            "",
            protocol,
            "guard-rails",
            serde_json::to_value(options).unwrap_or(json!({})),
            audit_outcome,
        );
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        self.audit.append(record)?;
        Ok(outcome?)
    }

    /// Run a cleanup sweep to completion. Non-interactive transports pass
    /// [`AssumeYes`] or [`DenyConfirmation`] in place of a prompt.
    pub async fn execute_cleanup(
        &self,
        ctx: &RunContext,
        principal: &str,
        protocol: AuditProtocol,
        options: &CleanupOptions,
        confirmation: &dyn ConfirmationSource,
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<CleanupReport, FacadeError> {
        let engine = CleanupEngine::new(Arc::clone(&self.telemetry));
        let outcome = engine.run(ctx, options, confirmation, cancel, progress);

        let audit_outcome = match &outcome {
            Ok(_) => AuditOutcome::Success,
            Err(CleanupError::DangerousPath(_)) | Err(CleanupError::Aborted) => AuditOutcome::Deny,
            Err(_) => AuditOutcome::Failure,
        };
        let mut record = AuditRecord::new(
            ctx,
            principal,
            "",
            protocol,
            "cleanup",
            serde_json::to_value(options).unwrap_or(json!({})),
            audit_outcome,
        );
        if let Err(e) = &outcome {
            record = record.with_detail(e.to_string());
        }
        self.audit.append(record)?;
        Ok(outcome?)
    }

    /// Run the release pipeline to completion.
    pub async fn execute_release(
        &self,
        ctx: &RunContext,
        principal: &str,
        protocol: AuditProtocol,
        request: &ReleaseRequest,
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<InstalledRelease, FacadeError> {
        let outcome = self.release.install(ctx, request, cancel, progress).await;
        let audit_outcome = match &outcome {
            Ok(_) => AuditOutcome::Success,
            Err(_) => AuditOutcome::Failure,
        };
        let mut record = AuditRecord::new(
            ctx,
            principal,
            "",
            protocol,
            "release-install",
            serde_json::to_value(request).unwrap_or(json!({})),
            audit_outcome,
        );
        if let Err(e) = &outcome {
            record = record.with_detail(e.to_string());
        }
        self.audit.append(record)?;
        Ok(outcome?)
    }

    // -----------------------------------------------------------------------
    // Background submission (gateway path)
    // -----------------------------------------------------------------------

    pub fn submit_guard_rails(
        self: &Arc<Self>,
        principal: String,
        protocol: AuditProtocol,
        options: GuardRailsOptions,
    ) -> Result<String, TaskError> {
        let state = Arc::clone(self);
        self.tasks.submit(
            TaskKind::GuardRails,
            self.config.task_timeout,
            move |cancel, progress| async move {
                let ctx = RunContext::new("guard-rails");
                let result = state
                    .execute_guard_rails(
                        &ctx,
                        &principal,
                        protocol,
                        &options,
                        &cancel,
                        &|fraction, detail| progress(fraction, detail),
                    )
                    .await;
                match result {
                    Ok(result) => Ok(serde_json::to_value(result).unwrap_or(json!({}))),
                    Err(e) => Err(e.to_string()),
                }
            },
        )
    }

    pub fn submit_cleanup(
        self: &Arc<Self>,
        principal: String,
        protocol: AuditProtocol,
        options: CleanupOptions,
        confirmed: bool,
    ) -> Result<String, TaskError> {
        let state = Arc::clone(self);
        self.tasks.submit(
            TaskKind::Cleanup,
            self.config.task_timeout,
            move |cancel, progress| async move {
                let ctx = RunContext::new("cleanup");
                let confirmation: &dyn ConfirmationSource =
                    if confirmed { &AssumeYes } else { &DenyConfirmation };
                let result = state
                    .execute_cleanup(
                        &ctx,
                        &principal,
                        protocol,
                        &options,
                        confirmation,
                        &cancel,
                        &|fraction, detail| progress(fraction, detail),
                    )
                    .await;
                match result {
                    Ok(report) => Ok(serde_json::to_value(report).unwrap_or(json!({}))),
                    Err(e) => Err(e.to_string()),
                }
            },
        )
    }

    pub fn submit_release(
        self: &Arc<Self>,
        principal: String,
        protocol: AuditProtocol,
        request: ReleaseRequest,
    ) -> Result<String, TaskError> {
        let state = Arc::clone(self);
        self.tasks.submit(
            TaskKind::Release,
            self.config.task_timeout,
            move |cancel, progress| async move {
                let ctx = RunContext::new("release-install");
                let result = state
                    .execute_release(
                        &ctx,
                        &principal,
                        protocol,
                        &request,
                        &cancel,
                        &|fraction, detail| progress(fraction, detail),
                    )
                    .await;
                match result {
                    Ok(installed) => Ok(serde_json::to_value(installed).unwrap_or(json!({}))),
                    Err(e) => Err(e.to_string()),
                }
            },
        )
    }
}

/// A gate provider with no gates at all; stands in where guard-rails is not
/// served (release-only deployments, some tests).
pub struct EmptyGateProvider;

impl GateProvider for EmptyGateProvider {
    fn gates(&self, _options: &GuardRailsOptions) -> Result<Vec<GateSpec>, String> {
        Ok(Vec::new())
    }
}
