//! Guard-rails orchestrator: the ordered quality-gate pipeline.
//!
//! Sequence: workspace cleanup prelude (fatal on failure), optional drift
//! check, then the quality gates: either the discovered plugin set or the
//! legacy fixed sequence, supplied by the caller as [`GateSpec`]s. Gates run
//! fail-fast; per-step durations are recorded even when a step fails.

use crate::cleanup::{AssumeYes, CleanupEngine, CleanupError, CleanupOptions};
use crate::context::RunContext;
use crate::drift::{self, DriftError};
use crate::plugin::{execute_plugin, Plugin, PluginCategory};
use crate::tasks::{CancelToken, Progress};
use crate::telemetry::TelemetrySink;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardRailsError {
    #[error("cleanup prelude failed: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("drift detection failed: {0}")]
    Drift(#[from] DriftError),

    #[error("guard-rails cancelled")]
    Cancelled {
        /// Gates completed (or marked cancelled) before the signal landed.
        result: GuardRailsResult,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardRailsOptions {
    pub workspace: PathBuf,
    pub skip_format: bool,
    pub drift_check: bool,
    pub use_plugins: bool,
    /// Suppress the deep-clean prelude (used by nested invocations).
    #[serde(default)]
    pub skip_cleanup: bool,
}

impl GuardRailsOptions {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            skip_format: false,
            drift_check: false,
            use_plugins: false,
            skip_cleanup: false,
        }
    }
}

/// One executed quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub gate: String,
    pub success: bool,
    pub exit_code: i32,
    pub summary: String,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardRailsResult {
    pub gates: Vec<GateReport>,
    pub success: bool,
    pub duration_s: f64,
}

/// A gate ready to run: the plugin plus its resolved configuration.
#[derive(Clone)]
pub struct GateSpec {
    pub plugin: Arc<dyn Plugin>,
    pub config: Value,
}

impl GateSpec {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            config: json!({}),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

pub struct GuardRailsPipeline {
    telemetry: Arc<TelemetrySink>,
}

impl GuardRailsPipeline {
    pub fn new(telemetry: Arc<TelemetrySink>) -> Self {
        Self { telemetry }
    }

    /// Run the pipeline over `gates` (already ordered by the caller: plugin
    /// discovery order or the legacy sequence).
    pub async fn run(
        &self,
        ctx: &RunContext,
        options: &GuardRailsOptions,
        gates: &[GateSpec],
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<GuardRailsResult, GuardRailsError> {
        let started = Instant::now();
        self.telemetry.emit_or_log(
            ctx,
            "cli.guard-rails.start",
            json!({"use_plugins": options.use_plugins, "drift_check": options.drift_check}),
        );
        let mut result = GuardRailsResult::default();

        // Cleanup prelude. A failure here is fatal to the whole run.
        if !options.skip_cleanup {
            let cleanup_started = Instant::now();
            let engine = CleanupEngine::new(Arc::clone(&self.telemetry));
            let cleanup_ctx = ctx.child("cleanup");
            let report = engine.run(
                &cleanup_ctx,
                &CleanupOptions::deep_clean(&options.workspace),
                &AssumeYes,
                cancel,
                &|_fraction, _detail| {},
            )?;
            let duration = cleanup_started.elapsed();
            self.telemetry
                .observe_duration("hephaestus.guard-rails.cleanup.duration", duration);
            result.gates.push(GateReport {
                gate: "cleanup".to_string(),
                success: true,
                exit_code: 0,
                summary: format!(
                    "removed {} path(s), {} error(s)",
                    report.removed, report.errors
                ),
                duration_s: duration.as_secs_f64(),
            });
        }
        progress(0.1, "cleanup prelude done");

        // Drift gate.
        if options.drift_check {
            let drift_started = Instant::now();
            let report = drift::detect_drift(&options.workspace).await?;
            let duration = drift_started.elapsed();
            self.telemetry
                .observe_duration("hephaestus.guard-rails.drift.duration", duration);
            if report.has_drift() {
                let tools: Vec<String> =
                    report.drifted_tools().iter().map(|t| t.to_string()).collect();
                self.telemetry
                    .emit_or_log(ctx, "cli.guard-rails.drift", json!({"tools": tools}));
                result.gates.push(GateReport {
                    gate: "drift".to_string(),
                    success: false,
                    exit_code: 1,
                    summary: format!(
                        "tool versions drifted: {} (remediation: {})",
                        tools.join(", "),
                        report.remediation.join("; ")
                    ),
                    duration_s: duration.as_secs_f64(),
                });
                return Ok(self.finish(ctx, result, started, false));
            }
            result.gates.push(GateReport {
                gate: "drift".to_string(),
                success: true,
                exit_code: 0,
                summary: "declared and installed tool versions agree".to_string(),
                duration_s: duration.as_secs_f64(),
            });
        }
        progress(0.2, "drift check done");

        // Quality gates, fail-fast.
        let runnable: Vec<&GateSpec> = gates
            .iter()
            .filter(|spec| {
                !(options.skip_format
                    && spec.plugin.metadata().category == PluginCategory::Formatting)
            })
            .collect();
        let total = runnable.len().max(1) as f64;
        for (index, spec) in runnable.iter().enumerate() {
            let name = spec.plugin.metadata().name.clone();
            if cancel.is_cancelled() {
                result.gates.push(GateReport {
                    gate: name,
                    success: false,
                    exit_code: -1,
                    summary: "cancelled".to_string(),
                    duration_s: 0.0,
                });
                result.success = false;
                return Err(GuardRailsError::Cancelled { result });
            }

            let mut config = spec.config.clone();
            if let Some(object) = config.as_object_mut() {
                object
                    .entry("workspace")
                    .or_insert_with(|| json!(options.workspace.display().to_string()));
            }

            let gate_started = Instant::now();
            let outcome = execute_plugin(spec.plugin.as_ref(), &config).await;
            let duration = gate_started.elapsed();
            self.telemetry.observe_duration(
                &format!("hephaestus.guard-rails.{name}.duration"),
                duration,
            );

            // A cancel that landed mid-gate marks this gate, not the next.
            let (success, summary) = if cancel.is_cancelled() {
                (false, "cancelled".to_string())
            } else {
                (outcome.success, outcome.message.clone())
            };

            self.telemetry.emit_or_log(
                ctx,
                "cli.guard-rails.gate",
                json!({
                    "gate": name,
                    "success": success,
                    "duration_s": duration.as_secs_f64(),
                    "exit_code": outcome.exit_code,
                }),
            );
            result.gates.push(GateReport {
                gate: name.clone(),
                success,
                exit_code: outcome.exit_code,
                summary,
                duration_s: duration.as_secs_f64(),
            });

            if cancel.is_cancelled() {
                result.success = false;
                return Err(GuardRailsError::Cancelled { result });
            }
            if !success {
                self.telemetry.emit_or_log(
                    ctx,
                    "cli.guard-rails.failed",
                    json!({
                        "gate": name,
                        "exit_code": outcome.exit_code,
                        "duration_s": duration.as_secs_f64(),
                    }),
                );
                return Ok(self.finish(ctx, result, started, false));
            }
            progress(0.2 + 0.8 * (index as f64 + 1.0) / total, &name);
        }

        Ok(self.finish(ctx, result, started, true))
    }

    fn finish(
        &self,
        ctx: &RunContext,
        mut result: GuardRailsResult,
        started: Instant,
        success: bool,
    ) -> GuardRailsResult {
        result.success = success;
        result.duration_s = started.elapsed().as_secs_f64();
        if success {
            self.telemetry.emit_or_log(
                ctx,
                "cli.guard-rails.complete",
                json!({"gates": result.gates.len(), "duration_s": result.duration_s}),
            );
        }
        result
    }
}
