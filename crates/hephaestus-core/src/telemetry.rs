//! Telemetry sink: schema-validated events, counters, and duration histograms.
//!
//! Event names are dotted namespaces (`release.download.start`,
//! `cleanup.path.removed`). Every named event must match a schema registered at
//! init time; emission with missing required payload keys fails with
//! [`TelemetryError::SchemaViolation`]. Backend dispatch goes through `tracing`
//! plus in-process counters/histograms and never fails the caller. When the
//! sink is disabled every call is a cheap no-op.

use crate::context::RunContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("unknown telemetry event: {0}")]
    UnknownEvent(String),

    #[error("schema violation for {event}: missing required key '{key}'")]
    SchemaViolation { event: String, key: &'static str },

    #[error("schema violation for {event}: payload must be a JSON object")]
    PayloadNotObject { event: String },
}

/// Severity attached to an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Declares the payload contract for one named event.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub name: &'static str,
    pub severity: Severity,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

/// Aggregated duration observations for one histogram name.
#[derive(Debug, Clone, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum_seconds: f64,
    pub max_seconds: f64,
}

/// Process-wide telemetry sink.
///
/// Registration happens once at startup; emission is concurrent. Counter and
/// histogram state sits behind mutexes held only for the update itself.
pub struct TelemetrySink {
    enabled: bool,
    schemas: HashMap<&'static str, EventSchema>,
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, HistogramSummary>>,
}

impl TelemetrySink {
    /// Build a sink with the full core event catalog registered.
    pub fn new(enabled: bool) -> Self {
        let mut schemas = HashMap::new();
        for schema in core_event_schemas() {
            schemas.insert(schema.name, schema);
        }
        Self {
            enabled,
            schemas,
            counters: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// A sink that drops everything. Used by tests and disabled deployments.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate `payload` against the registered schema for `event` and
    /// dispatch it enriched with the run/operation IDs from `ctx`.
    ///
    /// Schema violations are returned to the caller; backend trouble is not.
    pub fn emit(&self, ctx: &RunContext, event: &str, payload: Value) -> Result<(), TelemetryError> {
        if !self.enabled {
            return Ok(());
        }
        let schema = self
            .schemas
            .get(event)
            .ok_or_else(|| TelemetryError::UnknownEvent(event.to_string()))?;
        let object = payload
            .as_object()
            .ok_or_else(|| TelemetryError::PayloadNotObject {
                event: event.to_string(),
            })?;
        for key in schema.required {
            if !object.contains_key(*key) {
                return Err(TelemetryError::SchemaViolation {
                    event: event.to_string(),
                    key,
                });
            }
        }

        self.increment(event);
        let payload_value = Value::Object(object.clone());
        match schema.severity {
            Severity::Debug => tracing::debug!(
                target: "hephaestus::telemetry",
                event,
                run_id = %ctx.run_id,
                operation = %ctx.operation,
                operation_id = %ctx.operation_id,
                payload = %payload_value,
            ),
            Severity::Info => tracing::info!(
                target: "hephaestus::telemetry",
                event,
                run_id = %ctx.run_id,
                operation = %ctx.operation,
                operation_id = %ctx.operation_id,
                payload = %payload_value,
            ),
            Severity::Warning => tracing::warn!(
                target: "hephaestus::telemetry",
                event,
                run_id = %ctx.run_id,
                operation = %ctx.operation,
                operation_id = %ctx.operation_id,
                payload = %payload_value,
            ),
            Severity::Error => tracing::error!(
                target: "hephaestus::telemetry",
                event,
                run_id = %ctx.run_id,
                operation = %ctx.operation,
                operation_id = %ctx.operation_id,
                payload = %payload_value,
            ),
        }
        Ok(())
    }

    /// Emit, downgrading a schema violation to a warning log. Operations use
    /// this so telemetry bugs never fail the work itself.
    pub fn emit_or_log(&self, ctx: &RunContext, event: &str, payload: Value) {
        if let Err(e) = self.emit(ctx, event, payload) {
            tracing::warn!(target: "hephaestus::telemetry", error = %e, "telemetry emission dropped");
        }
    }

    /// Increment a counter by one.
    pub fn increment(&self, name: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Record one duration observation into a named histogram.
    pub fn observe_duration(&self, name: &str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let secs = elapsed.as_secs_f64();
        if let Ok(mut histograms) = self.histograms.lock() {
            let entry = histograms.entry(name.to_string()).or_default();
            entry.count += 1;
            entry.sum_seconds += secs;
            if secs > entry.max_seconds {
                entry.max_seconds = secs;
            }
        }
    }

    /// Time a closure into a named histogram and return its output.
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.observe_duration(name, start.elapsed());
        out
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.lock().ok().and_then(|h| h.get(name).cloned())
    }
}

// ---------------------------------------------------------------------------
// Event catalog
// ---------------------------------------------------------------------------

const fn schema(
    name: &'static str,
    severity: Severity,
    required: &'static [&'static str],
    optional: &'static [&'static str],
) -> EventSchema {
    EventSchema {
        name,
        severity,
        required,
        optional,
    }
}

/// The full set of events the core emits. Registered once at sink creation.
fn core_event_schemas() -> Vec<EventSchema> {
    vec![
        // Cleanup engine
        schema("cleanup.run.start", Severity::Info, &["root", "dry_run"], &["extra_paths"]),
        schema("cleanup.path.preview", Severity::Debug, &["path"], &[]),
        schema("cleanup.path.removed", Severity::Info, &["path"], &[]),
        schema("cleanup.path.skipped", Severity::Debug, &["path", "reason"], &[]),
        schema("cleanup.path.error", Severity::Warning, &["path", "reason"], &[]),
        schema("cleanup.run.complete", Severity::Info, &["removed", "skipped", "errors"], &[]),
        // Release pipeline
        schema("release.network.retry", Severity::Warning, &["attempt", "max_retries", "backoff_s"], &["reason"]),
        schema("release.http.retry", Severity::Warning, &["attempt", "max_retries", "backoff_s"], &["status"]),
        schema("release.download.start", Severity::Info, &["asset"], &["size"]),
        schema("release.download.complete", Severity::Info, &["asset", "size"], &[]),
        schema("release.asset.sanitised", Severity::Warning, &["original", "sanitised"], &[]),
        schema("release.manifest.locate", Severity::Debug, &["pattern"], &["asset"]),
        schema("release.manifest.download", Severity::Info, &["asset"], &[]),
        schema("release.manifest.verified", Severity::Info, &["asset", "sha256"], &[]),
        schema("release.manifest.skipped", Severity::Warning, &["reason"], &[]),
        schema("release.sigstore.locate", Severity::Debug, &["pattern"], &["asset"]),
        schema("release.sigstore.download", Severity::Info, &["asset"], &[]),
        schema("release.sigstore.missing", Severity::Warning, &["pattern"], &[]),
        schema("release.sigstore.verified", Severity::Info, &["asset", "subject", "issuer"], &["identities"]),
        schema("release.install.start", Severity::Info, &["wheel_count"], &[]),
        schema("release.install.invoke", Severity::Info, &["command"], &[]),
        schema("release.install.complete", Severity::Info, &["wheel_count"], &[]),
        // Guard-rails orchestrator
        schema("cli.guard-rails.start", Severity::Info, &["use_plugins", "drift_check"], &[]),
        schema("cli.guard-rails.gate", Severity::Info, &["gate", "success", "duration_s"], &["exit_code"]),
        schema("cli.guard-rails.drift", Severity::Error, &["tools"], &[]),
        schema("cli.guard-rails.complete", Severity::Info, &["gates", "duration_s"], &[]),
        schema("cli.guard-rails.failed", Severity::Error, &["gate", "exit_code"], &["duration_s"]),
        // Plugin subsystem
        schema("plugins.discovery.complete", Severity::Info, &["count"], &["source"]),
        schema("plugins.marketplace.rejected", Severity::Error, &["plugin", "reason"], &[]),
        // Task manager
        schema("tasks.submitted", Severity::Info, &["task_id", "kind"], &[]),
        schema("tasks.terminal", Severity::Info, &["task_id", "status"], &["error"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new("test")
    }

    #[test]
    fn emit_accepts_schema_complete_payload() {
        let sink = TelemetrySink::new(true);
        sink.emit(&ctx(), "cleanup.path.removed", json!({"path": "/tmp/x"}))
            .unwrap();
        assert_eq!(sink.counter_value("cleanup.path.removed"), 1);
    }

    #[test]
    fn emit_rejects_missing_required_key() {
        let sink = TelemetrySink::new(true);
        let err = sink
            .emit(&ctx(), "cleanup.path.removed", json!({"reason": "oops"}))
            .unwrap_err();
        assert!(matches!(err, TelemetryError::SchemaViolation { key: "path", .. }));
    }

    #[test]
    fn emit_rejects_unregistered_event() {
        let sink = TelemetrySink::new(true);
        let err = sink.emit(&ctx(), "no.such.event", json!({})).unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownEvent(_)));
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        let sink = TelemetrySink::disabled();
        sink.emit(&ctx(), "no.such.event", json!({})).unwrap();
        sink.increment("anything");
        assert_eq!(sink.counter_value("anything"), 0);
    }

    #[test]
    fn histograms_aggregate_count_sum_max() {
        let sink = TelemetrySink::new(true);
        sink.observe_duration("hephaestus.cleanup.preview.duration", Duration::from_millis(20));
        sink.observe_duration("hephaestus.cleanup.preview.duration", Duration::from_millis(40));
        let summary = sink
            .histogram_summary("hephaestus.cleanup.preview.duration")
            .unwrap();
        assert_eq!(summary.count, 2);
        assert!(summary.sum_seconds >= 0.06 - 1e-9);
        assert!(summary.max_seconds >= 0.04 - 1e-9);
    }
}
