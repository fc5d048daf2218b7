//! Append-only JSON-lines audit log for security-relevant events.
//!
//! Files are named by UTC date inside the audit directory; rotation is a
//! simple date change. Each record is buffered into one complete line and
//! written with a single write followed by a durable flush, so a crash
//! mid-record never leaves a partially-readable line. Parameter objects pass
//! through a deny-list redaction pass before serialization.

use crate::context::RunContext;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("failed to open audit file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write audit record: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Transport the audited operation arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditProtocol {
    Cli,
    Rest,
    Grpc,
    Internal,
}

/// Outcome classification for one audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allow,
    Deny,
    Error,
    Success,
    Failure,
}

/// One line in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub run_id: String,
    pub principal: String,
    pub key_id: String,
    pub protocol: AuditProtocol,
    pub operation: String,
    pub parameters: Value,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    /// Build a record stamped with the current UTC time and the run ID from `ctx`.
    pub fn new(
        ctx: &RunContext,
        principal: impl Into<String>,
        key_id: impl Into<String>,
        protocol: AuditProtocol,
        operation: impl Into<String>,
        parameters: Value,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            run_id: ctx.run_id.clone(),
            principal: principal.into(),
            key_id: key_id.into(),
            protocol,
            operation: operation.into(),
            parameters,
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Default parameter keys whose values are replaced before writing.
pub const DEFAULT_REDACTED_KEYS: &[&str] = &["token", "secret", "password", "authorization", "api_key"];

const REDACTED: &str = "[REDACTED]";

struct OpenedFile {
    date: String,
    file: File,
}

/// Append-only writer. Concurrent writers serialize on the per-file mutex.
pub struct AuditLog {
    dir: PathBuf,
    deny_list: Vec<String>,
    current: Mutex<Option<OpenedFile>>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            deny_list: DEFAULT_REDACTED_KEYS.iter().map(|k| k.to_string()).collect(),
            current: Mutex::new(None),
        }
    }

    /// Extend the redaction deny-list beyond the defaults.
    pub fn with_redacted_keys(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        self.deny_list.extend(extra);
        self
    }

    /// Serialize one record, redact its parameters, write the line, and flush
    /// to durable storage before returning. Callers must not acknowledge the
    /// audited operation externally until this returns `Ok`.
    pub fn append(&self, mut record: AuditRecord) -> Result<(), AuditError> {
        record.parameters = redact(record.parameters, &self.deny_list);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let rotate = match guard.as_ref() {
            Some(open) => open.date != date,
            None => true,
        };
        if rotate {
            std::fs::create_dir_all(&self.dir).map_err(|source| AuditError::Open {
                path: self.dir.clone(),
                source,
            })?;
            let path = self.dir.join(format!("{date}.log"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| AuditError::Open { path, source })?;
            *guard = Some(OpenedFile { date, file });
        }
        let open = guard.as_mut().unwrap_or_else(|| unreachable!("file opened above"));
        open.file.write_all(line.as_bytes())?;
        open.file.sync_data()?;
        Ok(())
    }

    /// Path of the file records are currently routed to.
    pub fn current_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.dir.join(format!("{date}.log"))
    }
}

/// Replace every value whose key matches the deny-list, recursively.
/// Matching is case-insensitive on key substrings, so `Authorization` and
/// `github_token` are both caught by their base entries.
fn redact(value: Value, deny_list: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    let lowered = key.to_ascii_lowercase();
                    if deny_list.iter().any(|denied| lowered.contains(denied.as_str())) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(val, deny_list))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.into_iter().map(|item| redact(item, deny_list)).collect(),
        ),
        other => other,
    }
}

/// Parse timestamps back out for retention checks and tests.
pub fn parse_timestamp(record: &AuditRecord) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&record.timestamp)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(params: Value) -> AuditRecord {
        AuditRecord::new(
            &RunContext::new("cleanup"),
            "svc-ci",
            "kid-1",
            AuditProtocol::Rest,
            "cleanup",
            params,
            AuditOutcome::Success,
        )
    }

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(record(json!({"root": "/workspace"}))).unwrap();
        log.append(record(json!({"root": "/workspace"}))).unwrap();

        let contents = std::fs::read_to_string(log.current_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: AuditRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.operation, "cleanup");
            assert!(parse_timestamp(&parsed).is_some());
        }
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn redacts_deny_listed_keys_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(record(json!({
            "repository": "org/tool",
            "token": "ghp_secretvalue",
            "nested": {"Authorization": "Bearer abc", "kept": 1},
        })))
        .unwrap();

        let contents = std::fs::read_to_string(log.current_path()).unwrap();
        assert!(!contents.contains("ghp_secretvalue"));
        assert!(!contents.contains("Bearer abc"));
        assert!(contents.contains(REDACTED));
        assert!(contents.contains("\"kept\":1"));
    }

    #[test]
    fn deny_entries_match_key_substrings() {
        let redacted = redact(
            json!({"github_token": "x", "SECRET_SAUCE": "y", "plain": "z"}),
            &DEFAULT_REDACTED_KEYS.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        );
        assert_eq!(redacted["github_token"], REDACTED);
        assert_eq!(redacted["SECRET_SAUCE"], REDACTED);
        assert_eq!(redacted["plain"], "z");
    }
}
