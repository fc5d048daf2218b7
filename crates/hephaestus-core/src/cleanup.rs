//! Workspace cleanup engine: a safe, auditable file-deletion sweep.
//!
//! Three phases: normalize & validate, preview, execute. Any resolved target
//! inside the dangerous-path set fails closed before a single file is touched,
//! and `.venv/**/site-packages/**` is preserved unconditionally to protect
//! developer environments. Extra paths outside the workspace root require
//! explicit confirmation before the sweep proceeds.

use crate::context::RunContext;
use crate::tasks::{CancelToken, Progress};
use crate::telemetry::TelemetrySink;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("refusing to operate on dangerous path: {0}")]
    DangerousPath(PathBuf),

    #[error("cleanup root {path} is not usable: {source}")]
    InvalidRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cleanup aborted: confirmation required for paths outside the workspace root")]
    Aborted,

    #[error("cleanup cancelled")]
    Cancelled,

    #[error("failed to write audit manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Normalized sweep options. `extra_paths` are resolved to absolute paths
/// during validation and rejected if they land in the dangerous set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOptions {
    pub root: PathBuf,
    #[serde(default)]
    pub include_git: bool,
    #[serde(default)]
    pub include_poetry_env: bool,
    #[serde(default = "default_true")]
    pub clean_python_cache: bool,
    #[serde(default = "default_true")]
    pub clean_build_artifacts: bool,
    #[serde(default)]
    pub clean_node_modules: bool,
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_manifest_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl CleanupOptions {
    /// Standard sweep: macOS cruft, Python caches, and build artifacts.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            include_git: false,
            include_poetry_env: false,
            clean_python_cache: true,
            clean_build_artifacts: true,
            clean_node_modules: false,
            extra_paths: Vec::new(),
            dry_run: false,
            audit_manifest_path: None,
        }
    }

    /// Everything the standard sweep covers plus node_modules and the
    /// virtualenv (guard-rails prelude defaults).
    pub fn deep_clean(root: impl Into<PathBuf>) -> Self {
        Self {
            clean_node_modules: true,
            include_poetry_env: true,
            ..Self::new(root)
        }
    }
}

/// What happened to one swept path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAction {
    Previewed,
    Removed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub path: PathBuf,
    pub action: CleanupAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Sweep result. Serialized as the audit manifest when requested; field
/// order is stable for diffing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    fn push(&mut self, path: PathBuf, action: CleanupAction, reason: Option<String>) {
        match action {
            CleanupAction::Removed => self.removed += 1,
            CleanupAction::Skipped => self.skipped += 1,
            CleanupAction::Error => self.errors += 1,
            CleanupAction::Previewed => {}
        }
        self.entries.push(CleanupEntry { path, action, reason });
    }

    /// A sweep with some errors but progress is partial success, distinct
    /// from fatal failure.
    pub fn is_partial(&self) -> bool {
        self.errors > 0 && self.removed > 0
    }
}

/// Answers the confirmation prompt when the sweep reaches outside the root.
pub trait ConfirmationSource: Send + Sync {
    fn confirm(&self, summary: &str) -> bool;
}

/// Pre-approved (`--yes`).
pub struct AssumeYes;

impl ConfirmationSource for AssumeYes {
    fn confirm(&self, _summary: &str) -> bool {
        true
    }
}

/// Never approves. Used by non-interactive callers that did not opt in.
pub struct DenyConfirmation;

impl ConfirmationSource for DenyConfirmation {
    fn confirm(&self, _summary: &str) -> bool {
        false
    }
}

/// The fixed dangerous-path set. Any file operation targeting a member fails
/// closed. `$HOME` is resolved at call time.
pub fn dangerous_paths() -> BTreeSet<PathBuf> {
    let mut set: BTreeSet<PathBuf> = [
        "/", "/home", "/usr", "/etc", "/var", "/bin", "/sbin", "/lib", "/opt", "/boot", "/root",
        "/sys", "/proc", "/dev",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            set.insert(PathBuf::from(home));
        }
    }
    set
}

fn is_dangerous(path: &Path, set: &BTreeSet<PathBuf>) -> bool {
    set.contains(path)
}

/// `.venv/**/site-packages/**` (and the site-packages directory itself) is
/// never removed, even when the sweep root is the virtualenv.
pub fn is_protected(path: &Path) -> bool {
    let mut seen_venv = false;
    for component in path.components() {
        if let Component::Normal(name) = component {
            if name == ".venv" {
                seen_venv = true;
            } else if seen_venv && name == "site-packages" {
                return true;
            }
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmationState {
    Planned,
    AwaitingConfirmation,
    Confirmed,
    Aborted,
}

struct Target {
    path: PathBuf,
    is_dir: bool,
    outside_root: bool,
}

/// The sweep engine. Stateless apart from its telemetry sink; one instance
/// serves every run.
pub struct CleanupEngine {
    telemetry: Arc<TelemetrySink>,
}

impl CleanupEngine {
    pub fn new(telemetry: Arc<TelemetrySink>) -> Self {
        Self { telemetry }
    }

    /// Run one sweep. Cancellation is observed between directory entries.
    pub fn run(
        &self,
        ctx: &RunContext,
        options: &CleanupOptions,
        confirmation: &dyn ConfirmationSource,
        cancel: &CancelToken,
        progress: Progress<'_>,
    ) -> Result<CleanupReport, CleanupError> {
        let danger = dangerous_paths();

        // Phase 1: normalize & validate. Nothing is touched until every
        // resolved path clears the dangerous set.
        let normalize_started = Instant::now();
        let root = options
            .root
            .canonicalize()
            .map_err(|source| CleanupError::InvalidRoot {
                path: options.root.clone(),
                source,
            })?;
        if is_dangerous(&root, &danger) {
            return Err(CleanupError::DangerousPath(root));
        }
        let mut extra_roots = Vec::new();
        for extra in &options.extra_paths {
            match extra.canonicalize() {
                Ok(resolved) => {
                    if is_dangerous(&resolved, &danger) {
                        return Err(CleanupError::DangerousPath(resolved));
                    }
                    extra_roots.push(resolved);
                }
                Err(_) => {
                    tracing::debug!(target: "hephaestus::cleanup", path = %extra.display(), "extra path does not exist, ignoring");
                }
            }
        }
        self.telemetry
            .observe_duration("hephaestus.cleanup.normalize.duration", normalize_started.elapsed());

        self.telemetry.emit_or_log(
            ctx,
            "cleanup.run.start",
            json!({
                "root": root.display().to_string(),
                "dry_run": options.dry_run,
                "extra_paths": extra_roots.len(),
            }),
        );
        progress(0.05, "normalized");

        // Phase 2: preview.
        let preview_started = Instant::now();
        let mut report = CleanupReport::default();
        let mut targets = Vec::new();
        self.preview_tree(ctx, &root, &root, options, cancel, &mut report, &mut targets)?;
        for extra_root in &extra_roots {
            let outside = !extra_root.starts_with(&root);
            self.preview_extra(ctx, extra_root, outside, cancel, &mut report, &mut targets)?;
        }
        self.telemetry
            .observe_duration("hephaestus.cleanup.preview.duration", preview_started.elapsed());
        progress(0.3, "previewed");

        // Confirmation state machine: any target outside the root needs an
        // explicit yes before execution.
        let mut state = ConfirmationState::Planned;
        if targets.iter().any(|t| t.outside_root) {
            state = ConfirmationState::AwaitingConfirmation;
            let outside: Vec<String> = targets
                .iter()
                .filter(|t| t.outside_root)
                .map(|t| t.path.display().to_string())
                .collect();
            tracing::debug!(
                target: "hephaestus::cleanup",
                state = ?state,
                targets = outside.len(),
                "confirmation required for outside-root targets"
            );
            let summary = format!(
                "{} path(s) outside {} would be removed: {}",
                outside.len(),
                root.display(),
                outside.join(", ")
            );
            state = if confirmation.confirm(&summary) {
                ConfirmationState::Confirmed
            } else {
                ConfirmationState::Aborted
            };
        }
        if state == ConfirmationState::Aborted {
            return Err(CleanupError::Aborted);
        }

        // Phase 3: execute (skipped entirely on dry runs).
        if !options.dry_run {
            let execute_started = Instant::now();
            let total = targets.len().max(1) as f64;
            for (index, target) in targets.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(CleanupError::Cancelled);
                }
                self.remove_target(ctx, target, &danger, &mut report);
                progress(0.3 + 0.7 * (index as f64 + 1.0) / total, "sweeping");
            }
            self.telemetry
                .observe_duration("hephaestus.cleanup.execute.duration", execute_started.elapsed());
        }

        self.telemetry.emit_or_log(
            ctx,
            "cleanup.run.complete",
            json!({
                "removed": report.removed,
                "skipped": report.skipped,
                "errors": report.errors,
            }),
        );
        progress(1.0, "complete");

        if let Some(manifest_path) = &options.audit_manifest_path {
            let rendered = serde_json::to_string_pretty(&report)
                .unwrap_or_else(|_| "{}".to_string());
            std::fs::write(manifest_path, rendered).map_err(|source| CleanupError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;
        }
        Ok(report)
    }

    fn preview_tree(
        &self,
        ctx: &RunContext,
        walk_root: &Path,
        sweep_root: &Path,
        options: &CleanupOptions,
        cancel: &CancelToken,
        report: &mut CleanupReport,
        targets: &mut Vec<Target>,
    ) -> Result<(), CleanupError> {
        let mut walker = WalkDir::new(walk_root).into_iter();
        while let Some(next) = walker.next() {
            if cancel.is_cancelled() {
                return Err(CleanupError::Cancelled);
            }
            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    report.push(path, CleanupAction::Error, Some(e.to_string()));
                    continue;
                }
            };
            let path = entry.path();
            if path == walk_root {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().is_dir();

            if is_protected(path) {
                if name == "site-packages" {
                    report.push(
                        path.to_path_buf(),
                        CleanupAction::Skipped,
                        Some("site-packages preserved".to_string()),
                    );
                    self.telemetry.emit_or_log(
                        ctx,
                        "cleanup.path.skipped",
                        json!({"path": path.display().to_string(), "reason": "site-packages preserved"}),
                    );
                    walker.skip_current_dir();
                }
                continue;
            }

            if is_dir && name == ".venv" {
                if !options.include_poetry_env {
                    walker.skip_current_dir();
                }
                // With include_poetry_env the walk descends and sweeps the
                // env piecemeal; site-packages subtrees stay protected.
                continue;
            }

            if matches_sweep_patterns(&name, is_dir, options) {
                if is_dir && subtree_contains_protected(path) {
                    // e.g. `.venv/lib/python3.12` as an extra path: descend
                    // instead of removing the whole directory.
                    continue;
                }
                let outside_root = !path.starts_with(sweep_root);
                self.record_preview(ctx, path, report);
                targets.push(Target {
                    path: path.to_path_buf(),
                    is_dir,
                    outside_root,
                });
                if is_dir {
                    walker.skip_current_dir();
                }
            }
        }
        Ok(())
    }

    /// Extra paths are explicit: the path itself is the target, not a tree
    /// to pattern-match.
    fn preview_extra(
        &self,
        ctx: &RunContext,
        path: &Path,
        outside_root: bool,
        cancel: &CancelToken,
        report: &mut CleanupReport,
        targets: &mut Vec<Target>,
    ) -> Result<(), CleanupError> {
        if cancel.is_cancelled() {
            return Err(CleanupError::Cancelled);
        }
        if is_protected(path) {
            report.push(
                path.to_path_buf(),
                CleanupAction::Skipped,
                Some("site-packages preserved".to_string()),
            );
            return Ok(());
        }
        let is_dir = path.is_dir();
        if is_dir && subtree_contains_protected(path) {
            report.push(
                path.to_path_buf(),
                CleanupAction::Skipped,
                Some("contains protected site-packages".to_string()),
            );
            return Ok(());
        }
        self.record_preview(ctx, path, report);
        targets.push(Target {
            path: path.to_path_buf(),
            is_dir,
            outside_root,
        });
        Ok(())
    }

    fn record_preview(&self, ctx: &RunContext, path: &Path, report: &mut CleanupReport) {
        report.push(path.to_path_buf(), CleanupAction::Previewed, None);
        self.telemetry.emit_or_log(
            ctx,
            "cleanup.path.preview",
            json!({"path": path.display().to_string()}),
        );
    }

    fn remove_target(
        &self,
        ctx: &RunContext,
        target: &Target,
        danger: &BTreeSet<PathBuf>,
        report: &mut CleanupReport,
    ) {
        if is_dangerous(&target.path, danger) || is_protected(&target.path) {
            report.push(
                target.path.clone(),
                CleanupAction::Error,
                Some("refused: protected or dangerous target".to_string()),
            );
            self.telemetry.emit_or_log(
                ctx,
                "cleanup.path.error",
                json!({"path": target.path.display().to_string(), "reason": "refused"}),
            );
            return;
        }
        let result = if target.is_dir {
            std::fs::remove_dir_all(&target.path)
        } else {
            std::fs::remove_file(&target.path)
        };
        match result {
            Ok(()) => {
                report.push(target.path.clone(), CleanupAction::Removed, None);
                self.telemetry.emit_or_log(
                    ctx,
                    "cleanup.path.removed",
                    json!({"path": target.path.display().to_string()}),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.push(
                    target.path.clone(),
                    CleanupAction::Skipped,
                    Some("already removed".to_string()),
                );
                self.telemetry.emit_or_log(
                    ctx,
                    "cleanup.path.skipped",
                    json!({"path": target.path.display().to_string(), "reason": "already removed"}),
                );
            }
            Err(e) => {
                report.push(target.path.clone(), CleanupAction::Error, Some(e.to_string()));
                self.telemetry.emit_or_log(
                    ctx,
                    "cleanup.path.error",
                    json!({"path": target.path.display().to_string(), "reason": e.to_string()}),
                );
            }
        }
    }
}

fn matches_sweep_patterns(name: &str, is_dir: bool, options: &CleanupOptions) -> bool {
    // macOS cruft is always eligible.
    if name == ".DS_Store" || name == ".AppleDouble" || name == "__MACOSX" || name.starts_with("._")
    {
        return true;
    }
    if options.clean_python_cache {
        if is_dir
            && matches!(name, "__pycache__" | ".pytest_cache" | ".mypy_cache" | ".ruff_cache")
        {
            return true;
        }
        if !is_dir && (name == ".coverage" || name.starts_with(".coverage.")) {
            return true;
        }
    }
    if options.clean_build_artifacts
        && is_dir
        && (name == "build" || name == "dist" || name.ends_with(".egg-info"))
    {
        return true;
    }
    if options.clean_node_modules && is_dir && name == "node_modules" {
        return true;
    }
    if options.include_git && is_dir && name == ".git" {
        return true;
    }
    if options.include_poetry_env && !is_dir && name == "pyvenv.cfg" {
        return true;
    }
    false
}

fn subtree_contains_protected(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .any(|entry| is_protected(entry.path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_set_contains_system_roots_and_home() {
        let set = dangerous_paths();
        assert!(set.contains(Path::new("/")));
        assert!(set.contains(Path::new("/etc")));
        if let Ok(home) = std::env::var("HOME") {
            assert!(set.contains(Path::new(&home)));
        }
    }

    #[test]
    fn site_packages_under_venv_is_protected() {
        assert!(is_protected(Path::new(
            "/work/project/.venv/lib/python3.12/site-packages/pkg/__init__.py"
        )));
        assert!(is_protected(Path::new("/work/.venv/lib/site-packages")));
        assert!(!is_protected(Path::new("/work/project/site-packages")));
        assert!(!is_protected(Path::new("/work/project/.venv/bin/python")));
    }

    #[test]
    fn pattern_matching_respects_toggles() {
        let mut options = CleanupOptions::new("/tmp");
        assert!(matches_sweep_patterns("__pycache__", true, &options));
        assert!(matches_sweep_patterns(".DS_Store", false, &options));
        assert!(matches_sweep_patterns("dist", true, &options));
        assert!(!matches_sweep_patterns("node_modules", true, &options));

        options.clean_python_cache = false;
        assert!(!matches_sweep_patterns("__pycache__", true, &options));

        options.clean_node_modules = true;
        assert!(matches_sweep_patterns("node_modules", true, &options));

        // Plain files named like cache dirs are not matched.
        assert!(!matches_sweep_patterns("build", false, &options));
    }

    #[test]
    fn egg_info_suffix_matches() {
        let options = CleanupOptions::new("/tmp");
        assert!(matches_sweep_patterns("hephaestus.egg-info", true, &options));
    }
}
