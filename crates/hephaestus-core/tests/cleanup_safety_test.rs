//! Integration test: cleanup engine safety rails.
//!
//! ## Scenarios
//! 1. Dry run previews `__pycache__` but never looks inside `.venv`.
//! 2. A dangerous root (`/`, `$HOME`) fails closed before any I/O.
//! 3. Extra paths outside the root abort without explicit confirmation.
//! 4. With confirmation, outside-root extras are removed.
//! 5. Running the same sweep twice removes nothing the second time.
//! 6. Sweeping the virtualenv itself preserves site-packages.
//! 7. The audit manifest round-trips through serde.

use hephaestus_core::{
    AssumeYes, CancelToken, CleanupAction, CleanupEngine, CleanupError, CleanupOptions,
    CleanupReport, DenyConfirmation, RunContext, TelemetrySink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn engine() -> CleanupEngine {
    CleanupEngine::new(Arc::new(TelemetrySink::disabled()))
}

fn run(
    options: &CleanupOptions,
    confirmation: &dyn hephaestus_core::ConfirmationSource,
) -> Result<CleanupReport, CleanupError> {
    engine().run(
        &RunContext::new("cleanup"),
        options,
        confirmation,
        &CancelToken::new(),
        &|_fraction, _detail| {},
    )
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"x").unwrap();
}

/// project/ with a pycache and a populated virtualenv.
fn sample_workspace() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    touch(&project.join("__pycache__").join("a.pyc"));
    touch(
        &project
            .join(".venv")
            .join("lib")
            .join("python3.12")
            .join("site-packages")
            .join("pkg")
            .join("__init__.py"),
    );
    (dir, project)
}

// ===========================================================================
// Scenario 1: dry run
// ===========================================================================

#[test]
fn dry_run_previews_pycache_and_ignores_site_packages() {
    let (_dir, project) = sample_workspace();
    let mut options = CleanupOptions::new(&project);
    options.dry_run = true;

    let report = run(&options, &AssumeYes).unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.errors, 0);

    let previews: Vec<&CleanupAction> = report.entries.iter().map(|e| &e.action).collect();
    assert_eq!(previews, vec![&CleanupAction::Previewed]);
    assert!(report.entries[0]
        .path
        .file_name()
        .is_some_and(|name| name == "__pycache__"));
    assert!(!report
        .entries
        .iter()
        .any(|entry| entry.path.to_string_lossy().contains("site-packages")));

    // Nothing was touched.
    assert!(project.join("__pycache__").join("a.pyc").exists());
    assert!(project
        .join(".venv/lib/python3.12/site-packages/pkg/__init__.py")
        .exists());
}

// ===========================================================================
// Scenario 2: dangerous roots
// ===========================================================================

#[test]
fn root_slash_fails_closed() {
    let options = CleanupOptions::new("/");
    let err = run(&options, &AssumeYes).unwrap_err();
    assert!(matches!(err, CleanupError::DangerousPath(path) if path == Path::new("/")));
}

#[test]
fn home_directory_fails_closed() {
    let Ok(home) = std::env::var("HOME") else {
        return;
    };
    let options = CleanupOptions::new(&home);
    let err = run(&options, &AssumeYes).unwrap_err();
    assert!(matches!(err, CleanupError::DangerousPath(_)));
}

#[test]
fn dangerous_extra_path_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = CleanupOptions::new(dir.path());
    options.extra_paths = vec![PathBuf::from("/etc")];
    let err = run(&options, &AssumeYes).unwrap_err();
    assert!(matches!(err, CleanupError::DangerousPath(_)));
}

// ===========================================================================
// Scenarios 3 and 4: outside-root confirmation
// ===========================================================================

#[test]
fn outside_root_extra_aborts_without_confirmation() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let stray = elsewhere.path().join("stray.log");
    touch(&stray);

    let mut options = CleanupOptions::new(root.path());
    options.extra_paths = vec![stray.clone()];
    let err = run(&options, &DenyConfirmation).unwrap_err();
    assert!(matches!(err, CleanupError::Aborted));
    assert!(stray.exists());
}

#[test]
fn outside_root_extra_removed_with_confirmation() {
    let root = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let stray = elsewhere.path().join("stray.log");
    touch(&stray);

    let mut options = CleanupOptions::new(root.path());
    options.extra_paths = vec![stray.clone()];
    let report = run(&options, &AssumeYes).unwrap();
    assert_eq!(report.removed, 1);
    assert!(!stray.exists());
}

// ===========================================================================
// Scenario 5: idempotence
// ===========================================================================

#[test]
fn second_sweep_removes_nothing() {
    let (_dir, project) = sample_workspace();
    touch(&project.join("build").join("lib").join("m.so"));
    touch(&project.join(".DS_Store"));

    let options = CleanupOptions::deep_clean(&project);
    let first = run(&options, &AssumeYes).unwrap();
    assert!(first.removed > 0);
    assert_eq!(first.errors, 0);

    let second = run(&options, &AssumeYes).unwrap();
    assert_eq!(second.removed, 0);
    assert_eq!(second.errors, 0);
}

// ===========================================================================
// Scenario 6: virtualenv root
// ===========================================================================

#[test]
fn sweeping_the_venv_itself_preserves_site_packages() {
    let (_dir, project) = sample_workspace();
    let venv = project.join(".venv");
    touch(&venv.join("pyvenv.cfg"));
    let protected = venv.join("lib/python3.12/site-packages/pkg/__init__.py");

    let mut options = CleanupOptions::new(&venv);
    options.include_poetry_env = true;
    let report = run(&options, &AssumeYes).unwrap();

    assert!(protected.exists(), "site-packages must survive a venv sweep");
    assert!(!venv.join("pyvenv.cfg").exists());
    assert!(report
        .entries
        .iter()
        .any(|entry| entry.action == CleanupAction::Skipped));
}

// ===========================================================================
// Scenario 7: manifest round-trip
// ===========================================================================

#[test]
fn audit_manifest_round_trips() {
    let (_dir, project) = sample_workspace();
    let manifest = project.join("cleanup-report.json");
    let mut options = CleanupOptions::new(&project);
    options.dry_run = true;
    options.audit_manifest_path = Some(manifest.clone());

    let report = run(&options, &AssumeYes).unwrap();
    let raw = std::fs::read_to_string(&manifest).unwrap();
    let parsed: CleanupReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.removed, report.removed);
    assert_eq!(parsed.entries.len(), report.entries.len());
    assert_eq!(
        serde_json::to_string(&parsed).unwrap(),
        serde_json::to_string(&report).unwrap()
    );
}
