//! Integration test: REST surface auth, submission, and task lifecycle.
//!
//! ## Scenarios
//! 1. Liveness and readiness endpoints answer without auth.
//! 2. Missing bearer token: 401 with `{detail, code}` envelope.
//! 3. Wrong role: 403, no task created, audit record with outcome=deny.
//! 4. Sync cleanup dry-run with a valid token: 200 and a report body.
//! 5. Async guard-rails submission: 202 with a task id that reaches a
//!    terminal snapshot via GET /api/v1/tasks/{id}.
//! 6. Unknown task id: 404.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hephaestus_core::release::host::{HostError, ReleaseHost, ReleaseMetadata};
use hephaestus_core::release::sigstore::{SigstoreError, SigstoreVerdict, SigstoreVerifier};
use hephaestus_core::release::ReleasePipeline;
use hephaestus_core::{
    issue_token, AuditLog, CoreConfig, EmptyGateProvider, Keystore, Role, ServiceAccountKey,
    ServiceState, TaskManager, TaskManagerConfig, TelemetrySink, Verifier,
};
use hephaestus_gateway::build_router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

struct UnreachableHost;

#[async_trait]
impl ReleaseHost for UnreachableHost {
    async fn fetch_release(
        &self,
        _repository: &str,
        _tag: &str,
        _token: Option<&str>,
        _timeout: Duration,
    ) -> Result<ReleaseMetadata, HostError> {
        Err(HostError::Transient("offline test host".to_string()))
    }

    async fn fetch_text(
        &self,
        _url: &str,
        _token: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, HostError> {
        Err(HostError::Transient("offline test host".to_string()))
    }

    async fn download(
        &self,
        _url: &str,
        _token: Option<&str>,
        _timeout: Duration,
        _dest: &Path,
    ) -> Result<u64, HostError> {
        Err(HostError::Transient("offline test host".to_string()))
    }
}

struct RejectAllVerifier;

#[async_trait]
impl SigstoreVerifier for RejectAllVerifier {
    async fn verify(
        &self,
        _artifact: &Path,
        _bundle: &Path,
    ) -> Result<SigstoreVerdict, SigstoreError> {
        Err(SigstoreError::VerifyFailed("offline test verifier".to_string()))
    }
}

struct Fixture {
    router: axum::Router,
    quality_token: String,
    cleanup_token: String,
    audit_dir: std::path::PathBuf,
    services: Arc<ServiceState>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let audit_dir = dir.path().join("audit");

    let quality_key = ServiceAccountKey {
        kid: "quality-1".to_string(),
        principal: "svc-quality".to_string(),
        roles: vec![Role::GuardRails],
        secret: "quality-secret".to_string(),
        expires_at: None,
    };
    let cleanup_key = ServiceAccountKey {
        kid: "cleanup-1".to_string(),
        principal: "svc-cleanup".to_string(),
        roles: vec![Role::Cleanup],
        secret: "cleanup-secret".to_string(),
        expires_at: None,
    };
    let keystore_path = dir.path().join("service-accounts.json");
    std::fs::write(
        &keystore_path,
        serde_json::to_string(&vec![quality_key.clone(), cleanup_key.clone()]).unwrap(),
    )
    .unwrap();

    let telemetry = Arc::new(TelemetrySink::disabled());
    let keystore = Arc::new(Keystore::load(&keystore_path).unwrap());
    let tasks = TaskManager::new(
        TaskManagerConfig {
            grace: Duration::from_millis(200),
            reap_interval: Duration::from_secs(3600),
            ..TaskManagerConfig::default()
        },
        Arc::clone(&telemetry),
    );
    let release = Arc::new(ReleasePipeline::new(
        Arc::new(UnreachableHost),
        Arc::new(RejectAllVerifier),
        Arc::clone(&telemetry),
    ));

    let services = Arc::new(ServiceState {
        config: CoreConfig::default(),
        telemetry,
        audit: Arc::new(AuditLog::new(&audit_dir)),
        keystore: Arc::clone(&keystore),
        verifier: Arc::new(Verifier::new(keystore)),
        tasks,
        release,
        gate_provider: Arc::new(EmptyGateProvider),
    });

    Fixture {
        router: build_router(Arc::clone(&services)),
        quality_token: issue_token(&quality_key, &[Role::GuardRails], Duration::from_secs(300))
            .unwrap(),
        cleanup_token: issue_token(&cleanup_key, &[Role::Cleanup], Duration::from_secs(300))
            .unwrap(),
        audit_dir,
        services,
        _dir: dir,
    }
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(path: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

// ===========================================================================
// Scenario 1: liveness endpoints
// ===========================================================================

#[tokio::test]
async fn liveness_and_health_need_no_auth() {
    let fixture = fixture();
    let (status, body) = send(&fixture.router, get("/", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "hephaestus");

    let (status, body) = send(&fixture.router, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service_accounts"], 2);
}

// ===========================================================================
// Scenario 2: missing token
// ===========================================================================

#[tokio::test]
async fn missing_token_is_401_with_error_envelope() {
    let fixture = fixture();
    let (status, body) = send(
        &fixture.router,
        post_json("/api/v1/quality/guard-rails", None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
    assert!(body["detail"].is_string());
}

// ===========================================================================
// Scenario 3: wrong role
// ===========================================================================

#[tokio::test]
async fn wrong_role_is_403_and_audited_as_deny() {
    let fixture = fixture();
    let (status, body) = send(
        &fixture.router,
        post_json(
            "/api/v1/quality/guard-rails",
            Some(&fixture.cleanup_token),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let audit_file = std::fs::read_dir(&fixture.audit_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let contents = std::fs::read_to_string(audit_file).unwrap();
    assert!(contents.contains("\"outcome\":\"deny\""));
    assert!(contents.contains("\"operation\":\"guard-rails\""));
}

// ===========================================================================
// Scenario 4: sync cleanup dry-run
// ===========================================================================

#[tokio::test]
async fn sync_cleanup_dry_run_returns_report() {
    let fixture = fixture();
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("__pycache__")).unwrap();

    let (status, body) = send(
        &fixture.router,
        post_json(
            "/api/v1/cleanup",
            Some(&fixture.cleanup_token),
            json!({
                "root": workspace.path(),
                "dry_run": true,
                "sync": true,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);
    assert_eq!(body["entries"][0]["action"], "previewed");
    assert!(workspace.path().join("__pycache__").exists());
}

// ===========================================================================
// Scenario 5: async guard-rails submission
// ===========================================================================

#[tokio::test]
async fn async_guard_rails_reaches_terminal_snapshot() {
    let fixture = fixture();
    let workspace = tempfile::tempdir().unwrap();
    let (status, body) = send(
        &fixture.router,
        post_json(
            "/api/v1/quality/guard-rails",
            Some(&fixture.quality_token),
            json!({"workspace": workspace.path(), "use_plugins": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let mut terminal = None;
    for _ in 0..100 {
        let (status, snapshot) = send(
            &fixture.router,
            get(
                &format!("/api/v1/tasks/{task_id}"),
                Some(&fixture.quality_token),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let state = snapshot["status"].as_str().unwrap().to_string();
        if state != "pending" && state != "running" {
            terminal = Some(snapshot);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = terminal.expect("task never reached a terminal state");
    assert_eq!(snapshot["status"], "completed");
    assert_eq!(snapshot["result"]["success"], true);

    // The manager still tracks it after completion.
    assert!(fixture.services.tasks.snapshot(&task_id).is_ok());
}

// ===========================================================================
// Scenario 6: unknown task
// ===========================================================================

#[tokio::test]
async fn unknown_task_is_404() {
    let fixture = fixture();
    let (status, body) = send(
        &fixture.router,
        get("/api/v1/tasks/no-such-task", Some(&fixture.quality_token)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
