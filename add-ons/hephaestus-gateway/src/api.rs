//! REST surface: bearer-authenticated submission endpoints, task snapshots,
//! and SSE progress streams.
//!
//! Handlers convert transport-specific requests into the shared facade calls;
//! no operation logic lives here. Every authorization decision is written to
//! the audit log before the response leaves the process.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hephaestus_core::{
    AssumeYes, AuditOutcome, AuditProtocol, AuditRecord, AuthError, CancelToken, CleanupError,
    CleanupOptions, ConfirmationSource, DenyConfirmation, FacadeError, GuardRailsOptions,
    Principal, ReleaseError, ReleaseRequest, Role, RunContext, TaskError, TaskKind,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use hephaestus_core::ServiceState;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceState>,
}

pub fn build_router(services: Arc<ServiceState>) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/v1/version", get(version))
        .route("/api/v1/quality/guard-rails", post(submit_guard_rails))
        .route("/api/v1/cleanup", post(submit_cleanup))
        .route("/api/v1/release/install", post(submit_release))
        .route("/api/v1/tasks/:id", get(task_snapshot))
        .route("/api/v1/tasks/:id/stream", get(task_stream))
        .layer(cors)
        .with_state(AppState { services })
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Every error response carries `{detail, code}`.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({"detail": self.detail, "code": self.code}));
        (self.status, body).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::TooManyTasks { .. } => {
                ApiError::new(StatusCode::CONFLICT, "over_capacity", e.to_string())
            }
            TaskError::UnknownTask(id) => ApiError::not_found(format!("unknown task: {id}")),
        }
    }
}

impl From<FacadeError> for ApiError {
    fn from(e: FacadeError) -> Self {
        match &e {
            FacadeError::Cleanup(CleanupError::DangerousPath(_))
            | FacadeError::Cleanup(CleanupError::InvalidRoot { .. })
            | FacadeError::GateDiscovery(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid", e.to_string())
            }
            FacadeError::Cleanup(CleanupError::Aborted) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "confirmation_required",
                e.to_string(),
            ),
            FacadeError::Release(ReleaseError::Config(_)) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid", e.to_string())
            }
            FacadeError::Audit(_) => ApiError::internal(e.to_string()),
            _ => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "operation_failed",
                e.to_string(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn kind_role(kind: TaskKind) -> Role {
    match kind {
        TaskKind::GuardRails => Role::GuardRails,
        TaskKind::Cleanup => Role::Cleanup,
        TaskKind::Release => Role::Release,
    }
}

/// Verify the bearer token against `role` and audit the decision. Both
/// outcomes are written before the response is produced.
fn authorize(
    state: &ServiceState,
    headers: &HeaderMap,
    role: Role,
    operation: &str,
) -> Result<Principal, ApiError> {
    let ctx = RunContext::new(operation);
    let token = match bearer_token(headers) {
        Some(token) => token,
        None => {
            audit_decision(state, &ctx, "anonymous", "", operation, AuditOutcome::Deny)?;
            return Err(ApiError::unauthorized("missing bearer token"));
        }
    };
    match state.verifier.verify(token, role) {
        Ok(principal) => {
            audit_decision(
                state,
                &ctx,
                &principal.name,
                &principal.key_id,
                operation,
                AuditOutcome::Allow,
            )?;
            Ok(principal)
        }
        Err(e) => {
            audit_decision(state, &ctx, "unknown", "", operation, AuditOutcome::Deny)?;
            match e {
                AuthError::RoleDenied { .. } => Err(ApiError::forbidden(e.to_string())),
                _ => Err(ApiError::unauthorized(e.to_string())),
            }
        }
    }
}

fn audit_decision(
    state: &ServiceState,
    ctx: &RunContext,
    principal: &str,
    key_id: &str,
    operation: &str,
    outcome: AuditOutcome,
) -> Result<(), ApiError> {
    state
        .audit
        .append(AuditRecord::new(
            ctx,
            principal,
            key_id,
            AuditProtocol::Rest,
            operation,
            json!({}),
            outcome,
        ))
        .map_err(|e| ApiError::internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

async fn root() -> Json<serde_json::Value> {
    Json(json!({"name": "hephaestus", "version": env!("CARGO_PKG_VERSION")}))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service_accounts": state.services.keystore.len(),
    }))
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

// ---------------------------------------------------------------------------
// Operation submission
// ---------------------------------------------------------------------------

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize)]
struct GuardRailsBody {
    #[serde(default = "default_workspace")]
    workspace: PathBuf,
    #[serde(default)]
    skip_format: bool,
    #[serde(default)]
    drift_check: bool,
    #[serde(default)]
    use_plugins: bool,
    /// Run inline and return the result instead of a task handle.
    #[serde(default)]
    sync: bool,
}

async fn submit_guard_rails(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GuardRailsBody>,
) -> Result<axum::response::Response, ApiError> {
    let principal = authorize(&state.services, &headers, Role::GuardRails, "guard-rails")?;
    let options = GuardRailsOptions {
        workspace: body.workspace,
        skip_format: body.skip_format,
        drift_check: body.drift_check,
        use_plugins: body.use_plugins,
        skip_cleanup: false,
    };

    if body.sync {
        let ctx = RunContext::new("guard-rails");
        let result = state
            .services
            .execute_guard_rails(
                &ctx,
                &principal.name,
                AuditProtocol::Rest,
                &options,
                &CancelToken::new(),
                &|_f, _d| {},
            )
            .await?;
        return Ok(Json(result).into_response());
    }
    let task_id =
        state
            .services
            .submit_guard_rails(principal.name, AuditProtocol::Rest, options)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"task_id": task_id}))).into_response())
}

#[derive(Debug, Deserialize)]
struct CleanupBody {
    #[serde(flatten)]
    options: CleanupOptions,
    /// Stands in for the interactive confirmation channel.
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    sync: bool,
}

async fn submit_cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CleanupBody>,
) -> Result<axum::response::Response, ApiError> {
    let principal = authorize(&state.services, &headers, Role::Cleanup, "cleanup")?;

    if body.sync {
        let ctx = RunContext::new("cleanup");
        let confirmation: &dyn ConfirmationSource = if body.confirm {
            &AssumeYes
        } else {
            &DenyConfirmation
        };
        let report = state
            .services
            .execute_cleanup(
                &ctx,
                &principal.name,
                AuditProtocol::Rest,
                &body.options,
                confirmation,
                &CancelToken::new(),
                &|_f, _d| {},
            )
            .await?;
        return Ok(Json(report).into_response());
    }
    let task_id = state.services.submit_cleanup(
        principal.name,
        AuditProtocol::Rest,
        body.options,
        body.confirm,
    )?;
    Ok((StatusCode::ACCEPTED, Json(json!({"task_id": task_id}))).into_response())
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    #[serde(flatten)]
    request: ReleaseRequest,
    #[serde(default)]
    sync: bool,
}

async fn submit_release(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReleaseBody>,
) -> Result<axum::response::Response, ApiError> {
    let principal = authorize(&state.services, &headers, Role::Release, "release-install")?;

    if body.sync {
        let ctx = RunContext::new("release-install");
        let installed = state
            .services
            .execute_release(
                &ctx,
                &principal.name,
                AuditProtocol::Rest,
                &body.request,
                &CancelToken::new(),
                &|_f, _d| {},
            )
            .await?;
        return Ok(Json(installed).into_response());
    }
    let task_id =
        state
            .services
            .submit_release(principal.name, AuditProtocol::Rest, body.request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"task_id": task_id}))).into_response())
}

// ---------------------------------------------------------------------------
// Task inspection and streaming
// ---------------------------------------------------------------------------

async fn task_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<axum::response::Response, ApiError> {
    if bearer_token(&headers).is_none() {
        return Err(ApiError::unauthorized("missing bearer token"));
    }
    let snapshot = state.services.tasks.snapshot(&id)?;
    authorize(
        &state.services,
        &headers,
        kind_role(snapshot.kind),
        "task-snapshot",
    )?;
    Ok(Json(snapshot).into_response())
}

/// SSE: each `data:` frame is a task snapshot; the stream closes after the
/// terminal one. A disconnecting consumer does not cancel the task.
async fn task_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if bearer_token(&headers).is_none() {
        return Err(ApiError::unauthorized("missing bearer token"));
    }
    let (initial, mut receiver) = state.services.tasks.subscribe(&id)?;
    authorize(
        &state.services,
        &headers,
        kind_role(initial.kind),
        "task-stream",
    )?;

    let stream = async_stream::stream! {
        let mut last_terminal = initial.status.is_terminal();
        if let Ok(event) = Event::default().json_data(&initial) {
            yield Ok(event);
        }
        while !last_terminal {
            match receiver.recv().await {
                Ok(snapshot) => {
                    last_terminal = snapshot.status.is_terminal();
                    if let Ok(event) = Event::default().json_data(&snapshot) {
                        yield Ok(event);
                    }
                }
                Err(_) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
