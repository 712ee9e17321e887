mod config;
mod http;
mod images;
mod jobs;
mod lens;
mod llm;
mod locator;
mod metrics;
mod models;
mod pipeline;
mod progress;
mod report;
mod scratch;
mod security;
mod store;
mod summary;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, BatchOutcome, DEFAULT_MAX_IMAGES, ReportRequest, RequestContext};
use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineErrorKind, PipelineParts};
use progress::TracingProgress;
use report::archive::{self, ReportGroup};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use store::{QuotaLedger, ReportStore, SqliteStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "appraisal.api", "server crashed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env();
    let store = SqliteStore::open(&config.database_path)?;
    let auth_state = AuthState::from_env();
    for username in auth_state.usernames() {
        if store.register_user(&username, DEFAULT_MAX_IMAGES).await? {
            info!(target = "appraisal.store", user = %username, "quota_row_created");
        }
    }
    info!(
        target = "appraisal.store",
        path = %store.path().display(),
        users = auth_state.usernames().len(),
        "store_ready"
    );

    let pipeline = Pipeline::new(
        PipelineConfig::from_app(&config),
        PipelineParts::live(store.clone()),
    );
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| format!("prometheus recorder: {err}"))?;

    let state = AppState {
        pipeline,
        queue,
        store,
        reports_dir: Arc::new(config.reports_dir.clone()),
        prometheus_handle,
    };
    let app = build_router(state, auth_state);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "appraisal.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    store: SqliteStore,
    reports_dir: Arc<PathBuf>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/reports", post(create_report).get(list_reports))
        .route("/reports/files/{file_name}", get(download_report))
        .route("/quota", get(get_quota))
        .nest(
            "/jobs",
            Router::new()
                .route("/reports", post(enqueue_report_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "appraisal-api",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Run one appraisal batch and wait for the reports.
///
/// - Method: `POST`
/// - Path: `/reports`
/// - Auth: `Authorization: Bearer <key>` or `X-Api-Key: <key>`
/// - Body: `{ "folder_url": "...", "mode": "full" | "basic" }`
/// - Response: `BatchOutcome`
async fn create_report(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ReportRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    crate::metrics::inc_requests("/reports");
    info!(
        target = "appraisal.api",
        user = %auth.username,
        api_key = %auth.api_key_id,
        mode = ?payload.mode,
        "report batch invoked",
    );
    let ctx = RequestContext {
        user: auth.username.clone(),
        mode: payload.mode,
    };
    let sink = TracingProgress {
        user: auth.username,
    };
    let outcome = state
        .pipeline
        .run_batch(&ctx, &payload.folder_url, &sink)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_report_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ReportRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/reports");
    let ctx = RequestContext {
        user: auth.username,
        mode: payload.mode,
    };
    let id = state
        .queue
        .enqueue_batch(payload.folder_url, ctx)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    state
        .queue
        .get(uuid, &auth.username)
        .map(Json)
        .ok_or_else(|| AppError::Pipeline(PipelineError::not_found("jobs", "job_not_found")))
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    processed: i64,
    max_allowed: i64,
    remaining: i64,
}

async fn get_quota(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<QuotaResponse>, AppError> {
    crate::metrics::inc_requests("/quota");
    let limits = state
        .store
        .get_limits(&auth.username)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("quota", err.to_string())))?;
    Ok(Json(QuotaResponse {
        processed: limits.processed_count,
        max_allowed: limits.max_allowed,
        remaining: limits.remaining(),
    }))
}

async fn user_report_groups(state: &AppState, user: &str) -> Result<Vec<ReportGroup>, AppError> {
    let stored = state
        .store
        .get_user_reports(user)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("reports", err.to_string())))?;
    Ok(archive::group_reports(&stored, &state.reports_dir))
}

/// Past reports of the caller, newest batch first.
async fn list_reports(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ReportGroup>>, AppError> {
    crate::metrics::inc_requests("/reports:list");
    Ok(Json(user_report_groups(&state, &auth.username).await?))
}

async fn download_report(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(file_name): Path<String>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/reports/files");
    let groups = user_report_groups(&state, &auth.username).await?;
    let not_found = || AppError::Pipeline(PipelineError::not_found("reports", "report_not_found"));
    let file = archive::find_file(&groups, &file_name).ok_or_else(not_found)?;
    let bytes = tokio::fs::read(&file.path).await.map_err(|err| {
        error!(
            target = "appraisal.api",
            path = %file.path.display(),
            error = %err,
            "report_file_unreadable"
        );
        not_found()
    })?;
    let disposition = format!("attachment; filename=\"{}\"", file.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, file.kind.mime_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::QuotaExceeded => StatusCode::FORBIDDEN,
                    PipelineErrorKind::NothingToReport => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
