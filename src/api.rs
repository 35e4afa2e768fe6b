use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::Error;
use crate::job::{JobId, JobStatus, Priority, Target};
use crate::queue::QueueDepths;
use crate::service::JobService;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobService,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub target: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub total_budget_secs: f64,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: JobId,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct CancelJobResponse {
    job_id: JobId,
    cancel_requested: bool,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    queues: QueueDepths,
    records: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    error: String,
}

/// Error wrapper carrying the HTTP status mapping.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            code: self.0.code(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/health", get(health_handler))
        .route("/v1/jobs", post(submit_job_handler))
        .route("/v1/jobs/:id", get(job_status_handler))
        .route("/v1/jobs/:id/cancel", post(cancel_job_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the adapter on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP adapter listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health_handler(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let queues = state.jobs.depths().await?;
    let records = state.jobs.record_count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        queues,
        records,
    }))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let budget = Duration::try_from_secs_f64(payload.total_budget_secs).map_err(|_| {
        Error::InvalidSubmission(format!(
            "total_budget_secs {} is not a valid duration",
            payload.total_budget_secs
        ))
    })?;
    let mut target = Target::new(payload.target);
    if let Some(kind) = payload.kind {
        target = target.with_kind(kind);
    }

    let job_id = state
        .jobs
        .submit(target, payload.priority.unwrap_or_default(), budget)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    // An id that cannot exist is reported the same way as one that no longer does.
    raw.parse::<JobId>()
        .map_err(|_| ApiError(Error::NotFound(JobId::nil())))
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.jobs.get_status(job_id).await?;
    Ok(Json(job))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.jobs.request_cancel(job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelJobResponse {
            job_id,
            cancel_requested: job.cancel_requested,
            status: job.status,
        }),
    ))
}
