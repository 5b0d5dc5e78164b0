//! HTTP surface: bot-facing session and claim endpoints plus the admin API.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::FleetError;
use crate::fleet::sessions::HeartbeatAck;
use crate::fleet::{Bot, RegistrationRequest, RegistrationResponse};
use crate::operations::OperationInfo;
use crate::orchestrator::{EnqueueBatch, FleetStats, Orchestrator};
use crate::scheduler::{ClaimOutcome, Job, JobOutcome, JobStatus, ReportAck};

#[derive(Debug, Deserialize)]
struct SessionBody {
    session_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ReportBody {
    session_id: Uuid,
    job_id: Uuid,
    #[serde(flatten)]
    outcome: JobOutcome,
}

/// Absent fields leave the current value alone; `null` clears it.
#[derive(Debug, Default, Deserialize)]
struct AssignmentBody {
    #[serde(default, deserialize_with = "present")]
    operation: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    queue: Option<Option<String>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    job_id: Uuid,
    released: bool,
    previous_holder: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// A [`FleetError`] rendered as `{"error": kind, "message": text}`.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::Validation(_)
            | FleetError::Execution(_)
            | FleetError::UnknownOperation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::JobNotFound(_) | FleetError::BotNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::ClaimConflict { .. } => StatusCode::CONFLICT,
            FleetError::SessionExpired(_) => StatusCode::UNAUTHORIZED,
            FleetError::BotUnhealthy(_) => StatusCode::FORBIDDEN,
            FleetError::StoreUnavailable(_) | FleetError::QueueFull(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FleetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FleetError::CircuitOpen(_) | FleetError::Transport(_) => StatusCode::BAD_GATEWAY,
            FleetError::DuplicateOperation(_) | FleetError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/bots/register", post(register_handler))
        .route("/v1/bots/{bot_id}/heartbeat", post(heartbeat_handler))
        .route("/v1/bots/{bot_id}/claim", post(claim_handler))
        .route("/v1/bots/{bot_id}/report", post(report_handler))
        .route("/v1/bots/{bot_id}/assignment", put(assignment_handler))
        .route("/v1/bots/{bot_id}", get(get_bot_handler))
        .route("/v1/bots", get(list_bots_handler))
        .route("/v1/operations", get(list_operations_handler))
        .route("/v1/jobs", get(list_jobs_handler).post(enqueue_handler))
        .route("/v1/jobs/{job_id}", get(get_job_handler))
        .route("/v1/jobs/{job_id}/release", post(release_handler))
        .route("/v1/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(orchestrator)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn register_handler(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<RegistrationRequest>,
) -> ApiResult<RegistrationResponse> {
    Ok(Json(orchestrator.register(request).await?))
}

async fn heartbeat_handler(
    State(orchestrator): State<Orchestrator>,
    Path(bot_id): Path<Uuid>,
    Json(body): Json<SessionBody>,
) -> ApiResult<HeartbeatAck> {
    Ok(Json(orchestrator.heartbeat(bot_id, body.session_id).await?))
}

async fn claim_handler(
    State(orchestrator): State<Orchestrator>,
    Path(bot_id): Path<Uuid>,
    Json(body): Json<SessionBody>,
) -> ApiResult<ClaimOutcome> {
    Ok(Json(orchestrator.claim(bot_id, body.session_id).await?))
}

async fn report_handler(
    State(orchestrator): State<Orchestrator>,
    Path(bot_id): Path<Uuid>,
    Json(body): Json<ReportBody>,
) -> ApiResult<ReportAck> {
    Ok(Json(
        orchestrator
            .report(bot_id, body.session_id, body.job_id, body.outcome)
            .await?,
    ))
}

async fn assignment_handler(
    State(orchestrator): State<Orchestrator>,
    Path(bot_id): Path<Uuid>,
    Json(body): Json<AssignmentBody>,
) -> ApiResult<Bot> {
    let mut bot = orchestrator.get_bot(bot_id).await?;
    if let Some(operation) = body.operation {
        bot = orchestrator.assign_operation(bot_id, operation).await?;
    }
    if let Some(queue) = body.queue {
        bot = orchestrator.assign_queue(bot_id, queue).await?;
    }
    Ok(Json(bot))
}

async fn get_bot_handler(
    State(orchestrator): State<Orchestrator>,
    Path(bot_id): Path<Uuid>,
) -> ApiResult<Bot> {
    Ok(Json(orchestrator.get_bot(bot_id).await?))
}

async fn list_bots_handler(State(orchestrator): State<Orchestrator>) -> ApiResult<Vec<Bot>> {
    Ok(Json(orchestrator.list_bots().await?))
}

async fn list_operations_handler(
    State(orchestrator): State<Orchestrator>,
) -> Json<Vec<OperationInfo>> {
    Json(orchestrator.list_operations())
}

async fn enqueue_handler(
    State(orchestrator): State<Orchestrator>,
    Json(batch): Json<EnqueueBatch>,
) -> Result<(StatusCode, Json<Vec<Job>>), ApiError> {
    let jobs = orchestrator.enqueue_batch(batch).await?;
    Ok((StatusCode::CREATED, Json(jobs)))
}

async fn list_jobs_handler(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Vec<Job>> {
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(FleetError::InvalidRequest)?;
    Ok(Json(orchestrator.list_jobs(status).await?))
}

async fn get_job_handler(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Job> {
    Ok(Json(orchestrator.get_job(job_id).await?))
}

async fn release_handler(
    State(orchestrator): State<Orchestrator>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<ReleaseResponse> {
    let previous_holder = orchestrator.release_job(job_id).await?;
    Ok(Json(ReleaseResponse {
        job_id,
        released: previous_holder.is_some(),
        previous_holder,
    }))
}

async fn stats_handler(State(orchestrator): State<Orchestrator>) -> ApiResult<FleetStats> {
    Ok(Json(orchestrator.stats().await?))
}
