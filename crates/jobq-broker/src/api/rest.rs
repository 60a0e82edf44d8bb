use crate::dispatcher::{DispatchError, EnqueueRequest};
use crate::Broker;
use jobq_core::{DeadLetterEntry, ErrorCode, Job, JobId, JobStatus};
use jobq_persistence::PersistenceError;
use jobq_worker::WorkerError;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

/// REST API routes
pub fn create_rest_api(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id/requeue", post(requeue_dead_letter))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Committed chunks; only reported for bulk jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_offset: Option<u64>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl JobView {
    fn new(job: Job, attempts: u32) -> Self {
        JobView {
            job_id: job.job_id,
            status: job.status,
            attempts,
            checkpoint_offset: job.kind.is_bulk().then_some(job.checkpoint_offset),
            result: job.result,
            error_code: job.error_code,
            cancel_requested: job.cancel_requested,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub job_id: JobId,
    pub task_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub seconds_since_last_success: u64,
    pub queue_depth: usize,
}

async fn submit_job(
    State(broker): State<Arc<Broker>>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let submission = broker.dispatcher().enqueue(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: submission.job_id,
        }),
    ))
}

async fn get_job(
    State(broker): State<Arc<Broker>>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobView>, ApiError> {
    let store = broker.store();
    let job = store.get_job(&job_id)?.ok_or(ApiError::NotFound)?;
    let attempts = store
        .get_task(&job.task_id)?
        .map(|t| t.attempts)
        .unwrap_or(0);

    Ok(Json(JobView::new(job, attempts)))
}

async fn cancel_job(
    State(broker): State<Arc<Broker>>,
    Path(job_id): Path<JobId>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let job = broker.cancel(&job_id)?;
    let attempts = broker
        .store()
        .get_task(&job.task_id)?
        .map(|t| t.attempts)
        .unwrap_or(0);

    Ok((StatusCode::ACCEPTED, Json(JobView::new(job, attempts))))
}

async fn list_dead_letters(
    State(broker): State<Arc<Broker>>,
) -> Result<Json<Vec<DeadLetterEntry>>, ApiError> {
    Ok(Json(broker.store().list_dead_letters()?))
}

async fn requeue_dead_letter(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RequeueResponse>), ApiError> {
    let task = broker.pool().governor().requeue(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RequeueResponse {
            job_id: task.job_id,
            task_id: task.id,
        }),
    ))
}

async fn metrics(State(broker): State<Arc<Broker>>) -> Result<Response, ApiError> {
    broker
        .metrics()
        .queue_depth
        .set(broker.queue().depth() as i64);
    let body = broker
        .metrics()
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// 200 while jobs keep succeeding, 503 once the last success is older than
/// the staleness threshold
async fn health_check(State(broker): State<Arc<Broker>>) -> (StatusCode, Json<HealthResponse>) {
    let health = broker.health();
    let (code, status) = if health.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            seconds_since_last_success: health.since_last_success().as_secs(),
            queue_depth: broker.queue().depth(),
        }),
    )
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::JobNotFound(_)
            | PersistenceError::TaskNotFound(_)
            | PersistenceError::DeadLetterNotFound(_) => ApiError::NotFound,
            PersistenceError::JobError(jobq_core::JobError::InvalidTransition { from, to }) => {
                ApiError::Conflict(format!("cannot move from {} to {}", from, to))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidPayload(msg) => ApiError::BadRequest(msg),
            DispatchError::QueueUnavailable(msg) => ApiError::ServiceUnavailable(msg),
            DispatchError::Persistence(e) => e.into(),
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Persistence(e) => e.into(),
            WorkerError::Queue(e) => ApiError::ServiceUnavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
