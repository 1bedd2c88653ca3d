//! REST facade: job submission, job status and worker administration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::CycloneError;
use crate::mailbox::{drain_slots, MailboxStore, WorkerSlot};
use crate::scheduler::job::{JobRecord, JobSpec, JobStatus};
use crate::scheduler::store::JobStore;
use crate::scheduler::submit::{ArraySubmission, JobSubmitter};
use crate::store::PageRequest;

#[derive(Clone)]
pub struct ApiState {
    pub submitter: JobSubmitter,
    pub jobs: Arc<dyn JobStore>,
    pub mailbox: Arc<dyn MailboxStore>,
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub struct ApiError(CycloneError);

impl From<CycloneError> for ApiError {
    fn from(e: CycloneError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CycloneError::InvalidSubmission(_) | CycloneError::Json(_) => StatusCode::BAD_REQUEST,
            CycloneError::JobNotFound { .. } | CycloneError::SlotNotFound(_) => StatusCode::NOT_FOUND,
            CycloneError::JobExists(_) | CycloneError::ConditionFailed(_) => StatusCode::CONFLICT,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitArrayRequest {
    #[serde(flatten)]
    spec: JobSpec,
    params: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    limit: Option<usize>,
    start_after: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobListResponse {
    jobs: Vec<JobRecord>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteByPrefixQuery {
    name_prefix: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletedResponse {
    deleted: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrainRequest {
    job_definition: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DrainResponse {
    drained: usize,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/array", post(submit_array_handler))
        .route(
            "/api/queues/:queue/jobs",
            get(list_jobs_handler).delete(delete_by_prefix_handler),
        )
        .route(
            "/api/queues/:queue/jobs/:id",
            get(get_job_handler).delete(delete_job_handler),
        )
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/drain", post(drain_workers_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting REST API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind REST API");
            return;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "REST API failed");
    }
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<impl IntoResponse> {
    let job_id = state.submitter.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn submit_array_handler(
    State(state): State<ApiState>,
    Json(request): Json<SubmitArrayRequest>,
) -> ApiResult<(StatusCode, Json<ArraySubmission>)> {
    let submission = state
        .submitter
        .submit_array(request.spec, &request.params)
        .await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(CycloneError::InvalidSubmission)?;
    let page = PageRequest {
        limit: query.limit.unwrap_or(100),
        start_after: query.start_after,
    };
    let page = state.jobs.list(&queue, status, page).await?;
    Ok(Json(JobListResponse {
        jobs: page.items,
        next: page.next,
    }))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path((queue, id)): Path<(String, String)>,
) -> ApiResult<Json<JobRecord>> {
    match state.jobs.get(&queue, &id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(CycloneError::JobNotFound { queue, id }.into()),
    }
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    Path((queue, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state.submitter.delete(&queue, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CycloneError::JobNotFound { queue, id }.into())
    }
}

async fn delete_by_prefix_handler(
    State(state): State<ApiState>,
    Path(queue): Path<String>,
    Query(query): Query<DeleteByPrefixQuery>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state
        .submitter
        .delete_by_name_prefix(&queue, &query.name_prefix)
        .await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn list_workers_handler(State(state): State<ApiState>) -> ApiResult<Json<Vec<WorkerSlot>>> {
    Ok(Json(state.mailbox.list().await?))
}

async fn drain_workers_handler(
    State(state): State<ApiState>,
    request: Option<Json<DrainRequest>>,
) -> ApiResult<Json<DrainResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let drained = drain_slots(state.mailbox.as_ref(), request.job_definition.as_deref()).await?;
    Ok(Json(DrainResponse { drained }))
}
