use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    Error, JobId, JobInfo, JobSpec, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use tracing::{debug, info, warn};

use crate::registry::now_ms;
use crate::state::Coordinator;

pub type AppState = Arc<Coordinator>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/abort", post(abort_job))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(next_tasks))
        .route("/api/v1/tasks/complete", post(complete_task))
        .with_state(state)
}

fn status_of(e: &Error) -> StatusCode {
    match e {
        Error::InvalidArgument(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::RemoteFailure | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_job_id(id: &str) -> Result<JobId, StatusCode> {
    id.parse::<JobId>().map_err(|_| StatusCode::BAD_REQUEST)
}

/* ---------------- HTTP handlers ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Accepts a prepared job graph; scheduling happens on the next pass.
// Submission stats input files under the scheduler lock, so it runs on the
// blocking pool.
async fn create_job(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> Result<Json<JobInfo>, StatusCode> {
    let submitted = tokio::task::spawn_blocking(move || state.submit_job(spec))
        .await
        .map_err(|e| {
            warn!("job submission panicked: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    submitted.map(Json).map_err(|e| {
        warn!("rejected job submission: {}", e);
        status_of(&e)
    })
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let id = parse_job_id(&id)?;
    state.job_info(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let id = parse_job_id(&id)?;
    state
        .abort_job(&id)
        .map(Json)
        .map_err(|e| status_of(&e))
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    state
        .register_worker(req)
        .map(|worker_id| Json(WorkerRegisterResponse { worker_id }))
        .map_err(|e| status_of(&e))
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    if state.heartbeat(&req.worker_id, req.running_tasks) {
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Hands out launches and kill orders queued for the worker since its last poll
async fn next_tasks(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    let work = state.take_work(&req.worker_id).map_err(|e| status_of(&e))?;
    if !work.launch.is_empty() || !work.kill.is_empty() {
        debug!(
            "worker {} polled: {} launches, {} kills",
            req.worker_id,
            work.launch.len(),
            work.kill.len()
        );
    }
    Ok(Json(work))
}

async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Json<TaskCompleteResponse> {
    let accepted = state.complete_task(&req);
    if accepted {
        info!(
            "worker {} reported task {} attempt {} of job {}: {}",
            req.worker_id,
            req.attempt.task_id,
            req.attempt.attempt,
            req.attempt.job_id,
            if req.success { "ok" } else { "failed" }
        );
    }
    Json(TaskCompleteResponse { accepted })
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = now_ms();
    Json(
        state
            .registry()
            .snapshot()
            .iter()
            .map(|w| w.metrics(now))
            .collect(),
    )
}
