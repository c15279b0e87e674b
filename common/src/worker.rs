use serde::{Deserialize, Serialize};

use crate::task::{AttemptRef, TaskLaunch};

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub rack: String,
    /// `host:port` of the worker's shuffle file channel server.
    pub shuffle_addr: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub running_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub worker_id: WorkerId,
}

/// Attempts to start and attempts to kill since the last poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub launch: Vec<TaskLaunch>,
    pub kill: Vec<AttemptRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub worker_id: WorkerId,
    pub attempt: AttemptRef,
    pub success: bool,
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    /// `false` when the report was stale (attempt superseded or job gone).
    pub accepted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub rack: String,
    pub shuffle_addr: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub reported_running: u32,
}
