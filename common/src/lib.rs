pub mod config;
pub mod dag;
pub mod error;
pub mod fs;
pub mod job;
pub mod partition;
pub mod shuffle;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
pub use job::{
    JobId, JobInfo, JobSpec, JobStatus, LocalityMode, SchedulingConfig, StageInfo, StageSpec,
};
pub use task::{AttemptRef, TaskId, TaskLaunch, TaskSpec, TaskState};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
