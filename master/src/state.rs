// master/src/state.rs

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::fs::FileSystem;
use common::{
    AttemptRef, Error, JobId, JobInfo, JobSpec, Result, TaskAssignmentResponse, TaskCompleteRequest,
    WorkerId, WorkerRegisterRequest,
};

use crate::coordination::{Assignment, SchedulerState};
use crate::registry::WorkerRegistry;
use crate::scheduler::TaskScheduler;

/// Job server state: the lock-free worker registry next to everything the
/// scheduler owns, which sits behind the one scheduler lock.
pub struct Coordinator {
    registry: WorkerRegistry,
    scheduler_lock: Mutex<SchedulerState>,
}

impl Coordinator {
    pub fn new(fs: Arc<dyn FileSystem>, heartbeat_timeout: Duration) -> Self {
        Self {
            registry: WorkerRegistry::new(heartbeat_timeout),
            scheduler_lock: Mutex::new(SchedulerState::new(fs)),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Runs `f` with the scheduler lock held.
    ///
    /// Most handlers call this straight from async context on the blocking
    /// `parking_lot` mutex; their critical sections are short and in memory.
    /// Job submission stats input files and the scheduling pass is the
    /// long holder; both run on the blocking pool.
    pub fn with_scheduler_state<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let mut state = self.scheduler_lock.lock();
        f(&mut state)
    }

    pub fn register_worker(&self, req: WorkerRegisterRequest) -> Result<WorkerId> {
        if req.max_concurrency == 0 {
            return Err(Error::InvalidArgument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        let capacity = req.max_concurrency;
        let worker = self.registry.register(req);
        self.with_scheduler_state(|s| s.add_worker(worker.id.clone(), capacity));
        info!(
            "worker registered: {} on {} ({}), capacity={}, shuffle={}",
            worker.id, worker.host, worker.rack, worker.capacity, worker.shuffle_addr
        );
        Ok(worker.id.clone())
    }

    /// Lock-free: only touches the registry's atomics.
    pub fn heartbeat(&self, worker: &str, running: u32) -> bool {
        self.registry.heartbeat(worker, running)
    }

    pub fn submit_job(&self, spec: JobSpec) -> Result<JobInfo> {
        self.with_scheduler_state(|s| s.submit_job(spec))
    }

    pub fn job_info(&self, id: &JobId) -> Option<JobInfo> {
        self.with_scheduler_state(|s| s.job_info(id))
    }

    pub fn abort_job(&self, id: &JobId) -> Result<JobInfo> {
        self.with_scheduler_state(|s| s.abort_job(id))
    }

    pub fn take_work(&self, worker: &str) -> Result<TaskAssignmentResponse> {
        if self.registry.get(worker).map_or(true, |w| w.is_dead()) {
            return Err(Error::NotFound(format!("worker {worker}")));
        }
        self.with_scheduler_state(|s| s.take_work(worker))
            .ok_or_else(|| Error::NotFound(format!("worker {worker}")))
    }

    /// Applies a task server's attempt report. Returns whether the report
    /// changed anything.
    pub fn complete_task(&self, req: &TaskCompleteRequest) -> bool {
        let attempt: &AttemptRef = &req.attempt;
        self.with_scheduler_state(|s| {
            if req.success {
                s.complete_attempt(attempt, &req.worker_id)
            } else {
                let cause = req.cause.as_deref().unwrap_or("unknown failure");
                s.fail_attempt(attempt, &req.worker_id, cause)
            }
        })
    }

    pub fn fail_worker(&self, worker: &str, cause: &str) -> usize {
        let host = self.registry.get(worker).map(|w| w.host.clone());
        self.with_scheduler_state(|s| s.fail_worker(worker, host.as_deref(), cause))
    }

    pub fn run_scheduling_pass(
        &self,
        scheduler: &dyn TaskScheduler,
        cancel: &CancellationToken,
    ) -> Result<Vec<Assignment>> {
        self.with_scheduler_state(|s| scheduler.schedule_tasks(s, &self.registry, cancel))
    }
}
