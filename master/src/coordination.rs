// master/src/coordination.rs
//
// Everything in this module is scheduler-owned: it is only reachable through
// `&mut SchedulerState`, which the coordinator hands out while holding the
// scheduler lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::dag::{downstream_of, validate_job_spec};
use common::fs::{FileInfo, FileSystem};
use common::task::{task_id, DISTANCE_LOCAL, DISTANCE_RACK};
use common::{
    AttemptRef, Error, JobId, JobInfo, JobSpec, JobStatus, Result, StageInfo, TaskAssignmentResponse,
    TaskId, TaskLaunch, TaskSpec, TaskState, WorkerId,
};

use crate::registry::{WorkerInfo, WorkerRegistry};

/* ---------------- tasks, stages, jobs ---------------- */

#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,

    pub assigned_worker: Option<WorkerId>,
    /// Attempts started so far; the running attempt's number when `Running`.
    pub attempts: u32,
    pub successful_attempt: Option<u32>,
    pub data_distance: Option<u8>,
    /// Only grows.
    pub bad_workers: HashSet<WorkerId>,
    /// Hosts whose worker died while running this task. A worker that
    /// re-registers under a new id stays excluded. Only grows.
    pub bad_hosts: HashSet<String>,
    pub last_failure: Option<(WorkerId, String)>,
    pub started_at: Option<DateTime<Utc>>,
}

impl TaskEntry {
    fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            spec,
            state: TaskState::Unscheduled,
            assigned_worker: None,
            attempts: 0,
            successful_attempt: None,
            data_distance: None,
            bad_workers: HashSet::new(),
            bad_hosts: HashSet::new(),
            last_failure: None,
            started_at: None,
        }
    }

    pub fn is_schedulable_on(&self, worker: &WorkerInfo) -> bool {
        self.state == TaskState::Unscheduled
            && self.assigned_worker.is_none()
            && !self.is_blacklisted(worker)
    }

    pub fn is_blacklisted(&self, worker: &WorkerInfo) -> bool {
        self.bad_workers.contains(&worker.id) || self.bad_hosts.contains(&worker.host)
    }

    fn is_current_attempt(&self, attempt: u32, worker: &str) -> bool {
        self.state == TaskState::Running
            && self.attempts == attempt
            && self.assigned_worker.as_deref() == Some(worker)
    }
}

#[derive(Debug, Clone)]
pub struct StageEntry {
    pub name: String,
    pub data_input: bool,
    pub depends_on: Vec<usize>,
    pub downstream: Vec<usize>,
    /// Set once every upstream stage has finished.
    pub ready: bool,
    pub unscheduled: usize,
    pub finished: usize,
    pub tasks: Vec<TaskEntry>,
}

impl StageEntry {
    pub fn is_ready_for_scheduling(&self) -> bool {
        self.ready && self.unscheduled > 0
    }

    pub fn is_finished(&self) -> bool {
        self.finished == self.tasks.len()
    }
}

/// Per-job memo tables. Filled on first use by the scheduler and dropped
/// with the job.
#[derive(Debug, Default)]
struct LocalityCache {
    file_info: HashMap<String, FileInfo>,
    /// Per stage: each task's hint hosts plus the hosts of its input file.
    hints: HashMap<usize, Arc<Vec<Vec<String>>>>,
    host_tasks: HashMap<(String, usize), Arc<Vec<usize>>>,
    rack_tasks: HashMap<(String, usize), Arc<Vec<usize>>>,
}

#[derive(Debug)]
pub struct JobEntry {
    pub id: JobId,
    pub spec: Arc<JobSpec>,
    pub status: JobStatus,
    pub stages: Vec<StageEntry>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub failed_attempts: u32,

    task_index: HashMap<TaskId, (usize, usize)>,
    locality: LocalityCache,
}

impl JobEntry {
    pub fn new(id: JobId, spec: JobSpec) -> Result<Self> {
        validate_job_spec(&spec)?;

        let mut task_index = HashMap::new();
        let stages = spec
            .stages
            .iter()
            .enumerate()
            .map(|(s, stage)| {
                let tasks: Vec<TaskEntry> = stage
                    .tasks
                    .iter()
                    .enumerate()
                    .map(|(t, ts)| {
                        let id = task_id(s, t);
                        task_index.insert(id.clone(), (s, t));
                        TaskEntry::new(id, ts.clone())
                    })
                    .collect();
                StageEntry {
                    name: stage.name.clone(),
                    data_input: stage.data_input,
                    depends_on: stage.depends_on.clone(),
                    downstream: downstream_of(&spec, s),
                    ready: stage.depends_on.is_empty(),
                    unscheduled: tasks.len(),
                    finished: 0,
                    tasks,
                }
            })
            .collect();

        Ok(Self {
            id,
            spec: Arc::new(spec),
            status: JobStatus::Running,
            stages,
            submitted_at: Utc::now(),
            finished_at: None,
            failure: None,
            failed_attempts: 0,
            task_index,
            locality: LocalityCache::default(),
        })
    }

    pub fn locate(&self, task_id: &str) -> Option<(usize, usize)> {
        self.task_index.get(task_id).copied()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskEntry> {
        self.locate(task_id)
            .map(|(s, t)| &self.stages[s].tasks[t])
    }

    pub fn unscheduled_tasks(&self) -> usize {
        self.stages.iter().map(|s| s.unscheduled).sum()
    }

    /* -------- memoized locality lookups -------- */

    /// Queries the file system at most once per path for the job's lifetime.
    pub fn file_info(&mut self, path: &str, fs: &dyn FileSystem) -> Result<&FileInfo> {
        if !self.locality.file_info.contains_key(path) {
            let info = fs.get_file_info(path)?;
            self.locality.file_info.insert(path.to_string(), info);
        }
        Ok(&self.locality.file_info[path])
    }

    fn stage_hints(&mut self, stage: usize, fs: &dyn FileSystem) -> Result<Arc<Vec<Vec<String>>>> {
        if let Some(h) = self.locality.hints.get(&stage) {
            return Ok(h.clone());
        }

        let specs: Vec<TaskSpec> = self.stages[stage].tasks.iter().map(|t| t.spec.clone()).collect();
        let mut hints = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut hosts = spec.locality_hints;
            if let Some(path) = spec.input_path.as_deref() {
                for h in &self.file_info(path, fs)?.hosts {
                    if !hosts.contains(h) {
                        hosts.push(h.clone());
                    }
                }
            }
            hints.push(hosts);
        }

        let hints = Arc::new(hints);
        self.locality.hints.insert(stage, hints.clone());
        Ok(hints)
    }

    /// Tasks of a data-input stage whose input lives on `host`.
    pub fn host_task_list(
        &mut self,
        host: &str,
        stage: usize,
        fs: &dyn FileSystem,
    ) -> Result<Arc<Vec<usize>>> {
        let key = (host.to_string(), stage);
        if let Some(list) = self.locality.host_tasks.get(&key) {
            return Ok(list.clone());
        }

        let list: Vec<usize> = if self.stages[stage].data_input {
            let hints = self.stage_hints(stage, fs)?;
            hints
                .iter()
                .enumerate()
                .filter(|(_, hosts)| hosts.iter().any(|h| h == host))
                .map(|(t, _)| t)
                .collect()
        } else {
            Vec::new()
        };

        let list = Arc::new(list);
        self.locality.host_tasks.insert(key, list.clone());
        Ok(list)
    }

    /// Tasks of a data-input stage with input somewhere in `rack`. Shared
    /// by every worker of the rack.
    pub fn rack_task_list(
        &mut self,
        rack: &str,
        stage: usize,
        fs: &dyn FileSystem,
        registry: &WorkerRegistry,
    ) -> Result<Arc<Vec<usize>>> {
        let key = (rack.to_string(), stage);
        if let Some(list) = self.locality.rack_tasks.get(&key) {
            return Ok(list.clone());
        }

        let list: Vec<usize> = if self.stages[stage].data_input {
            let hints = self.stage_hints(stage, fs)?;
            let mut racks_by_host: HashMap<String, Option<String>> = HashMap::new();
            hints
                .iter()
                .enumerate()
                .filter(|(_, hosts)| {
                    hosts.iter().any(|h| {
                        racks_by_host
                            .entry(h.clone())
                            .or_insert_with(|| registry.rack_of_host(h))
                            .as_deref()
                            == Some(rack)
                    })
                })
                .map(|(t, _)| t)
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            "job {}: {} tasks of stage {} are local to rack {}",
            self.id,
            list.len(),
            stage,
            rack
        );
        let list = Arc::new(list);
        self.locality.rack_tasks.insert(key, list.clone());
        Ok(list)
    }

    fn drop_caches(&mut self) {
        self.locality = LocalityCache::default();
    }

    /* -------- lifecycle -------- */

    /// Moves every non-terminal task to `Aborted`. Running attempts give
    /// back their slot and are queued for killing on their worker.
    pub fn abort_tasks(&mut self, workers: &mut HashMap<WorkerId, WorkerSchedState>) -> usize {
        let job_id = self.id;
        let mut aborted = 0;
        for stage in &mut self.stages {
            for task in &mut stage.tasks {
                if task.state > TaskState::Running {
                    continue;
                }
                if task.state == TaskState::Running {
                    if let Some(worker) = task.assigned_worker.as_deref() {
                        if let Some(ws) = workers.get_mut(worker) {
                            ws.release();
                            ws.kills.push(AttemptRef {
                                job_id,
                                task_id: task.id.clone(),
                                attempt: task.attempts,
                            });
                        }
                    }
                }
                task.state = TaskState::Aborted;
                aborted += 1;
            }
            stage.unscheduled = 0;
        }
        aborted
    }

    /// Marks the attempt finished. Returns `false` for stale reports.
    fn complete_attempt(
        &mut self,
        task_id: &str,
        attempt: u32,
        worker: &str,
        workers: &mut HashMap<WorkerId, WorkerSchedState>,
    ) -> bool {
        let Some((s, t)) = self.locate(task_id) else {
            return false;
        };
        let task = &mut self.stages[s].tasks[t];
        if !task.is_current_attempt(attempt, worker) {
            return false;
        }

        task.state = TaskState::Finished;
        task.successful_attempt = Some(attempt);
        if let Some(ws) = workers.get_mut(worker) {
            ws.release();
        }

        let stage = &mut self.stages[s];
        stage.finished += 1;
        if !stage.is_finished() {
            return true;
        }

        info!("job {}: stage {} ({}) finished", self.id, s, stage.name);
        for d in stage.downstream.clone() {
            let deps_done = self.stages[d]
                .depends_on
                .iter()
                .all(|&u| self.stages[u].is_finished());
            if deps_done && !self.stages[d].ready {
                self.stages[d].ready = true;
                debug!("job {}: stage {} is ready for scheduling", self.id, d);
            }
        }

        if self.stages.iter().all(StageEntry::is_finished) {
            self.status = JobStatus::Finished;
            self.finished_at = Some(Utc::now());
            info!("job {} finished", self.id);
        }
        true
    }

    /// Records a failed attempt and either puts the task back in the pool or,
    /// once its attempts are used up, fails the job.
    fn fail_attempt(
        &mut self,
        task_id: &str,
        attempt: u32,
        worker: &str,
        cause: &str,
        workers: &mut HashMap<WorkerId, WorkerSchedState>,
    ) -> bool {
        let Some((s, t)) = self.locate(task_id) else {
            return false;
        };
        let max_attempts = self.spec.config.max_task_attempts;
        let task = &mut self.stages[s].tasks[t];
        if !task.is_current_attempt(attempt, worker) {
            return false;
        }

        if let Some(ws) = workers.get_mut(worker) {
            ws.release();
        }
        task.bad_workers.insert(worker.to_string());
        task.last_failure = Some((worker.to_string(), cause.to_string()));
        task.assigned_worker = None;
        task.data_distance = None;
        self.failed_attempts += 1;

        if task.attempts >= max_attempts {
            task.state = TaskState::Failed;
            let reason = format!(
                "task {} failed on worker {}: {} (attempt {}/{})",
                task.id, worker, cause, task.attempts, max_attempts
            );
            warn!("job {} failed: {}", self.id, reason);
            self.failure = Some(reason);
            self.status = JobStatus::Failed;
            self.finished_at = Some(Utc::now());
            self.abort_tasks(workers);
        } else {
            task.state = TaskState::Unscheduled;
            warn!(
                "task {} of job {} failed on worker {} (attempt {}/{}): {}",
                task.id, self.id, worker, task.attempts, max_attempts, cause
            );
            self.stages[s].unscheduled += 1;
        }
        true
    }

    pub fn info(&self) -> JobInfo {
        let stages: Vec<StageInfo> = self
            .stages
            .iter()
            .map(|s| StageInfo {
                name: s.name.clone(),
                ready: s.ready,
                total_tasks: s.tasks.len() as u32,
                unscheduled: s.unscheduled as u32,
                running: s
                    .tasks
                    .iter()
                    .filter(|t| t.state == TaskState::Running)
                    .count() as u32,
                finished: s.finished as u32,
            })
            .collect();

        JobInfo {
            id: self.id,
            name: self.spec.name.clone(),
            status: self.status,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
            total_tasks: self.spec.total_tasks() as u32,
            completed_tasks: stages.iter().map(|s| s.finished).sum(),
            failed_attempts: self.failed_attempts,
            failure: self.failure.clone(),
            stages,
        }
    }
}

/* ---------------- workers ---------------- */

/// Scheduler-owned part of a worker's record.
#[derive(Debug, Default)]
pub struct WorkerSchedState {
    pub capacity: u32,
    /// Assigned attempts that have not finished yet.
    pub assigned: u32,
    pub launches: VecDeque<TaskLaunch>,
    pub kills: Vec<AttemptRef>,
}

impl WorkerSchedState {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.assigned)
    }

    fn release(&mut self) {
        self.assigned = self.assigned.saturating_sub(1);
    }
}

/// Informational record of one placement made by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub stage: usize,
    pub task: usize,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub data_distance: Option<u8>,
}

/// One worker's view of one job, alive for a single scheduler step.
pub struct WorkerJobView<'a> {
    worker: &'a WorkerInfo,
    slots: &'a mut WorkerSchedState,
    job: &'a mut JobEntry,
    fs: &'a dyn FileSystem,
    registry: &'a WorkerRegistry,
}

impl<'a> WorkerJobView<'a> {
    pub fn new(
        worker: &'a WorkerInfo,
        slots: &'a mut WorkerSchedState,
        job: &'a mut JobEntry,
        fs: &'a dyn FileSystem,
        registry: &'a WorkerRegistry,
    ) -> Self {
        Self {
            worker,
            slots,
            job,
            fs,
            registry,
        }
    }

    pub fn available_slots(&self) -> u32 {
        self.slots.available()
    }

    /// Host-local tasks of `stage` this worker could still take.
    pub fn local_task_count(&mut self, stage: usize) -> Result<usize> {
        let list = self.job.host_task_list(&self.worker.host, stage, self.fs)?;
        let tasks = &self.job.stages[stage].tasks;
        Ok(list
            .iter()
            .filter(|&&t| tasks[t].is_schedulable_on(self.worker))
            .count())
    }

    /// First task of the list selected by `distance` that is unassigned and
    /// has not blacklisted this worker.
    pub fn find_data_input_task_to_schedule(
        &mut self,
        stage: usize,
        distance: u8,
    ) -> Result<Option<usize>> {
        let list = match distance {
            DISTANCE_LOCAL => Some(self.job.host_task_list(&self.worker.host, stage, self.fs)?),
            DISTANCE_RACK => Some(self.job.rack_task_list(
                &self.worker.rack,
                stage,
                self.fs,
                self.registry,
            )?),
            _ => None,
        };

        let tasks = &self.job.stages[stage].tasks;
        let found = match list {
            Some(list) => list
                .iter()
                .copied()
                .find(|&t| tasks[t].is_schedulable_on(self.worker)),
            None => (0..tasks.len()).find(|&t| tasks[t].is_schedulable_on(self.worker)),
        };
        Ok(found)
    }

    /// Starts a new attempt of the task on this worker and queues its launch.
    pub fn assign_task(&mut self, stage: usize, task: usize, distance: Option<u8>) -> Assignment {
        let job_id = self.job.id;
        let stage_entry = &mut self.job.stages[stage];
        let entry = &mut stage_entry.tasks[task];
        debug_assert!(entry.is_schedulable_on(self.worker));
        debug_assert!(self.slots.available() > 0);

        entry.state = TaskState::Running;
        entry.assigned_worker = Some(self.worker.id.clone());
        entry.attempts += 1;
        entry.started_at = Some(Utc::now());
        if distance.is_some() {
            entry.data_distance = distance;
        }
        stage_entry.unscheduled -= 1;
        self.slots.assigned += 1;

        let attempt = AttemptRef {
            job_id,
            task_id: entry.id.clone(),
            attempt: entry.attempts,
        };
        self.slots.launches.push_back(TaskLaunch {
            attempt: attempt.clone(),
            stage,
            input_path: entry.spec.input_path.clone(),
            data_distance: entry.data_distance,
        });

        Assignment {
            job_id,
            task_id: attempt.task_id,
            stage,
            task,
            worker_id: self.worker.id.clone(),
            attempt: attempt.attempt,
            data_distance: entry.data_distance,
        }
    }
}

/* ---------------- the guarded state ---------------- */

pub struct SchedulerState {
    /// Active jobs in submission order.
    pub jobs: Vec<JobEntry>,
    pub workers: HashMap<WorkerId, WorkerSchedState>,
    pub fs: Arc<dyn FileSystem>,
    archived: HashMap<JobId, JobInfo>,
}

impl SchedulerState {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            jobs: Vec::new(),
            workers: HashMap::new(),
            fs,
            archived: HashMap::new(),
        }
    }

    pub fn add_worker(&mut self, id: WorkerId, capacity: u32) {
        self.workers.insert(id, WorkerSchedState::new(capacity));
    }

    /// Rejects the job with `NotFound` when a data-input task names a file
    /// the file system does not know; the lookups stay in the job's memo.
    pub fn submit_job(&mut self, spec: JobSpec) -> Result<JobInfo> {
        let mut entry = JobEntry::new(uuid::Uuid::new_v4(), spec)?;
        let inputs: Vec<String> = entry
            .stages
            .iter()
            .filter(|s| s.data_input)
            .flat_map(|s| s.tasks.iter().filter_map(|t| t.spec.input_path.clone()))
            .collect();
        for path in &inputs {
            entry.file_info(path, &*self.fs)?;
        }

        let info = entry.info();
        info!(
            "job {} ({}) submitted with {} stages / {} tasks",
            entry.id,
            entry.spec.name,
            entry.stages.len(),
            info.total_tasks
        );
        self.jobs.push(entry);
        Ok(info)
    }

    pub fn job_info(&self, id: &JobId) -> Option<JobInfo> {
        self.jobs
            .iter()
            .find(|j| &j.id == id)
            .map(JobEntry::info)
            .or_else(|| self.archived.get(id).cloned())
    }

    pub fn job(&self, id: &JobId) -> Option<&JobEntry> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn abort_job(&mut self, id: &JobId) -> Result<JobInfo> {
        let idx = self
            .jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::NotFound(format!("active job {id}")))?;

        let job = &mut self.jobs[idx];
        let aborted = job.abort_tasks(&mut self.workers);
        job.status = JobStatus::Aborted;
        job.finished_at = Some(Utc::now());
        info!("job {} aborted ({} tasks)", id, aborted);
        Ok(self.archive(idx))
    }

    pub fn complete_attempt(&mut self, attempt: &AttemptRef, worker: &str) -> bool {
        let Some(idx) = self.jobs.iter().position(|j| j.id == attempt.job_id) else {
            debug!("completion for inactive job {} ignored", attempt.job_id);
            return false;
        };
        let done = self.jobs[idx].complete_attempt(
            &attempt.task_id,
            attempt.attempt,
            worker,
            &mut self.workers,
        );
        if !done {
            debug!(
                "stale completion for task {} attempt {} from worker {}",
                attempt.task_id, attempt.attempt, worker
            );
        }
        if self.jobs[idx].status.is_terminal() {
            self.archive(idx);
        }
        done
    }

    pub fn fail_attempt(&mut self, attempt: &AttemptRef, worker: &str, cause: &str) -> bool {
        let Some(idx) = self.jobs.iter().position(|j| j.id == attempt.job_id) else {
            return false;
        };
        let failed = self.jobs[idx].fail_attempt(
            &attempt.task_id,
            attempt.attempt,
            worker,
            cause,
            &mut self.workers,
        );
        if self.jobs[idx].status.is_terminal() {
            self.archive(idx);
        }
        failed
    }

    /// Fails every attempt running on a worker that went away and forgets
    /// the worker's scheduler state. With `host` known, the tasks also
    /// blacklist that host.
    pub fn fail_worker(&mut self, worker: &str, host: Option<&str>, cause: &str) -> usize {
        let running: Vec<AttemptRef> = self
            .jobs
            .iter()
            .flat_map(|j| {
                j.stages.iter().flat_map(move |s| {
                    s.tasks
                        .iter()
                        .filter(|t| {
                            t.state == TaskState::Running
                                && t.assigned_worker.as_deref() == Some(worker)
                        })
                        .map(move |t| AttemptRef {
                            job_id: j.id,
                            task_id: t.id.clone(),
                            attempt: t.attempts,
                        })
                })
            })
            .collect();

        if let Some(host) = host {
            for a in &running {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == a.job_id) {
                    if let Some((s, t)) = job.locate(&a.task_id) {
                        job.stages[s].tasks[t].bad_hosts.insert(host.to_string());
                    }
                }
            }
        }

        let failed = running
            .iter()
            .filter(|a| self.fail_attempt(a, worker, cause))
            .count();
        self.workers.remove(worker);
        failed
    }

    /// Drains what the scheduler and the abort path queued for `worker`.
    pub fn take_work(&mut self, worker: &str) -> Option<TaskAssignmentResponse> {
        let ws = self.workers.get_mut(worker)?;
        Some(TaskAssignmentResponse {
            launch: ws.launches.drain(..).collect(),
            kill: std::mem::take(&mut ws.kills),
        })
    }

    fn archive(&mut self, idx: usize) -> JobInfo {
        let mut job = self.jobs.remove(idx);
        job.drop_caches();
        let info = job.info();
        self.archived.insert(job.id, info.clone());
        info
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::fs::LocalFileSystem;
    use common::{SchedulingConfig, StageSpec};

    use crate::registry::tests::register_req;

    pub(crate) fn data_stage(name: &str, hints: &[&[&str]]) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            data_input: true,
            depends_on: vec![],
            tasks: hints
                .iter()
                .map(|h| TaskSpec {
                    locality_hints: h.iter().map(|s| s.to_string()).collect(),
                    input_path: None,
                })
                .collect(),
        }
    }

    pub(crate) fn channel_stage(name: &str, tasks: usize, depends_on: Vec<usize>) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            data_input: false,
            depends_on,
            tasks: vec![TaskSpec::default(); tasks],
        }
    }

    pub(crate) fn job_spec(stages: Vec<StageSpec>) -> JobSpec {
        JobSpec {
            name: "test".to_string(),
            config: SchedulingConfig::default(),
            stages,
        }
    }

    fn state() -> SchedulerState {
        SchedulerState::new(Arc::new(LocalFileSystem::new(std::env::temp_dir())))
    }

    /// Assigns task `t` of stage `s` of the first job to `worker` by hand.
    fn assign(
        state: &mut SchedulerState,
        registry: &WorkerRegistry,
        worker: &WorkerInfo,
        s: usize,
        t: usize,
    ) -> Assignment {
        let SchedulerState { jobs, workers, fs, .. } = state;
        let slots = workers.get_mut(&worker.id).unwrap();
        WorkerJobView::new(worker, slots, &mut jobs[0], &**fs, registry).assign_task(s, t, None)
    }

    #[test]
    fn completion_is_counted_once_and_unlocks_downstream() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(20));
        let w = registry.register(register_req("h1", "r1", 2));
        let mut st = state();
        st.add_worker(w.id.clone(), 2);
        let info = st
            .submit_job(job_spec(vec![
                data_stage("map", &[&["h1"]]),
                channel_stage("reduce", 1, vec![0]),
            ]))
            .unwrap();
        assert!(!st.jobs[0].stages[1].ready);

        let a = assign(&mut st, &registry, &w, 0, 0);
        assert_eq!(st.workers[&w.id].available(), 1);
        assert_eq!(st.take_work(&w.id).unwrap().launch.len(), 1);

        let attempt = AttemptRef {
            job_id: info.id,
            task_id: a.task_id.clone(),
            attempt: a.attempt,
        };
        assert!(st.complete_attempt(&attempt, &w.id));
        assert!(!st.complete_attempt(&attempt, &w.id));
        assert_eq!(st.workers[&w.id].available(), 2);
        assert_eq!(st.jobs[0].stages[0].finished, 1);
        assert!(st.jobs[0].stages[1].ready);

        let b = assign(&mut st, &registry, &w, 1, 0);
        let attempt = AttemptRef {
            job_id: info.id,
            task_id: b.task_id,
            attempt: b.attempt,
        };
        assert!(st.complete_attempt(&attempt, &w.id));

        // finished jobs are archived and their status stays queryable
        assert!(st.jobs.is_empty());
        assert_eq!(st.job_info(&info.id).unwrap().status, JobStatus::Finished);
        assert_eq!(st.job_info(&info.id).unwrap().completed_tasks, 2);
    }

    #[test]
    fn failures_blacklist_and_exhaust_the_retry_budget() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(20));
        let w1 = registry.register(register_req("h1", "r1", 1));
        let w2 = registry.register(register_req("h2", "r1", 1));
        let mut st = state();
        st.add_worker(w1.id.clone(), 1);
        st.add_worker(w2.id.clone(), 1);

        let mut spec = job_spec(vec![data_stage("map", &[&[], &[]])]);
        spec.config.max_task_attempts = 2;
        let info = st.submit_job(spec).unwrap();

        let a = assign(&mut st, &registry, &w1, 0, 0);
        let attempt = AttemptRef {
            job_id: info.id,
            task_id: a.task_id.clone(),
            attempt: a.attempt,
        };
        // wrong worker is a stale report
        assert!(!st.fail_attempt(&attempt, &w2.id, "crash"));
        assert!(st.fail_attempt(&attempt, &w1.id, "crash"));

        let task = st.jobs[0].task(&a.task_id).unwrap();
        assert_eq!(task.state, TaskState::Unscheduled);
        assert!(task.bad_workers.contains(&w1.id));
        assert_eq!(st.jobs[0].stages[0].unscheduled, 2);
        assert_eq!(st.workers[&w1.id].available(), 1);

        // second task running on w1 gets aborted (and killed) when the job fails
        assign(&mut st, &registry, &w1, 0, 1);
        let b = assign(&mut st, &registry, &w2, 0, 0);
        assert_eq!(b.attempt, 2);
        let attempt = AttemptRef {
            job_id: info.id,
            task_id: b.task_id,
            attempt: b.attempt,
        };
        assert!(st.fail_attempt(&attempt, &w2.id, "disk full"));

        let job = st.job_info(&info.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_attempts, 2);
        let reason = job.failure.unwrap();
        assert!(reason.contains(&w2.id) && reason.contains("disk full"));

        assert_eq!(st.workers[&w1.id].available(), 1);
        assert_eq!(st.take_work(&w1.id).unwrap().kill.len(), 1);
    }

    #[test]
    fn abort_releases_slots_and_queues_kills() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(20));
        let w = registry.register(register_req("h1", "r1", 3));
        let mut st = state();
        st.add_worker(w.id.clone(), 3);
        let info = st
            .submit_job(job_spec(vec![data_stage("map", &[&[], &[], &[]])]))
            .unwrap();

        assign(&mut st, &registry, &w, 0, 0);
        assign(&mut st, &registry, &w, 0, 2);
        assert_eq!(st.workers[&w.id].available(), 1);

        let job = st.abort_job(&info.id).unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
        assert_eq!(job.stages[0].unscheduled, 0);
        assert_eq!(st.workers[&w.id].available(), 3);

        let work = st.take_work(&w.id).unwrap();
        assert_eq!(work.kill.len(), 2);
        assert!(matches!(st.abort_job(&info.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn dead_worker_attempts_go_back_to_the_pool() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(20));
        let w = registry.register(register_req("h1", "r1", 2));
        let mut st = state();
        st.add_worker(w.id.clone(), 2);
        st.submit_job(job_spec(vec![data_stage("map", &[&[], &[]])]))
            .unwrap();

        assign(&mut st, &registry, &w, 0, 0);
        assign(&mut st, &registry, &w, 0, 1);

        assert_eq!(st.fail_worker(&w.id, Some(&w.host), "heartbeat timeout"), 2);
        assert!(!st.workers.contains_key(&w.id));
        let stage = &st.jobs[0].stages[0];
        assert_eq!(stage.unscheduled, 2);
        assert!(stage.tasks.iter().all(|t| t.bad_workers.contains(&w.id)));

        // the same machine coming back under a fresh id is still excluded
        let again = registry.register(register_req("h1", "r1", 2));
        assert_ne!(again.id, w.id);
        let other = registry.register(register_req("h2", "r1", 2));
        assert!(stage.tasks.iter().all(|t| !t.is_schedulable_on(&again)));
        assert!(stage.tasks.iter().all(|t| t.is_schedulable_on(&other)));
    }

    #[test]
    fn submission_with_a_missing_input_file_is_rejected() {
        let mut st = state();
        let mut stage = data_stage("map", &[&[], &[]]);
        stage.tasks[1].input_path = Some(format!("no-such-input-{}", uuid::Uuid::new_v4()));

        let err = st.submit_job(job_spec(vec![stage])).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(st.jobs.is_empty());
    }

    #[test]
    fn submission_warms_the_file_info_memo() {
        let mut st = SchedulerState::new(Arc::new(CountingFs {
            calls: Default::default(),
        }));
        let mut stage = data_stage("map", &[&[], &[]]);
        stage.tasks[0].input_path = Some("/in/part-0".to_string());
        stage.tasks[1].input_path = Some("/in/part-0".to_string());
        st.submit_job(job_spec(vec![stage])).unwrap();

        let fs = CountingFs {
            calls: Default::default(),
        };
        assert_eq!(st.jobs[0].file_info("/in/part-0", &fs).unwrap().hosts, vec!["h2"]);
        assert_eq!(fs.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    struct CountingFs {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FileSystem for CountingFs {
        fn open_file(&self, path: &str) -> Result<Box<dyn std::io::Read + Send>> {
            Err(Error::NotFound(path.to_string()))
        }
        fn create_file(&self, path: &str) -> Result<Box<dyn std::io::Write + Send>> {
            Err(Error::NotFound(path.to_string()))
        }
        fn move_file(&self, from: &str, _to: &str) -> Result<()> {
            Err(Error::NotFound(from.to_string()))
        }
        fn get_file_info(&self, path: &str) -> Result<FileInfo> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(FileInfo {
                path: path.to_string(),
                size: 64,
                hosts: vec!["h2".to_string()],
            })
        }
    }

    #[test]
    fn file_info_and_locality_lists_are_memoized() {
        let registry = WorkerRegistry::new(std::time::Duration::from_secs(20));
        registry.register(register_req("h1", "r1", 1));
        registry.register(register_req("h2", "r2", 1));
        let fs = CountingFs {
            calls: Default::default(),
        };

        let mut stage = data_stage("map", &[&["h1"], &[], &[]]);
        stage.tasks[1].input_path = Some("/in/part-1".to_string());
        stage.tasks[2].input_path = Some("/in/part-1".to_string());
        let mut job = JobEntry::new(uuid::Uuid::new_v4(), job_spec(vec![stage])).unwrap();

        assert_eq!(*job.host_task_list("h1", 0, &fs).unwrap(), vec![0]);
        assert_eq!(*job.host_task_list("h2", 0, &fs).unwrap(), vec![1, 2]);
        assert_eq!(*job.rack_task_list("r2", 0, &fs, &registry).unwrap(), vec![1, 2]);
        assert_eq!(*job.rack_task_list("r1", 0, &fs, &registry).unwrap(), vec![0]);
        assert_eq!(fs.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        job.file_info("/in/part-1", &fs).unwrap();
        assert_eq!(fs.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
