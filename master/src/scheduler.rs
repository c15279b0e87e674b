// master/src/scheduler.rs

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::fs::FileSystem;
use common::task::{locality_label, DISTANCE_RACK, DISTANCE_REMOTE};
use common::{LocalityMode, Result, WorkerId};

use crate::coordination::{Assignment, JobEntry, SchedulerState, WorkerJobView, WorkerSchedState};
use crate::registry::{WorkerInfo, WorkerRegistry};
use crate::state::Coordinator;

/// One scheduling pass over the active jobs.
///
/// Implementations mutate the coordination state they are handed and return
/// the placements they made, for logging and tests. Assignments committed
/// before a cancellation or an error stand.
pub trait TaskScheduler: Send + Sync {
    fn schedule_tasks(
        &self,
        state: &mut SchedulerState,
        registry: &WorkerRegistry,
        cancel: &CancellationToken,
    ) -> Result<Vec<Assignment>>;
}

/// Locality-tiered, FIFO-across-jobs scheduler.
#[derive(Debug, Default)]
pub struct DefaultScheduler;

/// Heap entry for a candidate worker. Larger `primary`, then larger
/// `secondary`, then earlier registration wins.
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    primary: i64,
    secondary: i64,
    seq: u64,
    idx: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.primary
            .cmp(&other.primary)
            .then(self.secondary.cmp(&other.secondary))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn slots_key(mode: LocalityMode, slots: u32) -> i64 {
    match mode {
        LocalityMode::FewerServers => -(slots as i64),
        LocalityMode::Spreading | LocalityMode::OptimalLocality => slots as i64,
    }
}

fn cluster_available(workers: &[Arc<WorkerInfo>], sched: &HashMap<WorkerId, WorkerSchedState>) -> u32 {
    workers
        .iter()
        .filter_map(|w| sched.get(&w.id))
        .map(WorkerSchedState::available)
        .sum()
}

/// Everything a stage pass needs besides the job itself.
struct PassContext<'a> {
    workers: &'a [Arc<WorkerInfo>],
    fs: &'a dyn FileSystem,
    registry: &'a WorkerRegistry,
    multi_rack: bool,
    cancel: &'a CancellationToken,
}

impl DefaultScheduler {
    fn candidate(
        ctx: &PassContext<'_>,
        idx: usize,
        job: &mut JobEntry,
        slots: &mut WorkerSchedState,
        stage: usize,
    ) -> Result<Candidate> {
        let worker = &ctx.workers[idx];
        let mode = job.spec.config.locality_mode;
        let available = slots.available();
        let (primary, secondary) = match mode {
            LocalityMode::OptimalLocality => {
                let local = WorkerJobView::new(worker, slots, job, ctx.fs, ctx.registry)
                    .local_task_count(stage)?;
                (local as i64, available as i64)
            }
            _ => (slots_key(mode, available), 0),
        };
        Ok(Candidate {
            primary,
            secondary,
            seq: worker.seq,
            idx,
        })
    }

    /// Places tasks of a data-input stage tier by tier: host-local first,
    /// then rack-local, then anywhere.
    fn schedule_data_input_stage(
        ctx: &PassContext<'_>,
        job: &mut JobEntry,
        sched: &mut HashMap<WorkerId, WorkerSchedState>,
        stage: usize,
        out: &mut Vec<Assignment>,
    ) -> Result<()> {
        let max_distance = job.spec.config.max_data_distance.min(DISTANCE_REMOTE);

        for distance in 0..=max_distance {
            if distance == DISTANCE_RACK && !ctx.multi_rack {
                continue;
            }
            if job.stages[stage].unscheduled == 0 || cluster_available(ctx.workers, sched) == 0 {
                break;
            }

            // Under OptimalLocality a key is computed when its worker is
            // pushed and is not refreshed when another worker takes one of
            // its local tasks. A stale key only reorders workers inside the
            // tier: a worker whose local tasks are gone finds nothing here
            // and is dropped.
            let mut heap = BinaryHeap::new();
            for (idx, worker) in ctx.workers.iter().enumerate() {
                let Some(slots) = sched.get_mut(&worker.id) else {
                    continue;
                };
                if slots.available() > 0 {
                    heap.push(Self::candidate(ctx, idx, job, slots, stage)?);
                }
            }

            while let Some(best) = heap.pop() {
                if ctx.cancel.is_cancelled() || job.stages[stage].unscheduled == 0 {
                    return Ok(());
                }

                let worker = &ctx.workers[best.idx];
                let Some(slots) = sched.get_mut(&worker.id) else {
                    continue;
                };
                let mut view = WorkerJobView::new(worker, slots, job, ctx.fs, ctx.registry);
                let Some(task) = view.find_data_input_task_to_schedule(stage, distance)? else {
                    // nothing left for this worker at this tier
                    continue;
                };

                let assignment = view.assign_task(stage, task, Some(distance));
                let still_free = view.available_slots() > 0;
                log_assignment(worker, &assignment);
                out.push(assignment);

                if still_free {
                    heap.push(Self::candidate(ctx, best.idx, job, slots, stage)?);
                }
            }
        }
        Ok(())
    }

    /// Channel-only stages ignore locality: workers are ranked by free
    /// slots and each takes the first task that has not blacklisted it.
    fn schedule_channel_stage(
        ctx: &PassContext<'_>,
        job: &mut JobEntry,
        sched: &mut HashMap<WorkerId, WorkerSchedState>,
        stage: usize,
        out: &mut Vec<Assignment>,
    ) {
        let mode = job.spec.config.locality_mode;

        // reversed so the lowest task index sits at the end
        let mut pending: Vec<usize> = job.stages[stage]
            .tasks
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, t)| t.state == common::TaskState::Unscheduled && t.assigned_worker.is_none())
            .map(|(i, _)| i)
            .collect();

        let mut heap: BinaryHeap<Candidate> = ctx
            .workers
            .iter()
            .enumerate()
            .filter_map(|(idx, w)| {
                let available = sched.get(&w.id)?.available();
                (available > 0).then(|| Candidate {
                    primary: slots_key(mode, available),
                    secondary: 0,
                    seq: w.seq,
                    idx,
                })
            })
            .collect();

        while !pending.is_empty() {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let Some(best) = heap.pop() else {
                break;
            };

            let worker = &ctx.workers[best.idx];
            let Some(slots) = sched.get_mut(&worker.id) else {
                continue;
            };
            let tasks = &job.stages[stage].tasks;
            let Some(pos) = pending
                .iter()
                .rposition(|&t| !tasks[t].is_blacklisted(worker))
            else {
                continue;
            };
            let task = pending.swap_remove(pos);

            let mut view = WorkerJobView::new(worker, slots, job, ctx.fs, ctx.registry);
            let assignment = view.assign_task(stage, task, None);
            let available = view.available_slots();
            log_assignment(worker, &assignment);
            out.push(assignment);

            if available > 0 {
                heap.push(Candidate {
                    primary: slots_key(mode, available),
                    secondary: 0,
                    seq: worker.seq,
                    idx: best.idx,
                });
            }
        }
    }
}

fn log_assignment(worker: &WorkerInfo, a: &Assignment) {
    info!(
        "assigning task {} (job={}, attempt={}) to worker {} on {} [{}]",
        a.task_id,
        a.job_id,
        a.attempt,
        a.worker_id,
        worker.host,
        locality_label(a.data_distance)
    );
}

impl TaskScheduler for DefaultScheduler {
    fn schedule_tasks(
        &self,
        state: &mut SchedulerState,
        registry: &WorkerRegistry,
        cancel: &CancellationToken,
    ) -> Result<Vec<Assignment>> {
        let workers = registry.active_workers();
        let mut out = Vec::new();

        let SchedulerState {
            jobs,
            workers: sched,
            fs,
            ..
        } = state;
        let ctx = PassContext {
            workers: &workers,
            fs: &**fs,
            registry,
            multi_rack: WorkerRegistry::distinct_racks(&workers) > 1,
            cancel,
        };

        for job in jobs.iter_mut() {
            if cancel.is_cancelled() {
                debug!("scheduling pass cancelled after {} assignments", out.len());
                return Ok(out);
            }
            if job.status.is_terminal() {
                continue;
            }

            for stage in 0..job.stages.len() {
                if cancel.is_cancelled() {
                    return Ok(out);
                }
                if !job.stages[stage].is_ready_for_scheduling() {
                    continue;
                }
                if job.stages[stage].data_input {
                    Self::schedule_data_input_stage(&ctx, job, sched, stage, &mut out)?;
                } else {
                    Self::schedule_channel_stage(&ctx, job, sched, stage, &mut out);
                }
            }

            // Later jobs wait for the next pass once the cluster is full.
            // This only looks at free slots, not at whether a later job
            // could use them.
            if cluster_available(&workers, sched) == 0 {
                if job.unscheduled_tasks() > 0 {
                    debug!(
                        "cluster full while job {} still has {} unscheduled tasks",
                        job.id,
                        job.unscheduled_tasks()
                    );
                }
                break;
            }
        }

        Ok(out)
    }
}

/// Runs one pass at a time on the blocking pool, every `interval`, until
/// `shutdown` fires.
pub async fn run_scheduler_loop(
    coordinator: Arc<Coordinator>,
    scheduler: Arc<dyn TaskScheduler>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let coordinator = coordinator.clone();
        let scheduler = scheduler.clone();
        let cancel = shutdown.child_token();
        let pass = tokio::task::spawn_blocking(move || {
            coordinator.run_scheduling_pass(scheduler.as_ref(), &cancel)
        });

        match pass.await {
            Ok(Ok(assigned)) if !assigned.is_empty() => {
                debug!("scheduling pass assigned {} tasks", assigned.len());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("scheduling pass aborted: {}", e),
            Err(e) => warn!("scheduling pass panicked: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::fs::LocalFileSystem;
    use common::{AttemptRef, JobId, JobSpec, TaskState};

    use crate::coordination::tests::{channel_stage, data_stage, job_spec};
    use crate::registry::tests::register_req;

    struct Cluster {
        registry: WorkerRegistry,
        state: SchedulerState,
        ids: Vec<WorkerId>,
    }

    impl Cluster {
        /// Workers `(host, rack, capacity)` registered in order.
        fn new(workers: &[(&str, &str, u32)]) -> Self {
            let registry = WorkerRegistry::new(Duration::from_secs(60));
            let mut state = SchedulerState::new(Arc::new(LocalFileSystem::new(std::env::temp_dir())));
            let mut ids = Vec::new();
            for (host, rack, cap) in workers {
                let w = registry.register(register_req(host, rack, *cap));
                state.add_worker(w.id.clone(), *cap);
                ids.push(w.id.clone());
            }
            Self {
                registry,
                state,
                ids,
            }
        }

        fn submit(&mut self, spec: JobSpec) -> JobId {
            self.state.submit_job(spec).unwrap().id
        }

        fn pass(&mut self) -> Vec<Assignment> {
            DefaultScheduler
                .schedule_tasks(&mut self.state, &self.registry, &CancellationToken::new())
                .unwrap()
        }

        fn assigned(&self, worker: usize) -> u32 {
            self.state.workers[&self.ids[worker]].assigned
        }

        fn assert_within_capacity(&self) {
            for id in &self.ids {
                let ws = &self.state.workers[id];
                assert!(ws.assigned <= ws.capacity, "worker {id} over capacity");
            }
        }
    }

    fn with_mode(mut spec: JobSpec, mode: LocalityMode) -> JobSpec {
        spec.config.locality_mode = mode;
        spec
    }

    #[test]
    fn optimal_locality_places_local_task_first_and_fills_capacity() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 2), ("h3", "r1", 1)]);
        c.submit(with_mode(
            job_spec(vec![data_stage("map", &[&["h1"], &[], &[], &[]])]),
            LocalityMode::OptimalLocality,
        ));

        let out = c.pass();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].task_id, "s0-t0");
        assert_eq!(out[0].worker_id, c.ids[0]);
        assert_eq!(out[0].data_distance, Some(0));
        assert!(out[1..].iter().all(|a| a.data_distance == Some(2)));

        c.assert_within_capacity();
        assert_eq!(c.assigned(0) + c.assigned(1) + c.assigned(2), 4);
    }

    #[test]
    fn local_workers_win_before_remote_ones() {
        let mut c = Cluster::new(&[("h1", "r1", 4), ("h2", "r1", 4), ("h3", "r1", 4)]);
        c.submit(job_spec(vec![data_stage(
            "map",
            &[&["h3"], &["h2"], &["h3"], &[]],
        )]));

        let out = c.pass();
        let by_task: HashMap<&str, &Assignment> =
            out.iter().map(|a| (a.task_id.as_str(), a)).collect();
        assert_eq!(by_task["s0-t0"].worker_id, c.ids[2]);
        assert_eq!(by_task["s0-t1"].worker_id, c.ids[1]);
        assert_eq!(by_task["s0-t2"].worker_id, c.ids[2]);
        for t in ["s0-t0", "s0-t1", "s0-t2"] {
            assert_eq!(by_task[t].data_distance, Some(0));
        }
        assert_eq!(by_task["s0-t3"].data_distance, Some(2));

        // every local placement precedes every remote one
        let first_remote = out.iter().position(|a| a.data_distance == Some(2)).unwrap();
        assert!(out[..first_remote].iter().all(|a| a.data_distance == Some(0)));
    }

    #[test]
    fn rack_tier_is_used_only_with_several_racks() {
        let mut c = Cluster::new(&[("h1", "r1", 1), ("h2", "r2", 1), ("h3", "r2", 1)]);
        c.submit(job_spec(vec![data_stage("map", &[&["h3"], &["h3"]])]));

        let out = c.pass();
        let rack_local: Vec<_> = out
            .iter()
            .filter(|a| a.data_distance == Some(1))
            .collect();
        assert_eq!(rack_local.len(), 1);
        assert_eq!(rack_local[0].worker_id, c.ids[1]);
        assert!(out
            .iter()
            .any(|a| a.worker_id == c.ids[2] && a.data_distance == Some(0)));

        let mut single = Cluster::new(&[("h1", "r1", 1), ("h2", "r1", 1)]);
        single.submit(job_spec(vec![data_stage("map", &[&["h9"], &["h9"]])]));
        assert!(single.pass().iter().all(|a| a.data_distance == Some(2)));
    }

    #[test]
    fn max_data_distance_caps_the_tiers() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 2)]);
        let mut spec = job_spec(vec![data_stage("map", &[&["h1"], &["h9"]])]);
        spec.config.max_data_distance = 0;
        c.submit(spec);

        let out = c.pass();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].task_id, "s0-t0");
        assert_eq!(c.state.jobs[0].stages[0].unscheduled, 1);
    }

    #[test]
    fn stale_locality_keys_still_place_every_task_locally() {
        // h2 goes first with three local tasks and takes s0-t0, which h1
        // also counted; h1 then pops with its old key and takes s0-t1.
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 2)]);
        c.submit(with_mode(
            job_spec(vec![data_stage(
                "map",
                &[&["h1", "h2"], &["h1", "h2"], &["h2"]],
            )]),
            LocalityMode::OptimalLocality,
        ));

        let out = c.pass();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|a| a.data_distance == Some(0)));
        let by_task: HashMap<&str, &WorkerId> =
            out.iter().map(|a| (a.task_id.as_str(), &a.worker_id)).collect();
        assert_eq!(by_task["s0-t0"], &c.ids[1]);
        assert_eq!(by_task["s0-t1"], &c.ids[0]);
        assert_eq!(by_task["s0-t2"], &c.ids[1]);
        c.assert_within_capacity();
    }

    #[test]
    fn job_with_missing_input_is_rejected_and_others_still_run() {
        let mut c = Cluster::new(&[("h1", "r1", 2)]);
        let mut bad = data_stage("map", &[&[]]);
        bad.tasks[0].input_path = Some(format!("missing-{}/part-0", uuid::Uuid::new_v4()));
        let err = c.state.submit_job(job_spec(vec![bad])).unwrap_err();
        assert!(matches!(err, common::Error::NotFound(_)));

        let good = c.submit(job_spec(vec![data_stage("map", &[&[], &[]])]));
        let out = c.pass();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.job_id == good));
    }

    #[test]
    fn spreading_and_packing_modes_rank_workers_by_slots() {
        let mut spread = Cluster::new(&[("h1", "r1", 3), ("h2", "r1", 3)]);
        spread.submit(job_spec(vec![data_stage("map", &[&[], &[]])]));
        spread.pass();
        assert_eq!((spread.assigned(0), spread.assigned(1)), (1, 1));

        let mut pack = Cluster::new(&[("h1", "r1", 3), ("h2", "r1", 3)]);
        pack.submit(with_mode(
            job_spec(vec![data_stage("map", &[&[], &[]])]),
            LocalityMode::FewerServers,
        ));
        pack.pass();
        assert_eq!((pack.assigned(0), pack.assigned(1)), (2, 0));
    }

    #[test]
    fn second_pass_without_changes_assigns_nothing() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 1)]);
        c.submit(job_spec(vec![data_stage("map", &[&["h1"], &[], &[], &[], &[]])]));

        assert_eq!(c.pass().len(), 3);
        assert!(c.pass().is_empty());
        c.assert_within_capacity();
    }

    #[test]
    fn earlier_job_exhausting_capacity_blocks_later_jobs() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 1)]);
        let first = c.submit(job_spec(vec![data_stage("map", &[&[], &[], &[], &[]])]));
        let second = c.submit(job_spec(vec![data_stage("map", &[&["h1"]])]));

        let out = c.pass();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|a| a.job_id == first));
        assert!(out.iter().all(|a| a.job_id != second));
    }

    #[test]
    fn later_jobs_run_when_capacity_remains() {
        let mut c = Cluster::new(&[("h1", "r1", 4)]);
        let first = c.submit(job_spec(vec![data_stage("map", &[&[]])]));
        let second = c.submit(job_spec(vec![data_stage("map", &[&[], &[]])]));

        let out = c.pass();
        assert_eq!(out.iter().filter(|a| a.job_id == first).count(), 1);
        assert_eq!(out.iter().filter(|a| a.job_id == second).count(), 2);
    }

    #[test]
    fn failed_worker_is_never_reused_for_that_task() {
        let mut c = Cluster::new(&[("h1", "r1", 1)]);
        let job = c.submit(job_spec(vec![data_stage("map", &[&["h1"]])]));

        let a = c.pass().remove(0);
        let attempt = AttemptRef {
            job_id: job,
            task_id: a.task_id.clone(),
            attempt: a.attempt,
        };
        assert!(c.state.fail_attempt(&attempt, &c.ids[0], "exit code 1"));

        // only candidate is blacklisted: the task waits
        assert!(c.pass().is_empty());
        assert!(c.pass().is_empty());
        let task = c.state.jobs[0].task("s0-t0").unwrap();
        assert_eq!(task.state, TaskState::Unscheduled);

        // a new worker picks it up
        let w2 = c.registry.register(register_req("h2", "r1", 1));
        c.state.add_worker(w2.id.clone(), 1);
        let out = c.pass();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].worker_id, w2.id);
        assert_eq!(out[0].attempt, 2);
    }

    #[test]
    fn channel_stages_wait_for_upstream_and_skip_bad_workers() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 2)]);
        let job = c.submit(job_spec(vec![
            data_stage("map", &[&[]]),
            channel_stage("reduce", 2, vec![0]),
        ]));

        let map = c.pass();
        assert_eq!(map.len(), 1);
        assert!(c.pass().is_empty());

        let done = AttemptRef {
            job_id: job,
            task_id: map[0].task_id.clone(),
            attempt: map[0].attempt,
        };
        assert!(c.state.complete_attempt(&done, &map[0].worker_id));

        let reduce = c.pass();
        assert_eq!(reduce.len(), 2);
        assert!(reduce.iter().all(|a| a.stage == 1 && a.data_distance.is_none()));
        // spreading: one reduce task per worker, lowest index first
        assert_eq!(reduce[0].task_id, "s1-t0");
        assert_ne!(reduce[0].worker_id, reduce[1].worker_id);

        // fail s1-t0 on its worker; it must move to the other one
        let bad = reduce[0].worker_id.clone();
        let failed = AttemptRef {
            job_id: job,
            task_id: reduce[0].task_id.clone(),
            attempt: reduce[0].attempt,
        };
        assert!(c.state.fail_attempt(&failed, &bad, "shuffle fetch failed"));
        let retry = c.pass();
        assert_eq!(retry.len(), 1);
        assert_ne!(retry[0].worker_id, bad);
        c.assert_within_capacity();
    }

    #[test]
    fn cancelled_pass_commits_nothing_more() {
        let mut c = Cluster::new(&[("h1", "r1", 4)]);
        c.submit(job_spec(vec![data_stage("map", &[&[], &[]])]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = DefaultScheduler
            .schedule_tasks(&mut c.state, &c.registry, &cancel)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(c.state.jobs[0].stages[0].unscheduled, 2);
        assert_eq!(c.assigned(0), 0);
    }

    #[test]
    fn dead_workers_are_not_candidates() {
        let mut c = Cluster::new(&[("h1", "r1", 2), ("h2", "r1", 2)]);
        c.registry.get(&c.ids[0]).unwrap().mark_dead();
        c.submit(job_spec(vec![data_stage("map", &[&["h1"], &["h1"]])]));

        let out = c.pass();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.worker_id == c.ids[1]));
    }
}
