use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{AttemptRef, TaskLaunch, WorkerId, WorkerRegisterRequest};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::index_cache::PartitionFileIndexCache;
use crate::master_client::{MasterClient, Poll};
use crate::shuffle_server::ShuffleServer;
use crate::supervisor::{now_ms, task_args, RunningTask};

const REGISTER_RETRY: Duration = Duration::from_secs(2);
/// How long a launch waits for a slot held by an attempt that is being
/// killed before it is refused.
const SLOT_WAIT: Duration = Duration::from_secs(10);

/// Task server:
/// - registers with the job server and keeps heartbeating
/// - polls for launches and kill orders
/// - supervises one process per attempt and reports how it ended
/// - serves finished channel output over the shuffle port
pub struct TaskServer {
    config: WorkerConfig,
    master: MasterClient,
    registration: WorkerRegisterRequest,
    worker_id: Mutex<WorkerId>,
    running: DashMap<AttemptRef, Arc<RunningTask>>,
    slots: Arc<Semaphore>,
}

pub fn registration_request(config: &WorkerConfig, hostname: String, shuffle_port: u16) -> WorkerRegisterRequest {
    WorkerRegisterRequest {
        shuffle_addr: format!("{hostname}:{shuffle_port}"),
        hostname,
        rack: config.rack.clone(),
        max_concurrency: config.max_concurrency,
    }
}

pub async fn run(config: WorkerConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    // shuffle port first: its address goes into the registration
    let listener = TcpListener::bind(&config.shuffle_bind).await?;
    let shuffle_port = listener.local_addr()?.port();
    let cache = Arc::new(PartitionFileIndexCache::new(config.index_cache_size));
    let shuffle = Arc::new(ShuffleServer::new(
        config.data_dir.clone(),
        cache,
        config.shuffle_max_connections,
    ));
    tokio::spawn(shuffle.serve(listener, shutdown.clone()));

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let registration = registration_request(&config, hostname, shuffle_port);
    let master = MasterClient::new(config.master_base_url.clone());
    let worker_id = register_until_accepted(&master, &registration, &shutdown).await?;

    let server = Arc::new(TaskServer::new(config, master, registration, worker_id));

    tokio::spawn(server.clone().heartbeat_loop(shutdown.clone()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        ctrl_c.cancel();
    });

    server.poll_loop(&shutdown).await;
    server.dispose_all("worker shutting down");
    Ok(())
}

async fn register_until_accepted(
    master: &MasterClient,
    registration: &WorkerRegisterRequest,
    shutdown: &CancellationToken,
) -> Result<WorkerId> {
    loop {
        match master.register(registration).await {
            Ok(id) => {
                info!(
                    "worker {} registered with concurrency={} rack={} against {}",
                    id,
                    registration.max_concurrency,
                    registration.rack,
                    master.base_url()
                );
                return Ok(id);
            }
            Err(e) => warn!("registration failed: {:#}; retrying", e),
        }
        tokio::select! {
            _ = shutdown.cancelled() => anyhow::bail!("shut down before registering"),
            _ = sleep(REGISTER_RETRY) => {}
        }
    }
}

impl TaskServer {
    fn new(
        config: WorkerConfig,
        master: MasterClient,
        registration: WorkerRegisterRequest,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency.max(1) as usize)),
            config,
            master,
            registration,
            worker_id: Mutex::new(worker_id),
            running: DashMap::new(),
        }
    }

    fn worker_id(&self) -> WorkerId {
        self.worker_id.lock().clone()
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
            let worker_id = self.worker_id();
            match self.master.heartbeat(&worker_id, self.running.len() as u32).await {
                Ok(true) => {}
                Ok(false) => debug!("heartbeat of {} rejected", worker_id),
                Err(e) => warn!("heartbeat failed: {}", e),
            }
        }
    }

    async fn poll_loop(self: &Arc<Self>, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
            self.reap_timed_out(now_ms());

            let worker_id = self.worker_id();
            let work = match self.master.poll(&worker_id).await {
                Ok(Poll::Work(work)) => work,
                Ok(Poll::Forgotten) => {
                    // the job server already failed everything we were running
                    warn!("job server forgot worker {}; registering again", worker_id);
                    self.dispose_all("worker re-registered");
                    match register_until_accepted(&self.master, &self.registration, shutdown).await {
                        Ok(id) => *self.worker_id.lock() = id,
                        Err(_) => break,
                    }
                    continue;
                }
                Err(e) => {
                    warn!("poll failed: {}", e);
                    continue;
                }
            };

            for attempt in &work.kill {
                if let Some(task) = self.running.get(attempt) {
                    info!(
                        "killing task {} attempt {} of job {} on request",
                        attempt.task_id, attempt.attempt, attempt.job_id
                    );
                    task.kill_with_reason("killed by job server");
                }
            }
            for launch in work.launch {
                self.launch(&worker_id, launch).await;
            }
        }
    }

    async fn launch(self: &Arc<Self>, worker_id: &str, launch: TaskLaunch) {
        let attempt = launch.attempt.clone();
        if self.running.contains_key(&attempt) {
            debug!("attempt {:?} already running", attempt);
            return;
        }
        info!(
            "launching task {} attempt {} of job {} (stage={} input={:?} distance={:?})",
            attempt.task_id,
            attempt.attempt,
            attempt.job_id,
            launch.stage,
            launch.input_path,
            launch.data_distance
        );

        let Some(permit) = self.acquire_slot().await else {
            self.report(worker_id, &attempt, false, Some("worker at capacity".to_string()))
                .await;
            return;
        };

        let job_dir = self.config.data_dir.join(attempt.job_id.to_string());
        let dfs_job_dir = self.config.dfs_job_root.join(attempt.job_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            self.report(worker_id, &attempt, false, Some(format!("job directory: {e}")))
                .await;
            return;
        }

        let task = Arc::new(RunningTask::new(
            attempt.clone(),
            &self.config.task_program,
            task_args(&attempt, &job_dir, &dfs_job_dir),
        ));
        if let Err(e) = task.start() {
            self.report(worker_id, &attempt, false, Some(format!("launch failed: {e}")))
                .await;
            return;
        }
        self.running.insert(attempt, task.clone());

        let server = self.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let exit = task.wait_for_exit().await;
            server.running.remove(task.attempt());
            drop(permit);

            let (success, cause) = match exit {
                Some(exit) if exit.success() => (true, None),
                Some(exit) => (false, Some(exit.cause())),
                None => (false, Some("exit status lost".to_string())),
            };
            server.report(&worker_id, task.attempt(), success, cause).await;
        });
    }

    /// A killed attempt gives its slot back only once its process is
    /// reaped, so a launch that follows a kill in the same poll waits.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Some(permit);
        }
        debug!("all {} slots busy; waiting up to {:?}", self.config.max_concurrency, SLOT_WAIT);
        match tokio::time::timeout(SLOT_WAIT, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }

    async fn report(&self, worker_id: &str, attempt: &AttemptRef, success: bool, cause: Option<String>) {
        if success {
            info!("task {} attempt {} finished", attempt.task_id, attempt.attempt);
        } else {
            warn!(
                "task {} attempt {} failed: {}",
                attempt.task_id,
                attempt.attempt,
                cause.as_deref().unwrap_or("unknown")
            );
        }
        match self.master.complete(worker_id, attempt, success, cause).await {
            Ok(true) => {}
            Ok(false) => debug!("job server ignored report for {:?}", attempt),
            Err(e) => warn!("could not report {:?}: {}", attempt, e),
        }
    }

    fn reap_timed_out(&self, now_ms: i64) {
        let timeout = self.config.progress_timeout;
        for entry in self.running.iter() {
            let task = entry.value();
            if task.kill_reason().is_none() && task.is_timed_out(now_ms, timeout) {
                warn!(
                    "task {} attempt {} made no progress for {:?}",
                    entry.key().task_id,
                    entry.key().attempt,
                    timeout
                );
                task.kill_with_reason("progress timeout");
            }
        }
    }

    fn dispose_all(&self, reason: &str) {
        for entry in self.running.iter() {
            entry.value().kill_with_reason(reason);
        }
    }
}
