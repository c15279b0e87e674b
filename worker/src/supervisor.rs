// worker/src/supervisor.rs
//
// Owns one task process. The process moves NotStarted -> Running -> Exited
// exactly once; its exit is handed out through a one-shot channel that only
// the first waiter gets to observe.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{AttemptRef, Error, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const EXITED: u8 = 2;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    /// `None` when the process was killed by a signal or could not be reaped.
    pub code: Option<i32>,
    /// Why the process was killed, if it was.
    pub kill_reason: Option<String>,
}

impl TaskExit {
    pub fn success(&self) -> bool {
        self.kill_reason.is_none() && self.code == Some(0)
    }

    pub fn cause(&self) -> String {
        match (&self.kill_reason, self.code) {
            (Some(reason), _) => reason.clone(),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

/// Positional arguments every task program receives.
pub fn task_args(
    attempt: &AttemptRef,
    job_dir: &std::path::Path,
    dfs_job_dir: &std::path::Path,
) -> Vec<String> {
    vec![
        attempt.job_id.to_string(),
        job_dir.display().to_string(),
        attempt.task_id.clone(),
        dfs_job_dir.display().to_string(),
        attempt.attempt.to_string(),
    ]
}

pub struct RunningTask {
    attempt: AttemptRef,
    program: PathBuf,
    args: Vec<String>,
    state: Arc<AtomicU8>,
    last_progress_ms: Arc<AtomicI64>,
    kill: CancellationToken,
    kill_reason: Arc<Mutex<Option<String>>>,
    exit_rx: Mutex<Option<oneshot::Receiver<TaskExit>>>,
    exit_tx: Mutex<Option<oneshot::Sender<TaskExit>>>,
}

impl RunningTask {
    pub fn new(attempt: AttemptRef, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            attempt,
            program: program.into(),
            args,
            state: Arc::new(AtomicU8::new(NOT_STARTED)),
            last_progress_ms: Arc::new(AtomicI64::new(now_ms())),
            kill: CancellationToken::new(),
            kill_reason: Arc::new(Mutex::new(None)),
            exit_rx: Mutex::new(Some(rx)),
            exit_tx: Mutex::new(Some(tx)),
        }
    }

    pub fn attempt(&self) -> &AttemptRef {
        &self.attempt
    }

    pub fn state(&self) -> ProcessState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => ProcessState::NotStarted,
            RUNNING => ProcessState::Running,
            _ => ProcessState::Exited,
        }
    }

    pub fn last_progress_ms(&self) -> i64 {
        self.last_progress_ms.load(Ordering::Acquire)
    }

    /// Spawns the process. Fails if it was started or disposed before.
    pub fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidArgument(format!(
                "task {} attempt {} already started",
                self.attempt.task_id, self.attempt.attempt
            )));
        }
        let Some(exit_tx) = self.exit_tx.lock().take() else {
            self.state.store(EXITED, Ordering::Release);
            return Err(Error::Cancelled);
        };

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                self.state.store(EXITED, Ordering::Release);
                return Err(e.into());
            }
        };
        self.last_progress_ms.store(now_ms(), Ordering::Release);
        info!(
            "started task {} attempt {} of job {} (pid {:?})",
            self.attempt.task_id,
            self.attempt.attempt,
            self.attempt.job_id,
            child.id()
        );

        let stdout = child.stdout.take();
        let state = self.state.clone();
        let progress = self.last_progress_ms.clone();
        let kill = self.kill.clone();
        let kill_reason = self.kill_reason.clone();
        let label = format!("{}#{}", self.attempt.task_id, self.attempt.attempt);

        tokio::spawn(async move {
            let mut lines = stdout.map(|out| BufReader::new(out).lines());
            let status = loop {
                tokio::select! {
                    _ = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            debug!("kill of {} failed: {}", label, e);
                        }
                        break child.wait().await;
                    }
                    status = child.wait() => break status,
                    line = next_line(&mut lines) => match line {
                        Some(line) => {
                            progress.store(now_ms(), Ordering::Release);
                            debug!("{}: {}", label, line);
                        }
                        None => lines = None,
                    },
                }
            };

            let code = match status {
                Ok(s) => s.code(),
                Err(e) => {
                    warn!("could not reap {}: {}", label, e);
                    None
                }
            };
            let exit = TaskExit {
                code,
                kill_reason: kill_reason.lock().clone(),
            };
            state.store(EXITED, Ordering::Release);
            let _ = exit_tx.send(exit);
        });

        Ok(())
    }

    /// Waits for the exit. Only the first caller sees it; later callers get `None`.
    pub async fn wait_for_exit(&self) -> Option<TaskExit> {
        let rx = self.exit_rx.lock().take()?;
        rx.await.ok()
    }

    /// Kills the process if it runs and keeps it from ever starting.
    /// Safe to call at any point, any number of times.
    pub fn dispose(&self) {
        self.kill_with_reason("disposed");
    }

    /// Like [`RunningTask::dispose`], recording why. The first reason wins.
    pub fn kill_with_reason(&self, reason: &str) {
        {
            let mut current = self.kill_reason.lock();
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        if self
            .state
            .compare_exchange(NOT_STARTED, EXITED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // never started: nobody else holds the sender
            if let Some(tx) = self.exit_tx.lock().take() {
                let _ = tx.send(TaskExit {
                    code: None,
                    kill_reason: Some(reason.to_string()),
                });
            }
        }
        self.kill.cancel();
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason.lock().clone()
    }

    pub fn is_timed_out(&self, now_ms: i64, timeout: Duration) -> bool {
        self.state() == ProcessState::Running
            && now_ms - self.last_progress_ms() > timeout.as_millis() as i64
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
