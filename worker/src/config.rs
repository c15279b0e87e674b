use std::path::PathBuf;
use std::time::Duration;

use common::config::{env_millis, env_or, env_secs, env_string};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_base_url: String,
    pub max_concurrency: u32,
    pub rack: String,
    pub shuffle_bind: String,
    pub shuffle_max_connections: usize,
    pub index_cache_size: usize,
    /// Local root for channel output, one directory per job.
    pub data_dir: PathBuf,
    /// Shared root of per-job directories on the distributed file system.
    pub dfs_job_root: PathBuf,
    pub task_program: PathBuf,
    pub progress_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            master_base_url: env_string("MASTER_BASE_URL", "http://master:8080"),
            max_concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY),
            rack: env_string("WORKER_RACK", "/default-rack"),
            shuffle_bind: env_string("SHUFFLE_BIND", "0.0.0.0:7070"),
            shuffle_max_connections: env_or("SHUFFLE_MAX_CONNECTIONS", 64),
            index_cache_size: env_or("INDEX_CACHE_SIZE", 128),
            data_dir: PathBuf::from(env_string("DATA_DIR", "/data/channels")),
            dfs_job_root: PathBuf::from(env_string("DFS_JOB_ROOT", "/data/dfs/jobs")),
            task_program: PathBuf::from(env_string("TASK_PROGRAM", "/usr/local/bin/task-runner")),
            progress_timeout: env_secs("TASK_PROGRESS_TIMEOUT_SECS", 600),
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", 1_000),
        }
    }
}
