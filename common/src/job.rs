use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::task::TaskSpec;

/// Job ids travel as 16 raw bytes on the shuffle wire.
pub type JobId = Uuid;

/* --------- Scheduling configuration --------- */

/// How the scheduler orders candidate workers when several have room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalityMode {
    /// More free slots first: spread load over the cluster.
    #[default]
    Spreading,
    /// Fewer free slots first: pack tasks onto as few workers as possible.
    FewerServers,
    /// Workers holding more of the stage's input first.
    OptimalLocality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default)]
    pub locality_mode: LocalityMode,

    /// Highest data distance a data-input task may be placed at
    /// (0 = host-local only, 1 = rack-local, 2 = anywhere).
    #[serde(default = "default_max_data_distance")]
    pub max_data_distance: u8,

    /// Attempts a task may consume before it fails its job.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
}

fn default_max_data_distance() -> u8 {
    crate::task::DISTANCE_REMOTE
}

fn default_max_task_attempts() -> u32 {
    4
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            locality_mode: LocalityMode::default(),
            max_data_distance: default_max_data_distance(),
            max_task_attempts: default_max_task_attempts(),
        }
    }
}

/* --------- Job graph as submitted --------- */

/// A prepared job: an ordered list of stages. Stage `i` may only depend on
/// stages with a lower index, which keeps the graph acyclic by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,

    #[serde(default)]
    pub config: SchedulingConfig,

    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,

    /// Reads external split-based input (vs. only channel input from
    /// upstream stages). Only these stages are placed by locality.
    #[serde(default)]
    pub data_input: bool,

    /// Indexes of upstream stages that must finish first.
    #[serde(default)]
    pub depends_on: Vec<usize>,

    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::InvalidArgument(format!("job spec: {e}")))
    }

    pub fn total_tasks(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

/* --------- Job status as reported --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInfo {
    pub name: String,
    pub ready: bool,
    pub total_tasks: u32,
    pub unscheduled: u32,
    pub running: u32,
    pub finished: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_attempts: u32,

    /// Last attempt's worker and cause for a failed job.
    pub failure: Option<String>,

    pub stages: Vec<StageInfo>,
}
