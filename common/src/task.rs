use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::JobId;

pub type TaskId = String;

/* --------- Data distance --------- */

pub const DISTANCE_LOCAL: u8 = 0;
pub const DISTANCE_RACK: u8 = 1;
pub const DISTANCE_REMOTE: u8 = 2;

/// Human-readable locality classification, `None` meaning unknown.
pub fn locality_label(distance: Option<u8>) -> &'static str {
    match distance {
        None => "unknown",
        Some(DISTANCE_LOCAL) => "host-local",
        Some(DISTANCE_RACK) => "rack-local",
        Some(_) => "remote",
    }
}

/* --------- Tasks --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Hosts that already hold this task's input.
    #[serde(default)]
    pub locality_hints: Vec<String>,

    /// DFS path of the split, when the task reads external input. The
    /// file's hosts are added to the locality hints at scheduling time.
    #[serde(default)]
    pub input_path: Option<String>,
}

/// Ordered so that `state <= TaskState::Running` means "not terminal".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Unscheduled,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        self > TaskState::Running
    }
}

/// Task ids are derived from the stage and task position so that producers
/// and consumers can name channel files without a lookup.
pub fn task_id(stage: usize, index: usize) -> TaskId {
    format!("s{stage}-t{index}")
}

/// Task ids end up in file names on the task servers.
pub fn validate_task_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && id != "."
        && id != "..";
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("malformed task id {id:?}")))
    }
}

/// One attempt of one task, as known to both sides of the RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptRef {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub attempt: u32,
}

/// What a task server needs to start an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub attempt: AttemptRef,
    pub stage: usize,
    pub input_path: Option<String>,
    pub data_distance: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_separates_terminal_states() {
        assert!(!TaskState::Unscheduled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Aborted.is_terminal());
        assert!(TaskState::Unscheduled <= TaskState::Running);
    }

    #[test]
    fn task_ids_are_file_name_safe() {
        assert!(validate_task_id(&task_id(3, 12)).is_ok());
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("..").is_err());
        assert!(validate_task_id("a/b").is_err());
        assert!(validate_task_id("a\\b").is_err());
    }
}
