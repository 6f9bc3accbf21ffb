//! Staging task lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned to a task by the metadata store.
pub type TaskId = i64;

/// Task status.
///
/// Tasks only ever move forward through the pipeline:
/// `Submitted -> StageCompleting -> Staged -> Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created by a submitter; replicas are still being resolved or staged.
    Submitted,
    /// All staging requests issued; waiting for every replica to land.
    StageCompleting,
    /// Every linked replica is staged.
    Staged,
    /// The originating system has been notified.
    Done,
}

impl TaskStatus {
    /// All statuses in pipeline order.
    pub const ALL: [TaskStatus; 4] = [
        Self::Submitted,
        Self::StageCompleting,
        Self::Staged,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::StageCompleting => "StageCompleting",
            Self::Staged => "Staged",
            Self::Done => "Done",
        }
    }

    /// Whether a task in this status may move to `to`.
    pub fn can_advance_to(&self, to: TaskStatus) -> bool {
        to > *self
    }

    /// Statuses from which a task may legally move to `to`.
    pub fn predecessors(to: TaskStatus) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_advance_to(to))
            .collect()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownTaskStatus(s.to_string()))
    }
}

/// Callback details recorded for a task, used by the polling loop to
/// report completion back to the originating system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCallback {
    pub source: String,
    pub callback_method: String,
    pub source_task_id: String,
}
