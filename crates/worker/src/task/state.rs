use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use igloo_common::{PlanNodeId, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::OutputBufferInfo;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Planned | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Planned => "PLANNED",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Canceled => "CANCELED",
            TaskState::Aborted => "ABORTED",
            TaskState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Raised by the execution engine while running or starting the fragment.
    Execution,
    /// The output buffer hit an internal or routing error.
    OutputBuffer,
    /// The coordinator stopped polling the task.
    Abandoned,
    /// Reported by the coordinator through `failed`.
    Remote,
}

/// Cause recorded with a FAILED task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Snapshot returned to the coordinator's status long-poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    /// Regenerated whenever the task object is recreated, e.g. after a worker restart.
    pub task_instance_id: Uuid,
    pub version: u64,
    pub state: TaskState,
    pub self_uri: String,
    pub node_id: String,
    pub failures: Vec<ExecutionFailure>,
    pub queued_splits: u64,
    pub running_splits: u64,
    pub dynamic_filters_version: u64,
    pub output_buffer_overutilized: bool,
    pub memory_reservation_bytes: u64,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub create_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_splits: u64,
    pub queued_splits: u64,
    pub running_splits: u64,
    pub completed_splits: u64,
    pub buffered_bytes: u64,
}

/// Full task report, a superset of [`TaskStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub output_buffers: OutputBufferInfo,
    pub no_more_splits: BTreeSet<PlanNodeId>,
    pub stats: TaskStats,
}
