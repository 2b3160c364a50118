//! Contract between a task and the execution engine that runs its fragment.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use igloo_common::PlanNodeId;
use serde::{Deserialize, Serialize};

use super::dynamic_filters::DynamicFiltersCollector;
use super::state_machine::TaskStateMachine;
use super::version::StatusVersion;
use crate::buffer::OutputBuffer;
use crate::error::Result;

/// A unit of input assigned to one plan node. Identity is `sequence_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSplit {
    pub sequence_id: u64,
    pub payload: Vec<u8>,
}

impl ScheduledSplit {
    pub fn new(sequence_id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }
}

/// Splits for one plan node as sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<ScheduledSplit>,
    pub no_more_splits: bool,
}

impl TaskSource {
    pub fn new(
        plan_node_id: PlanNodeId,
        splits: Vec<ScheduledSplit>,
        no_more_splits: bool,
    ) -> Self {
        Self {
            plan_node_id,
            splits,
            no_more_splits,
        }
    }
}

/// Serialized plan fragment; opaque to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    pub properties: HashMap<String, String>,
}

/// Split progress reported by the engine. Every change bumps the task status version.
pub struct SplitCounters {
    queued: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    status_version: Arc<StatusVersion>,
}

impl fmt::Debug for SplitCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitCounters")
            .field("queued", &self.queued())
            .field("running", &self.running())
            .field("completed", &self.completed())
            .finish()
    }
}

impl SplitCounters {
    pub fn new(status_version: Arc<StatusVersion>) -> Self {
        Self {
            queued: AtomicU64::new(0),
            running: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            status_version,
        }
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    pub fn running(&self) -> u64 {
        self.running.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn splits_queued(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.status_version.update(|| {
            self.queued.fetch_add(count, Ordering::AcqRel);
            true
        });
    }

    /// A queued split began running.
    pub fn split_started(&self) {
        self.status_version.update(|| {
            Self::decrement(&self.queued);
            self.running.fetch_add(1, Ordering::AcqRel);
            true
        });
    }

    /// A running split completed.
    pub fn split_finished(&self) {
        self.status_version.update(|| {
            Self::decrement(&self.running);
            self.completed.fetch_add(1, Ordering::AcqRel);
            true
        });
    }

    fn decrement(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(1))
        });
    }
}

/// Everything the engine may touch while running a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session: Session,
    pub state_machine: Arc<TaskStateMachine>,
    pub output_buffer: Arc<OutputBuffer>,
    pub dynamic_filters: Arc<DynamicFiltersCollector>,
    pub splits: Arc<SplitCounters>,
}

/// Starts the engine for a fragment. Called once per task.
pub trait ExecutionStarter: Send + Sync {
    fn start(
        &self,
        context: TaskContext,
        fragment: &PlanFragment,
    ) -> Result<Arc<dyn TaskExecution>>;
}

/// A running fragment.
///
/// Implementations must not block: both methods are called from coordinator
/// request handlers and from task state listeners.
pub trait TaskExecution: Send + Sync {
    /// Delivers splits the engine has not seen yet, and closes streams.
    fn add_sources(&self, sources: Vec<TaskSource>);

    fn cancel(&self);
}
