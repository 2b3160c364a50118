//! Sticky lifecycle state of a single task.
//!
//! The terminal outcome lives in a write-once slot: the first terminal
//! transition wins and every later one is a silent no-op, so the first failure
//! cause is the one reported even when cancellation or a cascading error
//! follows it.
//!
//! Every successful transition bumps the task's [`StatusVersion`] in the same
//! critical section that records it. Listeners run afterwards, outside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use igloo_common::TaskId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::state::{ExecutionFailure, TaskState};
use super::version::StatusVersion;

pub type StateChangeListener = Arc<dyn Fn(TaskState) + Send + Sync>;

#[derive(Debug)]
struct TerminalOutcome {
    state: TaskState,
    failure: Option<ExecutionFailure>,
    end_time: DateTime<Utc>,
}

pub struct TaskStateMachine {
    task_id: TaskId,
    created_at: DateTime<Utc>,
    running: AtomicBool,
    terminal: OnceLock<TerminalOutcome>,
    state_tx: watch::Sender<TaskState>,
    listeners: Mutex<Vec<StateChangeListener>>,
    version: Arc<StatusVersion>,
}

impl std::fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateMachine")
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId) -> Self {
        Self::with_version(task_id, Arc::new(StatusVersion::new()))
    }

    /// Builds a state machine whose transitions bump `version`.
    pub fn with_version(task_id: TaskId, version: Arc<StatusVersion>) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Planned);
        Self {
            task_id,
            created_at: Utc::now(),
            running: AtomicBool::new(false),
            terminal: OnceLock::new(),
            state_tx,
            listeners: Mutex::new(Vec::new()),
            version,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TaskState {
        if let Some(outcome) = self.terminal.get() {
            outcome.state
        } else if self.running.load(Ordering::Acquire) {
            TaskState::Running
        } else {
            TaskState::Planned
        }
    }

    pub fn is_done(&self) -> bool {
        self.terminal.get().is_some()
    }

    /// Cause recorded by the winning `transition_to_failed`, if any.
    pub fn failure(&self) -> Option<&ExecutionFailure> {
        self.terminal.get().and_then(|outcome| outcome.failure.as_ref())
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.terminal.get().map(|outcome| outcome.end_time)
    }

    /// Registers a callback run after every successful transition.
    ///
    /// Callbacks run on the transitioning thread after the state is published
    /// and must not block.
    pub fn add_state_change_listener(&self, listener: StateChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    pub fn status_version(&self) -> &Arc<StatusVersion> {
        &self.version
    }

    pub fn transition_to_running(&self) -> bool {
        // terminal transitions take the same lock, so none can land between
        // the check and the swap
        let entered = self.version.update(|| {
            if self.is_done() || self.running.swap(true, Ordering::AcqRel) {
                return false;
            }
            self.publish();
            true
        });
        if entered {
            debug!(task_id = %self.task_id, "Task is running");
            self.notify(TaskState::Running);
        }
        entered
    }

    pub fn transition_to_finished(&self) -> bool {
        self.transition_to_terminal(TaskState::Finished, None)
    }

    pub fn transition_to_canceled(&self) -> bool {
        self.transition_to_terminal(TaskState::Canceled, None)
    }

    pub fn transition_to_aborted(&self) -> bool {
        self.transition_to_terminal(TaskState::Aborted, None)
    }

    pub fn transition_to_failed(&self, cause: ExecutionFailure) -> bool {
        self.transition_to_terminal(TaskState::Failed, Some(cause))
    }

    fn transition_to_terminal(&self, state: TaskState, failure: Option<ExecutionFailure>) -> bool {
        debug_assert!(state.is_terminal());
        let outcome = TerminalOutcome {
            state,
            failure,
            end_time: Utc::now(),
        };
        let won = self.version.update(|| match self.terminal.set(outcome) {
            Ok(()) => {
                self.publish();
                true
            }
            Err(_) => false,
        });
        if !won {
            debug!(
                task_id = %self.task_id,
                current = %self.state(),
                rejected = %state,
                "Ignoring transition of a finished task"
            );
            return false;
        }
        match self.failure() {
            Some(failure) => warn!(task_id = %self.task_id, %failure, "Task failed"),
            None => info!(task_id = %self.task_id, %state, "Task reached terminal state"),
        }
        self.notify(state);
        true
    }

    fn publish(&self) {
        self.state_tx.send_if_modified(|published| {
            let current = self.state();
            if *published != current {
                *published = current;
                true
            } else {
                false
            }
        });
    }

    fn notify(&self, new_state: TaskState) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener(new_state);
        }
    }

    /// Waits until the task is terminal, giving up after `timeout`.
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Option<TaskState> {
        let mut rx = self.state_tx.subscribe();
        let terminal = rx.wait_for(|state| state.is_terminal());
        let waited = tokio::time::timeout(timeout, terminal).await;
        match waited {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }
}
