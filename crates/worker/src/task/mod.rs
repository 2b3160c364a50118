//! Task lifecycle: state machine, dynamic filters, execution contract and the
//! [`SqlTask`] that composes them with the output buffer.

pub mod domain;
mod dynamic_filters;
mod execution;
mod sql_task;
pub mod state;
mod state_machine;
mod version;

pub use dynamic_filters::{
    DynamicFiltersCollector, VersionedDynamicFilterDomains, INITIAL_DYNAMIC_FILTERS_VERSION,
};
pub use execution::{
    ExecutionStarter, PlanFragment, ScheduledSplit, Session, SplitCounters, TaskContext,
    TaskExecution, TaskSource,
};
pub use sql_task::SqlTask;
pub use state::{ExecutionFailure, FailureKind, TaskInfo, TaskState, TaskStats, TaskStatus};
pub use state_machine::{StateChangeListener, TaskStateMachine};
pub use version::StatusVersion;
