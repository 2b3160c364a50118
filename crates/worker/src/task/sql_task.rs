use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use igloo_common::{DynamicFilterId, OutputBufferId, PlanNodeId, TaskId};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::domain::Domain;
use super::dynamic_filters::{DynamicFiltersCollector, VersionedDynamicFilterDomains};
use super::execution::{
    ExecutionStarter, PlanFragment, ScheduledSplit, Session, SplitCounters, TaskContext,
    TaskExecution, TaskSource,
};
use super::state::{ExecutionFailure, TaskInfo, TaskState, TaskStats, TaskStatus};
use super::state_machine::TaskStateMachine;
use super::version::StatusVersion;
use crate::buffer::{BufferResult, OutputBuffer, OutputBufferMemoryManager, OutputBuffersSpec};
use crate::config::Settings;
use crate::error::Result;
use crate::memory::QueryContext;

#[derive(Default)]
struct PlanNodeSplits {
    splits: BTreeMap<u64, ScheduledSplit>,
    no_more_splits: bool,
}

#[derive(Default)]
struct SourceState {
    nodes: BTreeMap<PlanNodeId, PlanNodeSplits>,
    /// Merged but not yet handed to the engine.
    undelivered: Vec<TaskSource>,
    started: bool,
}

impl SourceState {
    /// Unions `source` into the accumulated splits and returns only what is new.
    fn merge(&mut self, source: TaskSource) -> Option<TaskSource> {
        let node = self.nodes.entry(source.plan_node_id.clone()).or_default();
        let mut fresh = Vec::new();
        if node.no_more_splits {
            if source.splits.iter().any(|s| !node.splits.contains_key(&s.sequence_id)) {
                warn!(
                    plan_node_id = %source.plan_node_id,
                    "Ignoring splits sent after no more splits"
                );
            }
        } else {
            for split in source.splits {
                if let Entry::Vacant(entry) = node.splits.entry(split.sequence_id) {
                    fresh.push(split.clone());
                    entry.insert(split);
                }
            }
        }
        let closing = source.no_more_splits && !node.no_more_splits;
        node.no_more_splits |= source.no_more_splits;

        if fresh.is_empty() && !closing {
            None
        } else {
            Some(TaskSource::new(source.plan_node_id, fresh, closing))
        }
    }

    fn total_splits(&self) -> u64 {
        self.nodes.values().map(|n| n.splits.len() as u64).sum()
    }

    fn closed_nodes(&self) -> BTreeSet<PlanNodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.no_more_splits)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// One worker-local execution of a plan fragment.
///
/// Entry point for both the coordinator (updates, status polls, result pulls)
/// and the execution engine (through [`TaskContext`]).
pub struct SqlTask {
    task_id: TaskId,
    task_instance_id: Uuid,
    self_uri: String,
    node_id: String,
    status_max_wait: Duration,
    info_max_wait: Duration,
    query_context: Arc<QueryContext>,
    state_machine: Arc<TaskStateMachine>,
    output_buffer: Arc<OutputBuffer>,
    dynamic_filters: Arc<DynamicFiltersCollector>,
    splits: Arc<SplitCounters>,
    version: Arc<StatusVersion>,
    starter: Arc<dyn ExecutionStarter>,
    sources: Mutex<SourceState>,
    execution: Mutex<Option<Arc<dyn TaskExecution>>>,
    last_heartbeat: Mutex<DateTime<Utc>>,
}

impl std::fmt::Debug for SqlTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTask")
            .field("task_id", &self.task_id)
            .field("task_instance_id", &self.task_instance_id)
            .field("state", &self.state_machine.state())
            .finish()
    }
}

impl SqlTask {
    /// Builds a task with an uninitialized output buffer. Nothing runs until
    /// the first [`SqlTask::update_task`] carrying a fragment.
    pub fn create(
        task_id: TaskId,
        self_uri: String,
        node_id: String,
        query_context: Arc<QueryContext>,
        starter: Arc<dyn ExecutionStarter>,
        settings: &Settings,
    ) -> Arc<Self> {
        let version = Arc::new(StatusVersion::new());
        let state_machine = Arc::new(TaskStateMachine::with_version(
            task_id.clone(),
            Arc::clone(&version),
        ));
        let memory = Arc::new(OutputBufferMemoryManager::new(
            settings.max_buffer_size_bytes,
            settings.buffer_low_water_bytes(),
            Arc::clone(&query_context),
        ));
        let output_buffer = Arc::new(OutputBuffer::new(
            Arc::clone(&state_machine),
            memory,
            settings.client_max_wait(),
        ));
        let dynamic_filters = Arc::new(DynamicFiltersCollector::new(Arc::clone(&version)));
        let splits = Arc::new(SplitCounters::new(Arc::clone(&version)));

        let task = Arc::new_cyclic(|weak: &Weak<SqlTask>| {
            let weak = weak.clone();
            state_machine.add_state_change_listener(Arc::new(move |state: TaskState| {
                if let Some(task) = weak.upgrade() {
                    task.on_state_change(state);
                }
            }));
            Self {
                task_id: task_id.clone(),
                task_instance_id: Uuid::new_v4(),
                self_uri,
                node_id,
                status_max_wait: settings.status_max_wait(),
                info_max_wait: settings.info_max_wait(),
                query_context,
                state_machine,
                output_buffer,
                dynamic_filters,
                splits,
                version,
                starter,
                sources: Mutex::new(SourceState::default()),
                execution: Mutex::new(None),
                last_heartbeat: Mutex::new(Utc::now()),
            }
        });
        debug!(%task_id, task_instance_id = %task.task_instance_id, "Task created");
        task
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_instance_id(&self) -> Uuid {
        self.task_instance_id
    }

    pub fn query_context(&self) -> &Arc<QueryContext> {
        &self.query_context
    }

    pub fn state_machine(&self) -> &Arc<TaskStateMachine> {
        &self.state_machine
    }

    pub fn output_buffer(&self) -> &Arc<OutputBuffer> {
        &self.output_buffer
    }

    pub fn dynamic_filters(&self) -> &Arc<DynamicFiltersCollector> {
        &self.dynamic_filters
    }

    pub fn state(&self) -> TaskState {
        self.state_machine.state()
    }

    pub fn is_done(&self) -> bool {
        self.state_machine.is_done()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state_machine.end_time()
    }

    pub fn version(&self) -> u64 {
        self.version.current()
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sources(&self) -> MutexGuard<'_, SourceState> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_state_change(&self, state: TaskState) {
        match state {
            TaskState::Canceled | TaskState::Aborted => {
                self.output_buffer.destroy();
                self.cancel_execution();
            }
            // the buffer stays readable until the reaper releases it
            TaskState::Failed => self.cancel_execution(),
            TaskState::Planned | TaskState::Running | TaskState::Finished => {}
        }
    }

    fn cancel_execution(&self) {
        let execution = self.execution.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(execution) = execution {
            debug!(task_id = %self.task_id, "Stopping execution");
            execution.cancel();
        }
    }

    /// Applies a coordinator update.
    ///
    /// Splits are unioned per plan node by sequence id and only splits the
    /// engine has not seen are delivered. The first update carrying a fragment
    /// starts execution; a startup error fails the task.
    pub fn update_task(
        &self,
        session: Session,
        fragment: Option<PlanFragment>,
        sources: Vec<TaskSource>,
        output_buffers: OutputBuffersSpec,
    ) -> Result<TaskStatus> {
        self.record_heartbeat();
        let mut state = self.lock_sources();
        if self.state_machine.is_done() {
            debug!(
                task_id = %self.task_id,
                state = %self.state(),
                "Ignoring update of a finished task"
            );
            drop(state);
            return Ok(self.task_status());
        }

        if self.output_buffer.is_initialized() {
            self.output_buffer.set_output_buffers(&output_buffers)?;
        } else {
            self.output_buffer.initialize(&output_buffers)?;
        }

        let mut new_splits = 0;
        for source in sources {
            if let Some(delta) = state.merge(source) {
                new_splits += delta.splits.len() as u64;
                state.undelivered.push(delta);
            }
        }
        self.splits.splits_queued(new_splits);

        if !state.started {
            if let Some(fragment) = fragment.as_ref() {
                state.started = true;
                self.start_execution(session, fragment);
            }
        }

        let execution = self.execution.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(execution) = execution {
            if !state.undelivered.is_empty() {
                // delivered under the sources lock so the engine sees updates in order
                execution.add_sources(std::mem::take(&mut state.undelivered));
            }
        }
        drop(state);
        Ok(self.task_status())
    }

    fn start_execution(&self, session: Session, fragment: &PlanFragment) {
        self.state_machine.transition_to_running();
        let context = TaskContext {
            session,
            state_machine: Arc::clone(&self.state_machine),
            output_buffer: Arc::clone(&self.output_buffer),
            dynamic_filters: Arc::clone(&self.dynamic_filters),
            splits: Arc::clone(&self.splits),
        };
        match self.starter.start(context, fragment) {
            Ok(execution) => {
                info!(task_id = %self.task_id, fragment_id = %fragment.id, "Execution started");
                *self.execution.lock().unwrap_or_else(|e| e.into_inner()) = Some(execution);
                // a cancel that raced with startup found nothing to stop
                if matches!(
                    self.state(),
                    TaskState::Canceled | TaskState::Aborted | TaskState::Failed
                ) {
                    self.cancel_execution();
                }
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Execution failed to start");
                self.state_machine
                    .transition_to_failed(ExecutionFailure::execution(e.to_string()));
            }
        }
    }

    async fn wait_for_newer_version(&self, caller_version: u64, max_wait: Duration) {
        if self.state_machine.is_done() {
            return;
        }
        let mut rx = self.version.subscribe();
        let _ = tokio::time::timeout(max_wait, rx.wait_for(|v| *v > caller_version)).await;
    }

    /// Long-polls for a status newer than `caller_version`.
    ///
    /// Resolves immediately when the task is terminal or already newer, else on
    /// the next version bump or after the status max wait.
    pub async fn get_task_status(&self, caller_version: u64) -> TaskStatus {
        self.record_heartbeat();
        self.wait_for_newer_version(caller_version, self.status_max_wait).await;
        self.task_status()
    }

    pub async fn get_task_info(&self, caller_version: u64) -> TaskInfo {
        self.record_heartbeat();
        self.wait_for_newer_version(caller_version, self.info_max_wait).await;
        self.task_info()
    }

    pub fn task_status(&self) -> TaskStatus {
        self.version.read(|version| TaskStatus {
            task_id: self.task_id.clone(),
            task_instance_id: self.task_instance_id,
            version,
            state: self.state_machine.state(),
            self_uri: self.self_uri.clone(),
            node_id: self.node_id.clone(),
            failures: self.state_machine.failure().cloned().into_iter().collect(),
            queued_splits: self.splits.queued(),
            running_splits: self.splits.running(),
            dynamic_filters_version: self.dynamic_filters.version(),
            output_buffer_overutilized: self.output_buffer.is_full(),
            memory_reservation_bytes: self.output_buffer.buffered_bytes(),
            end_time: self.state_machine.end_time(),
        })
    }

    pub fn task_info(&self) -> TaskInfo {
        let status = self.task_status();
        let (total_splits, no_more_splits) = {
            let state = self.lock_sources();
            (state.total_splits(), state.closed_nodes())
        };
        let stats = TaskStats {
            create_time: self.state_machine.created_at(),
            end_time: status.end_time,
            total_splits,
            queued_splits: status.queued_splits,
            running_splits: status.running_splits,
            completed_splits: self.splits.completed(),
            buffered_bytes: status.memory_reservation_bytes,
        };
        TaskInfo {
            status,
            last_heartbeat: self.last_heartbeat(),
            output_buffers: self.output_buffer.get_info(),
            no_more_splits,
            stats,
        }
    }

    pub fn get_task_results(
        &self,
        buffer_id: OutputBufferId,
        token: u64,
        max_size_bytes: u64,
    ) -> BoxFuture<'static, Result<BufferResult>> {
        self.output_buffer.get(buffer_id, token, max_size_bytes)
    }

    pub fn acknowledge_task_results(&self, buffer_id: OutputBufferId, token: u64) {
        self.output_buffer.acknowledge(buffer_id, token);
    }

    /// Discards one consumer; may finish the task once no consumer is left.
    pub fn abort_task_results(&self, buffer_id: OutputBufferId) {
        debug!(task_id = %self.task_id, %buffer_id, "Aborting task results");
        self.output_buffer.abort(buffer_id);
    }

    /// Cancels on behalf of the coordinator. Idempotent.
    pub fn cancel(&self) -> TaskStatus {
        self.state_machine.transition_to_canceled();
        self.output_buffer.destroy();
        self.cancel_execution();
        self.task_status()
    }

    /// Aborts on behalf of the worker itself, e.g. at shutdown.
    pub fn abort(&self) -> TaskStatus {
        self.state_machine.transition_to_aborted();
        self.output_buffer.destroy();
        self.cancel_execution();
        self.task_status()
    }

    /// Fails the task; the output buffer stays readable until the task is reaped.
    pub fn failed(&self, cause: ExecutionFailure) -> TaskStatus {
        if !self.state_machine.transition_to_failed(cause) {
            debug!(
                task_id = %self.task_id,
                state = %self.state(),
                "Failure ignored, task already done"
            );
        }
        self.task_status()
    }

    pub fn get_dynamic_filter_domains(&self, caller_version: u64) -> VersionedDynamicFilterDomains {
        self.dynamic_filters.get_domains(caller_version)
    }

    /// Merges domains produced by the engine. Shortcut for the collector in [`TaskContext`].
    pub fn update_dynamic_filter_domains(&self, domains: HashMap<DynamicFilterId, Domain>) {
        self.dynamic_filters.update_domains(domains);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferType;
    use crate::error::WorkerError;
    use igloo_common::QueryId;

    struct FailingStarter;

    impl ExecutionStarter for FailingStarter {
        fn start(&self, _: TaskContext, _: &PlanFragment) -> Result<Arc<dyn TaskExecution>> {
            Err(WorkerError::Internal("no driver slots".to_string()))
        }
    }

    fn task(starter: Arc<dyn ExecutionStarter>) -> Arc<SqlTask> {
        let task_id: TaskId = "q1.1.0.0".parse().unwrap();
        let query = Arc::new(QueryContext::new(QueryId::new("q1").unwrap(), 1 << 30));
        SqlTask::create(
            task_id,
            "http://worker/v1/task/q1.1.0.0".to_string(),
            "node-1".to_string(),
            query,
            starter,
            &Settings::default(),
        )
    }

    fn fragment() -> PlanFragment {
        PlanFragment {
            id: "f1".to_string(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn startup_error_fails_the_task() {
        let task = task(Arc::new(FailingStarter));
        let status = task
            .update_task(
                Session::default(),
                Some(fragment()),
                Vec::new(),
                OutputBuffersSpec::new(BufferType::Partitioned),
            )
            .unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.failures[0].message.contains("no driver slots"));
        assert!(status.end_time.is_some());
    }

    #[test]
    fn splits_are_accumulated_before_the_fragment_arrives() {
        let task = task(Arc::new(FailingStarter));
        let node = PlanNodeId::new("scan");
        let status = task
            .update_task(
                Session::default(),
                None,
                vec![TaskSource::new(
                    node.clone(),
                    vec![ScheduledSplit::new(1, b"a".to_vec())],
                    false,
                )],
                OutputBuffersSpec::new(BufferType::Arbitrary),
            )
            .unwrap();
        assert_eq!(status.state, TaskState::Planned);
        assert_eq!(status.queued_splits, 1);
        assert_eq!(task.task_info().stats.total_splits, 1);
    }

    #[test]
    fn status_fields_never_change_under_the_same_version() {
        const UPDATES: u64 = 20_000;
        let task = task(Arc::new(FailingStarter));
        let filters = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || {
                let filter = DynamicFilterId::new("f");
                for _ in 0..UPDATES {
                    task.update_dynamic_filter_domains(HashMap::from([(
                        filter.clone(),
                        Domain::all(),
                    )]));
                }
            })
        };
        let splits = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || {
                for _ in 0..UPDATES {
                    task.splits.splits_queued(1);
                    task.splits.split_started();
                    task.splits.split_finished();
                }
            })
        };

        let mut seen: HashMap<u64, (u64, u64, u64)> = HashMap::new();
        while !filters.is_finished() || !splits.is_finished() {
            let status = task.task_status();
            let fields = (
                status.dynamic_filters_version,
                status.queued_splits,
                status.running_splits,
            );
            assert_eq!(*seen.entry(status.version).or_insert(fields), fields);
        }
        filters.join().unwrap();
        splits.join().unwrap();

        let status = task.task_status();
        assert_eq!(status.version, UPDATES * 4);
        assert_eq!(status.dynamic_filters_version, UPDATES);
        assert_eq!((status.queued_splits, status.running_splits), (0, 0));
    }

    #[test]
    fn terminal_transitions_bump_the_version_once() {
        let task = task(Arc::new(FailingStarter));
        let before = task.version();
        task.cancel();
        task.abort();
        let status = task.task_status();
        assert_eq!(status.state, TaskState::Canceled);
        assert_eq!(status.version, before + 1);
    }

    #[test]
    fn instance_ids_differ_between_incarnations() {
        let first = task(Arc::new(FailingStarter));
        let second = task(Arc::new(FailingStarter));
        assert_eq!(first.task_id(), second.task_id());
        assert_ne!(first.task_instance_id(), second.task_instance_id());
    }
}
