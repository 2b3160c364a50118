//! Registry of every task running on this worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use igloo_common::{OutputBufferId, QueryId, TaskId};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::buffer::{BufferResult, OutputBuffersSpec};
use crate::config::Settings;
use crate::error::{Result, WorkerError};
use crate::memory::QueryContext;
use crate::task::{
    ExecutionFailure, ExecutionStarter, FailureKind, PlanFragment, Session, SqlTask, TaskInfo,
    TaskSource, TaskState, TaskStatus, VersionedDynamicFilterDomains,
};

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Arc<SqlTask>>,
    queries: HashMap<QueryId, Arc<QueryContext>>,
}

/// Creates tasks on first contact and reaps them once they are no longer needed.
///
/// Updates, result pulls and terminal requests create the task if it does not
/// exist yet, so requests arriving out of order still land on one task.
/// Status and info polls never create one.
pub struct SqlTaskManager {
    settings: Settings,
    starter: Arc<dyn ExecutionStarter>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for SqlTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("SqlTaskManager")
            .field("node_id", &self.settings.node_id)
            .field("tasks", &registry.tasks.len())
            .field("queries", &registry.queries.len())
            .finish()
    }
}

impl SqlTaskManager {
    pub fn new(settings: Settings, starter: Arc<dyn ExecutionStarter>) -> Self {
        info!(node_id = %settings.node_id, "Task manager started");
        Self {
            settings,
            starter,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_or_create(&self, task_id: &TaskId) -> Arc<SqlTask> {
        let mut registry = self.lock();
        if let Some(task) = registry.tasks.get(task_id) {
            return Arc::clone(task);
        }
        let query_context = Arc::clone(
            registry
                .queries
                .entry(task_id.query_id().clone())
                .or_insert_with(|| {
                    Arc::new(QueryContext::new(
                        task_id.query_id().clone(),
                        self.settings.query_max_memory_bytes,
                    ))
                }),
        );
        let self_uri = format!(
            "{}/v1/task/{}",
            self.settings.base_uri.trim_end_matches('/'),
            task_id
        );
        let task = SqlTask::create(
            task_id.clone(),
            self_uri,
            self.settings.node_id.clone(),
            query_context,
            Arc::clone(&self.starter),
            &self.settings,
        );
        registry.tasks.insert(task_id.clone(), Arc::clone(&task));
        task
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Arc<SqlTask>> {
        self.lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| WorkerError::TaskNotFound(task_id.clone()))
    }

    pub fn tasks(&self) -> Vec<Arc<SqlTask>> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn query_context(&self, query_id: &QueryId) -> Option<Arc<QueryContext>> {
        self.lock().queries.get(query_id).cloned()
    }

    pub fn update_task(
        &self,
        task_id: &TaskId,
        session: Session,
        fragment: Option<PlanFragment>,
        sources: Vec<TaskSource>,
        output_buffers: OutputBuffersSpec,
    ) -> Result<TaskStatus> {
        self.get_or_create(task_id)
            .update_task(session, fragment, sources, output_buffers)
    }

    pub async fn get_task_status(
        &self,
        task_id: &TaskId,
        caller_version: u64,
    ) -> Result<TaskStatus> {
        let task = self.get_task(task_id)?;
        Ok(task.get_task_status(caller_version).await)
    }

    pub async fn get_task_info(&self, task_id: &TaskId, caller_version: u64) -> Result<TaskInfo> {
        let task = self.get_task(task_id)?;
        Ok(task.get_task_info(caller_version).await)
    }

    pub fn get_task_results(
        &self,
        task_id: &TaskId,
        buffer_id: OutputBufferId,
        token: u64,
        max_size_bytes: u64,
    ) -> BoxFuture<'static, Result<BufferResult>> {
        self.get_or_create(task_id)
            .get_task_results(buffer_id, token, max_size_bytes)
    }

    pub fn acknowledge_task_results(
        &self,
        task_id: &TaskId,
        buffer_id: OutputBufferId,
        token: u64,
    ) -> Result<()> {
        self.get_task(task_id)?.acknowledge_task_results(buffer_id, token);
        Ok(())
    }

    pub fn abort_task_results(&self, task_id: &TaskId, buffer_id: OutputBufferId) {
        self.get_or_create(task_id).abort_task_results(buffer_id);
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> TaskStatus {
        self.get_or_create(task_id).cancel()
    }

    pub fn abort_task(&self, task_id: &TaskId) -> TaskStatus {
        self.get_or_create(task_id).abort()
    }

    pub fn fail_task(&self, task_id: &TaskId, cause: ExecutionFailure) -> TaskStatus {
        self.get_or_create(task_id).failed(cause)
    }

    pub fn get_dynamic_filter_domains(
        &self,
        task_id: &TaskId,
        caller_version: u64,
    ) -> Result<VersionedDynamicFilterDomains> {
        Ok(self
            .get_task(task_id)?
            .get_dynamic_filter_domains(caller_version))
    }

    /// Releases tasks that have been terminal for longer than `info_max_age`.
    ///
    /// Returns the number of tasks removed.
    pub fn remove_old_tasks(&self) -> usize {
        let max_age = self.settings.info_max_age();
        let now = Utc::now();
        let mut removed = Vec::new();
        {
            let mut registry = self.lock();
            registry.tasks.retain(|task_id, task| {
                let Some(end_time) = task.end_time() else {
                    return true;
                };
                let age = (now - end_time).to_std().unwrap_or_default();
                if age >= max_age {
                    removed.push((task_id.clone(), Arc::clone(task)));
                    false
                } else {
                    true
                }
            });
            let Registry { tasks, queries } = &mut *registry;
            queries.retain(|query_id, _| tasks.keys().any(|t| t.query_id() == query_id));
        }

        for (task_id, task) in &removed {
            task.output_buffer().destroy();
            debug!(%task_id, state = %task.state(), "Removed old task");
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Removed old tasks");
        }
        removed.len()
    }

    /// Fails running tasks the coordinator has not contacted within `client_timeout`.
    ///
    /// Returns the number of tasks failed.
    pub fn fail_abandoned_tasks(&self) -> usize {
        let timeout = self.settings.client_timeout();
        let now = Utc::now();
        let mut failed = 0;
        for task in self.tasks() {
            if task.is_done() {
                continue;
            }
            let idle = (now - task.last_heartbeat()).to_std().unwrap_or_default();
            if idle >= timeout {
                warn!(
                    task_id = %task.task_id(),
                    idle_secs = idle.as_secs(),
                    "Failing abandoned task"
                );
                let cause = ExecutionFailure::new(
                    FailureKind::Abandoned,
                    format!("no coordinator contact for {:?}", idle),
                );
                if task.state_machine().transition_to_failed(cause) {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Runs both reaping passes every `reaper_interval` until `shutdown` fires.
    pub async fn run_reaper(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.reaper_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Task reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.fail_abandoned_tasks();
                    self.remove_old_tasks();
                }
            }
        }
    }

    /// Aborts every live task and waits up to `timeout` for each to settle.
    ///
    /// Returns the states observed; tasks that did not settle are omitted.
    pub async fn close(&self, timeout: Duration) -> Vec<(TaskId, TaskState)> {
        let tasks = self.tasks();
        let live: Vec<_> = tasks.iter().filter(|t| !t.is_done()).collect();
        info!(live = live.len(), "Closing task manager");
        for task in &live {
            task.abort();
        }
        let waits = tasks.iter().map(|task| async move {
            task.state_machine()
                .wait_for_terminal(timeout)
                .await
                .map(|state| (task.task_id().clone(), state))
        });
        join_all(waits).await.into_iter().flatten().collect()
    }
}
