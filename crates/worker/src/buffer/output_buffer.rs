use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use igloo_common::{OutputBufferId, TaskId};
use tracing::{debug, error, info, warn};

use super::client_buffer::{ClientBuffer, ReadOutcome};
use super::memory_manager::TrackedPage;
use super::{
    BufferResult, BufferState, BufferType, OutputBufferInfo, OutputBufferMemoryManager,
    OutputBuffersSpec, Page,
};
use crate::error::{Result, WorkerError};
use crate::task::state::{ExecutionFailure, FailureKind};
use crate::task::TaskStateMachine;

struct BufferInner {
    state: BufferState,
    buffer_type: Option<BufferType>,
    no_more_buffer_ids: bool,
    no_more_pages: bool,
    buffers: BTreeMap<OutputBufferId, ClientBuffer>,
    /// Broadcast only: pages replayed to buffer ids declared later.
    replay_pages: Vec<Arc<TrackedPage>>,
    /// Arbitrary only: pages not yet handed to any buffer id.
    master_queue: VecDeque<Arc<TrackedPage>>,
    total_pages_added: u64,
}

/// What the caller must tell the task once the buffer lock is released.
#[must_use]
enum Transition {
    None,
    Finished,
    Failed(String),
}

/// Output buffer of one task.
///
/// Holds a one-way handle to the task's state machine: buffer completion
/// finishes the task and internal buffer errors fail it. The task side only
/// ever calls back through [`OutputBuffer::destroy`].
pub struct OutputBuffer {
    task_id: TaskId,
    client_max_wait: Duration,
    memory: Arc<OutputBufferMemoryManager>,
    state_machine: Arc<TaskStateMachine>,
    inner: Mutex<BufferInner>,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("task_id", &self.task_id)
            .field("state", &self.state())
            .finish()
    }
}

impl OutputBuffer {
    pub fn new(
        state_machine: Arc<TaskStateMachine>,
        memory: Arc<OutputBufferMemoryManager>,
        client_max_wait: Duration,
    ) -> Self {
        Self {
            task_id: state_machine.task_id().clone(),
            client_max_wait,
            memory,
            state_machine,
            inner: Mutex::new(BufferInner {
                state: BufferState::Open,
                buffer_type: None,
                no_more_buffer_ids: false,
                no_more_pages: false,
                buffers: BTreeMap::new(),
                replay_pages: Vec::new(),
                master_queue: VecDeque::new(),
                total_pages_added: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BufferState {
        self.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().buffer_type.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.memory.is_full()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.memory.buffered_bytes()
    }

    /// Resolves when the producer may enqueue more pages.
    pub fn ready(&self) -> BoxFuture<'static, ()> {
        self.memory.ready()
    }

    /// Chooses the distribution rule and declares the first buffer ids.
    pub fn initialize(&self, spec: &OutputBuffersSpec) -> Result<()> {
        let transition = {
            let mut inner = self.lock();
            if let Some(existing) = inner.buffer_type {
                return Err(WorkerError::Internal(format!(
                    "output buffer of task {} already initialized as {}",
                    self.task_id, existing
                )));
            }
            if inner.state.is_terminal() {
                debug!(
                    task_id = %self.task_id,
                    "Ignoring initialization of a terminated output buffer"
                );
                return Ok(());
            }
            inner.buffer_type = Some(spec.buffer_type);
            info!(
                task_id = %self.task_id,
                buffer_type = %spec.buffer_type,
                "Output buffer initialized"
            );
            self.apply_spec(&mut inner, spec)?;
            self.check_finished(&mut inner)
        };
        self.apply(transition);
        Ok(())
    }

    /// Adds buffer ids and optionally closes the set on an initialized buffer.
    pub fn set_output_buffers(&self, spec: &OutputBuffersSpec) -> Result<()> {
        let transition = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return Ok(());
            }
            match inner.buffer_type {
                None => {
                    return Err(WorkerError::Internal(format!(
                        "output buffer of task {} is not initialized",
                        self.task_id
                    )))
                }
                Some(existing) if existing != spec.buffer_type => {
                    return Err(WorkerError::BufferTypeMismatch {
                        existing: existing.to_string(),
                        requested: spec.buffer_type.to_string(),
                    })
                }
                Some(_) => {}
            }
            self.apply_spec(&mut inner, spec)?;
            self.check_finished(&mut inner)
        };
        self.apply(transition);
        Ok(())
    }

    fn apply_spec(&self, inner: &mut BufferInner, spec: &OutputBuffersSpec) -> Result<()> {
        for &buffer_id in &spec.buffer_ids {
            if inner.buffers.contains_key(&buffer_id) {
                continue;
            }
            if inner.no_more_buffer_ids {
                return Err(WorkerError::UnknownBuffer(buffer_id));
            }
            Self::create_client_buffer(inner, buffer_id);
        }

        if spec.no_more_buffer_ids && !inner.no_more_buffer_ids {
            inner.no_more_buffer_ids = true;
            inner.replay_pages.clear();
            // reads issued before initialization may name ids the coordinator never declared
            for (buffer_id, buffer) in inner.buffers.iter_mut() {
                if !spec.buffer_ids.contains(buffer_id) {
                    warn!(task_id = %self.task_id, %buffer_id, "Destroying undeclared buffer");
                    buffer.destroy();
                }
            }
            Self::refresh_state(inner);
        }
        Ok(())
    }

    fn create_client_buffer(
        inner: &mut BufferInner,
        buffer_id: OutputBufferId,
    ) -> &mut ClientBuffer {
        let mut buffer = ClientBuffer::new(buffer_id);
        if inner.buffer_type == Some(BufferType::Broadcast) {
            buffer.enqueue_pages(inner.replay_pages.iter().cloned());
        }
        if inner.no_more_pages && inner.master_queue.is_empty() {
            buffer.set_no_more_pages();
        }
        inner.buffers.entry(buffer_id).or_insert(buffer)
    }

    fn refresh_state(inner: &mut BufferInner) {
        if !inner.state.is_terminal() {
            inner.state = BufferState::from_flags(inner.no_more_buffer_ids, inner.no_more_pages);
        }
    }

    /// Adds pages on behalf of the producer.
    ///
    /// Never fails toward the caller: pages arriving after the buffer stopped
    /// accepting them are dropped, and routing errors fail the buffer instead.
    pub fn enqueue(&self, buffer_id: Option<OutputBufferId>, pages: Vec<Page>) {
        if pages.is_empty() {
            return;
        }
        let transition = {
            let mut inner = self.lock();
            if !inner.state.can_add_pages() {
                debug!(
                    task_id = %self.task_id,
                    state = %inner.state,
                    pages = pages.len(),
                    "Dropping late pages"
                );
                return;
            }
            match self.route_pages(&mut inner, buffer_id, pages) {
                Ok(()) => Transition::None,
                Err(e) => Self::fail_locked(&mut inner, &self.memory, e.to_string()),
            }
        };
        self.apply(transition);
    }

    fn route_pages(
        &self,
        inner: &mut BufferInner,
        buffer_id: Option<OutputBufferId>,
        pages: Vec<Page>,
    ) -> Result<()> {
        let buffer_type = inner.buffer_type.ok_or_else(|| {
            WorkerError::Routing("pages enqueued before the buffer was initialized".to_string())
        })?;
        let count = pages.len() as u64;
        let tracked: Vec<Arc<TrackedPage>> =
            pages.into_iter().map(|page| TrackedPage::new(page, &self.memory)).collect();

        match buffer_type {
            BufferType::Broadcast => {
                for buffer in inner.buffers.values_mut() {
                    buffer.enqueue_pages(tracked.iter().cloned());
                }
                if !inner.no_more_buffer_ids {
                    inner.replay_pages.extend(tracked);
                }
            }
            BufferType::Partitioned => {
                let buffer_id = buffer_id.ok_or_else(|| {
                    WorkerError::Routing("partitioned output requires a buffer id".to_string())
                })?;
                let buffer = inner.buffers.get_mut(&buffer_id).ok_or_else(|| {
                    WorkerError::Routing(format!("undeclared partition {}", buffer_id))
                })?;
                buffer.enqueue_pages(tracked);
            }
            BufferType::Arbitrary => match buffer_id {
                Some(buffer_id) => {
                    let buffer = inner.buffers.get_mut(&buffer_id).ok_or_else(|| {
                        WorkerError::Routing(format!("undeclared buffer {}", buffer_id))
                    })?;
                    buffer.enqueue_pages(tracked);
                }
                None => {
                    inner.master_queue.extend(tracked);
                    Self::feed_waiting_readers(inner);
                }
            },
        }
        inner.total_pages_added += count;
        Ok(())
    }

    fn feed_waiting_readers(inner: &mut BufferInner) {
        let BufferInner {
            buffers,
            master_queue,
            ..
        } = inner;
        for buffer in buffers.values_mut() {
            if master_queue.is_empty() {
                break;
            }
            if let Some(max_size) = buffer.pending_max_size() {
                buffer.load_from(master_queue, max_size);
            }
        }
    }

    /// Reads pages of `buffer_id` starting at `token`.
    ///
    /// The returned future is already resolved when pages are available or the
    /// buffer id is complete. Otherwise it resolves when pages arrive, the
    /// buffer completes, or the keep-alive elapses (empty, not complete).
    /// Dropping the future leaves the buffer untouched.
    pub fn get(
        &self,
        buffer_id: OutputBufferId,
        token: u64,
        max_size_bytes: u64,
    ) -> BoxFuture<'static, Result<BufferResult>> {
        let (outcome, transition) = {
            let mut inner = self.lock();
            match self.get_locked(&mut inner, buffer_id, token, max_size_bytes) {
                Ok(outcome) => (Ok(outcome), self.check_finished(&mut inner)),
                Err(e) => (Err(e), Transition::None),
            }
        };
        self.apply(transition);

        match outcome {
            Ok(ReadOutcome::Ready(result)) => futures::future::ready(Ok(result)).boxed(),
            Ok(ReadOutcome::Pending(rx)) => {
                let max_wait = self.client_max_wait;
                async move {
                    match tokio::time::timeout(max_wait, rx).await {
                        Ok(Ok(result)) => Ok(result),
                        // keep-alive elapsed or the buffer was dropped; let the client poll again
                        _ => Ok(BufferResult::empty(token, false)),
                    }
                }
                .boxed()
            }
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }

    fn get_locked(
        &self,
        inner: &mut BufferInner,
        buffer_id: OutputBufferId,
        token: u64,
        max_size_bytes: u64,
    ) -> Result<ReadOutcome> {
        if inner.state == BufferState::Failed {
            return Ok(ReadOutcome::Ready(BufferResult::empty(token, true)));
        }
        if !inner.buffers.contains_key(&buffer_id) {
            if inner.state == BufferState::Finished {
                return Ok(ReadOutcome::Ready(BufferResult::empty(token, true)));
            }
            if inner.no_more_buffer_ids {
                return Err(WorkerError::UnknownBuffer(buffer_id));
            }
            Self::create_client_buffer(inner, buffer_id);
        }

        let BufferInner {
            buffers,
            master_queue,
            no_more_pages,
            ..
        } = inner;
        let Some(buffer) = buffers.get_mut(&buffer_id) else {
            return Err(WorkerError::UnknownBuffer(buffer_id));
        };
        if token == buffer.next_token() && buffer.load_from(master_queue, max_size_bytes) {
            debug!(
                task_id = %self.task_id,
                %buffer_id,
                "Loaded pages from the shared queue"
            );
        }
        if *no_more_pages && master_queue.is_empty() {
            for buffer in buffers.values_mut() {
                buffer.set_no_more_pages();
            }
        }
        match buffers.get_mut(&buffer_id) {
            Some(buffer) => buffer.get(token, max_size_bytes),
            None => Err(WorkerError::UnknownBuffer(buffer_id)),
        }
    }

    /// Releases every page of `buffer_id` below `token`.
    pub fn acknowledge(&self, buffer_id: OutputBufferId, token: u64) {
        let transition = {
            let mut inner = self.lock();
            let result = match inner.buffers.get_mut(&buffer_id) {
                Some(buffer) => buffer.acknowledge(token),
                None => {
                    debug!(
                        task_id = %self.task_id,
                        %buffer_id,
                        "Acknowledge for unknown buffer ignored"
                    );
                    Ok(())
                }
            };
            match result {
                Ok(()) => self.check_finished(&mut inner),
                Err(e) => Self::fail_locked(&mut inner, &self.memory, e.to_string()),
            }
        };
        self.apply(transition);
    }

    /// Discards one destination; may complete the whole buffer.
    pub fn abort(&self, buffer_id: OutputBufferId) {
        let transition = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            if !inner.buffers.contains_key(&buffer_id) {
                if inner.no_more_buffer_ids {
                    debug!(
                        task_id = %self.task_id,
                        %buffer_id,
                        "Abort for undeclared buffer ignored"
                    );
                    return;
                }
                Self::create_client_buffer(&mut inner, buffer_id);
            }
            match inner.buffers.get_mut(&buffer_id) {
                Some(buffer) if !buffer.is_destroyed() => buffer.destroy(),
                _ => return,
            }
            info!(task_id = %self.task_id, %buffer_id, "Output buffer aborted");
            self.check_finished(&mut inner)
        };
        self.apply(transition);
    }

    /// Signals the producer is done.
    pub fn set_no_more_pages(&self) {
        let transition = {
            let mut inner = self.lock();
            if inner.state.is_terminal() || inner.no_more_pages {
                return;
            }
            inner.no_more_pages = true;
            if inner.master_queue.is_empty() {
                for buffer in inner.buffers.values_mut() {
                    buffer.set_no_more_pages();
                }
            }
            Self::refresh_state(&mut inner);
            debug!(task_id = %self.task_id, state = %inner.state, "No more pages");
            self.check_finished(&mut inner)
        };
        self.memory.set_no_block_on_full();
        self.apply(transition);
    }

    /// Drops everything and completes all parked reads as complete.
    ///
    /// Used when the task is canceled or aborted, and by the reaper. Does not
    /// notify the task.
    pub fn destroy(&self) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = BufferState::Failed;
            Self::release_all(&mut inner);
        }
        self.memory.set_no_block_on_full();
        info!(task_id = %self.task_id, "Output buffer destroyed");
    }

    fn release_all(inner: &mut BufferInner) {
        for buffer in inner.buffers.values_mut() {
            buffer.destroy();
        }
        inner.replay_pages.clear();
        inner.master_queue.clear();
    }

    fn fail_locked(
        inner: &mut BufferInner,
        memory: &OutputBufferMemoryManager,
        cause: String,
    ) -> Transition {
        if inner.state.is_terminal() {
            return Transition::None;
        }
        inner.state = BufferState::Failed;
        Self::release_all(inner);
        memory.set_no_block_on_full();
        Transition::Failed(cause)
    }

    fn check_finished(&self, inner: &mut BufferInner) -> Transition {
        if inner.state != BufferState::Flushing {
            return Transition::None;
        }
        if !inner.master_queue.is_empty() {
            // shared pages nobody is left to read
            let unreadable = inner.no_more_buffer_ids
                && inner.buffers.values().all(ClientBuffer::is_destroyed);
            if !unreadable {
                return Transition::None;
            }
            debug!(
                task_id = %self.task_id,
                pages = inner.master_queue.len(),
                "Dropping pages left after every buffer was aborted"
            );
            inner.master_queue.clear();
        }
        if !inner.buffers.values().all(ClientBuffer::is_finished) {
            return Transition::None;
        }
        inner.state = BufferState::Finished;
        Self::release_all(inner);
        self.memory.set_no_block_on_full();
        Transition::Finished
    }

    fn apply(&self, transition: Transition) {
        match transition {
            Transition::None => {}
            Transition::Finished => {
                info!(task_id = %self.task_id, "Output buffer finished");
                self.state_machine.transition_to_finished();
            }
            Transition::Failed(cause) => {
                error!(task_id = %self.task_id, %cause, "Output buffer failed");
                self.state_machine
                    .transition_to_failed(ExecutionFailure::new(FailureKind::OutputBuffer, cause));
            }
        }
    }

    pub fn get_info(&self) -> OutputBufferInfo {
        let inner = self.lock();
        let buffers: Vec<_> = inner.buffers.values().map(ClientBuffer::info).collect();
        let buffered_pages = inner.master_queue.len() as u64
            + inner.buffers.values().map(|b| b.buffered_pages() as u64).sum::<u64>();
        OutputBufferInfo {
            buffer_type: inner.buffer_type,
            state: inner.state,
            can_add_buffers: inner.state.can_add_buffers(),
            can_add_pages: inner.state.can_add_pages(),
            total_buffered_bytes: self.memory.buffered_bytes(),
            total_buffered_pages: buffered_pages,
            total_pages_added: inner.total_pages_added,
            buffers,
        }
    }
}
