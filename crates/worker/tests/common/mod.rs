#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use igloo_common::{OutputBufferId, PlanNodeId, QueryId, TaskId};
use igloo_worker::buffer::{BufferType, OutputBuffersSpec, Page};
use igloo_worker::memory::QueryContext;
use igloo_worker::task::{
    ExecutionStarter, PlanFragment, ScheduledSplit, SqlTask, TaskContext, TaskExecution, TaskSource,
};
use igloo_worker::{Settings, WorkerError};

/// Fake engine: turns every split into one page and signals no more pages
/// once every plan node it has seen is closed.
pub struct FakeExecution {
    context: TaskContext,
    target: Option<OutputBufferId>,
    delivered: Mutex<Vec<ScheduledSplit>>,
    seen: Mutex<BTreeSet<PlanNodeId>>,
    closed: Mutex<BTreeSet<PlanNodeId>>,
    canceled: AtomicBool,
}

impl FakeExecution {
    pub fn delivered_sequence_ids(&self) -> Vec<u64> {
        self.delivered.lock().unwrap().iter().map(|s| s.sequence_id).collect()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl TaskExecution for FakeExecution {
    fn add_sources(&self, sources: Vec<TaskSource>) {
        let mut seen = self.seen.lock().unwrap();
        let mut closed = self.closed.lock().unwrap();
        for source in sources {
            seen.insert(source.plan_node_id.clone());
            for split in source.splits {
                self.context.splits.split_started();
                self.context
                    .output_buffer
                    .enqueue(self.target, vec![Page::new(split.payload.clone(), 1)]);
                self.context.splits.split_finished();
                self.delivered.lock().unwrap().push(split);
            }
            if source.no_more_splits {
                closed.insert(source.plan_node_id);
            }
        }
        if !seen.is_empty() && *seen == *closed {
            self.context.output_buffer.set_no_more_pages();
        }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeStarter {
    target: Option<OutputBufferId>,
    executions: Mutex<Vec<Arc<FakeExecution>>>,
}

impl FakeStarter {
    pub fn routing_to(target: Option<OutputBufferId>) -> Arc<Self> {
        Arc::new(Self {
            target,
            executions: Mutex::new(Vec::new()),
        })
    }

    pub fn execution(&self) -> Arc<FakeExecution> {
        Arc::clone(self.executions.lock().unwrap().last().expect("execution started"))
    }

    pub fn started(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

impl ExecutionStarter for FakeStarter {
    fn start(
        &self,
        context: TaskContext,
        _fragment: &PlanFragment,
    ) -> Result<Arc<dyn TaskExecution>, WorkerError> {
        let execution = Arc::new(FakeExecution {
            context,
            target: self.target,
            delivered: Mutex::new(Vec::new()),
            seen: Mutex::new(BTreeSet::new()),
            closed: Mutex::new(BTreeSet::new()),
            canceled: AtomicBool::new(false),
        });
        self.executions.lock().unwrap().push(Arc::clone(&execution));
        Ok(execution)
    }
}

pub fn test_settings() -> Settings {
    Settings {
        status_max_wait_ms: 200,
        info_max_wait_ms: 200,
        client_max_wait_ms: 200,
        ..Settings::default()
    }
}

pub fn task_id() -> TaskId {
    "q1.1.0.0".parse().unwrap()
}

pub fn create_task(starter: Arc<FakeStarter>) -> Arc<SqlTask> {
    let task_id = task_id();
    let query = Arc::new(QueryContext::new(QueryId::new("q1").unwrap(), 1 << 30));
    SqlTask::create(
        task_id.clone(),
        format!("http://worker-1/v1/task/{}", task_id),
        "worker-1".to_string(),
        query,
        starter,
        &test_settings(),
    )
}

pub fn fragment() -> PlanFragment {
    PlanFragment {
        id: "fragment-1".to_string(),
        payload: b"scan".to_vec(),
    }
}

pub fn single_partition() -> OutputBuffersSpec {
    OutputBuffersSpec::new(BufferType::Partitioned)
        .with_buffer(OutputBufferId(0))
        .with_no_more_buffer_ids()
}

pub fn scan() -> PlanNodeId {
    PlanNodeId::new("scan")
}

pub fn splits(ids: &[u64]) -> Vec<ScheduledSplit> {
    ids.iter().map(|&id| ScheduledSplit::new(id, vec![id as u8; 4])).collect()
}

pub const MAX_WAIT: Duration = Duration::from_secs(2);
