mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use igloo_common::{OutputBufferId, QueryId, TaskId};
use igloo_worker::buffer::BufferState;
use igloo_worker::task::{FailureKind, Session, TaskSource, TaskState};
use igloo_worker::{Settings, SqlTaskManager, WorkerError};
use tokio::sync::oneshot;

const BUFFER_0: OutputBufferId = OutputBufferId(0);

fn manager(settings: Settings) -> (Arc<SqlTaskManager>, Arc<FakeStarter>) {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    (Arc::new(SqlTaskManager::new(settings, starter.clone())), starter)
}

fn start(manager: &SqlTaskManager, task_id: &TaskId, no_more_splits: bool) -> TaskState {
    manager
        .update_task(
            task_id,
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), splits(&[1]), no_more_splits)],
            single_partition(),
        )
        .unwrap()
        .state
}

#[tokio::test]
async fn test_tasks_of_one_query_share_a_context() {
    let (manager, starter) = manager(test_settings());
    let first: TaskId = "q7.1.0.0".parse().unwrap();
    let second: TaskId = "q7.1.1.0".parse().unwrap();
    start(&manager, &first, false);
    start(&manager, &second, false);

    assert_eq!(starter.started(), 2);
    let a = manager.get_task(&first).unwrap();
    let b = manager.get_task(&second).unwrap();
    assert!(Arc::ptr_eq(a.query_context(), b.query_context()));
    assert!(a.query_context().memory_pool().reserved_bytes() >= 8);

    let status = manager.get_task_status(&first, 0).await.unwrap();
    assert_eq!(status.self_uri, "http://127.0.0.1:50051/v1/task/q7.1.0.0");
    assert_eq!(status.node_id, "igloo-worker");
}

#[tokio::test]
async fn test_status_of_unknown_task_is_not_found() {
    let (manager, _) = manager(test_settings());
    let result = manager.get_task_status(&task_id(), 0).await;
    assert!(matches!(result, Err(WorkerError::TaskNotFound(_))));
    assert!(manager.tasks().is_empty());
}

#[tokio::test]
async fn test_results_requested_before_update_land_on_the_same_task() {
    let (manager, _) = manager(test_settings());
    let task_id = task_id();
    let pending = manager.get_task_results(&task_id, BUFFER_0, 0, 1 << 20);

    start(&manager, &task_id, false);
    let result = tokio::time::timeout(MAX_WAIT, pending).await.unwrap().unwrap();
    assert_eq!(result.pages.len(), 1);
    assert_eq!(manager.tasks().len(), 1);
}

#[tokio::test]
async fn test_cancel_before_update_wins() {
    let (manager, starter) = manager(test_settings());
    let task_id = task_id();
    assert_eq!(manager.cancel_task(&task_id).state, TaskState::Canceled);
    assert_eq!(start(&manager, &task_id, true), TaskState::Canceled);
    assert_eq!(starter.started(), 0);
}

#[tokio::test]
async fn test_remove_old_tasks_releases_terminal_tasks() {
    let settings = Settings {
        info_max_age_secs: 0,
        ..test_settings()
    };
    let (manager, _) = manager(settings);
    let done: TaskId = "q1.1.0.0".parse().unwrap();
    let running: TaskId = "q2.1.0.0".parse().unwrap();
    start(&manager, &done, false);
    start(&manager, &running, false);

    let done_task = manager.get_task(&done).unwrap();
    let cause = igloo_worker::task::ExecutionFailure::new(FailureKind::Remote, "boom");
    manager.fail_task(&done, cause);
    assert_eq!(done_task.output_buffer().state(), BufferState::NoMoreBufferIds);

    assert_eq!(manager.remove_old_tasks(), 1);
    assert!(manager.get_task(&done).is_err());
    assert!(manager.get_task(&running).is_ok());
    assert_eq!(done_task.output_buffer().state(), BufferState::Failed);
    assert_eq!(done_task.query_context().memory_pool().reserved_bytes(), 0);
    assert!(manager.query_context(&QueryId::new("q1").unwrap()).is_none());
    assert!(manager.query_context(&QueryId::new("q2").unwrap()).is_some());
}

#[tokio::test]
async fn test_fresh_terminal_tasks_are_kept_for_info_max_age() {
    let (manager, _) = manager(test_settings());
    let task_id = task_id();
    manager.abort_task(&task_id);
    assert_eq!(manager.remove_old_tasks(), 0);
    assert_eq!(manager.get_task(&task_id).unwrap().state(), TaskState::Aborted);
}

#[tokio::test]
async fn test_abandoned_tasks_are_failed() {
    let settings = Settings {
        client_timeout_secs: 0,
        ..test_settings()
    };
    let (manager, starter) = manager(settings);
    let task_id = task_id();
    start(&manager, &task_id, false);

    assert_eq!(manager.fail_abandoned_tasks(), 1);
    let status = manager.get_task_status(&task_id, 0).await.unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.failures[0].kind, FailureKind::Abandoned);
    assert!(starter.execution().is_canceled());

    assert_eq!(manager.fail_abandoned_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_runs_until_shutdown() {
    let settings = Settings {
        client_timeout_secs: 0,
        reaper_interval_secs: 1,
        ..test_settings()
    };
    let (manager, _) = manager(settings);
    let task_id = task_id();
    start(&manager, &task_id, false);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let reaper = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_reaper(shutdown_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(manager.get_task(&task_id).unwrap().state(), TaskState::Failed);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), reaper).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_aborts_live_tasks() {
    let (manager, _) = manager(test_settings());
    let live: TaskId = "q1.1.0.0".parse().unwrap();
    let finished: TaskId = "q1.2.0.0".parse().unwrap();
    start(&manager, &live, false);
    manager
        .update_task(
            &finished,
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), Vec::new(), true)],
            single_partition(),
        )
        .unwrap();

    let mut states = manager.close(Duration::from_secs(1)).await;
    states.sort_by_key(|(id, _)| id.to_string());
    assert_eq!(
        states,
        vec![(live, TaskState::Aborted), (finished, TaskState::Finished)]
    );
}
