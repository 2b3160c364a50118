mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use igloo_common::{DynamicFilterId, OutputBufferId};
use igloo_worker::buffer::{BufferType, OutputBuffersSpec};
use igloo_worker::task::domain::{Domain, DomainValue};
use igloo_worker::task::{ExecutionFailure, FailureKind, Session, TaskSource, TaskState};

const BUFFER_0: OutputBufferId = OutputBufferId(0);

#[tokio::test]
async fn test_overlapping_updates_deliver_each_split_once() {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    let task = create_task(starter.clone());

    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[1, 2]), false)],
        single_partition(),
    )
    .unwrap();
    task.update_task(
        Session::default(),
        None,
        vec![TaskSource::new(scan(), splits(&[2, 3]), false)],
        single_partition(),
    )
    .unwrap();
    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[1, 3, 4]), true)],
        single_partition(),
    )
    .unwrap();

    assert_eq!(starter.started(), 1);
    assert_eq!(starter.execution().delivered_sequence_ids(), vec![1, 2, 3, 4]);

    let info = task.task_info();
    assert_eq!(info.stats.total_splits, 4);
    assert_eq!(info.stats.completed_splits, 4);
    assert!(info.no_more_splits.contains(&scan()));
    assert_eq!(info.output_buffers.total_pages_added, 4);
}

#[tokio::test]
async fn test_closed_split_stream_stays_closed() {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    let task = create_task(starter.clone());
    let spec = OutputBuffersSpec::new(BufferType::Partitioned).with_buffer(BUFFER_0);

    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[1]), true)],
        spec.clone(),
    )
    .unwrap();
    task.update_task(
        Session::default(),
        None,
        vec![TaskSource::new(scan(), splits(&[1, 9]), false)],
        spec,
    )
    .unwrap();

    assert_eq!(starter.execution().delivered_sequence_ids(), vec![1]);
    assert!(task.task_info().no_more_splits.contains(&scan()));
}

#[tokio::test]
async fn test_status_version_increases_on_every_change() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    let v0 = task.task_status().version;

    let v1 = task
        .update_task(
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), splits(&[1]), false)],
            single_partition(),
        )
        .unwrap()
        .version;
    assert!(v1 > v0);

    task.update_dynamic_filter_domains(HashMap::from([(
        DynamicFilterId::new("f"),
        Domain::single_value(DomainValue::Int(1)),
    )]));
    let v2 = task.task_status().version;
    assert_eq!(v2, v1 + 1);

    let v3 = task.cancel().version;
    assert!(v3 > v2);
    assert_eq!(task.task_status().version, v3);
}

#[tokio::test]
async fn test_first_failure_is_retained() {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    let task = create_task(starter.clone());
    task.update_task(Session::default(), Some(fragment()), Vec::new(), single_partition())
        .unwrap();

    task.failed(ExecutionFailure::new(FailureKind::Remote, "A"));
    task.failed(ExecutionFailure::new(FailureKind::Remote, "B"));
    let status = task.cancel();

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].message, "A");
    assert!(starter.execution().is_canceled());
}

#[tokio::test]
async fn test_drained_buffer_finishes_task() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    let status = task
        .update_task(
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), splits(&[1, 2]), true)],
            single_partition(),
        )
        .unwrap();
    assert_eq!(status.state, TaskState::Running);

    let result = task.get_task_results(BUFFER_0, 0, 1 << 20).await.unwrap();
    assert_eq!(result.pages.len(), 2);
    assert!(!result.buffer_complete);

    task.acknowledge_task_results(BUFFER_0, result.next_token);
    let last = task.get_task_results(BUFFER_0, result.next_token, 1 << 20).await.unwrap();
    assert!(last.buffer_complete);
    assert_eq!(task.state(), TaskState::Finished);
}

#[tokio::test]
async fn test_repeated_get_does_not_advance() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[1, 2, 3]), false)],
        single_partition(),
    )
    .unwrap();

    let first = task.get_task_results(BUFFER_0, 0, 1 << 20).await.unwrap();
    let second = task.get_task_results(BUFFER_0, 0, 1 << 20).await.unwrap();
    assert_eq!(first, second);

    let buffers = task.task_info().output_buffers.buffers;
    assert_eq!(buffers[0].acknowledged_pages, 0);
    assert_eq!(buffers[0].buffered_pages, 3);
}

#[tokio::test]
async fn test_empty_task_finishes_immediately() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    let status = task
        .update_task(
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), Vec::new(), true)],
            single_partition(),
        )
        .unwrap();
    assert_eq!(status.state, TaskState::Finished);
    assert!(status.end_time.is_some());
}

#[tokio::test]
async fn test_aborting_results_of_single_buffer_finishes_task() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[1]), true)],
        single_partition(),
    )
    .unwrap();
    assert_eq!(task.output_buffer().get_info().total_pages_added, 1);

    task.abort_task_results(BUFFER_0);
    let result = task.get_task_results(BUFFER_0, 0, 1 << 20).await.unwrap();
    assert!(result.buffer_complete);
    assert_eq!(task.state(), TaskState::Finished);
}

#[tokio::test]
async fn test_cancel_completes_pending_read() {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    let task = create_task(starter.clone());
    task.update_task(Session::default(), Some(fragment()), Vec::new(), single_partition())
        .unwrap();

    let pending = task.get_task_results(BUFFER_0, 0, 1 << 20);
    task.cancel();
    let result = tokio::time::timeout(MAX_WAIT, pending).await.unwrap().unwrap();
    assert!(result.buffer_complete);
    assert!(result.pages.is_empty());

    let status = task.get_task_status(0).await;
    assert_eq!(status.state, TaskState::Canceled);
    assert!(status.end_time.is_some());
    assert!(starter.execution().is_canceled());
}

#[tokio::test]
async fn test_failed_task_keeps_buffered_pages() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    task.update_task(
        Session::default(),
        Some(fragment()),
        vec![TaskSource::new(scan(), splits(&[7]), false)],
        single_partition(),
    )
    .unwrap();

    task.failed(ExecutionFailure::new(FailureKind::Remote, "upstream task failed"));
    let result = task.get_task_results(BUFFER_0, 0, 1 << 20).await.unwrap();
    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.pages[0].data(), &[7u8; 4]);
    assert!(!result.buffer_complete);
}

#[tokio::test]
async fn test_dynamic_filter_update_wakes_status_poll() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    task.update_task(Session::default(), Some(fragment()), Vec::new(), single_partition())
        .unwrap();
    let before = task.task_status();

    let poll = {
        let task = task.clone();
        let version = before.version;
        tokio::spawn(async move { task.get_task_status(version).await })
    };
    tokio::task::yield_now().await;

    task.update_dynamic_filter_domains(HashMap::from([(
        DynamicFilterId::new("f"),
        Domain::range(DomainValue::Int(0), DomainValue::Int(10)),
    )]));
    let after = tokio::time::timeout(Duration::from_millis(150), poll)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(after.version, before.version + 1);
    assert_eq!(after.dynamic_filters_version, before.dynamic_filters_version + 1);
    let domains = task.get_dynamic_filter_domains(before.dynamic_filters_version);
    assert_eq!(domains.version, after.dynamic_filters_version);
    assert!(domains.domains.contains_key(&DynamicFilterId::new("f")));
}

#[tokio::test(start_paused = true)]
async fn test_status_poll_returns_after_max_wait() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    let current = task.task_status().version;
    let status = task.get_task_status(current).await;
    assert_eq!(status.version, current);
    assert_eq!(status.state, TaskState::Planned);
}

#[tokio::test]
async fn test_status_poll_on_terminal_task_returns_immediately() {
    let task = create_task(FakeStarter::routing_to(Some(BUFFER_0)));
    let status = task.abort();
    let info = task.get_task_info(status.version);
    let polled = tokio::time::timeout(Duration::from_millis(50), info)
        .await
        .unwrap();
    assert_eq!(polled.status.state, TaskState::Aborted);
}

#[tokio::test]
async fn test_update_after_cancel_is_ignored() {
    let starter = FakeStarter::routing_to(Some(BUFFER_0));
    let task = create_task(starter.clone());
    task.cancel();
    let status = task
        .update_task(
            Session::default(),
            Some(fragment()),
            vec![TaskSource::new(scan(), splits(&[1]), true)],
            single_partition(),
        )
        .unwrap();
    assert_eq!(status.state, TaskState::Canceled);
    assert_eq!(starter.started(), 0);
}

#[tokio::test]
async fn test_buffer_type_change_is_rejected() {
    let task = create_task(FakeStarter::routing_to(None));
    task.update_task(
        Session::default(),
        Some(fragment()),
        Vec::new(),
        OutputBuffersSpec::new(BufferType::Broadcast).with_buffer(BUFFER_0),
    )
    .unwrap();
    let err = task.update_task(
        Session::default(),
        None,
        Vec::new(),
        OutputBuffersSpec::new(BufferType::Arbitrary).with_buffer(BUFFER_0),
    );
    assert!(err.is_err());
}
