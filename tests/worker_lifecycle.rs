//! Worker lifecycle: draining, faults and state transitions.

mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::timeout;

use chat_worker::config::WorkerLimits;
use chat_worker::error::Error;
use chat_worker::pipeline::{JobResult, TaskPipeline};
use chat_worker::queue::{LineQueue, MemoryQueue};
use chat_worker::worker::{ShutdownReason, WorkerController, WorkerState};

use common::{RecordingStore, Reply, StubInference, TEST_TIMEOUT};

fn worker(
    llm: Arc<StubInference>,
    queue: Arc<MemoryQueue>,
    limits: WorkerLimits,
) -> WorkerController {
    let pipeline = Arc::new(TaskPipeline::new(
        RecordingStore::new(),
        llm,
        queue.clone(),
        Duration::from_secs(2),
    ));
    WorkerController::new(pipeline, queue, limits)
}

#[tokio::test]
async fn scenario_e_in_flight_job_finishes_before_stop() {
    let llm = StubInference::new();
    let queue = Arc::new(MemoryQueue::new());
    llm.reply("slow question", Reply::Gated("slow answer".to_string()));
    queue.push_job("u5", "slow question");

    let worker = worker(llm.clone(), queue.clone(), WorkerLimits::default());
    let mut states = worker.subscribe_state();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(worker.run(async move {
        let _ = stop_rx.await;
    }));

    // The job is inside inference when the signal arrives.
    timeout(TEST_TIMEOUT, llm.started.notified()).await.expect("job never started");
    stop_tx.send(()).unwrap();
    timeout(TEST_TIMEOUT, states.wait_for(|s| *s == WorkerState::Draining))
        .await
        .expect("never started draining")
        .unwrap();

    // Nothing is accepted after the signal.
    queue.push_job("u6", "too late");
    assert_ne!(*states.borrow(), WorkerState::Stopped);

    llm.release.notify_one();
    let reason = timeout(TEST_TIMEOUT, running)
        .await
        .expect("worker hung")
        .unwrap()
        .unwrap();

    assert_eq!(reason, ShutdownReason::Signal);
    assert_eq!(*states.borrow(), WorkerState::Stopped);
    assert_eq!(queue.published(), vec![JobResult::new("u5", "slow answer")]);
    assert_eq!(queue.acked().len(), 1);
    assert!(llm.calls().iter().all(|(user, _, _)| user != "u6"));
    assert!(queue.is_closed());
}

#[tokio::test]
async fn states_move_through_the_full_lifecycle() {
    let llm = StubInference::new();
    let queue = Arc::new(MemoryQueue::new());
    queue.push_job("u1", "hello");
    queue.finish();

    let worker = worker(llm, queue.clone(), WorkerLimits::default());
    let mut states = worker.subscribe_state();
    let seen = tokio::spawn(async move {
        let mut seen = vec![*states.borrow_and_update()];
        while states.changed().await.is_ok() {
            seen.push(*states.borrow_and_update());
            if seen.last() == Some(&WorkerState::Stopped) {
                break;
            }
        }
        seen
    });

    let reason = timeout(TEST_TIMEOUT, worker.run(std::future::pending()))
        .await
        .expect("worker hung")
        .unwrap();
    assert_eq!(reason, ShutdownReason::QueueClosed);

    let seen = timeout(TEST_TIMEOUT, seen).await.unwrap().unwrap();
    assert_eq!(seen.first(), Some(&WorkerState::Starting));
    assert_eq!(seen.last(), Some(&WorkerState::Stopped));
    // watch may coalesce intermediate values but never goes backwards.
    let rank = |state: &WorkerState| match state {
        WorkerState::Starting => 0,
        WorkerState::Running => 1,
        WorkerState::Draining => 2,
        WorkerState::Stopped => 3,
    };
    assert!(seen.windows(2).all(|w| rank(&w[0]) < rank(&w[1])));
}

#[tokio::test]
async fn panicking_job_is_a_fault() {
    let llm = StubInference::new();
    let queue = Arc::new(MemoryQueue::new());
    llm.reply("boom", Reply::Panic);
    queue.push_job("u1", "boom");

    let worker = worker(llm, queue.clone(), WorkerLimits::default());
    let result = timeout(TEST_TIMEOUT, worker.run(std::future::pending()))
        .await
        .expect("worker hung");

    match result {
        Err(Error::Fault(message)) => assert!(message.contains("panicked")),
        other => panic!("expected fault, got {other:?}"),
    }
    assert!(queue.is_closed());
}

#[tokio::test]
async fn drain_timeout_aborts_and_reports_failure() {
    let llm = StubInference::new();
    let queue = Arc::new(MemoryQueue::new());
    llm.reply("stuck", Reply::Gated("never".to_string()));
    queue.push_job("u1", "stuck");

    let limits = WorkerLimits {
        drain_timeout: Duration::from_millis(100),
        ..WorkerLimits::default()
    };
    let worker = worker(llm.clone(), queue.clone(), limits);
    let started = llm.clone();
    let result = timeout(
        TEST_TIMEOUT,
        worker.run(async move { started.started.notified().await }),
    )
    .await
    .expect("worker hung");

    match result {
        Err(Error::Fault(message)) => assert!(message.contains("drain timed out")),
        other => panic!("expected drain fault, got {other:?}"),
    }
    assert!(queue.published().is_empty());
    assert!(queue.is_closed());
}

#[tokio::test]
async fn concurrency_limit_caps_in_flight_jobs() {
    let llm = StubInference::new();
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..6 {
        let query = format!("q{i}");
        llm.reply(&query, Reply::Delayed(Duration::from_millis(50), format!("r{i}")));
        queue.push_job(&format!("user{i}"), &query);
    }
    queue.finish();

    let limits = WorkerLimits {
        max_concurrent_jobs: 2,
        ..WorkerLimits::default()
    };
    let worker = worker(llm, queue.clone(), limits);
    let started = std::time::Instant::now();
    let reason = timeout(TEST_TIMEOUT, worker.run(std::future::pending()))
        .await
        .expect("worker hung")
        .unwrap();

    assert_eq!(reason, ShutdownReason::QueueClosed);
    assert_eq!(queue.published().len(), 6);
    // Six 50ms jobs two at a time take at least three rounds.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn line_transport_skips_bad_lines_and_publishes_every_job() {
    let mut input = Vec::new();
    input.extend_from_slice(b"{\"userId\":\"u1\",\"query\":\"one\"}\n");
    input.extend_from_slice(b"\xff\xfe\x00 binary\n");
    input.extend_from_slice(b"not json at all\n");
    input.extend_from_slice(b"{\"userId\":\"u2\",\"query\":\"two\"}\r\n");
    input.extend_from_slice(b"\n{\"userId\":\"u1\"}\n");
    // Last line has no newline.
    input.extend_from_slice(b"{\"userId\":\"u1\",\"query\":\"three\"}");

    let (writer, peer) = tokio::io::duplex(4096);
    let queue = Arc::new(LineQueue::new(Cursor::new(input), writer));
    let store = RecordingStore::new();
    let pipeline = Arc::new(TaskPipeline::new(
        store.clone(),
        StubInference::new(),
        queue.clone(),
        Duration::from_secs(2),
    ));

    let worker = WorkerController::new(pipeline, queue, WorkerLimits::default());
    let reason = timeout(TEST_TIMEOUT, worker.run(std::future::pending()))
        .await
        .expect("worker hung")
        .unwrap();
    assert_eq!(reason, ShutdownReason::QueueClosed);

    let mut published = Vec::new();
    let mut lines = BufReader::new(peer).lines();
    while let Some(line) = timeout(TEST_TIMEOUT, lines.next_line()).await.unwrap().unwrap() {
        published.push(serde_json::from_str::<JobResult>(&line).unwrap());
    }
    published.sort_by(|a, b| a.response.cmp(&b.response));
    assert_eq!(
        published,
        vec![
            JobResult::new("u1", "re: one"),
            JobResult::new("u1", "re: three"),
            JobResult::new("u2", "re: two"),
        ]
    );
    assert_eq!(store.inputs_for("u1"), vec!["one", "three"]);
}
