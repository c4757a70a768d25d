// Tests for the background processing queue: priority dispatch, retry with
// exponential backoff, cancellation, and status snapshots.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clinscribe::queue::backoff_delay;
use clinscribe::{
    AudioBlob, EventSender, MemoryRecordStore, NoteProcessor, ProcessingOutcome, ProcessingQueue,
    QueueConfig, RecordStatus, RecordStore, RecordingJob, SessionEvent, TaskStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct OkProcessor {
    order: Mutex<Vec<String>>,
}

impl OkProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            order: Mutex::new(Vec::new()),
        })
    }

    fn processed(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl NoteProcessor for OkProcessor {
    async fn process(
        &self,
        job: &RecordingJob,
        _cancel: &CancellationToken,
    ) -> Result<ProcessingOutcome> {
        self.order.lock().unwrap().push(job.recording_id.clone());
        Ok(ProcessingOutcome {
            transcript: format!("transcript for {}", job.recording_id),
            note: format!("note for {}", job.recording_id),
        })
    }
}

struct FailingProcessor {
    attempts: AtomicUsize,
}

impl FailingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NoteProcessor for FailingProcessor {
    async fn process(
        &self,
        _job: &RecordingJob,
        _cancel: &CancellationToken,
    ) -> Result<ProcessingOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("backend unavailable"))
    }
}

fn job(recording_id: &str) -> RecordingJob {
    RecordingJob {
        recording_id: recording_id.to_string(),
        patient_context: "follow-up visit".to_string(),
        audio: Arc::new(AudioBlob {
            samples: vec![0i16; 16000],
            sample_rate: 16000,
        }),
    }
}

fn test_config() -> QueueConfig {
    QueueConfig {
        worker_count: 1,
        dispatch_poll_ms: 50,
        ..QueueConfig::default()
    }
}

/// Poll until `predicate` holds or the (tokio-clock) deadline passes.
async fn wait_until<F: Fn() -> bool>(predicate: F, what: &str) {
    for _ in 0..2000 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn backoff_follows_capped_exponential() {
    assert_eq!(backoff_delay(0), Duration::from_secs(1));
    assert_eq!(backoff_delay(1), Duration::from_secs(2));
    assert_eq!(backoff_delay(3), Duration::from_secs(8));
    assert_eq!(backoff_delay(8), Duration::from_secs(256));
    assert_eq!(backoff_delay(9), Duration::from_secs(300));
    assert_eq!(backoff_delay(40), Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn higher_priority_task_is_dispatched_first() {
    let processor = OkProcessor::new();
    let store = Arc::new(MemoryRecordStore::new());
    let queue = ProcessingQueue::new(
        test_config(),
        processor.clone(),
        store,
        EventSender::disabled(),
    );

    // Enqueue both before the dispatch loop starts so they are pending
    // simultaneously.
    queue.enqueue(job("routine"), 5);
    queue.enqueue(job("urgent"), 8);
    queue.start();

    wait_until(|| processor.processed().len() == 2, "both tasks to finish").await;
    assert_eq!(
        processor.processed(),
        vec!["urgent".to_string(), "routine".to_string()]
    );
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn completion_updates_store_and_emits_event() {
    let processor = OkProcessor::new();
    let store = Arc::new(MemoryRecordStore::new());
    let (events, mut rx) = EventSender::channel();
    let queue = ProcessingQueue::new(test_config(), processor, store.clone(), events);
    queue.start();

    let task_id = queue.enqueue(job("rec-1"), 5);
    wait_until(
        || {
            matches!(
                queue.task(&task_id).map(|t| t.status),
                Some(TaskStatus::Completed)
            )
        },
        "task completion",
    )
    .await;

    let record = store.get_recording("rec-1").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.transcript.as_deref(), Some("transcript for rec-1"));
    assert_eq!(record.note.as_deref(), Some("note for rec-1"));

    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::TaskCompleted {
            task_id: id,
            transcript,
            ..
        } = event
        {
            assert_eq!(id, task_id);
            assert_eq!(transcript, "transcript for rec-1");
            saw_completed = true;
        }
    }
    assert!(saw_completed);

    let status = queue.status();
    assert_eq!(status.completed, 1);
    assert_eq!(status.queued, 0);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_task_retries_with_backoff_then_fails() {
    let processor = FailingProcessor::new();
    let store = Arc::new(MemoryRecordStore::new());
    let (events, mut rx) = EventSender::channel();
    let queue = ProcessingQueue::new(
        QueueConfig {
            max_retries: 2,
            ..test_config()
        },
        processor.clone(),
        store.clone(),
        events,
    );
    queue.start();

    let task_id = queue.enqueue(job("rec-fail"), 5);
    wait_until(
        || {
            matches!(
                queue.task(&task_id).map(|t| t.status),
                Some(TaskStatus::Failed)
            )
        },
        "task to exhaust retries",
    )
    .await;

    // Initial attempt plus exactly max_retries retries.
    assert_eq!(processor.attempts.load(Ordering::SeqCst), 3);
    let record = queue.task(&task_id).unwrap();
    assert_eq!(record.retry_count, 2);
    assert!(record.error.as_deref().unwrap_or("").contains("backend unavailable"));

    // Retries drift one priority level lower each time.
    assert_eq!(record.priority, 3);

    let external = store.get_recording("rec-fail").await.unwrap().unwrap();
    assert_eq!(external.status, RecordStatus::Failed);
    assert!(external.error.is_some());

    let mut retry_delays = Vec::new();
    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::TaskRetryScheduled { delay_secs, .. } => retry_delays.push(delay_secs),
            SessionEvent::TaskFailed { task_id: id, .. } => {
                assert_eq!(id, task_id);
                saw_failed = true;
            }
            _ => {}
        }
    }
    assert_eq!(retry_delays, vec![1, 2], "backoff follows min(300, 2^n)");
    assert!(saw_failed);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn auto_retry_can_be_disabled() {
    let processor = FailingProcessor::new();
    let queue = ProcessingQueue::new(
        QueueConfig {
            auto_retry: false,
            ..test_config()
        },
        processor.clone(),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );
    queue.start();

    let task_id = queue.enqueue(job("rec-once"), 5);
    wait_until(
        || {
            matches!(
                queue.task(&task_id).map(|t| t.status),
                Some(TaskStatus::Failed)
            )
        },
        "task failure",
    )
    .await;

    assert_eq!(processor.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(queue.task(&task_id).unwrap().retry_count, 0);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_removes_queued_task_before_it_runs() {
    let processor = OkProcessor::new();
    let queue = ProcessingQueue::new(
        test_config(),
        processor.clone(),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );

    // Not started yet: the task can only be queued.
    let task_id = queue.enqueue(job("rec-cancel"), 5);
    assert!(queue.cancel(&task_id));
    queue.start();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(processor.processed().is_empty(), "cancelled task must not run");

    let record = queue.task(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("cancelled"));

    // A second cancel of the same task reports failure.
    assert!(!queue.cancel(&task_id));
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn finished_cap_evicts_oldest_completed_records() {
    let processor = OkProcessor::new();
    let queue = ProcessingQueue::new(
        QueueConfig {
            finished_cap: 2,
            ..test_config()
        },
        processor.clone(),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );

    // Same priority, so the single worker finishes them in insertion order.
    let first = queue.enqueue(job("rec-1"), 5);
    let second = queue.enqueue(job("rec-2"), 5);
    let third = queue.enqueue(job("rec-3"), 5);
    queue.start();

    wait_until(|| processor.processed().len() == 3, "all tasks to finish").await;
    wait_until(|| queue.status().completed == 2, "oldest record eviction").await;

    assert!(queue.task(&first).is_none(), "oldest completed record evicted");
    assert!(queue.task(&second).is_some());
    assert!(queue.task(&third).is_some());
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn finished_cap_evicts_oldest_failed_records() {
    let processor = FailingProcessor::new();
    let queue = ProcessingQueue::new(
        QueueConfig {
            finished_cap: 1,
            auto_retry: false,
            ..test_config()
        },
        processor.clone(),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );

    let first = queue.enqueue(job("rec-a"), 5);
    let second = queue.enqueue(job("rec-b"), 5);
    queue.start();

    wait_until(
        || processor.attempts.load(Ordering::SeqCst) == 2,
        "both tasks to fail",
    )
    .await;
    wait_until(|| queue.task(&first).is_none(), "oldest failed record eviction").await;

    assert_eq!(queue.status().failed, 1);
    assert_eq!(queue.task(&second).unwrap().status, TaskStatus::Failed);
    queue.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_requeues_entry_waiting_for_a_worker() {
    struct BlockedProcessor {
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl NoteProcessor for BlockedProcessor {
        async fn process(
            &self,
            job: &RecordingJob,
            _cancel: &CancellationToken,
        ) -> Result<ProcessingOutcome> {
            self.gate.notified().await;
            Ok(ProcessingOutcome {
                transcript: job.recording_id.clone(),
                note: String::new(),
            })
        }
    }

    let queue = ProcessingQueue::new(
        test_config(),
        Arc::new(BlockedProcessor {
            gate: tokio::sync::Notify::new(),
        }),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );
    queue.start();

    let blocked = queue.enqueue(job("rec-busy"), 5);
    wait_until(
        || queue.status().processing == 1,
        "worker to pick up the first task",
    )
    .await;

    // The dispatch loop pops this entry and then parks waiting for the one
    // worker permit the blocked task holds.
    let waiting = queue.enqueue(job("rec-waiting"), 5);
    tokio::time::sleep(Duration::from_millis(500)).await;

    queue.shutdown().await;

    assert_eq!(queue.task(&waiting).unwrap().status, TaskStatus::Queued);
    assert_eq!(queue.status().queued, 1, "popped entry returned to the heap");
    assert_eq!(queue.task(&blocked).unwrap().status, TaskStatus::Processing);
}

#[tokio::test(start_paused = true)]
async fn status_reports_queue_depth_before_start() {
    let queue = ProcessingQueue::new(
        test_config(),
        OkProcessor::new(),
        Arc::new(MemoryRecordStore::new()),
        EventSender::disabled(),
    );

    queue.enqueue(job("a"), 3);
    queue.enqueue(job("b"), 7);

    let status = queue.status();
    assert_eq!(status.queued, 2);
    assert_eq!(status.processing, 0);
    assert_eq!(status.completed, 0);
    assert_eq!(status.failed, 0);
}
