use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::AudioBlob;
use crate::events::{EventSender, SessionEvent};
use crate::store::{RecordStatus, RecordStore, RecordingUpdate};

/// Highest priority a task can be enqueued with.
pub const MAX_PRIORITY: u8 = 10;

/// Retry backoff is capped at this many seconds.
const MAX_BACKOFF_SECS: u64 = 300;

/// Queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Bounded worker pool size.
    pub worker_count: usize,
    /// Retries allowed per task before it is terminally failed.
    pub max_retries: u32,
    /// Global switch for automatic retries.
    pub auto_retry: bool,
    /// Per-task wall-clock budget for the processing collaborator.
    pub processing_timeout_secs: u64,
    /// Cap on each of the completed and failed maps (oldest evicted).
    pub finished_cap: usize,
    /// How long the dispatch loop blocks waiting for work before re-checking
    /// for shutdown.
    pub dispatch_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_retries: 3,
            auto_retry: true,
            processing_timeout_secs: 600,
            finished_cap: 100,
            dispatch_poll_ms: 500,
        }
    }
}

/// One finished recording awaiting transcript + note generation.
#[derive(Clone)]
pub struct RecordingJob {
    /// Id of the recording in the external record store.
    pub recording_id: String,
    pub patient_context: String,
    pub audio: Arc<AudioBlob>,
}

/// What the processing collaborator produces.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub transcript: String,
    pub note: String,
}

/// Transcription + note-generation collaborator, run on worker tasks.
/// Implementations should check the cancellation token at safe points.
#[async_trait]
pub trait NoteProcessor: Send + Sync {
    async fn process(
        &self,
        job: &RecordingJob,
        cancel: &CancellationToken,
    ) -> Result<ProcessingOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Bookkeeping for one queue task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub priority: u8,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Point-in-time queue snapshot, safe to call from any thread.
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_processing_secs: f64,
}

/// Exponential retry backoff: `min(300, 2^r)` seconds, where `r` is the
/// number of retries already performed.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = 2u64
        .checked_pow(retry_count)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

struct PendingEntry {
    priority: u8,
    seq: u64,
    task_id: String,
    retry_count: u32,
    job: RecordingJob,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    /// Max-heap: higher priority first, insertion order within a priority.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<PendingEntry>,
    next_seq: u64,
    /// Queued and processing tasks.
    tasks: HashMap<String, TaskRecord>,
    completed: HashMap<String, TaskRecord>,
    completed_order: VecDeque<String>,
    failed: HashMap<String, TaskRecord>,
    failed_order: VecDeque<String>,
    cancel_tokens: HashMap<String, CancellationToken>,
    processed_count: u64,
    processing_secs_total: f64,
}

impl QueueState {
    fn record_completed(&mut self, record: TaskRecord, cap: usize) {
        self.completed_order.push_back(record.task_id.clone());
        self.completed.insert(record.task_id.clone(), record);
        while self.completed_order.len() > cap {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }

    fn record_failed(&mut self, record: TaskRecord, cap: usize) {
        self.failed_order.push_back(record.task_id.clone());
        self.failed.insert(record.task_id.clone(), record);
        while self.failed_order.len() > cap {
            if let Some(old) = self.failed_order.pop_front() {
                self.failed.remove(&old);
            }
        }
    }
}

struct QueueCtx {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    workers: Arc<Semaphore>,
    processor: Arc<dyn NoteProcessor>,
    store: Arc<dyn RecordStore>,
    events: EventSender,
    shutdown: AtomicBool,
}

/// Background queue turning finished recordings into transcripts and notes
/// without blocking the next session.
///
/// A dedicated dispatch task pops the highest-priority pending entry and
/// hands it to a bounded worker pool. Failures retry with exponential
/// backoff via deferred timers, drifting one priority level lower per retry
/// so a repeatedly failing task cannot starve fresh work.
pub struct ProcessingQueue {
    ctx: Arc<QueueCtx>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingQueue {
    pub fn new(
        config: QueueConfig,
        processor: Arc<dyn NoteProcessor>,
        store: Arc<dyn RecordStore>,
        events: EventSender,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        let ctx = Arc::new(QueueCtx {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            workers,
            processor,
            store,
            events,
            shutdown: AtomicBool::new(false),
        });
        Self {
            ctx,
            dispatch: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop. Idempotent.
    pub fn start(&self) {
        let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        if dispatch.is_some() {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        *dispatch = Some(tokio::spawn(dispatch_loop(ctx)));
        info!("Processing queue started");
    }

    /// Accept a finished recording. Returns the task id.
    pub fn enqueue(&self, job: RecordingJob, priority: u8) -> String {
        let priority = priority.min(MAX_PRIORITY);
        let task_id = uuid::Uuid::new_v4().to_string();

        {
            let mut state = self.ctx.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.tasks.insert(
                task_id.clone(),
                TaskRecord {
                    task_id: task_id.clone(),
                    priority,
                    retry_count: 0,
                    status: TaskStatus::Queued,
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    error: None,
                },
            );
            state.heap.push(PendingEntry {
                priority,
                seq,
                task_id: task_id.clone(),
                retry_count: 0,
                job,
            });
        }

        info!("Enqueued task {} (priority {})", task_id, priority);
        self.ctx.events.emit(SessionEvent::TaskQueued {
            task_id: task_id.clone(),
            priority,
        });
        self.ctx.notify.notify_one();
        task_id
    }

    /// Best-effort cancellation.
    ///
    /// Guaranteed for tasks still queued (removed before they run). For an
    /// in-flight task the cancellation token is triggered and honoring it is
    /// up to the processor. Returns `false` for finished or unknown tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.ctx.lock_state();

        match state.tasks.get(task_id).map(|t| t.status) {
            Some(TaskStatus::Queued) => {
                let remaining: Vec<PendingEntry> = state
                    .heap
                    .drain()
                    .filter(|entry| entry.task_id != task_id)
                    .collect();
                state.heap = remaining.into_iter().collect();

                // The dispatch loop may have already popped the entry while
                // waiting for a worker permit; a pre-cancelled token makes
                // the worker drop it before calling the processor.
                state
                    .cancel_tokens
                    .entry(task_id.to_string())
                    .or_default()
                    .cancel();

                if let Some(mut record) = state.tasks.remove(task_id) {
                    record.status = TaskStatus::Failed;
                    record.error = Some("cancelled".to_string());
                    record.finished_at = Some(Utc::now());
                    let cap = self.ctx.config.finished_cap;
                    state.record_failed(record, cap);
                }
                info!("Cancelled queued task {}", task_id);
                true
            }
            Some(TaskStatus::Processing) => {
                if let Some(token) = state.cancel_tokens.get(task_id) {
                    token.cancel();
                    info!("Requested cancellation of in-flight task {}", task_id);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Point-in-time snapshot; never exposes live references.
    pub fn status(&self) -> QueueStatus {
        let state = self.ctx.lock_state();
        let queued = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count();
        let processing = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .count();
        let average = if state.processed_count > 0 {
            state.processing_secs_total / state.processed_count as f64
        } else {
            0.0
        };
        QueueStatus {
            queued,
            processing,
            completed: state.completed.len(),
            failed: state.failed.len(),
            average_processing_secs: average,
        }
    }

    /// Copy of one task's bookkeeping, wherever it currently lives.
    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        let state = self.ctx.lock_state();
        state
            .tasks
            .get(task_id)
            .or_else(|| state.completed.get(task_id))
            .or_else(|| state.failed.get(task_id))
            .cloned()
    }

    /// Stop the dispatch loop. In-flight workers finish on their own.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.store(true, Ordering::SeqCst);
        // Closing the semaphore wakes a dispatch loop parked on a worker
        // permit; the entry it holds goes back into the heap.
        self.ctx.workers.close();
        self.ctx.notify.notify_waiters();
        let handle = {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            dispatch.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatch loop panicked: {}", e);
            }
        }
        info!("Processing queue stopped");
    }
}

impl QueueCtx {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn dispatch_loop(ctx: Arc<QueueCtx>) {
    info!("Dispatch loop started");
    let poll = Duration::from_millis(ctx.config.dispatch_poll_ms.max(50));

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let entry = ctx.lock_state().heap.pop();
        let Some(entry) = entry else {
            // Block with a timeout so shutdown stays responsive.
            let _ = tokio::time::timeout(poll, ctx.notify.notified()).await;
            continue;
        };

        let permit = match Arc::clone(&ctx.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Shutdown closed the semaphore while this entry waited for
                // a worker; re-queue it so its record does not strand.
                ctx.lock_state().heap.push(entry);
                break;
            }
        };

        let worker_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _permit = permit;
            run_task(worker_ctx, entry).await;
        });
    }

    info!("Dispatch loop stopped");
}

async fn run_task(ctx: Arc<QueueCtx>, entry: PendingEntry) {
    let task_id = entry.task_id.clone();

    let cancel = {
        let mut state = ctx.lock_state();
        let token = state
            .cancel_tokens
            .entry(task_id.clone())
            .or_default()
            .clone();

        if !token.is_cancelled() {
            if let Some(record) = state.tasks.get_mut(&task_id) {
                record.status = TaskStatus::Processing;
                record.started_at = Some(Utc::now());
            }
        }
        token
    };

    if cancel.is_cancelled() {
        // Cancelled between pop and start; cancel() already moved the record.
        ctx.lock_state().cancel_tokens.remove(&task_id);
        return;
    }

    if let Err(e) = ctx
        .store
        .update_recording(
            &entry.job.recording_id,
            RecordingUpdate::status(RecordStatus::Processing),
        )
        .await
    {
        warn!("Failed to persist processing status: {:#}", e);
    }

    let started = std::time::Instant::now();
    let timeout = Duration::from_secs(ctx.config.processing_timeout_secs.max(1));

    let result = match tokio::time::timeout(timeout, ctx.processor.process(&entry.job, &cancel)).await
    {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!(
            "processing timed out after {}s",
            timeout.as_secs()
        )),
    };

    match result {
        Ok(outcome) => {
            complete_task(&ctx, &entry, outcome, started.elapsed().as_secs_f64()).await;
        }
        Err(message) if cancel.is_cancelled() => {
            fail_task(&ctx, &entry, format!("cancelled: {}", message)).await;
        }
        Err(message) => {
            let retry_allowed =
                ctx.config.auto_retry && entry.retry_count < ctx.config.max_retries;
            if retry_allowed {
                schedule_retry(&ctx, entry, message);
            } else {
                fail_task(&ctx, &entry, message).await;
            }
        }
    }
}

async fn complete_task(
    ctx: &Arc<QueueCtx>,
    entry: &PendingEntry,
    outcome: ProcessingOutcome,
    processing_secs: f64,
) {
    {
        let mut state = ctx.lock_state();
        state.cancel_tokens.remove(&entry.task_id);
        if let Some(mut record) = state.tasks.remove(&entry.task_id) {
            record.status = TaskStatus::Completed;
            record.finished_at = Some(Utc::now());
            let cap = ctx.config.finished_cap;
            state.record_completed(record, cap);
        }
        state.processed_count += 1;
        state.processing_secs_total += processing_secs;
    }

    if let Err(e) = ctx
        .store
        .update_recording(
            &entry.job.recording_id,
            RecordingUpdate {
                status: Some(RecordStatus::Completed),
                transcript: Some(outcome.transcript.clone()),
                note: Some(outcome.note.clone()),
                error: None,
            },
        )
        .await
    {
        warn!("Failed to persist completed recording: {:#}", e);
    }

    info!(
        "Task {} completed in {:.1}s",
        entry.task_id, processing_secs
    );
    ctx.events.emit(SessionEvent::TaskCompleted {
        task_id: entry.task_id.clone(),
        transcript: outcome.transcript,
        note: outcome.note,
        processing_secs,
    });
}

async fn fail_task(ctx: &Arc<QueueCtx>, entry: &PendingEntry, message: String) {
    {
        let mut state = ctx.lock_state();
        state.cancel_tokens.remove(&entry.task_id);
        if let Some(mut record) = state.tasks.remove(&entry.task_id) {
            record.status = TaskStatus::Failed;
            record.error = Some(message.clone());
            record.finished_at = Some(Utc::now());
            let cap = ctx.config.finished_cap;
            state.record_failed(record, cap);
        }
    }

    if let Err(e) = ctx
        .store
        .update_recording(
            &entry.job.recording_id,
            RecordingUpdate {
                status: Some(RecordStatus::Failed),
                transcript: None,
                note: None,
                error: Some(message.clone()),
            },
        )
        .await
    {
        warn!("Failed to persist failed recording: {:#}", e);
    }

    error!("Task {} failed: {}", entry.task_id, message);
    ctx.events.emit(SessionEvent::TaskFailed {
        task_id: entry.task_id.clone(),
        error: message,
    });
}

/// Re-enqueue after an exponential backoff on a deferred timer, one priority
/// level lower. Retries of one task are strictly sequential: this timer is
/// the only path back into the heap.
fn schedule_retry(ctx: &Arc<QueueCtx>, entry: PendingEntry, message: String) {
    let delay = backoff_delay(entry.retry_count);
    let attempt = entry.retry_count + 1;
    let new_priority = entry.priority.saturating_sub(1);

    {
        let mut state = ctx.lock_state();
        if let Some(record) = state.tasks.get_mut(&entry.task_id) {
            record.status = TaskStatus::Queued;
            record.retry_count = attempt;
            record.priority = new_priority;
            record.error = Some(message.clone());
        }
    }

    warn!(
        "Task {} failed ({}); retry {}/{} in {}s",
        entry.task_id,
        message,
        attempt,
        ctx.config.max_retries,
        delay.as_secs()
    );
    ctx.events.emit(SessionEvent::TaskRetryScheduled {
        task_id: entry.task_id.clone(),
        attempt,
        delay_secs: delay.as_secs(),
    });

    let retry_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if retry_ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = retry_ctx.lock_state();
            // Dropped if the task was cancelled while waiting.
            if !state.tasks.contains_key(&entry.task_id) {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(PendingEntry {
                priority: new_priority,
                seq,
                task_id: entry.task_id.clone(),
                retry_count: attempt,
                job: entry.job,
            });
        }
        retry_ctx.notify.notify_one();
    });
}
