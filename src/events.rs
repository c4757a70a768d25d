use tokio::sync::mpsc;

/// Which configured resource limit was crossed during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    Memory,
    Duration,
}

/// Everything the core tells the presentation layer.
///
/// A single closed set of variants delivered over one channel, so the UI
/// drains events in order instead of wiring loose callbacks into every
/// component.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A finished recording was accepted by the processing queue.
    TaskQueued { task_id: String, priority: u8 },

    /// Background processing produced a transcript and note.
    TaskCompleted {
        task_id: String,
        transcript: String,
        note: String,
        processing_secs: f64,
    },

    /// Retries are exhausted (or disabled); the task is terminally failed.
    TaskFailed { task_id: String, error: String },

    /// A failed task will be re-enqueued after a backoff delay.
    TaskRetryScheduled {
        task_id: String,
        attempt: u32,
        delay_secs: u64,
    },

    /// The fallback chain is about to try another transcription provider.
    FallbackAttempted { provider: String },

    /// The health monitor gave up on the active input device.
    DeviceDisconnected { device: String },

    /// A capture limit (memory or duration) was crossed; recording continues
    /// but the operator should wrap up.
    ResourceLimitReached { kind: ResourceLimit },

    /// Periodic-analysis countdown tick: seconds remaining, `0` when the
    /// analysis starts, `-1` when the analyzer stops.
    AnalysisCountdown { seconds_remaining: i64 },

    /// One interim analysis finished.
    AnalysisCompleted { sequence: u64, text: String },

    /// An autosave snapshot was written to disk.
    AutosaveTick { snapshot_index: usize },
}

/// Cloneable, never-blocking handle for emitting [`SessionEvent`]s.
///
/// A disconnected or absent receiver is silently ignored; the core never
/// stalls on the presentation layer.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSender {
    /// Create a sender plus the receiver the presentation layer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards everything, for headless use and tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
