use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioBlob, CaptureStateMachine};
use crate::error::CoreError;
use crate::events::{EventSender, SessionEvent};

/// Periodic-analysis settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Seconds between analyses (countdown length).
    pub interval_secs: u64,
    /// History ring size; oldest entries evicted past this.
    pub history_cap: usize,
    /// How long `stop()` waits for an in-flight analysis.
    pub stop_timeout_secs: u64,
    /// Minimum elapsed recording time before an immediate analysis runs.
    pub min_elapsed_for_immediate_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            history_cap: 20,
            stop_timeout_secs: 10,
            min_elapsed_for_immediate_secs: 30,
        }
    }
}

/// One interim diagnostic snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisHistoryEntry {
    pub sequence: u64,
    pub elapsed_secs: f64,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

/// Interim-analysis collaborator, invoked with the audio captured so far.
#[async_trait]
pub trait InterimAnalyzer: Send + Sync {
    async fn analyze(&self, audio: &AudioBlob, elapsed_secs: f64) -> Result<AnalysisResult>;
}

struct AnalyzerShared {
    config: AnalysisConfig,
    capture: Arc<CaptureStateMachine>,
    analyzer: Arc<dyn InterimAnalyzer>,
    events: EventSender,
    history: Mutex<VecDeque<AnalysisHistoryEntry>>,
    sequence: AtomicU64,
    /// Held for the duration of each analysis; `stop()` waits on it.
    in_flight: tokio::sync::Mutex<()>,
    running: AtomicBool,
}

impl AnalyzerShared {
    /// Run one analysis against the current combined buffer. No-op when the
    /// analyzer has been stopped or nothing is buffered yet.
    async fn run_once(&self) {
        let _guard = self.in_flight.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let Some(blob) = self.capture.combined_audio() else {
            debug!("Skipping analysis: no audio buffered yet");
            return;
        };
        let elapsed_secs = self.capture.effective_duration().as_secs_f64();

        match self.analyzer.analyze(&blob, elapsed_secs).await {
            Ok(result) => {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                {
                    let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                    history.push_back(AnalysisHistoryEntry {
                        sequence,
                        elapsed_secs,
                        text: result.text.clone(),
                        metadata: result.metadata,
                    });
                    while history.len() > self.config.history_cap {
                        history.pop_front();
                    }
                }
                info!("Interim analysis {} complete (at {:.0}s)", sequence, elapsed_secs);
                self.events.emit(SessionEvent::AnalysisCompleted {
                    sequence,
                    text: result.text,
                });
            }
            Err(e) => {
                warn!("Interim analysis failed: {:#}", e);
            }
        }
    }
}

/// Recurring interim analysis during an active recording.
///
/// A self-rescheduling countdown rather than a fixed-rate timer: the next
/// countdown starts only after the previous analysis returns, so a slow
/// analysis delays, but never skips, subsequent cycles. Countdown progress
/// is published as [`SessionEvent::AnalysisCountdown`] (`0` right before an
/// analysis, `-1` on stop).
pub struct PeriodicAnalyzer {
    shared: Arc<AnalyzerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicAnalyzer {
    pub fn new(
        config: AnalysisConfig,
        capture: Arc<CaptureStateMachine>,
        analyzer: Arc<dyn InterimAnalyzer>,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(AnalyzerShared {
                config,
                capture,
                analyzer,
                events,
                history: Mutex::new(VecDeque::new()),
                sequence: AtomicU64::new(0),
                in_flight: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the countdown loop. Idempotent while running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Periodic analyzer already running");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let interval = shared.config.interval_secs.max(1) as i64;
            info!("Periodic analyzer started ({}s interval)", interval);

            'cycles: loop {
                let mut remaining = interval;
                while remaining > 0 {
                    if !shared.running.load(Ordering::SeqCst) {
                        break 'cycles;
                    }
                    shared.events.emit(SessionEvent::AnalysisCountdown {
                        seconds_remaining: remaining,
                    });
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    remaining -= 1;
                }

                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                shared.events.emit(SessionEvent::AnalysisCountdown {
                    seconds_remaining: 0,
                });
                shared.run_once().await;
                // Loop back: the next countdown begins only now.
            }

            shared.events.emit(SessionEvent::AnalysisCountdown {
                seconds_remaining: -1,
            });
            info!("Periodic analyzer stopped");
        });

        // A stop() that timed out on a stuck analysis leaves the previous
        // loop parked inside run_once; it must not outlive the restart, or
        // two loops end up cycling concurrently.
        if let Some(stale) = self.lock_task().replace(handle) {
            stale.abort();
        }
    }

    /// Stop the analyzer, waiting up to the configured timeout for an
    /// in-flight analysis to finish. After this returns no further analysis
    /// starts, which prevents a stop-then-restart race.
    pub async fn stop(&self) -> Result<(), CoreError> {
        self.shared.running.store(false, Ordering::SeqCst);

        let timeout = Duration::from_secs(self.shared.config.stop_timeout_secs.max(1));
        match tokio::time::timeout(timeout, self.shared.in_flight.lock()).await {
            Ok(_guard) => {}
            Err(_) => {
                return Err(CoreError::StopTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
        }

        // Only the countdown sleep remains; the loop notices `running` and
        // emits its final `-1` tick within a second.
        if let Some(handle) = self.lock_task().take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Analyzer loop panicked: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Run one analysis now instead of waiting for the first full interval.
    /// Used when the feature is enabled mid-recording; refused until the
    /// recording has enough elapsed audio to be worth analyzing.
    pub fn trigger_immediate(&self) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed = self.shared.capture.effective_duration();
        if elapsed.as_secs() < self.shared.config.min_elapsed_for_immediate_secs {
            debug!(
                "Immediate analysis refused: only {:.0}s elapsed",
                elapsed.as_secs_f64()
            );
            return false;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.run_once().await;
        });
        true
    }

    /// Copy of the bounded analysis history, oldest first.
    pub fn history(&self) -> Vec<AnalysisHistoryEntry> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// All analysis text as one blob for persistence.
    pub fn combined_text(&self) -> String {
        let history = self
            .shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .map(|entry| {
                format!(
                    "[analysis {} @ {:.0}s]\n{}",
                    entry.sequence, entry.elapsed_secs, entry.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}
