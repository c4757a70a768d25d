use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::events::{EventSender, ResourceLimit, SessionEvent};

/// Lifecycle of one capture session.
///
/// `Idle → Recording ⇄ Paused`, then `Recording/Paused → Processing`, and
/// back to `Idle` via `clear()`. Transitions are strict: a mutator called
/// from the wrong state fails with [`CoreError::InvalidTransition`] instead
/// of silently no-opping, so callers must track state explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Processing,
}

/// Sample-format parameters, fixed from the first segment of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample of the capture source
    pub bit_depth: u16,
    /// Number of interleaved channels
    pub channels: u16,
}

impl SampleFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bit_depth: 16,
            channels: 1,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz/{}bit/{}ch",
            self.sample_rate, self.bit_depth, self.channels
        )
    }
}

/// One contiguous run of combined audio: mono 16-bit PCM at a fixed rate.
///
/// This is the machine's output format; everything downstream (autosave
/// snapshots, transcription, interim analysis) consumes it.
#[derive(Debug, Clone)]
pub struct AudioBlob {
    /// Mono i16 PCM samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioBlob {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of [`CaptureStateMachine::add_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Segment buffered normally.
    Accepted,
    /// Machine was not in `Recording`; the segment was dropped. This is
    /// deliberate so a late capture callback cannot race a pause/stop from
    /// the UI thread.
    Ignored,
    /// Segment buffered, but a configured limit is now exceeded. Recording
    /// continues; the caller is expected to react.
    LimitExceeded(ResourceLimit),
}

/// Capture limits and combine threshold.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Number of pending segments that triggers combination into one chunk.
    /// Keeps peak memory bounded by threshold size, not session length.
    pub combine_threshold: usize,
    /// Soft cap on the buffer's estimated memory footprint, in bytes.
    pub max_memory_bytes: usize,
    /// Soft cap on estimated recorded audio duration, in seconds.
    pub max_duration_secs: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            combine_threshold: 50,
            max_memory_bytes: 500 * 1024 * 1024,
            max_duration_secs: 3.0 * 60.0 * 60.0,
        }
    }
}

struct CaptureInner {
    state: RecordingState,
    started_at: Option<Instant>,
    /// Set while paused; folded into `pause_total` on resume/stop.
    paused_at: Option<Instant>,
    pause_total: Duration,
    /// Fixed by the first segment, immutable until `clear()`.
    format: Option<SampleFormat>,
    /// Raw interleaved f32 segments awaiting combination, arrival order.
    pending: Vec<Vec<f32>>,
    /// Combined mono i16 chunks, append-only, arrival order.
    chunks: Vec<Vec<i16>>,
    /// Total mono frames accounted so far (pending + combined).
    total_frames: u64,
    segment_count: u64,
    memory_bytes: usize,
}

impl CaptureInner {
    fn new() -> Self {
        Self {
            state: RecordingState::Idle,
            started_at: None,
            paused_at: None,
            pause_total: Duration::ZERO,
            format: None,
            pending: Vec::new(),
            chunks: Vec::new(),
            total_frames: 0,
            segment_count: 0,
            memory_bytes: 0,
        }
    }

    /// Merge pending segments into one mono i16 chunk.
    ///
    /// Multi-channel frames are averaged down to one channel, then the f32
    /// samples are clamped to [-1, 1] and scaled to i16.
    fn combine_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let channels = self.format.map(|f| f.channels).unwrap_or(1).max(1) as usize;

        let frame_total: usize = self.pending.iter().map(|s| s.len() / channels).sum();
        let mut chunk = Vec::with_capacity(frame_total);

        let pending: Vec<Vec<f32>> = self.pending.drain(..).collect();
        for segment in pending {
            self.memory_bytes = self
                .memory_bytes
                .saturating_sub(segment.len() * std::mem::size_of::<f32>());

            if channels == 1 {
                for sample in segment {
                    chunk.push(f32_to_i16(sample));
                }
            } else {
                for frame in segment.chunks_exact(channels) {
                    let sum: f32 = frame.iter().sum();
                    chunk.push(f32_to_i16(sum / channels as f32));
                }
            }
        }

        self.memory_bytes += chunk.len() * std::mem::size_of::<i16>();
        debug!(
            "Combined pending segments into chunk {} ({} frames)",
            self.chunks.len(),
            chunk.len()
        );
        self.chunks.push(chunk);
    }

    fn estimated_duration_secs(&self) -> f64 {
        match self.format {
            Some(format) if format.sample_rate > 0 => {
                self.total_frames as f64 / format.sample_rate as f64
            }
            _ => 0.0,
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Thread-safe buffer and state machine for streamed audio samples.
///
/// One coarse mutex serializes every operation. That is sufficient here:
/// segment arrival is bounded by real-time capture (one call per few hundred
/// milliseconds), and this is the only lock shared between the capture
/// callback thread and the rest of the system.
pub struct CaptureStateMachine {
    config: CaptureConfig,
    inner: Mutex<CaptureInner>,
    events: EventSender,
}

impl CaptureStateMachine {
    pub fn new(config: CaptureConfig, events: EventSender) -> Self {
        Self {
            config,
            inner: Mutex::new(CaptureInner::new()),
            events,
        }
    }

    /// `Idle → Recording`; resets all buffers and counters.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if inner.state != RecordingState::Idle {
            return Err(CoreError::InvalidTransition {
                operation: "start",
                from: inner.state,
            });
        }
        *inner = CaptureInner::new();
        inner.state = RecordingState::Recording;
        inner.started_at = Some(Instant::now());
        Ok(())
    }

    /// `Recording → Paused`.
    pub fn pause(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if inner.state != RecordingState::Recording {
            return Err(CoreError::InvalidTransition {
                operation: "pause",
                from: inner.state,
            });
        }
        inner.state = RecordingState::Paused;
        inner.paused_at = Some(Instant::now());
        Ok(())
    }

    /// `Paused → Recording`; folds the pause span into the running total
    /// used to compute effective recording duration.
    pub fn resume(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if inner.state != RecordingState::Paused {
            return Err(CoreError::InvalidTransition {
                operation: "resume",
                from: inner.state,
            });
        }
        if let Some(paused_at) = inner.paused_at.take() {
            inner.pause_total += paused_at.elapsed();
        }
        inner.state = RecordingState::Recording;
        Ok(())
    }

    /// `Recording | Paused → Processing`; finalizes pause accounting.
    pub fn stop(&self) -> Result<(), CoreError> {
        let mut inner = self.lock();
        match inner.state {
            RecordingState::Recording | RecordingState::Paused => {}
            from => {
                return Err(CoreError::InvalidTransition {
                    operation: "stop",
                    from,
                })
            }
        }
        if let Some(paused_at) = inner.paused_at.take() {
            inner.pause_total += paused_at.elapsed();
        }
        inner.state = RecordingState::Processing;
        Ok(())
    }

    /// Drop all buffers and metadata and return to `Idle`. Valid from any
    /// state (it is the only way out of `Processing`).
    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = CaptureInner::new();
    }

    /// Buffer one segment of raw interleaved samples.
    ///
    /// Accepted only in `Recording`; anything else returns
    /// [`SegmentOutcome::Ignored`]. The first segment fixes the session's
    /// sample format; a later mismatch is a typed error. Crossing a
    /// configured memory or duration limit is reported (and logged) but does
    /// not stop the recording.
    pub fn add_segment(
        &self,
        samples: Vec<f32>,
        format: SampleFormat,
    ) -> Result<SegmentOutcome, CoreError> {
        let mut inner = self.lock();
        if inner.state != RecordingState::Recording {
            return Ok(SegmentOutcome::Ignored);
        }

        match inner.format {
            None => inner.format = Some(format),
            Some(expected) if expected != format => {
                return Err(CoreError::FormatMismatch {
                    expected: expected.to_string(),
                    got: format.to_string(),
                });
            }
            Some(_) => {}
        }

        let channels = format.channels.max(1) as usize;
        inner.total_frames += (samples.len() / channels) as u64;
        inner.segment_count += 1;
        inner.memory_bytes += samples.len() * std::mem::size_of::<f32>();
        inner.pending.push(samples);

        if inner.pending.len() >= self.config.combine_threshold {
            inner.combine_pending();
        }

        if inner.memory_bytes > self.config.max_memory_bytes {
            warn!(
                "Capture buffer exceeds memory limit ({} > {} bytes)",
                inner.memory_bytes, self.config.max_memory_bytes
            );
            self.events.emit(SessionEvent::ResourceLimitReached {
                kind: ResourceLimit::Memory,
            });
            return Ok(SegmentOutcome::LimitExceeded(ResourceLimit::Memory));
        }

        let duration = inner.estimated_duration_secs();
        if duration > self.config.max_duration_secs {
            warn!(
                "Recording exceeds duration limit ({:.1}s > {:.1}s)",
                duration, self.config.max_duration_secs
            );
            self.events.emit(SessionEvent::ResourceLimitReached {
                kind: ResourceLimit::Duration,
            });
            return Ok(SegmentOutcome::LimitExceeded(ResourceLimit::Duration));
        }

        Ok(SegmentOutcome::Accepted)
    }

    /// Force a final combination of pending segments and concatenate every
    /// chunk into one blob. Returns `None` if no audio was ever added.
    /// Callable in any state; the autosave loop uses this mid-recording.
    pub fn combined_audio(&self) -> Option<AudioBlob> {
        let mut inner = self.lock();
        inner.combine_pending();

        if inner.chunks.is_empty() {
            return None;
        }

        let total: usize = inner.chunks.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in &inner.chunks {
            samples.extend_from_slice(chunk);
        }

        let sample_rate = inner.format.map(|f| f.sample_rate).unwrap_or(16000);
        Some(AudioBlob {
            samples,
            sample_rate,
        })
    }

    pub fn state(&self) -> RecordingState {
        self.lock().state
    }

    /// Sample format fixed by the first segment, if any arrived yet.
    pub fn format(&self) -> Option<SampleFormat> {
        self.lock().format
    }

    /// Number of segments accepted this session.
    pub fn segment_count(&self) -> u64 {
        self.lock().segment_count
    }

    /// Total time spent paused, including a currently open pause span.
    pub fn pause_duration(&self) -> Duration {
        let inner = self.lock();
        let open = inner.paused_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
        inner.pause_total + open
    }

    /// Wall-clock time since `start()` minus accumulated pauses.
    pub fn effective_duration(&self) -> Duration {
        let inner = self.lock();
        let Some(started_at) = inner.started_at else {
            return Duration::ZERO;
        };
        let open = inner.paused_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
        started_at
            .elapsed()
            .saturating_sub(inner.pause_total + open)
    }

    /// Estimated recorded-audio duration from accumulated frame counts.
    pub fn estimated_duration_secs(&self) -> f64 {
        self.lock().estimated_duration_secs()
    }

    /// Running estimate of the buffer's memory footprint.
    pub fn memory_estimate_bytes(&self) -> usize {
        self.lock().memory_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureInner> {
        // A poisoned capture mutex means a panic mid-append; the buffer is
        // still structurally valid, so keep serving the session.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
