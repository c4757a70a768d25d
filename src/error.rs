use thiserror::Error;

use crate::audio::RecordingState;

/// Typed errors surfaced by the capture core.
///
/// Most plumbing failures (I/O, config, provider calls) travel as
/// `anyhow::Error`; this enum covers the cases callers are expected to
/// match on.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A state-machine operation was called from the wrong state.
    /// Programmer error: callers must track state explicitly.
    #[error("invalid transition: {operation} is not allowed from {from:?}")]
    InvalidTransition {
        operation: &'static str,
        from: RecordingState,
    },

    /// A segment arrived with a sample format different from the one fixed
    /// by the first segment of the session.
    #[error("sample format mismatch: session uses {expected}, segment is {got}")]
    FormatMismatch { expected: String, got: String },

    /// The health monitor declared the active input device dead after
    /// repeated consecutive check failures.
    #[error("input device disconnected: {device}")]
    DeviceDisconnected { device: String },

    /// `stop()` timed out waiting for an in-flight analysis to finish.
    #[error("timed out waiting for in-flight analysis after {timeout_secs}s")]
    StopTimeout { timeout_secs: u64 },
}
