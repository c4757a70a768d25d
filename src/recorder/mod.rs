use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audio::CaptureStateMachine;
use crate::device::{DeviceCache, DeviceHost, InputStream, SegmentSink};
use crate::error::CoreError;
use crate::events::{EventSender, SessionEvent};

/// Orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Preferred input device name; `None` means the system default.
    pub device_name: Option<String>,
    /// How long the enumerated device list stays fresh.
    pub device_cache_ttl_secs: u64,
    /// Health-check period for the active stream.
    pub device_check_interval_secs: u64,
    /// Consecutive failed health checks before declaring disconnection.
    pub max_device_errors: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            device_cache_ttl_secs: 30,
            device_check_interval_secs: 2,
            max_device_errors: 3,
        }
    }
}

/// What a stream is capturing for. One concurrent stream per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPurpose {
    Dictation,
}

struct ActiveStream {
    device_name: String,
    stream: Box<dyn InputStream>,
    monitor_stop: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

impl ActiveStream {
    fn shut_down(mut self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
        self.monitor.abort();
        self.stream.close();
    }
}

/// Wraps the capture state machine with device awareness: name resolution
/// against a TTL'd device cache, stream lifecycle, and health monitoring.
///
/// Lifecycle methods return success booleans with failures logged; the one
/// exception is the health-check path, which surfaces a typed
/// [`CoreError::DeviceDisconnected`] through [`take_device_error`].
///
/// [`take_device_error`]: RecordingOrchestrator::take_device_error
pub struct RecordingOrchestrator {
    config: RecorderConfig,
    capture: Arc<CaptureStateMachine>,
    host: Arc<dyn DeviceHost>,
    cache: DeviceCache,
    /// Instance-owned; no cross-instance aliasing of active streams.
    streams: Mutex<HashMap<StreamPurpose, ActiveStream>>,
    /// Written by the health monitor task, drained by `take_device_error`.
    device_error: Arc<Mutex<Option<CoreError>>>,
    events: EventSender,
}

impl RecordingOrchestrator {
    pub fn new(
        config: RecorderConfig,
        capture: Arc<CaptureStateMachine>,
        host: Arc<dyn DeviceHost>,
        events: EventSender,
    ) -> Self {
        let cache = DeviceCache::new(
            Arc::clone(&host),
            Duration::from_secs(config.device_cache_ttl_secs),
        );
        Self {
            config,
            capture,
            host,
            cache,
            streams: Mutex::new(HashMap::new()),
            device_error: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Start a new recording: resolve the device, move the state machine to
    /// `Recording`, open the stream, and begin health monitoring.
    ///
    /// Must be called from within a tokio runtime (the health monitor is a
    /// spawned task).
    pub fn start(&self) -> bool {
        if self.lock_streams().contains_key(&StreamPurpose::Dictation) {
            warn!("Recording already active; ignoring start");
            return false;
        }

        let device_name = self.resolve_configured_device();

        if let Err(e) = self.capture.start() {
            error!("Cannot start recording: {}", e);
            return false;
        }

        let capture = Arc::clone(&self.capture);
        let sink: SegmentSink = Arc::new(move |samples, format| {
            // Late segments after pause/stop are ignored by the machine;
            // only a format mismatch is worth logging here.
            if let Err(e) = capture.add_segment(samples, format) {
                warn!("Dropped segment: {}", e);
            }
        });

        let stream = match self.host.open_input_stream(device_name.as_deref(), sink) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open input stream: {:#}", e);
                self.capture.clear();
                return false;
            }
        };

        let resolved = device_name.unwrap_or_else(|| {
            self.host
                .default_input_name()
                .unwrap_or_else(|| "default".to_string())
        });

        let monitor_stop = Arc::new(AtomicBool::new(false));
        let monitor = self.spawn_health_monitor(
            resolved.clone(),
            stream.health(),
            Arc::clone(&monitor_stop),
        );

        info!("Recording started on '{}'", resolved);
        self.lock_streams().insert(
            StreamPurpose::Dictation,
            ActiveStream {
                device_name: resolved,
                stream,
                monitor_stop,
                monitor,
            },
        );
        true
    }

    /// Stop the recording: close the stream and move the machine to
    /// `Processing` so the buffered audio can be handed downstream.
    pub fn stop(&self) -> bool {
        let Some(active) = self.lock_streams().remove(&StreamPurpose::Dictation) else {
            warn!("No active recording to stop");
            return false;
        };
        info!("Stopping recording on '{}'", active.device_name);
        active.shut_down();

        match self.capture.stop() {
            Ok(()) => true,
            Err(e) => {
                error!("Stop failed: {}", e);
                false
            }
        }
    }

    pub fn pause(&self) -> bool {
        match self.capture.pause() {
            Ok(()) => true,
            Err(e) => {
                warn!("Pause failed: {}", e);
                false
            }
        }
    }

    /// Resume a paused recording. Refused when the stream has died in the
    /// meantime; recording must not silently continue on a different
    /// physical device without operator confirmation.
    pub fn resume(&self) -> bool {
        {
            let streams = self.lock_streams();
            match streams.get(&StreamPurpose::Dictation) {
                Some(active) if active.stream.health().is_alive() => {}
                Some(active) => {
                    warn!(
                        "Cannot resume: input device '{}' is no longer alive",
                        active.device_name
                    );
                    return false;
                }
                None => {
                    warn!("Cannot resume: no active stream");
                    return false;
                }
            }
        }

        match self.capture.resume() {
            Ok(()) => true,
            Err(e) => {
                warn!("Resume failed: {}", e);
                false
            }
        }
    }

    /// Abandon the recording: tear the stream down and drop all buffers.
    pub fn cancel(&self) -> bool {
        if let Some(active) = self.lock_streams().remove(&StreamPurpose::Dictation) {
            active.shut_down();
        }
        self.capture.clear();
        info!("Recording cancelled");
        true
    }

    /// Typed error left behind by the health monitor, if any. Reading it
    /// clears it.
    pub fn take_device_error(&self) -> Option<CoreError> {
        self.device_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Current device list via the TTL cache.
    pub fn device_names(&self) -> anyhow::Result<Vec<String>> {
        self.cache.device_names()
    }

    fn resolve_configured_device(&self) -> Option<String> {
        let requested = self.config.device_name.as_deref()?;

        match self.cache.resolve(requested) {
            Ok(Some(name)) => {
                if name != requested {
                    info!("Resolved device '{}' to '{}'", requested, name);
                }
                Some(name)
            }
            Ok(None) => {
                warn!(
                    "Input device '{}' not found; falling back to system default",
                    requested
                );
                None
            }
            Err(e) => {
                warn!(
                    "Device enumeration failed ({}); falling back to system default",
                    e
                );
                None
            }
        }
    }

    fn spawn_health_monitor(
        &self,
        device_name: String,
        health: crate::device::StreamHealth,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.device_check_interval_secs.max(1));
        let max_errors = self.config.max_device_errors.max(1);
        let capture = Arc::clone(&self.capture);
        let events = self.events.clone();
        let error_slot = Arc::clone(&self.device_error);

        tokio::spawn(async move {
            let mut consecutive_errors = 0u32;

            loop {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                if health.is_alive() {
                    consecutive_errors = 0;
                    continue;
                }

                consecutive_errors += 1;
                warn!(
                    "Device health check failed for '{}' ({}/{})",
                    device_name, consecutive_errors, max_errors
                );

                if consecutive_errors >= max_errors {
                    error!("Input device '{}' disconnected", device_name);
                    // Pause rather than stop: the operator decides whether
                    // to resume on a reconnected device or give up.
                    if let Err(e) = capture.pause() {
                        warn!("Could not pause after disconnection: {}", e);
                    }
                    *error_slot.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(CoreError::DeviceDisconnected {
                            device: device_name.clone(),
                        });
                    events.emit(SessionEvent::DeviceDisconnected {
                        device: device_name.clone(),
                    });
                    break;
                }
            }
        })
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<StreamPurpose, ActiveStream>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}
