use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::SampleFormat;

/// Callback receiving raw interleaved samples from a live input stream.
/// Invoked on the capture thread; it must never block noticeably.
pub type SegmentSink = Arc<dyn Fn(Vec<f32>, SampleFormat) + Send + Sync>;

/// Shared liveness flag between a running stream and the health monitor.
#[derive(Clone)]
pub struct StreamHealth {
    alive: Arc<AtomicBool>,
}

impl StreamHealth {
    pub fn new_alive() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// A live audio input stream delivering segments to a [`SegmentSink`].
pub trait InputStream: Send {
    /// Liveness handle polled by the orchestrator's health monitor.
    fn health(&self) -> StreamHealth;

    /// Tear the stream down. Idempotent.
    fn close(&mut self);
}

/// Host abstraction over input-device enumeration and stream creation.
///
/// The production implementation is [`CpalHost`]; tests inject fakes the
/// same way the audio backend trait works in chunked recording.
pub trait DeviceHost: Send + Sync {
    fn input_device_names(&self) -> Result<Vec<String>>;

    fn default_input_name(&self) -> Option<String>;

    /// Open a capture stream on the named device (`None` = system default).
    fn open_input_stream(
        &self,
        device_name: Option<&str>,
        sink: SegmentSink,
    ) -> Result<Box<dyn InputStream>>;
}

/// cpal-backed device host.
pub struct CpalHost;

impl DeviceHost for CpalHost {
    fn input_device_names(&self) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .context("Failed to enumerate input devices")?;

        let mut names = Vec::new();
        for device in devices {
            match device.name() {
                Ok(name) => names.push(name),
                Err(e) => warn!("Skipping unnamed input device: {}", e),
            }
        }
        Ok(names)
    }

    fn default_input_name(&self) -> Option<String> {
        cpal::default_host()
            .default_input_device()
            .and_then(|d| d.name().ok())
    }

    fn open_input_stream(
        &self,
        device_name: Option<&str>,
        sink: SegmentSink,
    ) -> Result<Box<dyn InputStream>> {
        let health = StreamHealth::new_alive();
        let stop = Arc::new(AtomicBool::new(false));
        let requested = device_name.map(str::to_owned);

        // cpal streams are not Send, so a dedicated thread owns the stream
        // for its whole lifetime and the rest of the system talks to it
        // through the health flag and stop signal.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_health = health.clone();
        let thread_stop = Arc::clone(&stop);

        let join = std::thread::Builder::new()
            .name("capture-stream".into())
            .spawn(move || {
                match run_capture_stream(requested.as_deref(), sink, thread_health.clone()) {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Keep the stream alive until asked to stop.
                        while !thread_stop.load(Ordering::SeqCst) {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                    Err(e) => {
                        thread_health.mark_dead();
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("Failed to spawn capture thread")?;

        ready_rx
            .recv()
            .context("Capture thread exited before reporting readiness")?
            .context("Failed to open input stream")?;

        Ok(Box::new(CpalStream {
            health,
            stop,
            join: Some(join),
        }))
    }
}

/// Build and start the cpal stream. Runs on the capture thread; the
/// returned stream must stay alive as long as capture should continue.
fn run_capture_stream(
    device_name: Option<&str>,
    sink: SegmentSink,
    health: StreamHealth,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .context("Failed to enumerate input devices")?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("Input device not found: {}", name))?,
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("No default input device found"))?,
    };

    let supported = device
        .default_input_config()
        .context("Failed to query default input config")?;

    let format = SampleFormat {
        sample_rate: supported.sample_rate().0,
        bit_depth: (supported.sample_format().sample_size() * 8) as u16,
        channels: supported.channels(),
    };
    let stream_config: cpal::StreamConfig = supported.config();

    info!(
        "Opening input stream on '{}' at {}",
        device.name().unwrap_or_else(|_| "<unknown>".into()),
        format
    );

    let err_health = health.clone();
    let on_error = move |e: cpal::StreamError| {
        warn!("Input stream error: {}", e);
        err_health.mark_dead();
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| sink(data.to_vec(), format),
            on_error,
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| {
                let samples = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                sink(samples, format)
            },
            on_error,
            None,
        )?,
        other => anyhow::bail!("Unsupported input sample format: {:?}", other),
    };

    stream.play().context("Failed to start input stream")?;
    Ok(stream)
}

struct CpalStream {
    health: StreamHealth,
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl InputStream for CpalStream {
    fn health(&self) -> StreamHealth {
        self.health.clone()
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.health.mark_dead();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Input-device name cache with a time-to-live.
///
/// Enumeration can be slow on some platforms, so the orchestrator resolves
/// names against a cached list and re-enumerates only after expiry.
pub struct DeviceCache {
    host: Arc<dyn DeviceHost>,
    ttl: Duration,
    cached: Mutex<Option<CachedNames>>,
}

struct CachedNames {
    names: Vec<String>,
    fetched_at: Instant,
}

impl DeviceCache {
    pub fn new(host: Arc<dyn DeviceHost>, ttl: Duration) -> Self {
        Self {
            host,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Point-in-time copy of the device list, refreshed past the TTL.
    pub fn device_names(&self) -> Result<Vec<String>> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());

        let expired = match cached.as_ref() {
            Some(c) => c.fetched_at.elapsed() >= self.ttl,
            None => true,
        };

        if expired {
            let names = self.host.input_device_names()?;
            debug!("Refreshed device cache: {} input devices", names.len());
            *cached = Some(CachedNames {
                names,
                fetched_at: Instant::now(),
            });
        }

        Ok(cached.as_ref().map(|c| c.names.clone()).unwrap_or_default())
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Resolve a requested device name against the cached list. Returns
    /// `None` when nothing matches; the caller falls back to the system
    /// default device.
    pub fn resolve(&self, requested: &str) -> Result<Option<String>> {
        let names = self.device_names()?;
        Ok(resolve_device_name(requested, &names))
    }
}

/// Match a requested device name against the available list, most exact
/// tier first: exact, case-insensitive, substring, suffix-stripped, and
/// finally a "(Device N)" index extraction.
pub fn resolve_device_name(requested: &str, available: &[String]) -> Option<String> {
    if requested.is_empty() || available.is_empty() {
        return None;
    }

    if let Some(name) = available.iter().find(|n| n.as_str() == requested) {
        return Some(name.clone());
    }

    let requested_lower = requested.to_lowercase();
    if let Some(name) = available
        .iter()
        .find(|n| n.to_lowercase() == requested_lower)
    {
        return Some(name.clone());
    }

    if let Some(name) = available.iter().find(|n| {
        let lower = n.to_lowercase();
        lower.contains(&requested_lower) || requested_lower.contains(&lower)
    }) {
        return Some(name.clone());
    }

    // Platform qualifiers like "Microphone (USB Audio)" vs "Microphone".
    let requested_stripped = strip_suffix_qualifier(&requested_lower);
    if let Some(name) = available
        .iter()
        .find(|n| strip_suffix_qualifier(&n.to_lowercase()) == requested_stripped)
    {
        return Some(name.clone());
    }

    if let Some(index) = extract_device_index(requested) {
        if let Some(name) = available.get(index) {
            return Some(name.clone());
        }
    }

    None
}

/// Strip a trailing parenthesised qualifier: "Mic (USB Audio)" -> "Mic".
fn strip_suffix_qualifier(name: &str) -> String {
    match (name.rfind('('), name.ends_with(')')) {
        (Some(open), true) => name[..open].trim_end().to_string(),
        _ => name.trim_end().to_string(),
    }
}

/// Last-resort tier: a saved name like "Built-in Mic (Device 2)" carries the
/// enumeration index it had when it was saved.
fn extract_device_index(requested: &str) -> Option<usize> {
    let start = requested.rfind("(Device ")?;
    let rest = &requested[start + "(Device ".len()..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}
