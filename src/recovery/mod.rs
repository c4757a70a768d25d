use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBlob, CaptureStateMachine, SampleFormat};
use crate::events::{EventSender, SessionEvent};

const METADATA_FILE: &str = "metadata.json";
const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Autosave settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AutosaveConfig {
    /// Directory holding one subdirectory per in-progress session.
    pub root_dir: PathBuf,
    /// Seconds between snapshot ticks.
    pub interval_secs: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("autosave-sessions"),
            interval_secs: 60,
        }
    }
}

/// Durable session status. `Recording` and `Incomplete` are offered for
/// recovery at startup; `Completed` directories still on disk are leftovers
/// from a failed cleanup and are deleted opportunistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveStatus {
    Recording,
    Incomplete,
    Completed,
}

/// `metadata.json` contents. This layout is read directly by the startup
/// recovery scan and must stay stable across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub status: AutosaveStatus,
    pub sample_format: Option<SampleFormat>,
    pub duration_estimate_secs: f64,
    pub patient_context: String,
    pub chunk_count: usize,
    pub started_at: DateTime<Utc>,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// A crashed or abandoned session found by the startup scan.
#[derive(Debug, Clone)]
pub struct RecoverableSession {
    pub session_id: String,
    pub dir: PathBuf,
    pub metadata: SessionMetadata,
}

struct SnapshotCtx {
    capture: Arc<CaptureStateMachine>,
    events: EventSender,
    dir: PathBuf,
    session_id: String,
    patient_context: String,
    started_at: DateTime<Utc>,
    snapshot_index: AtomicUsize,
}

impl SnapshotCtx {
    /// Write one full-buffer snapshot plus refreshed metadata. Every tick
    /// re-exports the entire combined buffer, so the highest-numbered file
    /// is always authoritative for recovery. I/O failures skip the tick.
    fn snapshot_tick(&self) {
        let Some(blob) = self.capture.combined_audio() else {
            debug!("Autosave tick skipped: no audio buffered yet");
            return;
        };

        let index = self.snapshot_index.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(snapshot_file_name(index));

        if let Err(e) = audio::write_blob(&path, &blob) {
            warn!("Autosave snapshot {} failed: {:#}", index, e);
            return;
        }

        let metadata = SessionMetadata {
            session_id: self.session_id.clone(),
            status: AutosaveStatus::Recording,
            sample_format: self.capture.format(),
            duration_estimate_secs: blob.duration_seconds(),
            patient_context: self.patient_context.clone(),
            chunk_count: index + 1,
            started_at: self.started_at,
            last_saved_at: Some(Utc::now()),
        };
        if let Err(e) = write_metadata(&self.dir, &metadata) {
            warn!("Autosave metadata update failed: {:#}", e);
        }

        debug!(
            "Autosave snapshot {} written ({:.1}s of audio)",
            index,
            blob.duration_seconds()
        );
        self.events.emit(SessionEvent::AutosaveTick {
            snapshot_index: index,
        });
    }

    fn write_status(&self, status: AutosaveStatus) -> Result<()> {
        let mut metadata = read_metadata(&self.dir)?;
        metadata.status = status;
        write_metadata(&self.dir, &metadata)
    }
}

struct ActiveSession {
    ctx: Arc<SnapshotCtx>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Durably snapshots in-progress audio so a crash cannot lose an encounter.
///
/// One session directory per recording: `metadata.json` plus sequentially
/// numbered full-buffer WAV snapshots. On clean completion the metadata is
/// marked `completed` before the directory is deleted, so a failed delete is
/// never mistaken for a crash by the next startup scan.
pub struct AutosaveManager {
    config: AutosaveConfig,
    capture: Arc<CaptureStateMachine>,
    events: EventSender,
    active: Mutex<Option<ActiveSession>>,
}

impl AutosaveManager {
    pub fn new(
        config: AutosaveConfig,
        capture: Arc<CaptureStateMachine>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            capture,
            events,
            active: Mutex::new(None),
        }
    }

    /// Create the session directory and start the snapshot loop. One active
    /// session per process; returns the short session id.
    pub fn begin_session(&self, patient_context: &str) -> Result<String> {
        let mut active = self.lock_active();
        if active.is_some() {
            bail!("An autosave session is already active");
        }

        let session_id = short_session_id();
        let dir = self.config.root_dir.join(&session_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;

        let ctx = Arc::new(SnapshotCtx {
            capture: Arc::clone(&self.capture),
            events: self.events.clone(),
            dir: dir.clone(),
            session_id: session_id.clone(),
            patient_context: patient_context.to_string(),
            started_at: Utc::now(),
            snapshot_index: AtomicUsize::new(0),
        });

        let metadata = SessionMetadata {
            session_id: session_id.clone(),
            status: AutosaveStatus::Recording,
            sample_format: None,
            duration_estimate_secs: 0.0,
            patient_context: patient_context.to_string(),
            chunk_count: 0,
            started_at: ctx.started_at,
            last_saved_at: None,
        };
        write_metadata(&dir, &metadata)?;

        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let loop_ctx = Arc::clone(&ctx);
        let loop_stop = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            info!("Autosave loop started ({}s interval)", interval.as_secs());
            loop {
                tokio::time::sleep(interval).await;
                if loop_stop.load(Ordering::SeqCst) {
                    break;
                }
                loop_ctx.snapshot_tick();
            }
            info!("Autosave loop stopped");
        });

        info!("Autosave session {} started at {}", session_id, dir.display());
        *active = Some(ActiveSession { ctx, stop, task });
        Ok(session_id)
    }

    /// Force a snapshot outside the timer, e.g. right before processing.
    pub fn snapshot_now(&self) -> Result<()> {
        let active = self.lock_active();
        match active.as_ref() {
            Some(session) => {
                session.ctx.snapshot_tick();
                Ok(())
            }
            None => bail!("No active autosave session"),
        }
    }

    /// Recording finished and was handed off successfully: mark the session
    /// `completed`, then delete it. Ordering matters; if the delete fails
    /// the marker keeps the next startup scan from offering it as a crash.
    pub fn finish_success(&self) -> Result<()> {
        let Some(session) = self.take_active() else {
            bail!("No active autosave session");
        };

        if let Err(e) = session.ctx.write_status(AutosaveStatus::Completed) {
            warn!("Failed to mark session completed: {:#}", e);
        }
        if let Err(e) = fs::remove_dir_all(&session.ctx.dir) {
            // Non-fatal: the completed marker makes the leftover harmless.
            warn!(
                "Failed to delete session directory {}: {}",
                session.ctx.dir.display(),
                e
            );
        }
        info!("Autosave session {} completed", session.ctx.session_id);
        Ok(())
    }

    /// Recording was cancelled or is shutting down abnormally: stop the
    /// loop, mark the session `incomplete`, and keep every file.
    pub fn abandon(&self) {
        let Some(session) = self.take_active() else {
            return;
        };
        if let Err(e) = session.ctx.write_status(AutosaveStatus::Incomplete) {
            warn!("Failed to mark session incomplete: {:#}", e);
        }
        info!(
            "Autosave session {} retained for recovery",
            session.ctx.session_id
        );
    }

    fn take_active(&self) -> Option<ActiveSession> {
        let session = self.lock_active().take()?;
        session.stop.store(true, Ordering::SeqCst);
        session.task.abort();
        Some(session)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Startup recovery scan. Sessions still marked `recording` or `incomplete`
/// are offered for recovery; `completed` leftovers are deleted.
pub fn scan_sessions(root: &Path) -> Result<Vec<RecoverableSession>> {
    let mut recoverable = Vec::new();

    if !root.exists() {
        return Ok(recoverable);
    }

    for dir_entry in fs::read_dir(root).context("Failed to read autosave root")? {
        let dir_entry = dir_entry?;
        let dir = dir_entry.path();
        if !dir.is_dir() {
            continue;
        }

        let metadata = match read_metadata(&dir) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping unreadable session {}: {:#}", dir.display(), e);
                continue;
            }
        };

        match metadata.status {
            AutosaveStatus::Completed => {
                info!("Cleaning up leftover completed session {}", dir.display());
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!("Leftover cleanup failed: {}", e);
                }
            }
            AutosaveStatus::Recording | AutosaveStatus::Incomplete => {
                recoverable.push(RecoverableSession {
                    session_id: metadata.session_id.clone(),
                    dir,
                    metadata,
                });
            }
        }
    }

    // Most recently saved first, for the recovery prompt.
    recoverable.sort_by(|a, b| b.metadata.last_saved_at.cmp(&a.metadata.last_saved_at));
    Ok(recoverable)
}

/// Whether any crashed or abandoned session is waiting on disk.
pub fn has_incomplete_recording(root: &Path) -> bool {
    match scan_sessions(root) {
        Ok(sessions) => !sessions.is_empty(),
        Err(e) => {
            warn!("Recovery scan failed: {:#}", e);
            false
        }
    }
}

/// Reconstruct the audio of a recoverable session from its most recent
/// snapshot. Each snapshot holds the full buffer, so only the
/// highest-numbered file matters.
pub fn recover_audio(session: &RecoverableSession) -> Result<AudioBlob> {
    let mut latest: Option<(usize, PathBuf)> = None;

    for file_entry in fs::read_dir(&session.dir).context("Failed to read session directory")? {
        let path = file_entry?.path();
        let Some(index) = snapshot_index_of(&path) else {
            continue;
        };
        if latest.as_ref().map(|(i, _)| index > *i).unwrap_or(true) {
            latest = Some((index, path));
        }
    }

    let Some((index, path)) = latest else {
        bail!(
            "Session {} has no snapshot files to recover",
            session.session_id
        );
    };

    info!(
        "Recovering session {} from snapshot {}",
        session.session_id, index
    );
    audio::read_blob(path)
}

/// The operator declined recovery: delete everything for this session.
pub fn discard_session(session: &RecoverableSession) -> Result<()> {
    fs::remove_dir_all(&session.dir).with_context(|| {
        format!(
            "Failed to delete session directory {}",
            session.dir.display()
        )
    })?;
    info!("Discarded session {}", session.session_id);
    Ok(())
}

fn snapshot_file_name(index: usize) -> String {
    format!("{}{:03}.wav", SNAPSHOT_PREFIX, index)
}

fn snapshot_index_of(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?;
    rest.strip_suffix(".wav")?.parse().ok()
}

fn short_session_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

fn read_metadata(dir: &Path) -> Result<SessionMetadata> {
    let path = metadata_path(dir);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_metadata(dir: &Path, metadata: &SessionMetadata) -> Result<()> {
    let path = metadata_path(dir);
    let raw = serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
    fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))
}
