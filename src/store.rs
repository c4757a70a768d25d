use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Processing status persisted on the external recording record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Partial update applied to a recording record; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordingUpdate {
    pub status: Option<RecordStatus>,
    pub transcript: Option<String>,
    pub note: Option<String>,
    pub error: Option<String>,
}

impl RecordingUpdate {
    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecording {
    pub id: String,
    pub status: RecordStatus,
    pub transcript: Option<String>,
    pub note: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// External recording store. Schema and transport are out of scope; the
/// core only needs to read a record back and push status/result updates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn update_recording(&self, id: &str, update: RecordingUpdate) -> Result<()>;

    async fn get_recording(&self, id: &str) -> Result<Option<StoredRecording>>;
}

/// In-memory store for tests and headless runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, StoredRecording>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn update_recording(&self, id: &str, update: RecordingUpdate) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| StoredRecording {
                id: id.to_string(),
                status: RecordStatus::Pending,
                transcript: None,
                note: None,
                error: None,
                updated_at: Utc::now(),
            });

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(transcript) = update.transcript {
            record.transcript = Some(transcript);
        }
        if let Some(note) = update.note {
            record.note = Some(note);
        }
        if let Some(error) = update.error {
            record.error = Some(error);
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_recording(&self, id: &str) -> Result<Option<StoredRecording>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(id).cloned())
    }
}
