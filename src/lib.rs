pub mod analysis;
pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod queue;
pub mod recorder;
pub mod recovery;
pub mod store;
pub mod transcription;

pub use analysis::{
    AnalysisConfig, AnalysisHistoryEntry, AnalysisResult, InterimAnalyzer, PeriodicAnalyzer,
};
pub use audio::{
    AudioBlob, CaptureConfig, CaptureStateMachine, RecordingState, SampleFormat, SegmentOutcome,
};
pub use config::Config;
pub use device::{CpalHost, DeviceCache, DeviceHost, InputStream, SegmentSink, StreamHealth};
pub use error::CoreError;
pub use events::{EventSender, ResourceLimit, SessionEvent};
pub use queue::{
    NoteProcessor, ProcessingOutcome, ProcessingQueue, QueueConfig, QueueStatus, RecordingJob,
    TaskRecord, TaskStatus,
};
pub use recorder::{RecorderConfig, RecordingOrchestrator, StreamPurpose};
pub use recovery::{
    AutosaveConfig, AutosaveManager, AutosaveStatus, RecoverableSession, SessionMetadata,
};
pub use store::{MemoryRecordStore, RecordStatus, RecordStore, RecordingUpdate, StoredRecording};
pub use transcription::{FallbackChain, TranscriptionConfig, TranscriptionProvider};
