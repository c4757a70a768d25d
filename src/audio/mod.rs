pub mod capture;
pub mod file;

pub use capture::{
    AudioBlob, CaptureConfig, CaptureStateMachine, RecordingState, SampleFormat, SegmentOutcome,
};
pub use file::{read_blob, write_blob};
