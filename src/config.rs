use anyhow::Result;
use serde::Deserialize;

use crate::analysis::AnalysisConfig;
use crate::audio::CaptureConfig;
use crate::queue::QueueConfig;
use crate::recorder::RecorderConfig;
use crate::recovery::AutosaveConfig;
use crate::transcription::TranscriptionConfig;

/// Whole-application configuration tree.
///
/// Each component takes its own section by value at construction time;
/// component behavior is a function of its injected config plus its own
/// state, with no shared mutable settings object.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
