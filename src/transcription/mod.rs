use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::audio::{self, AudioBlob};
use crate::events::{EventSender, SessionEvent};

/// Fallback-chain settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TranscriptionConfig {
    /// Provider tried first.
    pub primary_provider: String,
    /// Remaining providers, tried in this order after the primary fails.
    pub fallback_order: Vec<String>,
    /// Optional context clip prepended to every transcription attempt.
    pub prefix_clip_path: Option<PathBuf>,
}

/// One speech-to-text backend.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe one audio blob. The empty string means "no transcript";
    /// any non-empty result (including placeholder text such as
    /// "no speech detected") counts as success.
    async fn transcribe(&self, audio: &AudioBlob, patient_context: &str) -> Result<String>;
}

/// Ordered attempt across STT backends.
///
/// Failure is the empty-string sentinel, not an error type: provider errors
/// are logged and treated as empty, which keeps the fallback logic uniform.
/// If every provider fails the chain returns an empty string; callers must
/// treat that as "no transcript", not as "no attempt was made".
pub struct FallbackChain {
    config: TranscriptionConfig,
    providers: Vec<Arc<dyn TranscriptionProvider>>,
    /// Prefix clip is loaded from disk once and memoized for the process
    /// lifetime; a load failure just disables the prefix.
    prefix_clip: OnceCell<Option<AudioBlob>>,
    events: EventSender,
}

impl FallbackChain {
    pub fn new(
        config: TranscriptionConfig,
        providers: Vec<Arc<dyn TranscriptionProvider>>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            providers,
            prefix_clip: OnceCell::new(),
            events,
        }
    }

    /// Run the chain: primary provider first, then the configured fallback
    /// order. Emits [`SessionEvent::FallbackAttempted`] before each
    /// non-primary attempt so the operator can be informed.
    pub async fn transcribe(&self, audio: &AudioBlob, patient_context: &str) -> String {
        let input = self.with_prefix(audio).await;

        for (attempt, provider) in self.attempt_order().into_iter().enumerate() {
            if attempt > 0 {
                self.events.emit(SessionEvent::FallbackAttempted {
                    provider: provider.name().to_string(),
                });
                info!("Falling back to transcription provider '{}'", provider.name());
            }

            match provider.transcribe(&input, patient_context).await {
                Ok(text) if !text.is_empty() => {
                    info!(
                        "Provider '{}' returned {} chars",
                        provider.name(),
                        text.len()
                    );
                    return text;
                }
                Ok(_) => {
                    warn!("Provider '{}' returned no transcript", provider.name());
                }
                Err(e) => {
                    warn!("Provider '{}' failed: {:#}", provider.name(), e);
                }
            }
        }

        warn!("All transcription providers failed");
        String::new()
    }

    /// Primary first, then the configured fallback order, then any
    /// registered providers the config forgot to mention.
    fn attempt_order(&self) -> Vec<Arc<dyn TranscriptionProvider>> {
        let mut order: Vec<Arc<dyn TranscriptionProvider>> = Vec::new();

        let mut push_by_name = |name: &str, order: &mut Vec<Arc<dyn TranscriptionProvider>>| {
            if order.iter().any(|p| p.name() == name) {
                return;
            }
            if let Some(provider) = self.providers.iter().find(|p| p.name() == name) {
                order.push(Arc::clone(provider));
            } else {
                warn!("Configured transcription provider '{}' is not registered", name);
            }
        };

        push_by_name(&self.config.primary_provider, &mut order);
        for name in &self.config.fallback_order {
            push_by_name(name, &mut order);
        }
        for provider in &self.providers {
            if !order.iter().any(|p| p.name() == provider.name()) {
                order.push(Arc::clone(provider));
            }
        }

        order
    }

    /// Prepend the cached prefix clip when its sample rate matches.
    async fn with_prefix(&self, audio: &AudioBlob) -> AudioBlob {
        let prefix = self
            .prefix_clip
            .get_or_init(|| async {
                let path = self.config.prefix_clip_path.as_ref()?;
                match audio::read_blob(path) {
                    Ok(clip) => {
                        info!(
                            "Loaded prefix clip: {:.1}s from {}",
                            clip.duration_seconds(),
                            path.display()
                        );
                        Some(clip)
                    }
                    Err(e) => {
                        warn!("Failed to load prefix clip: {:#}", e);
                        None
                    }
                }
            })
            .await;

        match prefix {
            Some(clip) if clip.sample_rate == audio.sample_rate => {
                let mut samples = Vec::with_capacity(clip.samples.len() + audio.samples.len());
                samples.extend_from_slice(&clip.samples);
                samples.extend_from_slice(&audio.samples);
                AudioBlob {
                    samples,
                    sample_rate: audio.sample_rate,
                }
            }
            Some(clip) => {
                warn!(
                    "Prefix clip sample rate {} does not match audio {}; skipping prefix",
                    clip.sample_rate, audio.sample_rate
                );
                audio.clone()
            }
            None => audio.clone(),
        }
    }
}
