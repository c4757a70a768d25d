use anyhow::{Context, Result};
use hound::{SampleFormat as WavSampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::debug;

use super::capture::AudioBlob;

/// Write a combined audio blob as a 16-bit mono WAV file.
///
/// Used by the autosave loop for snapshot files; the format must stay
/// readable by [`read_blob`] across versions for crash recovery to work.
pub fn write_blob(path: impl AsRef<Path>, blob: &AudioBlob) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate: blob.sample_rate,
        bits_per_sample: 16,
        sample_format: WavSampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    for &sample in &blob.samples {
        writer
            .write_sample(sample)
            .context("Failed to write sample to WAV")?;
    }

    writer.finalize().context("Failed to finalize WAV file")?;

    debug!(
        "Wrote {:.1}s of audio to {}",
        blob.duration_seconds(),
        path.display()
    );
    Ok(())
}

/// Read a snapshot WAV file back into an audio blob.
pub fn read_blob(path: impl AsRef<Path>) -> Result<AudioBlob> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read audio samples")?;

    debug!(
        "Read {} samples at {}Hz from {}",
        samples.len(),
        spec.sample_rate,
        path.display()
    );

    Ok(AudioBlob {
        samples,
        sample_rate: spec.sample_rate,
    })
}
