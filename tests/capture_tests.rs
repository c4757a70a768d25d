// Tests for the audio capture state machine: strict transitions, pause
// accounting, segment combination, and resource limits.

use clinscribe::events::{EventSender, ResourceLimit};
use clinscribe::{CaptureConfig, CaptureStateMachine, CoreError, RecordingState, SampleFormat, SegmentOutcome};
use std::time::Duration;

fn machine(config: CaptureConfig) -> CaptureStateMachine {
    CaptureStateMachine::new(config, EventSender::disabled())
}

fn one_second_mono(sample_rate: u32) -> Vec<f32> {
    vec![0.1f32; sample_rate as usize]
}

#[test]
fn five_one_second_segments_combine_to_five_seconds() {
    let machine = machine(CaptureConfig::default());
    let format = SampleFormat::mono(16000);

    machine.start().unwrap();
    for _ in 0..5 {
        let outcome = machine.add_segment(one_second_mono(16000), format).unwrap();
        assert_eq!(outcome, SegmentOutcome::Accepted);
    }
    machine.stop().unwrap();

    assert_eq!(machine.segment_count(), 5);
    let blob = machine.combined_audio().expect("audio was recorded");
    let duration = blob.duration_seconds();
    assert!(
        (duration - 5.0).abs() < 0.5,
        "expected ~5.0s, got {duration:.2}s"
    );
}

#[test]
fn combined_duration_is_independent_of_combine_threshold() {
    let format = SampleFormat::mono(8000);
    let segments: Vec<Vec<f32>> = vec![
        vec![0.2; 8000],
        vec![0.3; 4000],
        vec![0.1; 12000],
        vec![0.0; 2000],
        vec![0.4; 6000],
    ];
    let total_frames: usize = segments.iter().map(Vec::len).sum();
    let expected = total_frames as f64 / 8000.0;

    for threshold in [1, 2, 100] {
        let machine = machine(CaptureConfig {
            combine_threshold: threshold,
            ..CaptureConfig::default()
        });
        machine.start().unwrap();
        for segment in &segments {
            machine.add_segment(segment.clone(), format).unwrap();
        }
        let blob = machine.combined_audio().unwrap();
        assert!(
            (blob.duration_seconds() - expected).abs() < 0.01,
            "threshold {threshold}: expected {expected:.3}s, got {:.3}s",
            blob.duration_seconds()
        );
    }
}

#[test]
fn pause_accumulates_duration_and_ignores_segments() {
    let machine = machine(CaptureConfig::default());
    let format = SampleFormat::mono(16000);

    machine.start().unwrap();
    machine.add_segment(one_second_mono(16000), format).unwrap();
    machine.pause().unwrap();

    std::thread::sleep(Duration::from_millis(60));

    // Segments while paused are dropped without touching the buffer.
    let outcome = machine.add_segment(one_second_mono(16000), format).unwrap();
    assert_eq!(outcome, SegmentOutcome::Ignored);
    assert_eq!(machine.segment_count(), 1);

    machine.resume().unwrap();
    let paused = machine.pause_duration();
    assert!(
        paused >= Duration::from_millis(50),
        "pause duration {paused:?} too short"
    );
    assert_eq!(machine.state(), RecordingState::Recording);
}

#[test]
fn invalid_transitions_fail_without_mutating_state() {
    let machine = machine(CaptureConfig::default());

    assert!(matches!(
        machine.pause(),
        Err(CoreError::InvalidTransition { operation: "pause", .. })
    ));
    assert!(matches!(
        machine.stop(),
        Err(CoreError::InvalidTransition { operation: "stop", .. })
    ));
    assert_eq!(machine.state(), RecordingState::Idle);

    machine.start().unwrap();
    assert!(matches!(
        machine.start(),
        Err(CoreError::InvalidTransition { operation: "start", .. })
    ));
    assert!(matches!(
        machine.resume(),
        Err(CoreError::InvalidTransition { operation: "resume", .. })
    ));
    assert_eq!(machine.state(), RecordingState::Recording);
}

#[test]
fn stereo_segments_are_averaged_to_mono() {
    let machine = machine(CaptureConfig {
        combine_threshold: 1,
        ..CaptureConfig::default()
    });
    let format = SampleFormat {
        sample_rate: 16000,
        bit_depth: 32,
        channels: 2,
    };

    machine.start().unwrap();
    // Two frames: (0.5, -0.5) -> 0.0 and (1.0, 1.0) -> 1.0 (full scale).
    machine
        .add_segment(vec![0.5, -0.5, 1.0, 1.0], format)
        .unwrap();

    let blob = machine.combined_audio().unwrap();
    assert_eq!(blob.samples.len(), 2);
    assert_eq!(blob.samples[0], 0);
    assert_eq!(blob.samples[1], i16::MAX);
}

#[test]
fn float_samples_are_clamped_before_scaling() {
    let machine = machine(CaptureConfig {
        combine_threshold: 1,
        ..CaptureConfig::default()
    });
    machine.start().unwrap();
    machine
        .add_segment(vec![2.0, -3.0], SampleFormat::mono(16000))
        .unwrap();

    let blob = machine.combined_audio().unwrap();
    assert_eq!(blob.samples[0], i16::MAX);
    assert_eq!(blob.samples[1], -i16::MAX);
}

#[test]
fn format_is_fixed_by_first_segment() {
    let machine = machine(CaptureConfig::default());
    machine.start().unwrap();
    machine
        .add_segment(vec![0.0; 100], SampleFormat::mono(16000))
        .unwrap();

    let err = machine
        .add_segment(vec![0.0; 100], SampleFormat::mono(44100))
        .unwrap_err();
    assert!(matches!(err, CoreError::FormatMismatch { .. }));
    assert_eq!(machine.format(), Some(SampleFormat::mono(16000)));
}

#[test]
fn duration_limit_reports_but_does_not_stop_recording() {
    let machine = machine(CaptureConfig {
        max_duration_secs: 0.5,
        ..CaptureConfig::default()
    });
    let format = SampleFormat::mono(16000);

    machine.start().unwrap();
    let outcome = machine.add_segment(one_second_mono(16000), format).unwrap();
    assert_eq!(
        outcome,
        SegmentOutcome::LimitExceeded(ResourceLimit::Duration)
    );

    // Recording continues; further segments are still buffered.
    assert_eq!(machine.state(), RecordingState::Recording);
    machine.add_segment(one_second_mono(16000), format).unwrap();
    assert_eq!(machine.segment_count(), 2);
}

#[test]
fn memory_limit_reports_but_does_not_stop_recording() {
    let machine = machine(CaptureConfig {
        max_memory_bytes: 1024,
        ..CaptureConfig::default()
    });
    let outcome = {
        machine.start().unwrap();
        machine
            .add_segment(vec![0.0; 4096], SampleFormat::mono(16000))
            .unwrap()
    };
    assert_eq!(outcome, SegmentOutcome::LimitExceeded(ResourceLimit::Memory));
    assert_eq!(machine.state(), RecordingState::Recording);
}

#[test]
fn combined_audio_is_none_when_nothing_was_added() {
    let machine = machine(CaptureConfig::default());
    machine.start().unwrap();
    machine.stop().unwrap();
    assert!(machine.combined_audio().is_none());
}

#[test]
fn clear_returns_to_idle_and_drops_everything() {
    let machine = machine(CaptureConfig::default());
    machine.start().unwrap();
    machine
        .add_segment(one_second_mono(16000), SampleFormat::mono(16000))
        .unwrap();
    machine.stop().unwrap();
    assert_eq!(machine.state(), RecordingState::Processing);

    machine.clear();
    assert_eq!(machine.state(), RecordingState::Idle);
    assert_eq!(machine.segment_count(), 0);
    assert!(machine.combined_audio().is_none());
    assert_eq!(machine.memory_estimate_bytes(), 0);

    // A fresh session can start again after clear.
    machine.start().unwrap();
    assert_eq!(machine.state(), RecordingState::Recording);
}

#[test]
fn stop_is_valid_from_paused() {
    let machine = machine(CaptureConfig::default());
    machine.start().unwrap();
    machine.pause().unwrap();
    machine.stop().unwrap();
    assert_eq!(machine.state(), RecordingState::Processing);
}
