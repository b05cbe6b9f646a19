//! Voice front-end integration tests
//!
//! Runs synthetic sample streams through framing, VAD and utterance assembly
//! without requiring audio hardware.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lectern::config::AudioConfig;
use lectern::voice::tts::{into_blocks, resample_audio};
use lectern::voice::{
    AudioEvent, FrameSegmenter, UtteranceBuilder, VadState, VoiceActivityDetector, route_frame,
    samples_to_wav,
};

const SAMPLE_RATE: u32 = 16_000;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sine(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (SAMPLE_RATE as f32 * duration_secs) as usize]
}

fn config() -> AudioConfig {
    AudioConfig {
        sample_rate: SAMPLE_RATE,
        frame_ms: 30,
        vad_threshold: 0.03,
        barge_in_threshold: 0.2,
        silence_timeout: Duration::from_millis(300),
        ..AudioConfig::default()
    }
}

/// Feed `samples` through segmenter and VAD the way the capture thread does
fn route(samples: &[f32], playing: bool) -> Vec<AudioEvent> {
    let config = config();
    let mut segmenter = FrameSegmenter::new(config.frame_samples());
    let mut vad = VoiceActivityDetector::new(&config, Arc::new(AtomicBool::new(playing)));

    // Uneven pushes, like a real callback
    samples
        .chunks(1000)
        .flat_map(|block| segmenter.push(block))
        .flat_map(|frame| route_frame(&mut vad, frame))
        .collect()
}

#[test]
fn test_segmenter_numbers_frames_contiguously() {
    let mut segmenter = FrameSegmenter::new(480);

    let first = segmenter.push(&vec![0.1; 1000]);
    assert_eq!(first.len(), 2);
    let second = segmenter.push(&vec![0.1; 500]);
    assert_eq!(second.len(), 1);

    let sequences: Vec<u64> = first.iter().chain(&second).map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert!(first.iter().chain(&second).all(|f| f.samples.len() == 480));
}

#[test]
fn test_spoken_phrase_becomes_one_utterance() {
    let mut samples = silence(0.3);
    samples.extend(sine(440.0, 1.0, 0.5));
    samples.extend(silence(0.6));

    let events = route(&samples, false);

    let starts = events
        .iter()
        .filter(|e| matches!(e, AudioEvent::SpeechStart { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|e| matches!(e, AudioEvent::SpeechEnd { .. }))
        .count();
    assert_eq!((starts, ends), (1, 1));
    assert!(matches!(events.first(), Some(AudioEvent::SpeechStart { .. })));
    assert!(matches!(events.last(), Some(AudioEvent::SpeechEnd { .. })));

    // Every frame between the edges is contiguous and builds cleanly
    let mut builder = UtteranceBuilder::new(SAMPLE_RATE);
    for event in &events {
        if let AudioEvent::Frame(frame) = event {
            builder.push(frame).unwrap();
        }
    }
    let utterance = builder.finish();

    // About a second of speech plus the trailing silence window
    assert!(utterance.duration() >= Duration::from_millis(1000));
    assert!(utterance.duration() < Duration::from_millis(1500));
    assert!(utterance.has_speech(0.03));
}

#[test]
fn test_silence_produces_no_events() {
    assert!(route(&silence(2.0), false).is_empty());
}

#[test]
fn test_quiet_audio_during_playback_is_not_barge_in() {
    // Loud enough for the idle threshold, too quiet to interrupt playback
    let bleed = sine(440.0, 1.0, 0.1);

    assert!(route(&bleed, true).is_empty());
    assert!(!route(&bleed, false).is_empty());
}

#[test]
fn test_loud_speech_during_playback_interrupts() {
    let events = route(&sine(440.0, 0.5, 0.8), true);
    assert!(matches!(events.first(), Some(AudioEvent::SpeechStart { .. })));
}

#[test]
fn test_playback_flag_is_read_per_frame() {
    let config = config();
    let playing = Arc::new(AtomicBool::new(true));
    let mut vad = VoiceActivityDetector::new(&config, Arc::clone(&playing));
    let mut segmenter = FrameSegmenter::new(config.frame_samples());

    let frames = segmenter.push(&sine(440.0, 0.3, 0.1));
    let (during, after) = frames.split_at(frames.len() / 2);

    for frame in during {
        assert!(route_frame(&mut vad, frame.clone()).is_empty());
    }
    playing.store(false, Ordering::Relaxed);
    let events: Vec<AudioEvent> = after
        .iter()
        .flat_map(|f| route_frame(&mut vad, f.clone()))
        .collect();
    assert!(matches!(events.first(), Some(AudioEvent::SpeechStart { .. })));
    assert_eq!(vad.state(), VadState::Speech);
}

#[test]
fn test_builder_rejects_gap() {
    let mut segmenter = FrameSegmenter::new(480);
    let frames = segmenter.push(&vec![0.2; 480 * 3]);

    let mut builder = UtteranceBuilder::new(SAMPLE_RATE);
    builder.push(&frames[0]).unwrap();
    assert!(builder.push(&frames[2]).is_err());
    builder.push(&frames[1]).unwrap();
    assert_eq!(builder.frame_count(), 2);
}

#[test]
fn test_utterance_wav_is_readable() {
    let samples = sine(440.0, 0.25, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, samples.len());
}

#[test]
fn test_resample_to_playback_rate() {
    let input = sine(440.0, 0.5, 0.5);
    let output = resample_audio(&input, 16_000, 24_000).unwrap();

    assert_eq!(output.len(), input.len() * 3 / 2);
    let peak = output.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!(peak > 0.3 && peak < 0.7, "peak {peak}");
}

#[test]
fn test_resample_same_rate_is_identity() {
    let input = sine(440.0, 0.1, 0.5);
    assert_eq!(resample_audio(&input, 24_000, 24_000).unwrap(), input);
}

#[test]
fn test_blocks_preserve_samples() {
    let samples: Vec<f32> = (0..2000u16).map(f32::from).collect();
    let blocks = into_blocks(samples.clone(), 720);

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks.concat(), samples);
}
