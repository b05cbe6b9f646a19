//! Energy-based voice activity detection
//!
//! A frame counts as speech when its RMS energy exceeds the threshold. While
//! playback is active the stricter barge-in threshold applies, so the
//! assistant's own voice leaking into the microphone is less likely to
//! register as the user speaking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::frame::AudioFrame;
use crate::config::AudioConfig;

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Waiting for speech
    Idle,
    /// Inside an utterance
    Speech,
}

/// Boundary reported for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    SpeechStart,
    SpeechEnd,
}

/// Voice activity detector with a trailing silence timeout
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    barge_in_threshold: f32,
    silence_frames_needed: u32,
    silence_frames: u32,
    state: VadState,
    playing: Arc<AtomicBool>,
}

impl VoiceActivityDetector {
    /// Create a detector; `playing` is raised by playback while audio is queued
    #[must_use]
    pub fn new(config: &AudioConfig, playing: Arc<AtomicBool>) -> Self {
        let frame_ms = u128::from(config.frame_ms.max(1));
        let silence_frames_needed = config.silence_timeout.as_millis().div_ceil(frame_ms);

        Self {
            threshold: config.vad_threshold,
            barge_in_threshold: config.barge_in_threshold.max(config.vad_threshold),
            silence_frames_needed: u32::try_from(silence_frames_needed)
                .unwrap_or(u32::MAX)
                .max(1),
            silence_frames: 0,
            state: VadState::Idle,
            playing,
        }
    }

    /// Threshold in effect right now
    #[must_use]
    pub fn effective_threshold(&self) -> f32 {
        if self.playing.load(Ordering::Relaxed) {
            self.barge_in_threshold
        } else {
            self.threshold
        }
    }

    /// Classify a frame, returning a boundary if one occurred
    pub fn process(&mut self, frame: &AudioFrame) -> Option<VadEdge> {
        let energy = frame.energy();
        let is_speech = energy > self.effective_threshold();

        match self.state {
            VadState::Idle => {
                if is_speech {
                    self.state = VadState::Speech;
                    self.silence_frames = 0;
                    tracing::trace!(energy, sequence = frame.sequence, "speech start");
                    return Some(VadEdge::SpeechStart);
                }
                None
            }
            VadState::Speech => {
                if is_speech {
                    self.silence_frames = 0;
                    return None;
                }

                self.silence_frames += 1;
                if self.silence_frames >= self.silence_frames_needed {
                    self.reset();
                    tracing::trace!(sequence = frame.sequence, "speech end");
                    return Some(VadEdge::SpeechEnd);
                }
                None
            }
        }
    }

    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    /// Return to idle
    pub const fn reset(&mut self) {
        self.state = VadState::Idle;
        self.silence_frames = 0;
    }
}
