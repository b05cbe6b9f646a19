//! Audio frames and utterance assembly

use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Fixed-duration block of mono PCM produced by capture
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Contiguous, starting at 0 for each capture session
    pub sequence: u64,
    /// When the frame was cut from the capture buffer
    pub timestamp: Instant,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    #[must_use]
    pub fn new(sequence: u64, samples: Vec<f32>) -> Self {
        Self {
            sequence,
            timestamp: Instant::now(),
            samples,
        }
    }

    /// RMS energy of the frame
    #[must_use]
    pub fn energy(&self) -> f32 {
        calculate_energy(&self.samples)
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Cuts a continuous sample stream into numbered frames of equal length
#[derive(Debug)]
pub struct FrameSegmenter {
    frame_samples: usize,
    next_sequence: u64,
    pending: Vec<f32>,
}

impl FrameSegmenter {
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            next_sequence: 0,
            pending: Vec::new(),
        }
    }

    /// Append samples and return every complete frame; the remainder waits
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for block in self.pending.chunks_exact(self.frame_samples) {
            frames.push(AudioFrame::new(self.next_sequence, block.to_vec()));
            self.next_sequence += 1;
        }

        self.pending.drain(..complete * self.frame_samples);
        frames
    }
}

/// A finalized, immutable span of speech
#[derive(Debug, Clone)]
pub struct Utterance {
    samples: Vec<f32>,
    sample_rate: u32,
    frame_count: usize,
    peak_energy: f32,
    started_at: Option<Instant>,
}

impl Utterance {
    /// Build an utterance directly from samples (one logical frame)
    #[must_use]
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        let peak_energy = calculate_energy(&samples);
        let frame_count = usize::from(!samples.is_empty());
        Self {
            samples,
            sample_rate,
            frame_count,
            peak_energy,
            started_at: None,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Highest per-frame RMS energy
    #[must_use]
    pub const fn peak_energy(&self) -> f32 {
        self.peak_energy
    }

    /// Capture time of the first frame
    #[must_use]
    pub const fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Whether any frame reached `threshold`
    #[must_use]
    pub fn has_speech(&self, threshold: f32) -> bool {
        !self.is_empty() && self.peak_energy >= threshold
    }

    /// Encode as 16-bit mono WAV
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        super::samples_to_wav(&self.samples, self.sample_rate)
    }
}

/// Accumulates contiguous frames into an [`Utterance`]
#[derive(Debug)]
pub struct UtteranceBuilder {
    sample_rate: u32,
    samples: Vec<f32>,
    last_sequence: Option<u64>,
    frame_count: usize,
    peak_energy: f32,
    started_at: Option<Instant>,
}

impl UtteranceBuilder {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
            last_sequence: None,
            frame_count: 0,
            peak_energy: 0.0,
            started_at: None,
        }
    }

    /// Append a frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::Input`] if the frame does not directly follow the
    /// previous one; the builder is left unchanged
    pub fn push(&mut self, frame: &AudioFrame) -> Result<()> {
        if let Some(last) = self.last_sequence
            && frame.sequence != last + 1
        {
            return Err(Error::Input(format!(
                "non-contiguous frame: expected {}, got {}",
                last + 1,
                frame.sequence
            )));
        }

        if self.started_at.is_none() {
            self.started_at = Some(frame.timestamp);
        }
        self.samples.extend_from_slice(&frame.samples);
        self.last_sequence = Some(frame.sequence);
        self.frame_count += 1;
        self.peak_energy = self.peak_energy.max(frame.energy());
        Ok(())
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Duration of audio collected so far
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Freeze into an utterance
    #[must_use]
    pub fn finish(self) -> Utterance {
        Utterance {
            samples: self.samples,
            sample_rate: self.sample_rate,
            frame_count: self.frame_count,
            peak_energy: self.peak_energy,
            started_at: self.started_at,
        }
    }
}
