//! Audio device boundary used by the turn controller

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::capture::spawn_capture;
use super::frame::AudioFrame;
use super::playback::{AudioPlayback, PlaybackHandle};
use crate::Result;
use crate::config::AudioConfig;

/// Capacity of the capture event channel (about ten seconds of frames)
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Events produced by capture, in frame order
#[derive(Debug, Clone)]
pub enum AudioEvent {
    /// Voice activity began on the frame that follows
    SpeechStart { sequence: u64 },
    /// A frame inside an utterance
    Frame(AudioFrame),
    /// Voice activity ended with the preceding frame
    SpeechEnd { sequence: u64 },
    /// The input or output device failed
    DeviceLost(String),
}

/// Sink for synthesized audio
///
/// Calls never block on the device: samples are queued and played by the
/// playback thread.
pub trait AudioOutput: Send + Sync {
    /// Queue samples for playback in submission order
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Device`] if the output is gone
    fn enqueue(&self, samples: &[f32]) -> Result<()>;

    /// Drop everything queued and silence the device
    fn cancel(&self);

    /// Samples still waiting to be played
    fn pending(&self) -> usize;
}

/// Running capture and playback threads
pub struct AudioIo {
    events: Option<mpsc::Receiver<AudioEvent>>,
    output: Arc<PlaybackHandle>,
    capture_thread: Option<JoinHandle<()>>,
    playback: AudioPlayback,
}

impl AudioIo {
    /// Open the default input and output devices
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Device`] if either device cannot be opened
    pub fn open(config: &AudioConfig, shutdown: CancellationToken) -> Result<Self> {
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let playing = Arc::new(AtomicBool::new(false));

        let playback = AudioPlayback::spawn(config, Arc::clone(&playing), tx.clone())?;
        let output = Arc::new(playback.handle());

        let capture_thread = spawn_capture(config, playing, tx, shutdown)?;

        tracing::info!(
            sample_rate = config.sample_rate,
            frame_ms = config.frame_ms,
            playback_rate = config.playback_sample_rate,
            "audio io started"
        );

        Ok(Self {
            events: Some(events),
            output,
            capture_thread: Some(capture_thread),
            playback,
        })
    }

    /// Take the capture event receiver (only once)
    pub const fn take_events(&mut self) -> Option<mpsc::Receiver<AudioEvent>> {
        self.events.take()
    }

    /// Playback sink
    #[must_use]
    pub fn output(&self) -> Arc<PlaybackHandle> {
        Arc::clone(&self.output)
    }

    /// Stop both threads and wait for capture to exit
    ///
    /// Capture exits once the shutdown token fires or the receiver is dropped.
    pub fn close(mut self) {
        self.playback.shutdown();
        drop(self.events.take());
        if let Some(handle) = self.capture_thread.take()
            && handle.join().is_err()
        {
            tracing::warn!("capture thread panicked");
        }
    }
}
