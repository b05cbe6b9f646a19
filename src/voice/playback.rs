//! Audio playback to speakers

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::io::{AudioEvent, AudioOutput};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// How long an idle stream keeps running before it is paused
const IDLE_PAUSE: Duration = Duration::from_millis(250);

/// Playback still counts as active this long after the queue drains
///
/// Covers device latency, room echo and the gap before the next fragment.
const PLAYING_TAIL: Duration = Duration::from_millis(400);

enum Command {
    Play,
    Pause,
    Shutdown,
}

/// Shared sample queue read by the output callback
#[derive(Clone, Default)]
struct SampleQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    samples: VecDeque<f32>,
    /// Output frames left before playback stops counting as active
    tail: usize,
}

impl SampleQueue {
    fn push(&self, samples: &[f32]) {
        if let Ok(mut state) = self.inner.lock() {
            state.samples.extend(samples.iter().copied());
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.samples.clear();
            state.tail = 0;
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|s| s.samples.len()).unwrap_or(0)
    }

    /// Nothing queued and the tail has run out
    fn is_idle(&self) -> bool {
        self.inner
            .lock()
            .map(|s| s.samples.is_empty() && s.tail == 0)
            .unwrap_or(true)
    }

    /// Fill one output buffer and report whether playback is still active
    ///
    /// Every drained buffer restarts the tail; silent buffers count it down.
    fn drain_into(&self, data: &mut [f32], channels: usize, tail_frames: usize) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            data.fill(0.0);
            return false;
        };

        let mut frames = 0;
        let mut played = false;
        for frame in data.chunks_mut(channels) {
            let sample = state.samples.pop_front();
            played |= sample.is_some();
            frame.fill(sample.unwrap_or(0.0));
            frames += 1;
        }

        if played {
            state.tail = tail_frames;
        } else {
            state.tail = state.tail.saturating_sub(frames);
        }
        !state.samples.is_empty() || state.tail > 0
    }
}

/// Cloneable sink that feeds the playback thread
pub struct PlaybackHandle {
    queue: SampleQueue,
    playing: Arc<AtomicBool>,
    commands: std_mpsc::Sender<Command>,
}

impl AudioOutput for PlaybackHandle {
    fn enqueue(&self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        self.queue.push(samples);
        self.playing.store(true, Ordering::Relaxed);
        self.commands
            .send(Command::Play)
            .map_err(|_| Error::Device("playback thread is gone".to_string()))
    }

    fn cancel(&self) {
        self.queue.clear();
        self.playing.store(false, Ordering::Relaxed);
        let _ = self.commands.send(Command::Pause);
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Owns the `audio-playback` thread
pub struct AudioPlayback {
    queue: SampleQueue,
    playing: Arc<AtomicBool>,
    commands: std_mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Open the default output device and start the playback thread
    ///
    /// Device failures after startup are reported on `events` as
    /// [`AudioEvent::DeviceLost`].
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn spawn(
        config: &AudioConfig,
        playing: Arc<AtomicBool>,
        events: mpsc::Sender<AudioEvent>,
    ) -> Result<Self> {
        let sample_rate = config.playback_sample_rate;
        let queue = SampleQueue::default();
        let (commands, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread_queue = queue.clone();
        let thread_playing = Arc::clone(&playing);

        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let error = Arc::new(Mutex::new(None::<String>));
                let stream = match open_output_stream(
                    sample_rate,
                    thread_queue.clone(),
                    Arc::clone(&thread_playing),
                    Arc::clone(&error),
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                run_playback_loop(&stream, &command_rx, &thread_queue, &error, &events);
                drop(stream);
                tracing::debug!("playback thread exited");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("playback thread exited during startup".to_string()))??;

        Ok(Self {
            queue,
            playing,
            commands,
            thread: Some(thread),
        })
    }

    /// Create a sink for this playback thread
    #[must_use]
    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            queue: self.queue.clone(),
            playing: Arc::clone(&self.playing),
            commands: self.commands.clone(),
        }
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("playback thread panicked");
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_playback_loop(
    stream: &Stream,
    commands: &std_mpsc::Receiver<Command>,
    queue: &SampleQueue,
    error: &Arc<Mutex<Option<String>>>,
    events: &mpsc::Sender<AudioEvent>,
) {
    let mut running = false;

    loop {
        if let Some(err) = error.lock().ok().and_then(|mut e| e.take()) {
            let _ = events.blocking_send(AudioEvent::DeviceLost(err));
            return;
        }

        match commands.recv_timeout(IDLE_PAUSE) {
            Ok(Command::Play) => {
                if !running {
                    if let Err(e) = stream.play() {
                        let _ = events.blocking_send(AudioEvent::DeviceLost(e.to_string()));
                        return;
                    }
                    running = true;
                }
            }
            Ok(Command::Pause) => {
                if running {
                    let _ = stream.pause();
                    running = false;
                }
            }
            Ok(Command::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if running && queue.is_idle() {
                    let _ = stream.pause();
                    running = false;
                }
            }
        }
    }
}

fn open_output_stream(
    sample_rate: u32,
    queue: SampleQueue,
    playing: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| c.channels() == 2 && supports_rate(c))
        })
        .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels.max(1));
    let tail_frames = usize::try_from(
        u64::from(sample_rate) * u64::try_from(PLAYING_TAIL.as_millis()).unwrap_or(0) / 1000,
    )
    .unwrap_or(0);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let active = queue.drain_into(data, channels, tail_frames);
                playing.store(active, Ordering::Relaxed);
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                if let Ok(mut slot) = error.lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    // Streams may start running on creation; stay silent until asked to play
    let _ = stream.pause();

    Ok(stream)
}

/// Decode MP3 bytes to mono f32 samples, returning the stream's sample rate
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);

                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Tts(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_cancel() {
        let (commands, rx) = std_mpsc::channel();
        let handle = PlaybackHandle {
            queue: SampleQueue::default(),
            playing: Arc::new(AtomicBool::new(false)),
            commands,
        };

        handle.enqueue(&[0.1; 100]).unwrap();
        handle.enqueue(&[0.2; 50]).unwrap();
        assert_eq!(handle.pending(), 150);
        assert!(handle.playing.load(Ordering::Relaxed));

        handle.cancel();
        assert_eq!(handle.pending(), 0);
        assert!(!handle.playing.load(Ordering::Relaxed));
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_playing_held_through_gap() {
        let queue = SampleQueue::default();
        let mut out = [0.0f32; 100];

        queue.push(&[0.5; 150]);
        assert!(queue.drain_into(&mut out, 1, 250));
        assert!(out.iter().all(|&s| s > 0.4));

        // Queue drains mid-buffer; the tail keeps playback active
        assert!(queue.drain_into(&mut out, 1, 250));
        assert!(out[..50].iter().all(|&s| s > 0.4));
        assert!(out[50..].iter().all(|&s| s.abs() < f32::EPSILON));
        assert!(queue.drain_into(&mut out, 1, 250));
        assert!(!queue.is_idle());

        // Next fragment arrives before the tail runs out
        queue.push(&[0.5; 10]);
        assert!(queue.drain_into(&mut out, 1, 250));

        // Silence long enough to exhaust the tail
        assert!(queue.drain_into(&mut out, 1, 250));
        assert!(queue.drain_into(&mut out, 1, 250));
        assert!(!queue.drain_into(&mut out, 1, 250));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_cancel_drops_tail() {
        let queue = SampleQueue::default();
        let mut out = [0.0f32; 64];

        queue.push(&[0.5; 32]);
        assert!(queue.drain_into(&mut out, 2, 1000));
        queue.clear();
        assert!(queue.is_idle());
        assert!(!queue.drain_into(&mut out, 2, 1000));
    }

    #[test]
    fn test_enqueue_after_thread_gone() {
        let (commands, rx) = std_mpsc::channel();
        drop(rx);
        let handle = PlaybackHandle {
            queue: SampleQueue::default(),
            playing: Arc::new(AtomicBool::new(false)),
            commands,
        };

        assert!(matches!(handle.enqueue(&[0.1]), Err(Error::Device(_))));
    }

    #[test]
    fn test_decode_garbage_is_empty_or_error() {
        // minimp3 skips data it cannot sync to
        match decode_mp3(&[0u8; 64]) {
            Ok((samples, _)) => assert!(samples.is_empty()),
            Err(e) => assert!(matches!(e, Error::Tts(_))),
        }
    }
}
