//! Audio capture from microphone

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFrame, FrameSegmenter};
use super::io::AudioEvent;
use super::vad::{VadEdge, VadState, VoiceActivityDetector};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Captures audio from the default input device
///
/// Holds a cpal stream, so it must stay on the thread that created it.
pub struct AudioCapture {
    config: StreamConfig,
    sample_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    error: Arc<Mutex<Option<String>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at `sample_rate`
    ///
    /// Mono is preferred; multi-channel input is downmixed.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| {
                device
                    .supported_input_configs()
                    .ok()?
                    .find(|c| supports_rate(c))
            })
            .ok_or_else(|| Error::Device("no suitable input config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(None)),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let error = Arc::clone(&self.error);
        let channels = usize::from(self.config.channels.max(1));

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device".to_string()))?;

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        if channels == 1 {
                            buf.extend_from_slice(data);
                        } else {
                            #[allow(clippy::cast_precision_loss)]
                            buf.extend(
                                data.chunks(channels)
                                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                            );
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    if let Ok(mut slot) = error.lock() {
                        slot.get_or_insert_with(|| err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Get captured audio buffer and clear it
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// First stream error reported by the device, if any
    #[must_use]
    pub fn take_error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|mut e| e.take())
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Start the `audio-capture` thread
///
/// The thread frames captured audio, runs the VAD and sends [`AudioEvent`]s
/// until `shutdown` fires or the receiver is dropped. A stream error is
/// reported once as [`AudioEvent::DeviceLost`].
///
/// # Errors
///
/// Returns [`Error::Device`] if the input device cannot be opened
pub fn spawn_capture(
    config: &AudioConfig,
    playing: Arc<AtomicBool>,
    tx: mpsc::Sender<AudioEvent>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let config = config.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

    let handle = std::thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            let started = AudioCapture::new(config.sample_rate).and_then(|mut capture| {
                capture.start()?;
                Ok(capture)
            });

            let mut capture = match started {
                Ok(capture) => {
                    let _ = ready_tx.send(Ok(()));
                    capture
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut segmenter = FrameSegmenter::new(config.frame_samples());
            let mut vad = VoiceActivityDetector::new(&config, playing);
            let poll = config.frame_duration() / 2;

            'capture: while !shutdown.is_cancelled() {
                if let Some(err) = capture.take_error() {
                    let _ = tx.blocking_send(AudioEvent::DeviceLost(err));
                    break;
                }

                for frame in segmenter.push(&capture.take_buffer()) {
                    for event in route_frame(&mut vad, frame) {
                        if tx.blocking_send(event).is_err() {
                            break 'capture;
                        }
                    }
                }

                std::thread::sleep(poll);
            }

            capture.stop();
        })?;

    ready_rx
        .recv()
        .map_err(|_| Error::Device("capture thread exited during startup".to_string()))??;

    Ok(handle)
}

/// Run a frame through the VAD and produce its events in order
///
/// Frames outside an utterance are dropped.
pub fn route_frame(vad: &mut VoiceActivityDetector, frame: AudioFrame) -> Vec<AudioEvent> {
    let sequence = frame.sequence;
    match vad.process(&frame) {
        Some(VadEdge::SpeechStart) => vec![
            AudioEvent::SpeechStart { sequence },
            AudioEvent::Frame(frame),
        ],
        Some(VadEdge::SpeechEnd) => vec![
            AudioEvent::Frame(frame),
            AudioEvent::SpeechEnd { sequence },
        ],
        None if vad.state() == VadState::Speech => vec![AudioEvent::Frame(frame)],
        None => Vec::new(),
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let wav_err = |e: hound::Error| Error::Input(format!("wav encoding failed: {e}"));

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_err)?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16).map_err(wav_err)?;
        }

        writer.finalize().map_err(wav_err)?;
    }

    Ok(cursor.into_inner())
}
