//! Voice processing module
//!
//! Capture and playback run on dedicated threads that own the cpal streams.
//! Capture frames audio and runs the VAD; playback drains a sample queue.
//! Transcription and synthesis are HTTP adapters behind traits.

mod capture;
mod frame;
mod io;
mod playback;
pub mod stt;
pub mod tts;
mod vad;

pub use capture::{AudioCapture, route_frame, samples_to_wav, spawn_capture};
pub use frame::{AudioFrame, FrameSegmenter, Utterance, UtteranceBuilder, calculate_energy};
pub use io::{AudioEvent, AudioIo, AudioOutput};
pub use playback::{AudioPlayback, PlaybackHandle, decode_mp3};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{AudioStream, Synthesizer, TextToSpeech};
pub use vad::{VadEdge, VadState, VoiceActivityDetector};
