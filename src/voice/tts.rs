//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};

use super::playback::decode_mp3;
use crate::config::{TtsBackend, VoiceConfig};
use crate::{Error, Result};

/// Synthesized audio as ordered sample blocks at the playback rate
pub type AudioStream = BoxStream<'static, Result<Vec<f32>>>;

/// Turns text into playable audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns a provider error if synthesis cannot start
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// Synthesizes speech over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsBackend,
    output_rate: u32,
    block_samples: usize,
}

impl TextToSpeech {
    /// Create a TTS client producing blocks of `block_samples` at `output_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(
        voice: &VoiceConfig,
        api_key: Option<&SecretString>,
        output_rate: u32,
        block_samples: usize,
    ) -> Result<Self> {
        let api_key = api_key
            .map(|k| k.expose_secret())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                Error::Config(match voice.tts_provider {
                    TtsBackend::OpenAI => "OpenAI API key required for TTS".to_string(),
                    TtsBackend::ElevenLabs => "ElevenLabs API key required for TTS".to_string(),
                })
            })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key.to_string()),
            voice: voice.tts_voice.clone(),
            // ElevenLabs doesn't use speed in the same way
            speed: match voice.tts_provider {
                TtsBackend::OpenAI => voice.tts_speed,
                TtsBackend::ElevenLabs => 1.0,
            },
            model: voice.tts_model.clone(),
            provider: voice.tts_provider,
            output_rate,
            block_samples: block_samples.max(1),
        })
    }

    /// Synthesize using OpenAI TTS, returning MP3 bytes
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Synthesize using ElevenLabs TTS, returning MP3 bytes
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", self.voice);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(futures::stream::empty().boxed());
        }

        let mp3 = match self.provider {
            TtsBackend::OpenAI => self.synthesize_openai(text).await?,
            TtsBackend::ElevenLabs => self.synthesize_elevenlabs(text).await?,
        };

        let output_rate = self.output_rate;
        let block_samples = self.block_samples;
        let samples = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let (samples, source_rate) = decode_mp3(&mp3)?;
            if source_rate == 0 || source_rate == output_rate {
                return Ok(samples);
            }
            resample_audio(&samples, source_rate, output_rate)
        })
        .await
        .map_err(|e| Error::Tts(format!("decode task failed: {e}")))??;

        tracing::debug!(
            chars = text.len(),
            samples = samples.len(),
            "synthesis complete"
        );

        Ok(futures::stream::iter(into_blocks(samples, block_samples).into_iter().map(Ok)).boxed())
    }
}

/// Split samples into blocks of `block_samples` (the last may be shorter)
#[must_use]
pub fn into_blocks(samples: Vec<f32>, block_samples: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(block_samples.max(1))
        .map(<[f32]>::to_vec)
        .collect()
}

/// Resample audio using rubato
///
/// The final partial chunk is zero-padded and the output trimmed to the
/// expected length.
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if samples.is_empty() || from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Tts(format!("resampler init failed: {e}")))?;

    // Convert to f64
    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();

    let delay = resampler.output_delay();
    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;

    let mut output = Vec::with_capacity(expected + delay);
    let mut pos = 0;
    // The resampler picks its own chunk length, so ask before every call;
    // once input runs out, zero blocks flush its internal delay
    while output.len() < expected + delay {
        let needed = resampler.input_frames_next();
        let end = (pos + needed).min(input.len());
        let mut block = input[pos..end].to_vec();
        block.resize(needed, 0.0);
        pos = end;

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Tts(format!("resample failed: {e}")))?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    // Convert back to f32
    Ok(output
        .iter()
        .skip(delay)
        .take(expected)
        .map(|&s| s as f32)
        .collect())
}
