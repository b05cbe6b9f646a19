//! Speech-to-text (STT) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::frame::Utterance;
use crate::config::SttBackend;
use crate::{Error, Result};

/// Utterances whose loudest frame is below this RMS are treated as silence
pub const SILENCE_FLOOR: f32 = 0.005;

/// Converts a finalized utterance to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyInput`] for silent audio or a provider error
    async fn transcribe(&self, utterance: &Utterance) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Transcribes speech over HTTP
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttBackend,
}

impl SpeechToText {
    /// Create an STT client for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(provider: SttBackend, api_key: Option<&SecretString>, model: &str) -> Result<Self> {
        let api_key = api_key
            .map(|k| k.expose_secret())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                Error::Config(match provider {
                    SttBackend::Whisper => "OpenAI API key required for Whisper".to_string(),
                    SttBackend::Deepgram => "Deepgram API key required".to_string(),
                })
            })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key.to_string()),
            model: model.to_string(),
            provider,
        })
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;

        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        if !utterance.has_speech(SILENCE_FLOOR) {
            return Err(Error::EmptyInput);
        }

        let audio = utterance.to_wav()?;
        let transcript = match self.provider {
            SttBackend::Whisper => self.transcribe_whisper(audio).await?,
            SttBackend::Deepgram => self.transcribe_deepgram(audio).await?,
        };

        let transcript = transcript.trim().to_string();
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_key() {
        assert!(SpeechToText::new(SttBackend::Whisper, None, "whisper-1").is_err());

        let empty = SecretString::from(String::new());
        assert!(SpeechToText::new(SttBackend::Deepgram, Some(&empty), "nova-2").is_err());
    }

    #[tokio::test]
    async fn test_silence_is_empty_input() {
        let key = SecretString::from("sk-test".to_string());
        let stt = SpeechToText::new(SttBackend::Whisper, Some(&key), "whisper-1").unwrap();

        let silent = Utterance::from_samples(vec![0.0; 1600], 16_000);
        assert!(matches!(stt.transcribe(&silent).await, Err(Error::EmptyInput)));

        let empty = Utterance::from_samples(Vec::new(), 16_000);
        assert!(matches!(stt.transcribe(&empty).await, Err(Error::EmptyInput)));
    }
}
