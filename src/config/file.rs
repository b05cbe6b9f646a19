//! TOML configuration file loading
//!
//! Supports `~/.config/lectern/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LecternConfigFile {
    /// Data directory override (database, session snapshot)
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Audio capture, VAD and playback configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Turn timing configuration
    #[serde(default)]
    pub turn: TurnFileConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalFileConfig,

    /// Speech provider configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Web coordinator configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub playback_sample_rate: Option<u32>,
    pub vad_threshold: Option<f32>,
    pub barge_in_threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
}

/// Turn timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    pub max_utterance_ms: Option<u64>,
    pub stt_deadline_ms: Option<u64>,
    pub llm_deadline_ms: Option<u64>,
    pub tts_deadline_ms: Option<u64>,
    pub interrupt_grace_ms: Option<u64>,
    pub max_history: Option<usize>,
    pub heartbeat_ms: Option<u64>,
}

/// Retrieval configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetrievalFileConfig {
    pub k: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
}

/// Speech provider configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// STT backend ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS backend ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL (e.g. `http://localhost:11434/v1` for Ollama)
    pub base_url: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    pub max_tokens: Option<u32>,

    /// Assistant system prompt
    pub system_prompt: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
    pub llm: Option<String>,
}

/// Web coordinator configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_dir: Option<String>,
    pub stale_after_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LecternConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LecternConfigFile {
    let Some(path) = config_file_path() else {
        return LecternConfigFile::default();
    };

    if !path.exists() {
        return LecternConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            LecternConfigFile::default()
        }),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LecternConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> crate::Result<LecternConfigFile> {
    let config = toml::from_str(content)?;
    Ok(config)
}

/// Return the config file path: `~/.config/lectern/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LECTERN_CONFIG") {
        return Some(PathBuf::from(path));
    }

    directories::BaseDirs::new().map(|d| d.config_dir().join("lectern").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_overlay() {
        let fc = parse_config(
            r#"
            [audio]
            silence_timeout_ms = 900

            [retrieval]
            k = 5

            [llm]
            base_url = "http://localhost:11434/v1"
            model = "mistral"
            "#,
        )
        .unwrap();

        assert_eq!(fc.audio.silence_timeout_ms, Some(900));
        assert_eq!(fc.audio.sample_rate, None);
        assert_eq!(fc.retrieval.k, Some(5));
        assert_eq!(fc.llm.model.as_deref(), Some("mistral"));
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn test_malformed() {
        assert!(parse_config("[audio\nk = ").is_err());
    }
}
