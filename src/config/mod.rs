//! Configuration management for Lectern
//!
//! Every option resolves as env > TOML file > default.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};
use file::LecternConfigFile;

/// Default assistant instructions
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering spoken questions. \
Based on the provided context, answer the question. If the information is not in the context, \
say that you don't have enough information to answer. Keep responses concise and conversational, \
they will be read aloud.";

/// Lectern configuration
#[derive(Debug)]
pub struct Config {
    /// Path to data directory (database, session snapshot)
    pub data_dir: PathBuf,

    /// Audio capture, VAD and playback configuration
    pub audio: AudioConfig,

    /// Turn timing configuration
    pub turn: TurnTimingConfig,

    /// Retrieval configuration
    pub retrieval: RetrievalConfig,

    /// Speech provider configuration
    pub voice: VoiceConfig,

    /// Language model configuration
    pub llm: LlmConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Web coordinator configuration
    pub api_server: ApiServerConfig,
}

/// Audio capture, VAD and playback configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Duration of one `AudioFrame` in milliseconds
    pub frame_ms: u32,

    /// Playback sample rate in Hz (synthesized audio is resampled to this)
    pub playback_sample_rate: u32,

    /// RMS energy above which a frame counts as speech
    pub vad_threshold: f32,

    /// RMS energy required while playback is active
    pub barge_in_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_timeout: Duration,
}

impl AudioConfig {
    /// Number of capture samples per frame
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Number of playback samples per frame
    #[must_use]
    pub const fn playback_frame_samples(&self) -> usize {
        (self.playback_sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Frame duration
    #[must_use]
    pub const fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 30,
            playback_sample_rate: 24_000,
            vad_threshold: 0.03,
            barge_in_threshold: 0.08,
            silence_timeout: Duration::from_millis(700),
        }
    }
}

/// Turn timing configuration
#[derive(Debug, Clone)]
pub struct TurnTimingConfig {
    /// Utterances are force-finalized after this long
    pub max_utterance: Duration,

    /// Deadline for a transcription call
    pub stt_deadline: Duration,

    /// Deadline for starting generation and for each next fragment
    pub llm_deadline: Duration,

    /// Deadline for starting synthesis and for each next audio block
    pub tts_deadline: Duration,

    /// Time an interrupted turn gets to wind down before it is aborted
    pub interrupt_grace: Duration,

    /// Exchanges kept as conversation context
    pub max_history: usize,

    /// How often an idle speech loop refreshes the session timestamp
    pub heartbeat: Duration,
}

impl Default for TurnTimingConfig {
    fn default() -> Self {
        Self {
            max_utterance: Duration::from_secs(15),
            stt_deadline: Duration::from_secs(10),
            llm_deadline: Duration::from_secs(20),
            tts_deadline: Duration::from_secs(10),
            interrupt_grace: Duration::from_millis(500),
            max_history: 6,
            heartbeat: Duration::from_secs(2),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks to retrieve
    pub k: usize,

    /// Retrieval gives up after this long and the turn proceeds without context
    pub timeout: Duration,

    /// Embedding endpoint base URL (OpenAI-compatible)
    pub embedding_base_url: String,

    /// Embedding model identifier
    pub embedding_model: String,

    /// Embedding dimension recorded at provisioning
    pub embedding_dim: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 3,
            timeout: Duration::from_millis(1500),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: crate::db::DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dim: crate::db::EMBEDDING_DIM,
        }
    }
}

/// STT backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttBackend {
    Whisper,
    Deepgram,
}

impl FromStr for SttBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// TTS backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsBackend {
    OpenAI,
    ElevenLabs,
}

impl FromStr for TtsBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Speech provider configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub stt_provider: SttBackend,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    pub tts_provider: TtsBackend,

    /// TTS model (e.g. "tts-1", "eleven_monolingual_v1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_provider: SttBackend::Whisper,
            stt_model: "whisper-1".to_string(),
            tts_provider: TtsBackend::OpenAI,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
        }
    }
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Max tokens per response
    pub max_tokens: u32,

    /// Assistant system prompt
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS, embeddings, chat)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<SecretString>,

    /// Key for the chat endpoint when it is not `OpenAI` (falls back to `openai`)
    pub llm: Option<SecretString>,
}

impl ApiKeys {
    /// Key for the configured STT backend
    #[must_use]
    pub const fn stt(&self, backend: SttBackend) -> Option<&SecretString> {
        match backend {
            SttBackend::Whisper => self.openai.as_ref(),
            SttBackend::Deepgram => self.deepgram.as_ref(),
        }
    }

    /// Key for the configured TTS backend
    #[must_use]
    pub const fn tts(&self, backend: TtsBackend) -> Option<&SecretString> {
        match backend {
            TtsBackend::OpenAI => self.openai.as_ref(),
            TtsBackend::ElevenLabs => self.elevenlabs.as_ref(),
        }
    }

    /// Key for the chat endpoint
    #[must_use]
    pub fn llm(&self) -> Option<&SecretString> {
        self.llm.as_ref().or(self.openai.as_ref())
    }
}

/// Web coordinator configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Path to static files directory (web UI)
    pub static_dir: Option<PathBuf>,

    /// A session not refreshed for this long fails readiness
    pub stale_after: Duration,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            static_dir: None,
            stale_after: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            audio: AudioConfig::default(),
            turn: TurnTimingConfig::default(),
            retrieval: RetrievalConfig::default(),
            voice: VoiceConfig::default(),
            llm: LlmConfig::default(),
            api_keys: ApiKeys::default(),
            api_server: ApiServerConfig::default(),
        }
    }
}

/// Parse an env value, falling back to the file value then the default
fn layered<T: FromStr>(env: Option<String>, file: Option<T>, default: T) -> T {
    env.and_then(|v| v.parse().ok()).or(file).unwrap_or(default)
}

/// Same as [`layered`] for millisecond durations
fn layered_ms(env: Option<String>, file: Option<u64>, default: Duration) -> Duration {
    env.and_then(|v| v.parse().ok())
        .or(file)
        .map_or(default, Duration::from_millis)
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::from_sources(fc, |key| std::env::var(key).ok())?;

        // Ensure data dir exists
        std::fs::create_dir_all(&config.data_dir).ok();

        Ok(config)
    }

    /// Build configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is invalid
    pub fn from_sources(
        fc: LecternConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: layered(
                env("LECTERN_SAMPLE_RATE"),
                fc.audio.sample_rate,
                audio_defaults.sample_rate,
            ),
            frame_ms: layered(
                env("LECTERN_FRAME_MS"),
                fc.audio.frame_ms,
                audio_defaults.frame_ms,
            ),
            playback_sample_rate: layered(
                env("LECTERN_PLAYBACK_SAMPLE_RATE"),
                fc.audio.playback_sample_rate,
                audio_defaults.playback_sample_rate,
            ),
            vad_threshold: layered(
                env("LECTERN_VAD_THRESHOLD"),
                fc.audio.vad_threshold,
                audio_defaults.vad_threshold,
            ),
            barge_in_threshold: layered(
                env("LECTERN_BARGE_IN_THRESHOLD"),
                fc.audio.barge_in_threshold,
                audio_defaults.barge_in_threshold,
            ),
            silence_timeout: layered_ms(
                env("LECTERN_SILENCE_TIMEOUT_MS"),
                fc.audio.silence_timeout_ms,
                audio_defaults.silence_timeout,
            ),
        };

        if audio.frame_ms == 0 || audio.sample_rate == 0 || audio.playback_sample_rate == 0 {
            return Err(Error::Config(
                "sample rates and frame size must be non-zero".to_string(),
            ));
        }

        let turn_defaults = TurnTimingConfig::default();
        let turn = TurnTimingConfig {
            max_utterance: layered_ms(
                env("LECTERN_MAX_UTTERANCE_MS"),
                fc.turn.max_utterance_ms,
                turn_defaults.max_utterance,
            ),
            stt_deadline: layered_ms(
                env("LECTERN_STT_DEADLINE_MS"),
                fc.turn.stt_deadline_ms,
                turn_defaults.stt_deadline,
            ),
            llm_deadline: layered_ms(
                env("LECTERN_LLM_DEADLINE_MS"),
                fc.turn.llm_deadline_ms,
                turn_defaults.llm_deadline,
            ),
            tts_deadline: layered_ms(
                env("LECTERN_TTS_DEADLINE_MS"),
                fc.turn.tts_deadline_ms,
                turn_defaults.tts_deadline,
            ),
            interrupt_grace: layered_ms(
                env("LECTERN_INTERRUPT_GRACE_MS"),
                fc.turn.interrupt_grace_ms,
                turn_defaults.interrupt_grace,
            ),
            max_history: layered(
                env("LECTERN_MAX_HISTORY"),
                fc.turn.max_history,
                turn_defaults.max_history,
            ),
            heartbeat: layered_ms(
                env("LECTERN_HEARTBEAT_MS"),
                fc.turn.heartbeat_ms,
                turn_defaults.heartbeat,
            ),
        };

        let retrieval_defaults = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            k: layered(env("LECTERN_RETRIEVAL_K"), fc.retrieval.k, retrieval_defaults.k),
            timeout: layered_ms(
                env("LECTERN_RETRIEVAL_TIMEOUT_MS"),
                fc.retrieval.timeout_ms,
                retrieval_defaults.timeout,
            ),
            embedding_base_url: env("LECTERN_EMBEDDING_URL")
                .unwrap_or(retrieval_defaults.embedding_base_url),
            embedding_model: env("LECTERN_EMBEDDING_MODEL")
                .or(fc.retrieval.embedding_model)
                .unwrap_or(retrieval_defaults.embedding_model),
            embedding_dim: layered(
                env("LECTERN_EMBEDDING_DIM"),
                fc.retrieval.embedding_dim,
                retrieval_defaults.embedding_dim,
            ),
        };

        let voice_defaults = VoiceConfig::default();
        let voice = VoiceConfig {
            stt_provider: env("LECTERN_STT_PROVIDER")
                .or(fc.voice.stt_provider)
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or(voice_defaults.stt_provider),
            stt_model: env("LECTERN_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or(voice_defaults.stt_model),
            tts_provider: env("LECTERN_TTS_PROVIDER")
                .or(fc.voice.tts_provider)
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or(voice_defaults.tts_provider),
            tts_model: env("LECTERN_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or(voice_defaults.tts_model),
            tts_voice: env("LECTERN_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .unwrap_or(voice_defaults.tts_voice),
            tts_speed: layered(
                env("LECTERN_TTS_SPEED"),
                fc.voice.tts_speed,
                voice_defaults.tts_speed,
            )
            .clamp(0.25, 4.0),
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: env("LECTERN_LLM_URL")
                .or(fc.llm.base_url)
                .unwrap_or(llm_defaults.base_url),
            model: env("LECTERN_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(llm_defaults.model),
            max_tokens: layered(
                env("LECTERN_LLM_MAX_TOKENS"),
                fc.llm.max_tokens,
                llm_defaults.max_tokens,
            ),
            system_prompt: fc.llm.system_prompt.unwrap_or(llm_defaults.system_prompt),
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
            llm: env("LECTERN_LLM_API_KEY")
                .or(fc.api_keys.llm)
                .map(SecretString::from),
        };

        let server_defaults = ApiServerConfig::default();
        let api_server = ApiServerConfig {
            host: env("LECTERN_HOST")
                .or(fc.server.host)
                .unwrap_or(server_defaults.host),
            port: layered(
                env("LECTERN_PORT").or_else(|| env("PORT")),
                fc.server.port,
                server_defaults.port,
            ),
            static_dir: env("LECTERN_STATIC_DIR")
                .or(fc.server.static_dir)
                .map(PathBuf::from),
            stale_after: layered_ms(
                env("LECTERN_STALE_AFTER_MS"),
                fc.server.stale_after_ms,
                server_defaults.stale_after,
            ),
        };

        // Determine data directory (~/.local/share/lectern on Linux)
        let data_dir = env("LECTERN_DATA_DIR")
            .or(fc.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            data_dir,
            audio,
            turn,
            retrieval,
            voice,
            llm,
            api_keys,
            api_server,
        })
    }

    /// Path of the knowledge database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lectern.db")
    }

    /// Path of the published session snapshot
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }
}

/// Default data directory: `~/.local/share/lectern`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("lectern"))
}
