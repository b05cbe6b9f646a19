//! Error types for Lectern

use thiserror::Error;

/// Result type alias for Lectern operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error or timeout is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transcription,
    Retrieval,
    Generation,
    Synthesis,
    Embedding,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transcription => "transcription",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
            Self::Embedding => "embedding",
        };
        f.write_str(name)
    }
}

/// Broad classification used to decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or empty audio; recovered inside the turn without surfacing
    Input,
    /// Speech, language or embedding backend failure, including deadlines
    Provider,
    /// Audio hardware unavailable; fatal to the process
    Device,
    /// Database or filesystem problems
    Storage,
    /// Invalid configuration
    Config,
}

/// Errors that can occur in Lectern
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed audio input
    #[error("input error: {0}")]
    Input(String),

    /// Utterance carried no speech energy
    #[error("no speech detected in utterance")]
    EmptyInput,

    /// Audio device error
    #[error("audio device error: {0}")]
    Device(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Embedding error
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Provider call exceeded its deadline
    #[error("{0} deadline exceeded")]
    Timeout(Stage),

    /// Vector store has not been provisioned
    #[error("vector store is not provisioned (run `lectern setup`)")]
    Unprovisioned,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) | Self::EmptyInput => ErrorKind::Input,
            Self::Stt(_)
            | Self::Tts(_)
            | Self::Llm(_)
            | Self::Embedding(_)
            | Self::Timeout(_)
            | Self::Http(_)
            | Self::Serialization(_) => ErrorKind::Provider,
            Self::Device(_) => ErrorKind::Device,
            Self::Unprovisioned | Self::Io(_) | Self::Database(_) | Self::Sqlite(_) => {
                ErrorKind::Storage
            }
            Self::Config(_) | Self::Toml(_) => ErrorKind::Config,
        }
    }

    /// Whether this error must terminate the process
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(Error::EmptyInput.kind(), ErrorKind::Input);
        assert_eq!(Error::Timeout(Stage::Generation).kind(), ErrorKind::Provider);
        assert_eq!(Error::Stt("quota".into()).kind(), ErrorKind::Provider);
        assert!(Error::Device("unplugged".into()).is_fatal());
        assert!(!Error::Tts("500".into()).is_fatal());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout(Stage::Synthesis);
        assert_eq!(err.to_string(), "synthesis deadline exceeded");
    }
}
