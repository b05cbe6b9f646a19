//! Lectern - a voice assistant grounded in a local knowledge base
//!
//! Listens on the microphone, transcribes each utterance, retrieves the most
//! relevant passages from a `SQLite` vector store, streams a grounded answer
//! from a chat model and speaks it back sentence by sentence. Speaking over
//! the assistant interrupts it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  voice: capture ─ VAD ─ frames      playback queue   │
//! └──────────────┬───────────────────────────▲───────────┘
//!                │ AudioEvent                │ enqueue / cancel
//! ┌──────────────▼───────────────────────────┴───────────┐
//! │  turn: TurnController ── StageEvent ── TurnPipeline   │
//! │        STT → retrieval → generation → TTS            │
//! └──────────────┬───────────────────────────────────────┘
//!                │ SessionState
//! ┌──────────────▼───────────────────────────────────────┐
//! │  session ── api (health, session, SSE, query, tts)   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod knowledge;
pub mod prompt;
pub mod session;
pub mod setup;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use session::{SessionMirror, SessionPublisher, SessionState, SessionView};
pub use turn::{TurnController, TurnStatus, TurnTransition};
