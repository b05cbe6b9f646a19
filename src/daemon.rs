//! Daemon - wires providers, audio and the web coordinator together
//!
//! Three modes share the same wiring:
//! - `listen`: speech loop only, mirroring the session to `session.json`
//! - `serve`: web coordinator only, reading `session.json`
//! - `run`: both in one process, sharing the session in memory

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{ChatGenerator, ResponseGenerator};
use crate::api::ApiServerBuilder;
use crate::db::{self, DbPool, Embedder, TextEmbedder, VectorStore};
use crate::knowledge::{EmptyRetriever, KnowledgeRetriever, Retriever};
use crate::session::{FileSessionView, SessionMirror, SessionPublisher, SessionView};
use crate::turn::{Providers, TurnConfig, TurnController};
use crate::voice::{AudioIo, AudioOutput, SpeechToText, Synthesizer, TextToSpeech};
use crate::{Config, Error, Result};

/// The Lectern daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Speech loop and web coordinator in one process
    ///
    /// # Errors
    ///
    /// Returns error if a provider cannot be configured, the audio device
    /// fails, or the server cannot bind
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let (retriever, db) = open_knowledge(&self.config);
        let generator = build_generator(&self.config)?;
        let providers = build_providers(&self.config, retriever.clone(), generator.clone())?;

        let publisher = SessionPublisher::new();
        let mirror = SessionMirror::spawn(publisher.subscribe(), self.config.session_path());
        let view: Arc<dyn SessionView> = Arc::new(publisher.view());

        let server = web_server(&self.config, view, db)
            .query(retriever, generator)
            .tts(providers.synthesizer.clone())
            .build()
            .spawn(shutdown.clone());

        let result = run_speech_loop(&self.config, providers, publisher, shutdown.clone()).await;
        mirror.join().await;

        shutdown.cancel();
        match server.await {
            Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
            Err(e) => tracing::error!(error = %e, "API server task panicked"),
            Ok(Ok(())) => {}
        }
        result
    }

    /// Speech loop only
    ///
    /// # Errors
    ///
    /// Returns error if a provider cannot be configured or the audio device fails
    #[allow(clippy::future_not_send)]
    pub async fn listen(self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let (retriever, _db) = open_knowledge(&self.config);
        let generator = build_generator(&self.config)?;
        let providers = build_providers(&self.config, retriever, generator)?;

        let publisher = SessionPublisher::new();
        let mirror = SessionMirror::spawn(publisher.subscribe(), self.config.session_path());

        let result = run_speech_loop(&self.config, providers, publisher, shutdown).await;
        mirror.join().await;
        result
    }

    /// Web coordinator only, reading the session a separate speech loop writes
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot bind
    pub async fn serve(self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let (retriever, db) = open_knowledge(&self.config);
        let view: Arc<dyn SessionView> =
            Arc::new(FileSessionView::new(self.config.session_path()));

        let mut builder = web_server(&self.config, view, db);
        match build_generator(&self.config) {
            Ok(generator) => builder = builder.query(retriever, generator),
            Err(e) => tracing::warn!(error = %e, "query endpoint disabled"),
        }
        match build_synthesizer(&self.config) {
            Ok(synthesizer) => builder = builder.tts(synthesizer),
            Err(e) => tracing::warn!(error = %e, "tts endpoint disabled"),
        }

        builder.build().run(shutdown).await
    }
}

/// Token cancelled on Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            signal.cancel();
        }
    });
    token
}

fn web_server(config: &Config, view: Arc<dyn SessionView>, db: Option<DbPool>) -> ApiServerBuilder {
    let mut builder = ApiServerBuilder::new(view, &config.api_server.host, config.api_server.port)
        .config(config)
        .static_dir(config.api_server.static_dir.clone());
    if let Some(db) = db {
        builder = builder.db(db);
    }
    builder
}

#[allow(clippy::future_not_send)]
async fn run_speech_loop(
    config: &Config,
    providers: Providers,
    publisher: SessionPublisher,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut audio = AudioIo::open(&config.audio, shutdown.clone())?;
    let events = audio
        .take_events()
        .ok_or_else(|| Error::Device("capture events already taken".to_string()))?;
    let output: Arc<dyn AudioOutput> = audio.output();

    let mut controller =
        TurnController::new(TurnConfig::from_config(config), providers, output, publisher);
    controller.prepare_apology().await;

    tracing::info!("lectern listening");
    let result = controller.run(events, shutdown.clone()).await;

    shutdown.cancel();
    audio.close();
    result
}

/// Embedder for the configured embedding endpoint
///
/// # Errors
///
/// Returns error if the hosted endpoint is used without an API key
pub fn build_embedder(config: &Config) -> Result<Arc<dyn TextEmbedder>> {
    let embedder = Embedder::new(
        config.api_keys.openai.as_ref(),
        &config.retrieval.embedding_base_url,
        &config.retrieval.embedding_model,
    )?;
    Ok(Arc::new(embedder))
}

/// Retriever over the knowledge store, or an empty one when unavailable
///
/// A missing store degrades answers; it never stops the assistant.
pub fn open_knowledge(config: &Config) -> (Arc<dyn Retriever>, Option<DbPool>) {
    let path = config.db_path();
    let pool = match db::open(&path) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "knowledge store unavailable; answering without context");
            return (Arc::new(EmptyRetriever), None);
        }
    };

    if !db::is_provisioned(&pool) {
        tracing::warn!(path = %path.display(), "knowledge store unprovisioned; run `lectern setup`");
    }

    match build_embedder(config) {
        Ok(embedder) => {
            let store = VectorStore::new(pool.clone());
            (Arc::new(KnowledgeRetriever::new(store, embedder)), Some(pool))
        }
        Err(e) => {
            tracing::warn!(error = %e, "embeddings unavailable; answering without context");
            (Arc::new(EmptyRetriever), Some(pool))
        }
    }
}

fn build_generator(config: &Config) -> Result<Arc<dyn ResponseGenerator>> {
    Ok(Arc::new(ChatGenerator::new(&config.llm, config.api_keys.llm())?))
}

fn build_synthesizer(config: &Config) -> Result<Arc<dyn Synthesizer>> {
    let voice = &config.voice;
    let synthesizer = TextToSpeech::new(
        voice,
        config.api_keys.tts(voice.tts_provider),
        config.audio.playback_sample_rate,
        config.audio.playback_frame_samples(),
    )?;
    Ok(Arc::new(synthesizer))
}

/// Real provider adapters for a speech loop
///
/// # Errors
///
/// Returns error if a required API key is missing
pub fn build_providers(
    config: &Config,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn ResponseGenerator>,
) -> Result<Providers> {
    let voice = &config.voice;

    let transcriber = SpeechToText::new(
        voice.stt_provider,
        config.api_keys.stt(voice.stt_provider),
        &voice.stt_model,
    )?;
    let synthesizer = build_synthesizer(config)?;

    tracing::info!(
        stt = ?voice.stt_provider,
        tts = ?voice.tts_provider,
        llm = %config.llm.model,
        "providers configured"
    );

    Ok(Providers {
        transcriber: Arc::new(transcriber),
        retriever,
        generator,
        synthesizer,
    })
}
