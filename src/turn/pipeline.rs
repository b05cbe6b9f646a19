//! Per-turn provider pipeline
//!
//! Runs transcription, retrieval, generation and synthesis for one utterance
//! and reports progress to the controller as [`StageEvent`]s. The task never
//! touches turn status or audio output itself.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use super::cancel::{CallHandle, with_deadline};
use crate::agent::{Exchange, GenerationRequest, ResponseGenerator};
use crate::config::Config;
use crate::error::Stage;
use crate::knowledge::{RetrievedChunk, Retriever};
use crate::voice::{Synthesizer, Transcriber, Utterance};
use crate::{Error, Result};

/// Fragments buffered between generation and synthesis
const FRAGMENT_BUFFER: usize = 4;

/// The four provider seams a turn needs
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub retriever: Arc<dyn Retriever>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Deadlines and limits applied by the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub k: usize,
    pub retrieval_timeout: Duration,
    pub stt_deadline: Duration,
    pub llm_deadline: Duration,
    pub tts_deadline: Duration,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            k: config.retrieval.k,
            retrieval_timeout: config.retrieval.timeout,
            stt_deadline: config.turn.stt_deadline,
            llm_deadline: config.turn.llm_deadline,
            tts_deadline: config.turn.tts_deadline,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Progress reported by a pipeline task
#[derive(Debug)]
pub struct StageEvent {
    pub turn_id: u64,
    pub kind: StageEventKind,
}

#[derive(Debug)]
pub enum StageEventKind {
    Transcribed(String),
    /// Retrieval finished; empty on miss, failure or timeout
    Retrieved(Vec<RetrievedChunk>),
    /// A response fragment was produced
    Fragment(String),
    /// Synthesized samples ready for playback
    Audio(Vec<f32>),
    /// Generation and synthesis both ran to the end
    Finished,
    Failed(Error),
}

/// One turn's provider work
pub struct TurnPipeline {
    turn_id: u64,
    providers: Providers,
    config: PipelineConfig,
    events: mpsc::UnboundedSender<StageEvent>,
}

impl TurnPipeline {
    #[must_use]
    pub fn new(
        turn_id: u64,
        providers: Providers,
        config: PipelineConfig,
        events: mpsc::UnboundedSender<StageEvent>,
    ) -> Self {
        Self {
            turn_id,
            providers,
            config,
            events,
        }
    }

    /// Run until finished, failed or cancelled
    ///
    /// Cancellation drops whatever provider call is in flight.
    pub async fn run(self, utterance: Utterance, history: Vec<Exchange>, handle: CallHandle) {
        let token = handle.token();
        let turn_id = self.turn_id;

        tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::debug!(turn_id, "turn pipeline cancelled");
            }
            result = self.drive(utterance, history) => {
                let kind = match result {
                    Ok(()) => StageEventKind::Finished,
                    Err(e) => StageEventKind::Failed(e),
                };
                if !handle.is_cancelled() {
                    self.emit(kind);
                }
            }
        }
    }

    async fn drive(&self, utterance: Utterance, history: Vec<Exchange>) -> Result<()> {
        let transcript = with_deadline(
            Stage::Transcription,
            self.config.stt_deadline,
            self.providers.transcriber.transcribe(&utterance),
        )
        .await?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(Error::EmptyInput);
        }

        tracing::info!(turn_id = self.turn_id, transcript = %transcript, "transcribed");
        self.emit(StageEventKind::Transcribed(transcript.clone()));

        let context = self.retrieve(&transcript).await;
        self.emit(StageEventKind::Retrieved(context.clone()));

        let request = GenerationRequest {
            transcript,
            context,
            history,
            role: None,
        };
        self.respond(request).await
    }

    async fn retrieve(&self, transcript: &str) -> Vec<RetrievedChunk> {
        let lookup = self.providers.retriever.retrieve(transcript, self.config.k);
        if let Ok(chunks) = tokio::time::timeout(self.config.retrieval_timeout, lookup).await {
            tracing::debug!(turn_id = self.turn_id, hits = chunks.len(), "retrieved context");
            chunks
        } else {
            tracing::warn!(
                turn_id = self.turn_id,
                timeout_ms = self.config.retrieval_timeout.as_millis(),
                "retrieval timed out; answering without context"
            );
            Vec::new()
        }
    }

    /// Generate and synthesize concurrently, fragment by fragment
    async fn respond(&self, request: GenerationRequest) -> Result<()> {
        let (tx, rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        tokio::try_join!(self.generate(request, tx), self.synthesize(rx))?;
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest, tx: mpsc::Sender<String>) -> Result<()> {
        let deadline = self.config.llm_deadline;
        let mut stream = with_deadline(
            Stage::Generation,
            deadline,
            self.providers.generator.generate(request),
        )
        .await?;

        let mut produced = 0usize;
        loop {
            let next = tokio::time::timeout(deadline, stream.next())
                .await
                .map_err(|_| Error::Timeout(Stage::Generation))?;
            let Some(fragment) = next else {
                break;
            };
            let fragment = fragment?;
            if fragment.trim().is_empty() {
                continue;
            }

            produced += 1;
            self.emit(StageEventKind::Fragment(fragment.clone()));
            if tx.send(fragment).await.is_err() {
                // Synthesis side already failed; its error wins
                return Ok(());
            }
        }

        if produced == 0 {
            return Err(Error::Llm("empty response".to_string()));
        }
        Ok(())
    }

    async fn synthesize(&self, mut rx: mpsc::Receiver<String>) -> Result<()> {
        let deadline = self.config.tts_deadline;

        while let Some(fragment) = rx.recv().await {
            let mut audio = with_deadline(
                Stage::Synthesis,
                deadline,
                self.providers.synthesizer.synthesize(fragment.trim()),
            )
            .await?;

            loop {
                let next = tokio::time::timeout(deadline, audio.next())
                    .await
                    .map_err(|_| Error::Timeout(Stage::Synthesis))?;
                let Some(block) = next else {
                    break;
                };
                let block = block?;
                if !block.is_empty() {
                    self.emit(StageEventKind::Audio(block));
                }
            }
        }
        Ok(())
    }

    fn emit(&self, kind: StageEventKind) {
        // Controller gone means shutdown
        let _ = self.events.send(StageEvent {
            turn_id: self.turn_id,
            kind,
        });
    }
}
