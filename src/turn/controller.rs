//! Turn controller
//!
//! Owns the turn lifecycle. One select loop consumes audio events from
//! capture and stage events from the running pipeline task; it is the only
//! writer of turn status and the only caller of [`AudioOutput`]. Provider
//! work always happens in the spawned pipeline, never in this loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::cancel::CallHandle;
use super::context::ConversationContext;
use super::pipeline::{PipelineConfig, Providers, StageEvent, StageEventKind, TurnPipeline};
use super::state::{TurnStatus, TurnTransition};
use crate::config::Config;
use crate::error::{ErrorKind, Stage};
use crate::knowledge::RetrievedChunk;
use crate::prompt::APOLOGY;
use crate::session::{SessionPublisher, SourceRef};
use crate::voice::{AudioEvent, AudioFrame, AudioOutput, UtteranceBuilder};
use crate::{Error, Result};

const TRANSITION_CAPACITY: usize = 64;

/// Timing and limits for the controller
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub sample_rate: u32,
    /// Utterances without any frame above this energy never reach STT
    pub vad_threshold: f32,
    pub max_utterance: Duration,
    pub interrupt_grace: Duration,
    pub max_history: usize,
    /// How often playback drain is checked
    pub drain_tick: Duration,
    /// How often the session timestamp is refreshed
    pub heartbeat: Duration,
    pub pipeline: PipelineConfig,
}

impl TurnConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            vad_threshold: config.audio.vad_threshold,
            max_utterance: config.turn.max_utterance,
            interrupt_grace: config.turn.interrupt_grace,
            max_history: config.turn.max_history,
            drain_tick: config.audio.frame_duration(),
            heartbeat: config.turn.heartbeat,
            pipeline: PipelineConfig::from_config(config),
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The single turn the controller tracks
struct Turn {
    id: u64,
    status: TurnStatus,
    /// Set once a terminal turn has returned the session to idle
    closed: bool,
    builder: Option<UtteranceBuilder>,
    transcript: Option<String>,
    sources: Vec<SourceRef>,
    response: String,
    generation_done: bool,
    handle: Option<CallHandle>,
    task: Option<JoinHandle<()>>,
}

impl Turn {
    fn new(id: u64, sample_rate: u32) -> Self {
        Self {
            id,
            status: TurnStatus::Listening,
            closed: false,
            builder: Some(UtteranceBuilder::new(sample_rate)),
            transcript: None,
            sources: Vec::new(),
            response: String::new(),
            generation_done: false,
            handle: None,
            task: None,
        }
    }

    fn is_active(&self) -> bool {
        !self.closed && self.status.is_active()
    }

    fn reported_status(&self) -> TurnStatus {
        if self.closed {
            TurnStatus::Idle
        } else {
            self.status
        }
    }
}

/// Drives turns from speech start to completion
pub struct TurnController {
    config: TurnConfig,
    providers: Providers,
    output: Arc<dyn AudioOutput>,
    publisher: SessionPublisher,
    context: ConversationContext,
    next_turn_id: u64,
    current: Option<Turn>,
    stage_tx: mpsc::UnboundedSender<StageEvent>,
    stage_rx: Option<mpsc::UnboundedReceiver<StageEvent>>,
    transitions: broadcast::Sender<TurnTransition>,
    apology_clip: Option<Arc<Vec<f32>>>,
}

impl TurnController {
    #[must_use]
    pub fn new(
        config: TurnConfig,
        providers: Providers,
        output: Arc<dyn AudioOutput>,
        publisher: SessionPublisher,
    ) -> Self {
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let context = ConversationContext::new(config.max_history);

        Self {
            config,
            providers,
            output,
            publisher,
            context,
            next_turn_id: 1,
            current: None,
            stage_tx,
            stage_rx: Some(stage_rx),
            transitions,
            apology_clip: None,
        }
    }

    /// Use a pre-synthesized clip for the spoken apology
    #[must_use]
    pub fn with_apology_clip(mut self, samples: Vec<f32>) -> Self {
        self.apology_clip = (!samples.is_empty()).then(|| Arc::new(samples));
        self
    }

    /// Synthesize the apology clip up front so failures can be voiced
    /// without another provider call
    pub async fn prepare_apology(&mut self) {
        let deadline = self.config.pipeline.tts_deadline;
        let synthesizer = self.providers.synthesizer.clone();

        let synthesis = async move {
            let mut stream = synthesizer.synthesize(APOLOGY).await?;
            let mut samples = Vec::new();
            while let Some(block) = stream.next().await {
                samples.extend(block?);
            }
            Ok::<_, Error>(samples)
        };

        match tokio::time::timeout(deadline, synthesis).await {
            Ok(Ok(samples)) if !samples.is_empty() => {
                tracing::debug!(samples = samples.len(), "apology clip ready");
                self.apology_clip = Some(Arc::new(samples));
            }
            Ok(Ok(_)) => tracing::warn!("apology synthesis returned no audio"),
            Ok(Err(e)) => tracing::warn!(error = %e, "apology synthesis failed"),
            Err(_) => tracing::warn!(stage = %Stage::Synthesis, "apology synthesis timed out"),
        }
    }

    #[must_use]
    pub fn has_apology_clip(&self) -> bool {
        self.apology_clip.is_some()
    }

    /// Subscribe to status transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TurnTransition> {
        self.transitions.subscribe()
    }

    /// Run until shutdown or until capture closes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the audio device is lost or playback fails
    pub async fn run(
        mut self,
        mut audio: mpsc::Receiver<AudioEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let Some(mut stage_rx) = self.stage_rx.take() else {
            return Err(Error::Config("turn controller already ran".to_string()));
        };

        let mut tick = tokio::time::interval(self.config.drain_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("turn controller running");

        let result = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                event = audio.recv() => {
                    let Some(event) = event else {
                        tracing::info!("audio capture closed");
                        break Ok(());
                    };
                    if let Err(e) = self.handle_audio(event) {
                        break Err(e);
                    }
                }
                Some(event) = stage_rx.recv() => {
                    if let Err(e) = self.handle_stage(event) {
                        break Err(e);
                    }
                }
                _ = tick.tick() => self.check_drained(),
                _ = heartbeat.tick() => self.publisher.touch(),
            }
        };

        self.stop();
        result
    }

    fn handle_audio(&mut self, event: AudioEvent) -> Result<()> {
        match event {
            AudioEvent::SpeechStart { sequence } => {
                tracing::debug!(sequence, "speech start");
                self.on_speech_start();
            }
            AudioEvent::Frame(frame) => self.on_frame(&frame),
            AudioEvent::SpeechEnd { sequence } => {
                tracing::debug!(sequence, "speech end");
                self.on_speech_end();
            }
            AudioEvent::DeviceLost(message) => {
                tracing::error!(error = %message, "audio device lost");
                return Err(Error::Device(message));
            }
        }
        Ok(())
    }

    fn on_speech_start(&mut self) {
        let active = self
            .current
            .as_ref()
            .filter(|t| t.is_active())
            .map(|t| (t.id, t.status));

        match active {
            Some((id, TurnStatus::Listening)) => {
                tracing::debug!(turn_id = id, "already listening");
                return;
            }
            Some(_) => self.interrupt(),
            None => {
                // Leftover audio such as an apology clip
                if self.output.pending() > 0 {
                    self.output.cancel();
                }
            }
        }
        self.begin_turn();
    }

    fn begin_turn(&mut self) {
        let id = self.next_turn_id;
        self.next_turn_id += 1;

        self.current = Some(Turn::new(id, self.config.sample_rate));
        self.emit_transition(id, TurnStatus::Idle, TurnStatus::Listening);
        tracing::info!(turn_id = id, "turn started");
        self.publish();
    }

    /// Stop the active turn in favour of new speech
    fn interrupt(&mut self) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };

        if let Some(handle) = &turn.handle {
            handle.cancel();
        }
        self.output.cancel();

        if let Some(task) = turn.task.take() {
            let grace = self.config.interrupt_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if !task.is_finished() {
                    tracing::warn!("turn task outlived interrupt grace; aborting");
                    task.abort();
                }
            });
        }

        if let Some(transcript) = &turn.transcript {
            self.context.push(transcript, &turn.response);
        }

        let (id, from) = (turn.id, turn.status);
        turn.status = TurnStatus::Interrupted;
        tracing::info!(turn_id = id, from = %from, "turn interrupted");
        self.emit_transition(id, from, TurnStatus::Interrupted);
        self.publisher.publish(|s| s.last_outcome = Some(TurnStatus::Interrupted));
        self.publish();
    }

    fn on_frame(&mut self, frame: &AudioFrame) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        if !turn.is_active() || turn.status != TurnStatus::Listening {
            return;
        }
        let Some(builder) = turn.builder.as_mut() else {
            return;
        };

        if let Err(e) = builder.push(frame) {
            tracing::warn!(turn_id = turn.id, error = %e, "dropping frame");
            return;
        }

        if builder.duration() >= self.config.max_utterance {
            tracing::info!(turn_id = turn.id, "max utterance length reached");
            self.dispatch();
        }
    }

    fn on_speech_end(&mut self) {
        if self
            .current
            .as_ref()
            .is_some_and(|t| t.is_active() && t.status == TurnStatus::Listening)
        {
            self.dispatch();
        }
    }

    /// Hand the finished utterance to a pipeline task
    fn dispatch(&mut self) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        let Some(builder) = turn.builder.take() else {
            return;
        };
        let id = turn.id;
        let utterance = builder.finish();

        if utterance.is_empty() || !utterance.has_speech(self.config.vad_threshold) {
            tracing::debug!(turn_id = id, frames = utterance.frame_count(), "utterance has no speech");
            self.drop_turn();
            return;
        }

        tracing::debug!(
            turn_id = id,
            duration_ms = utterance.duration().as_millis(),
            "utterance captured"
        );

        let handle = CallHandle::new();
        let pipeline = TurnPipeline::new(
            id,
            self.providers.clone(),
            self.config.pipeline.clone(),
            self.stage_tx.clone(),
        );
        let history = self.context.snapshot();
        let task = tokio::spawn(pipeline.run(utterance, history, handle.clone()));

        turn.handle = Some(handle);
        turn.task = Some(task);
        self.set_status(TurnStatus::Transcribing);
    }

    fn handle_stage(&mut self, event: StageEvent) -> Result<()> {
        let Some(turn) = self.current.as_mut() else {
            return Ok(());
        };
        if event.turn_id != turn.id || !turn.is_active() {
            tracing::debug!(turn_id = event.turn_id, "discarding stale stage event");
            return Ok(());
        }

        match event.kind {
            StageEventKind::Transcribed(transcript) => {
                turn.transcript = Some(transcript);
                self.set_status(TurnStatus::Retrieving);
            }
            StageEventKind::Retrieved(chunks) => {
                turn.sources = sources(&chunks);
                self.set_status(TurnStatus::Generating);
            }
            StageEventKind::Fragment(text) => {
                turn.response.push_str(&text);
                if turn.status == TurnStatus::Generating {
                    self.set_status(TurnStatus::Speaking);
                } else {
                    self.publish();
                }
            }
            StageEventKind::Audio(samples) => {
                if let Err(e) = self.output.enqueue(&samples) {
                    tracing::error!(error = %e, "playback failed");
                    self.fail_turn(&e);
                    return Err(e);
                }
            }
            StageEventKind::Finished => {
                turn.generation_done = true;
                self.check_drained();
            }
            StageEventKind::Failed(error) => self.fail_turn(&error),
        }
        Ok(())
    }

    /// Complete a spoken turn once its audio has played out
    fn check_drained(&mut self) {
        let ready = self.current.as_ref().is_some_and(|t| {
            t.is_active() && t.status == TurnStatus::Speaking && t.generation_done
        });
        if ready && self.output.pending() == 0 {
            self.finish_turn(TurnStatus::Completed, None);
        }
    }

    fn fail_turn(&mut self, error: &Error) {
        let Some(turn) = self.current.as_ref() else {
            return;
        };

        if error.kind() == ErrorKind::Input {
            tracing::debug!(turn_id = turn.id, error = %error, "turn dropped");
            self.drop_turn();
            return;
        }

        tracing::error!(turn_id = turn.id, status = %turn.status, error = %error, "turn failed");
        self.output.cancel();
        if let Some(clip) = &self.apology_clip
            && let Err(e) = self.output.enqueue(clip)
        {
            tracing::warn!(error = %e, "could not play apology");
        }
        self.finish_turn(TurnStatus::Failed, Some(error.to_string()));
    }

    /// End a turn that never had usable input
    ///
    /// Transitions still pass through `failed`, but the session only returns
    /// to idle; the previous outcome and error stay as they were.
    fn drop_turn(&mut self) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        let (id, from) = (turn.id, turn.status);

        if let Some(handle) = &turn.handle {
            handle.cancel();
        }
        turn.task = None;
        turn.status = TurnStatus::Failed;
        turn.closed = true;

        self.emit_transition(id, from, TurnStatus::Failed);
        self.emit_transition(id, TurnStatus::Failed, TurnStatus::Idle);
        self.publish();
    }

    /// Move the current turn to a terminal status, then back to idle
    fn finish_turn(&mut self, outcome: TurnStatus, error: Option<String>) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        let (id, from) = (turn.id, turn.status);

        if let Some(handle) = &turn.handle {
            handle.cancel();
        }
        turn.task = None;
        turn.status = outcome;

        let apologize = outcome == TurnStatus::Failed && error.is_some();
        if outcome == TurnStatus::Completed
            && let Some(transcript) = &turn.transcript
        {
            self.context.push(transcript, &turn.response);
        }
        if apologize {
            turn.response = APOLOGY.to_string();
        }

        tracing::info!(turn_id = id, outcome = %outcome, "turn finished");
        self.emit_transition(id, from, outcome);
        self.publisher.publish(|s| {
            s.last_outcome = Some(outcome);
            if let Some(message) = error {
                s.last_error = Some(message);
            }
        });
        self.publish();

        if let Some(turn) = self.current.as_mut() {
            turn.closed = true;
        }
        self.emit_transition(id, outcome, TurnStatus::Idle);
        self.publish();
    }

    fn set_status(&mut self, to: TurnStatus) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        let from = turn.status;
        if !from.can_transition(to) {
            tracing::warn!(turn_id = turn.id, from = %from, to = %to, "ignoring illegal transition");
            return;
        }
        turn.status = to;
        let id = turn.id;
        self.emit_transition(id, from, to);
        self.publish();
    }

    fn emit_transition(&self, turn_id: u64, from: TurnStatus, to: TurnStatus) {
        tracing::debug!(turn_id, from = %from, to = %to, "transition");
        // No subscribers is fine
        let _ = self.transitions.send(TurnTransition {
            turn_id,
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Mirror the current turn into the session snapshot
    fn publish(&self) {
        let Some(turn) = self.current.as_ref() else {
            return;
        };
        self.publisher.publish(|s| {
            s.status = turn.reported_status();
            s.turn_id = Some(turn.id);
            s.transcript.clone_from(&turn.transcript);
            s.response.clone_from(&turn.response);
            s.sources.clone_from(&turn.sources);
        });
    }

    fn stop(&mut self) {
        if let Some(turn) = self.current.as_mut() {
            if let Some(handle) = &turn.handle {
                handle.cancel();
            }
            if let Some(task) = turn.task.take() {
                task.abort();
            }
        }
        self.output.cancel();
        self.publisher.publish(|s| s.status = TurnStatus::Idle);
        tracing::info!("turn controller stopped");
    }
}

fn sources(chunks: &[RetrievedChunk]) -> Vec<SourceRef> {
    chunks.iter().map(SourceRef::from).collect()
}
