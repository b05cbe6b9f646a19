//! Shared test utilities: fake providers, a recording audio sink and a
//! controller harness

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lectern::agent::{FragmentStream, GenerationRequest, ResponseGenerator};
use lectern::knowledge::{RetrievedChunk, Retriever};
use lectern::turn::{Providers, TurnConfig, TurnController, TurnStatus, TurnTransition};
use lectern::voice::{AudioEvent, AudioFrame, AudioOutput, AudioStream, Synthesizer, Transcriber, Utterance};
use lectern::{Error, Result, SessionPublisher, SessionState};

/// Samples per 30 ms frame at 16 kHz
pub const FRAME_SAMPLES: usize = 480;

// --- Providers ---

/// Replies with queued transcripts; the last one repeats
pub struct FakeTranscriber {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl FakeTranscriber {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _utterance: &Utterance) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = if self.fail {
            Err(Error::Stt("transcriber unavailable".to_string()))
        } else {
            let mut last = self.last.lock().unwrap();
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                last.clone_from(&reply);
            }
            Ok(last.clone())
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        reply
    }
}

/// Returns fixed chunks, optionally after a delay
pub struct FakeRetriever {
    chunks: Vec<RetrievedChunk>,
    delay: Duration,
    queries: Mutex<Vec<String>>,
}

impl FakeRetriever {
    pub fn new(chunks: Vec<RetrievedChunk>) -> Self {
        Self {
            chunks,
            delay: Duration::ZERO,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Never answers within any sane timeout
    pub fn hanging() -> Self {
        Self {
            delay: Duration::from_secs(3600),
            ..Self::new(vec![chunk(1, "unreachable", "never.md", 1.0)])
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Retriever for FakeRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        self.queries.lock().unwrap().push(query.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.chunks.iter().take(k).cloned().collect()
    }
}

/// Streams fixed fragments and records every request
pub struct FakeGenerator {
    fragments: Vec<String>,
    delay: Duration,
    fail_after: Option<usize>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(ToString::to_string).collect(),
            delay: Duration::ZERO,
            fail_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before each fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Emit `n` fragments, then a stream error
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for FakeGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream> {
        self.requests.lock().unwrap().push(request);

        let fragments = self.fragments.clone();
        let delay = self.delay;
        let fail_after = self.fail_after;

        let stream = futures::stream::unfold(0usize, move |i| {
            let fragments = fragments.clone();
            async move {
                if fail_after == Some(i) {
                    return Some((Err(Error::Llm("stream reset".to_string())), usize::MAX));
                }
                let fragment = fragments.get(i)?.clone();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(fragment), i + 1))
            }
        });
        Ok(stream.boxed())
    }
}

/// One block per fragment, as long as the fragment's text
pub struct FakeSynthesizer {
    texts: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.texts.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("voice unavailable".to_string()));
        }
        let block = vec![0.25_f32; text.len()];
        Ok(futures::stream::iter(vec![Ok(block)]).boxed())
    }
}

// --- Audio output ---

/// Records enqueued blocks; while holding, queued samples stay pending
#[derive(Default)]
pub struct RecordingOutput {
    blocks: Mutex<Vec<Vec<f32>>>,
    pending: AtomicUsize,
    hold: AtomicBool,
    cancels: AtomicUsize,
}

impl RecordingOutput {
    /// Plays instantly: nothing is ever pending
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keeps audio pending until [`Self::release`]
    pub fn holding() -> Arc<Self> {
        let output = Self::default();
        output.hold.store(true, Ordering::SeqCst);
        Arc::new(output)
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.pending.store(0, Ordering::SeqCst);
    }

    pub fn blocks(&self) -> Vec<Vec<f32>> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn block_lengths(&self) -> Vec<usize> {
        self.blocks().iter().map(Vec::len).collect()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl AudioOutput for RecordingOutput {
    fn enqueue(&self, samples: &[f32]) -> Result<()> {
        self.blocks.lock().unwrap().push(samples.to_vec());
        if self.hold.load(Ordering::SeqCst) {
            self.pending.fetch_add(samples.len(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn cancel(&self) {
        self.pending.store(0, Ordering::SeqCst);
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

// --- Builders ---

pub fn chunk(id: i64, text: &str, source: &str, score: f32) -> RetrievedChunk {
    RetrievedChunk {
        id,
        text: text.to_string(),
        source: source.to_string(),
        score,
    }
}

pub fn providers(
    transcriber: &Arc<FakeTranscriber>,
    retriever: &Arc<FakeRetriever>,
    generator: &Arc<FakeGenerator>,
    synthesizer: &Arc<FakeSynthesizer>,
) -> Providers {
    Providers {
        transcriber: transcriber.clone(),
        retriever: retriever.clone(),
        generator: generator.clone(),
        synthesizer: synthesizer.clone(),
    }
}

/// Frame with every sample at `amplitude` (RMS equals amplitude)
pub fn frame(sequence: u64, amplitude: f32) -> AudioFrame {
    AudioFrame::new(sequence, vec![amplitude; FRAME_SAMPLES])
}

/// Speech start, `frames` loud frames and speech end, starting at `first`
pub fn utterance_events(first: u64, frames: u64, amplitude: f32) -> Vec<AudioEvent> {
    let mut events = vec![AudioEvent::SpeechStart { sequence: first }];
    events.extend((first..first + frames).map(|seq| AudioEvent::Frame(frame(seq, amplitude))));
    events.push(AudioEvent::SpeechEnd {
        sequence: first + frames - 1,
    });
    events
}

// --- Controller harness ---

pub struct Harness {
    pub audio: mpsc::Sender<AudioEvent>,
    pub transitions: broadcast::Receiver<TurnTransition>,
    pub session: watch::Receiver<Arc<SessionState>>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<()>>,
    /// Every transition observed so far
    pub seen: Vec<TurnTransition>,
}

impl Harness {
    pub fn start(config: TurnConfig, providers: Providers, output: Arc<RecordingOutput>) -> Self {
        Self::start_with_apology(config, providers, output, None)
    }

    pub fn start_with_apology(
        config: TurnConfig,
        providers: Providers,
        output: Arc<RecordingOutput>,
        apology: Option<Vec<f32>>,
    ) -> Self {
        let publisher = SessionPublisher::new();
        let session = publisher.subscribe();

        let mut controller = TurnController::new(config, providers, output, publisher);
        if let Some(clip) = apology {
            controller = controller.with_apology_clip(clip);
        }
        let transitions = controller.subscribe();

        let (audio, audio_rx) = mpsc::channel(1024);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(audio_rx, shutdown.clone()));

        Self {
            audio,
            transitions,
            session,
            shutdown,
            task,
            seen: Vec::new(),
        }
    }

    pub async fn send(&self, events: Vec<AudioEvent>) {
        for event in events {
            self.audio.send(event).await.expect("controller stopped");
        }
    }

    /// Collect transitions until one matches `turn_id` and `to`
    pub async fn wait_for(&mut self, turn_id: u64, to: TurnStatus) {
        let transitions = &mut self.transitions;
        let seen = &mut self.seen;
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let transition = transitions.recv().await.expect("transition channel closed");
                let done = transition.turn_id == turn_id && transition.to == to;
                seen.push(transition);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for turn {turn_id} -> {to}; saw {:?}", self.seen));
    }

    /// Collect transitions already emitted, without waiting
    pub fn drain(&mut self) {
        while let Ok(transition) = self.transitions.try_recv() {
            self.seen.push(transition);
        }
    }

    /// Target statuses seen for one turn, in order
    pub fn path(&self, turn_id: u64) -> Vec<TurnStatus> {
        self.seen
            .iter()
            .filter(|t| t.turn_id == turn_id)
            .map(|t| t.to)
            .collect()
    }

    pub fn snapshot(&self) -> Arc<SessionState> {
        self.session.borrow().clone()
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.expect("controller panicked")
    }
}

/// At most one turn is active at any point in `transitions`
pub fn assert_single_active(transitions: &[TurnTransition]) {
    let mut active = HashSet::new();
    for t in transitions {
        if t.to.is_active() {
            active.insert(t.turn_id);
        } else {
            active.remove(&t.turn_id);
        }
        assert!(
            active.len() <= 1,
            "more than one active turn after {t:?}: {active:?}"
        );
    }
}
