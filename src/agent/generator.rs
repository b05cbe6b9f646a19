//! Streaming response generation over an OpenAI-compatible chat API

use std::collections::VecDeque;
use std::fmt::Display;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use super::sentences::{DEFAULT_MIN_CHARS, SentenceChunker};
use crate::config::LlmConfig;
use crate::knowledge::RetrievedChunk;
use crate::prompt::build_messages;
use crate::{Error, Result};

/// Response text as ordered, speakable fragments
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// A prior user/assistant exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    /// Text actually produced; partial if the turn was interrupted
    pub assistant: String,
}

/// Everything needed to answer one question
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub transcript: String,
    pub context: Vec<RetrievedChunk>,
    pub history: Vec<Exchange>,
    /// Who is asking (e.g. "student"), when the caller says
    pub role: Option<String>,
}

/// Produces a response as a stream of fragments
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Start generating
    ///
    /// # Errors
    ///
    /// Returns a provider error if the request is rejected
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream>;
}

/// Generator for `/chat/completions` with `stream: true`
///
/// Works with `OpenAI` and any server exposing the same API (e.g. Ollama's `/v1`).
pub struct ChatGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_tokens: u32,
    system_prompt: String,
}

impl ChatGenerator {
    /// Create a generator
    ///
    /// # Errors
    ///
    /// Returns error if the hosted `OpenAI` endpoint is used without an API key
    pub fn new(config: &LlmConfig, api_key: Option<&SecretString>) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.expose_secret().is_empty())
            .map(|k| SecretString::from(k.expose_secret().to_string()));

        if api_key.is_none() && config.base_url.contains("api.openai.com") {
            return Err(Error::Config(
                "OpenAI API key required for chat completions".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        })
    }
}

#[async_trait]
impl ResponseGenerator for ChatGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream> {
        let messages = build_messages(&self.system_prompt, &request);

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });

        tracing::debug!(
            model = %self.model,
            context_chunks = request.context.len(),
            history = request.history.len(),
            "starting chat completion"
        );

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat completion error");
            return Err(Error::Llm(format!("API error {status}: {body}")));
        }

        Ok(fragment_stream(response.bytes_stream()))
    }
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, serde::Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

struct SseState<E> {
    body: BoxStream<'static, std::result::Result<Vec<u8>, E>>,
    buffer: Vec<u8>,
    chunker: SentenceChunker,
    ready: VecDeque<String>,
    finished: bool,
}

impl<E> SseState<E> {
    /// Consume every complete line in the buffer
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            // SSE format: "data: {...}" or "data: [DONE]"
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.finish();
                return;
            }

            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    let content = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default();
                    if !content.is_empty() {
                        self.ready.extend(self.chunker.push(&content));
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, data, "skipping unparseable stream chunk");
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Some(rest) = self.chunker.finish() {
            self.ready.push_back(rest);
        }
        self.buffer.clear();
        self.finished = true;
    }
}

/// Turn a server-sent-events byte stream into sentence fragments
///
/// Dropping the returned stream drops `body`, which closes the connection.
pub fn fragment_stream<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display + Send + 'static,
{
    let state = SseState {
        body: body.map(|r| r.map(|b| b.as_ref().to_vec())).boxed(),
        buffer: Vec::new(),
        chunker: SentenceChunker::new(DEFAULT_MIN_CHARS),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(fragment) = st.ready.pop_front() {
                return Some((Ok(fragment), st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(&bytes);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(Error::Llm(format!("stream error: {e}"))), st));
                }
                None => {
                    // Servers may close without a trailing newline or [DONE]
                    st.buffer.push(b'\n');
                    st.drain_lines();
                    st.finish();
                }
            }
        }
    })
    .boxed()
}
