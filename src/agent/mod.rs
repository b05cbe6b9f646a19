//! Response generation
//!
//! - **generator**: Streaming chat completion adapter
//! - **sentences**: Coalesce token deltas into speakable fragments

mod generator;
mod sentences;

pub use generator::{
    ChatGenerator, Exchange, FragmentStream, GenerationRequest, ResponseGenerator,
    fragment_stream,
};
pub use sentences::{DEFAULT_MIN_CHARS, SentenceChunker};
