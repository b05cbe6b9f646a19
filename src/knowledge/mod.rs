//! Knowledge base: ingestion, retrieval and context formatting
//!
//! - **chunker**: Split documents into overlapping chunks
//! - **ingest**: Embed chunks and write them to the vector store
//! - **retriever**: Find the chunks nearest a query
//! - **selection**: Format retrieved chunks for the prompt

pub mod chunker;
pub mod ingest;
mod retriever;
mod selection;

pub use chunker::TextSplitter;
pub use ingest::{IngestReport, Ingestor, collect_documents};
pub use retriever::{EmptyRetriever, KnowledgeRetriever, RetrievedChunk, Retriever};
pub use selection::{DEFAULT_CONTEXT_TOKENS, estimate_tokens, format_context};
