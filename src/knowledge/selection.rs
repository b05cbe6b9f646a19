//! Context formatting for prompt injection

use std::fmt::Write;

use super::RetrievedChunk;

/// Default token budget for injected context
pub const DEFAULT_CONTEXT_TOKENS: usize = 1500;

/// Format retrieved chunks for prompt injection, trimmed to `max_tokens`
///
/// Chunks keep their retrieval order. The first chunk is always kept even if
/// it alone exceeds the budget.
#[must_use]
pub fn format_context(chunks: &[RetrievedChunk], max_tokens: usize) -> String {
    let kept = trim_to_budget(chunks, max_tokens);
    if kept.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for (i, chunk) in kept.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(out, "[{}] ({})\n{}", i + 1, chunk.source, chunk.text.trim());
    }
    out
}

/// Keep the longest prefix of `chunks` that fits within a token budget
fn trim_to_budget(chunks: &[RetrievedChunk], max_tokens: usize) -> &[RetrievedChunk] {
    let mut total_tokens = 0;
    let mut keep = 0;

    for chunk in chunks {
        total_tokens += estimate_tokens(&chunk.text) + estimate_tokens(&chunk.source);

        if total_tokens > max_tokens && keep > 0 {
            break;
        }
        keep += 1;
    }

    &chunks[..keep]
}

/// Rough token estimation (4 chars per token)
#[must_use]
pub const fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}
