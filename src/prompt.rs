//! Prompt assembly for grounded responses

use serde::Serialize;

use crate::agent::{Exchange, GenerationRequest};
use crate::knowledge::{DEFAULT_CONTEXT_TOKENS, format_context};

/// Apology shown (and spoken, when pre-synthesized) after a provider failure
pub const APOLOGY: &str = "Sorry, I ran into a problem answering that. Please try again.";

/// Chat role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Build the system prompt with the asker's role and retrieved context appended
#[must_use]
pub fn build_system_prompt(base: &str, request: &GenerationRequest) -> String {
    let mut prompt = base.to_string();
    if let Some(role) = request.role.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        prompt.push_str(&format!("\n\nThe person asking is a {role}."));
    }

    let context = format_context(&request.context, DEFAULT_CONTEXT_TOKENS);
    if context.is_empty() {
        prompt.push_str("\n\nNo reference material was found for this question.");
    } else {
        prompt.push_str(&format!("\n\nContext:\n{context}"));
    }
    prompt
}

/// Build the full message list: system, prior exchanges, then the question
#[must_use]
pub fn build_messages(base: &str, request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);
    messages.push(ChatMessage::new(Role::System, build_system_prompt(base, request)));

    for Exchange { user, assistant } in &request.history {
        messages.push(ChatMessage::new(Role::User, user.as_str()));
        if !assistant.is_empty() {
            messages.push(ChatMessage::new(Role::Assistant, assistant.as_str()));
        }
    }

    messages.push(ChatMessage::new(Role::User, request.transcript.as_str()));
    messages
}
