//! In-memory conversation history

use std::collections::VecDeque;

use crate::agent::Exchange;

/// Ring of the most recent exchanges; never persisted
#[derive(Debug)]
pub struct ConversationContext {
    exchanges: VecDeque<Exchange>,
    max: usize,
}

impl ConversationContext {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            exchanges: VecDeque::with_capacity(max),
            max,
        }
    }

    /// Record an exchange, evicting the oldest beyond capacity
    pub fn push(&mut self, user: &str, assistant: &str) {
        if self.max == 0 || user.trim().is_empty() {
            return;
        }
        if self.exchanges.len() == self.max {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(Exchange {
            user: user.to_string(),
            assistant: assistant.to_string(),
        });
    }

    /// Copy of the history, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<Exchange> {
        self.exchanges.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let mut context = ConversationContext::new(2);
        context.push("one", "1");
        context.push("two", "2");
        context.push("three", "");

        let history = context.snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user, "two");
        assert_eq!(history[1].assistant, "");
    }

    #[test]
    fn test_disabled() {
        let mut context = ConversationContext::new(0);
        context.push("one", "1");
        assert!(context.is_empty());
    }
}
