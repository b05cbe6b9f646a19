//! Coalesces streamed token deltas into speakable fragments

/// Fragments shorter than this keep accumulating past a sentence boundary
pub const DEFAULT_MIN_CHARS: usize = 12;

/// Buffers deltas and releases complete sentences
///
/// Concatenating every released fragment reproduces the streamed text,
/// minus leading whitespace before the first fragment and trailing
/// whitespace after the last. Whitespace between sentences stays at the
/// start of the following fragment.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
    min_chars: usize,
    started: bool,
}

impl SentenceChunker {
    #[must_use]
    pub const fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
            started: false,
        }
    }

    /// Append a delta and return any fragments it completed
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        if self.started {
            self.buffer.push_str(delta);
        } else {
            self.buffer.push_str(delta.trim_start());
            self.started = !self.buffer.is_empty();
        }

        let mut fragments = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buffer.split_off(end);
            let fragment = std::mem::replace(&mut self.buffer, rest);
            fragments.push(fragment);
        }
        fragments
    }

    /// Flush whatever remains
    #[must_use]
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end();
        (!rest.trim_start().is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first boundary that yields a long enough fragment
    ///
    /// A boundary is a newline, or `.`/`!`/`?` (plus closing quotes or
    /// brackets) followed by whitespace. Terminators at the very end of the
    /// buffer wait for more input, since the next delta may continue the token.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            let is_boundary = match c {
                '\n' => true,
                '.' | '!' | '?' => {
                    // Swallow trailing closers like `."` or `?)`
                    while let Some(&(_, next)) = chars.peek() {
                        if matches!(next, '"' | '\'' | ')' | ']' | '”' | '’') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    chars.peek().is_some_and(|&(_, next)| next.is_whitespace())
                }
                _ => false,
            };

            if !is_boundary {
                continue;
            }

            let end = chars.peek().map_or(self.buffer.len(), |&(j, _)| j);
            if self.buffer[..end].trim().chars().count() >= self.min_chars {
                return Some(end);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_sentence_end() {
        let mut chunker = SentenceChunker::new(1);
        let mut out = chunker.push("Refunds are issued within 30 days. You need");
        out.extend(chunker.push(" a receipt."));
        assert_eq!(out, vec!["Refunds are issued within 30 days."]);
        assert_eq!(chunker.finish().as_deref(), Some(" You need a receipt."));
    }

    #[test]
    fn test_decimal_not_boundary() {
        let mut chunker = SentenceChunker::new(1);
        let out = chunker.push("The fee is 3.5 percent of the total. ");
        assert_eq!(out, vec!["The fee is 3.5 percent of the total."]);
    }

    #[test]
    fn test_token_split_across_deltas() {
        let mut chunker = SentenceChunker::new(1);
        assert!(chunker.push("Version 2.").is_empty());
        let out = chunker.push("1 is out. ");
        assert_eq!(out, vec!["Version 2.1 is out."]);
    }

    #[test]
    fn test_short_fragments_merge() {
        let mut chunker = SentenceChunker::new(DEFAULT_MIN_CHARS);
        let out = chunker.push("Yes. You can return it. ");
        assert_eq!(out, vec!["Yes. You can return it."]);
    }

    #[test]
    fn test_concatenation_keeps_spacing() {
        let text = "\n  Refunds are issued within 30 days.  Bring your receipt!\nThanks.\n";
        let mut chunker = SentenceChunker::new(1);
        let mut out = Vec::new();
        for delta in text.as_bytes().chunks(5) {
            out.extend(chunker.push(std::str::from_utf8(delta).unwrap()));
        }
        out.extend(chunker.finish());

        assert!(out.len() > 1);
        assert_eq!(out.concat(), text.trim());
    }

    #[test]
    fn test_whitespace_only_input() {
        let mut chunker = SentenceChunker::new(1);
        assert!(chunker.push("  \n ").is_empty());
        assert!(chunker.finish().is_none());
    }

    #[test]
    fn test_quote_closer() {
        let mut chunker = SentenceChunker::new(1);
        let out = chunker.push("She said \"done.\" Then left.\n");
        assert_eq!(out, vec!["She said \"done.\"", " Then left.\n"]);
    }
}
