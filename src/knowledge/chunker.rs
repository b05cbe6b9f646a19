//! Recursive character splitter for ingestion

/// Default maximum chunk length in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between neighbouring chunks in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;

/// Separators tried in order, coarsest first
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

/// Splits text on the coarsest separator that yields pieces no longer than
/// `chunk_size`, recursing into finer separators for oversized pieces, then
/// merges neighbouring pieces back up to `chunk_size` with `overlap`.
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl TextSplitter {
    /// Create a splitter; overlap is capped below the chunk size
    #[must_use]
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    /// Split `text` into chunks
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect()
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let finer = separators.get(position + 1..).unwrap_or(&[]);

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<String> = Vec::new();

        for piece in pieces {
            if char_len(&piece) <= self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }

            if finer.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_with(&piece, finer));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }

        chunks
    }

    /// Greedily join pieces up to `chunk_size`, carrying a tail of up to
    /// `overlap` characters into the next chunk
    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };

            if total + len + joiner > self.chunk_size && !current.is_empty() {
                push_joined(&mut docs, &current, separator);

                while total > self.overlap
                    || (total > 0
                        && total + len + if current.is_empty() { 0 } else { sep_len }
                            > self.chunk_size)
                {
                    let Some(first) = current.pop_front() else {
                        break;
                    };
                    total -= char_len(first) + if current.is_empty() { 0 } else { sep_len };
                }
            }

            let joiner = if current.is_empty() { 0 } else { sep_len };
            current.push_back(piece);
            total += len + joiner;
        }

        if !current.is_empty() {
            push_joined(&mut docs, &current, separator);
        }

        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &std::collections::VecDeque<&str>, separator: &str) {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
