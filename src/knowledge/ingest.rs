//! Document ingestion into the vector store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::{NewChunk, TextEmbedder, VectorStore};
use crate::{Error, Result};

use super::chunker::TextSplitter;

/// Texts embedded per request
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// File extensions picked up by ingestion
const EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Summary of an ingestion run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Files read
    pub files: usize,
    /// Chunks written
    pub chunks: usize,
    /// Chunks from earlier runs replaced by this one
    pub replaced: usize,
    /// Files skipped as empty or unreadable
    pub skipped: usize,
}

/// Reads documents, splits them and writes embedded chunks
pub struct Ingestor {
    store: VectorStore,
    embedder: Arc<dyn TextEmbedder>,
    splitter: TextSplitter,
    batch_size: usize,
}

impl Ingestor {
    #[must_use]
    pub fn new(store: VectorStore, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            store,
            embedder,
            splitter: TextSplitter::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the splitter
    #[must_use]
    pub const fn with_splitter(mut self, splitter: TextSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    /// Override the embedding batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Ingest every supported file under `dir`
    ///
    /// Re-ingesting a file replaces the chunks it produced before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unprovisioned`] if the store has no schema, or an error
    /// if embedding or writing fails
    pub async fn ingest_dir(&self, dir: &Path) -> Result<IngestReport> {
        // Surface an unprovisioned store before doing any work
        self.store.dimension()?;

        let files = collect_documents(dir)?;
        tracing::info!(dir = %dir.display(), files = files.len(), "ingesting documents");

        let mut report = IngestReport::default();
        for path in files {
            let source = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();

            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    report.skipped += 1;
                    continue;
                }
            };

            let (written, replaced) = self.ingest_text(&source, &text).await?;
            if written == 0 {
                report.skipped += 1;
                continue;
            }

            report.files += 1;
            report.chunks += written;
            report.replaced += replaced;
        }

        tracing::info!(
            files = report.files,
            chunks = report.chunks,
            replaced = report.replaced,
            skipped = report.skipped,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Split, embed and store one document, returning `(written, replaced)`
    ///
    /// # Errors
    ///
    /// Returns error if embedding or writing fails
    pub async fn ingest_text(&self, source: &str, text: &str) -> Result<(usize, usize)> {
        let pieces = self.splitter.split(text);
        if pieces.is_empty() {
            return Ok((0, 0));
        }

        let mut chunks = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(self.batch_size) {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            let embeddings = self.embedder.embed_batch(&refs).await?;
            if embeddings.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                )));
            }

            chunks.extend(batch.iter().zip(embeddings).map(|(text, embedding)| NewChunk {
                text: text.clone(),
                source: source.to_string(),
                embedding,
            }));
        }

        // Embed everything first so a failed run leaves old chunks intact
        let replaced = self.store.delete_source(source)?;
        let ids = self.store.insert_batch(&chunks)?;

        tracing::debug!(source, chunks = ids.len(), replaced, "document ingested");
        Ok((ids.len(), replaced))
    }
}

/// Recursively list supported documents under `dir`, sorted by path
///
/// # Errors
///
/// Returns error if `dir` is not a readable directory
pub fn collect_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Input(format!("not a directory: {}", dir.display())));
    }

    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()))
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8; 4]).unwrap();

        let files = collect_documents(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() != "png"));
    }

    #[test]
    fn test_collect_rejects_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(collect_documents(file.path()).is_err());
    }
}
