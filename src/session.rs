//! Session state shared between the speech loop and the API
//!
//! The turn controller is the only writer. Readers get immutable snapshots
//! either from the in-process watch channel or from the JSON file the loop
//! mirrors to disk when the API runs in another process.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::knowledge::RetrievedChunk;
use crate::turn::TurnStatus;

/// A retrieved source shown alongside the response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub score: f32,
}

impl From<&RetrievedChunk> for SourceRef {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            source: chunk.source.clone(),
            score: chunk.score,
        }
    }
}

/// Snapshot of the conversation as the UI sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    /// Bumped on every published change
    pub version: u64,
    pub status: TurnStatus,
    pub turn_id: Option<u64>,
    pub transcript: Option<String>,
    pub response: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub last_outcome: Option<TurnStatus>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    #[must_use]
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            version: 0,
            status: TurnStatus::Idle,
            turn_id: None,
            transcript: None,
            response: String::new(),
            sources: Vec::new(),
            last_outcome: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Equal ignoring version and timestamp
    fn same_content(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.status == other.status
            && self.turn_id == other.turn_id
            && self.transcript == other.transcript
            && self.response == other.response
            && self.sources == other.sources
            && self.last_outcome == other.last_outcome
            && self.last_error == other.last_error
    }
}

/// Single-writer publisher of [`SessionState`]
pub struct SessionPublisher {
    tx: watch::Sender<Arc<SessionState>>,
}

impl SessionPublisher {
    /// In-memory publisher with a fresh session id
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(SessionState::new(Uuid::new_v4())));
        Self { tx }
    }

    /// Latest snapshot
    #[must_use]
    pub fn current(&self) -> Arc<SessionState> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionState>> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn view(&self) -> WatchSessionView {
        WatchSessionView::new(self.subscribe())
    }

    /// Apply `update` and publish if anything changed
    ///
    /// Returns whether a new version was published.
    pub fn publish(&self, update: impl FnOnce(&mut SessionState)) -> bool {
        self.tx.send_if_modified(|current| {
            let mut next = SessionState::clone(current);
            update(&mut next);
            if next.same_content(current) {
                return false;
            }
            next.version = current.version + 1;
            next.updated_at = Utc::now();
            *current = Arc::new(next);
            true
        })
    }

    /// Refresh `updated_at` without publishing a new version
    pub fn touch(&self) {
        self.tx.send_modify(|current| {
            let mut next = SessionState::clone(current);
            next.updated_at = Utc::now();
            *current = Arc::new(next);
        });
    }
}

impl Default for SessionPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task mirroring snapshots to a JSON file
///
/// Writes run on the blocking pool; snapshots published while a write is in
/// flight coalesce into the next one. Once every publisher is dropped the
/// file is removed, so a reader never mistakes a finished speech loop for a
/// live one.
pub struct SessionMirror {
    task: JoinHandle<()>,
}

impl SessionMirror {
    #[must_use]
    pub fn spawn(mut rx: watch::Receiver<Arc<SessionState>>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let task = tokio::spawn(async move {
            let mut state = rx.borrow_and_update().clone();
            loop {
                let target = path.clone();
                if let Err(e) =
                    tokio::task::spawn_blocking(move || write_snapshot(&target, &state)).await
                {
                    tracing::warn!(error = %e, "session writer failed");
                }
                if rx.changed().await.is_err() {
                    break;
                }
                state = rx.borrow_and_update().clone();
            }

            let target = path.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || remove_snapshot(&target)).await {
                tracing::warn!(error = %e, "session cleanup failed");
            }
            tracing::debug!(path = %path.display(), "session mirror stopped");
        });

        Self { task }
    }

    /// Wait until the publisher is gone and the file removed
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session mirror task panicked");
        }
    }
}

/// Write via a temp file and rename so readers never see a partial file
fn write_snapshot(path: &Path, state: &SessionState) {
    let json = match serde_json::to_vec_pretty(state) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize session state");
            return;
        }
    };

    let tmp = path.with_extension("json.tmp");
    let result = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(e) = result {
        tracing::warn!(error = %e, path = %path.display(), "failed to write session state");
    }
}

fn remove_snapshot(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to remove session state");
        }
    }
}

/// Read access to the latest session snapshot
pub trait SessionView: Send + Sync {
    /// `None` when no speech loop is publishing
    fn snapshot(&self) -> Option<Arc<SessionState>>;
}

/// View backed by the in-process watch channel
#[derive(Clone)]
pub struct WatchSessionView {
    rx: watch::Receiver<Arc<SessionState>>,
}

impl WatchSessionView {
    #[must_use]
    pub const fn new(rx: watch::Receiver<Arc<SessionState>>) -> Self {
        Self { rx }
    }
}

impl SessionView for WatchSessionView {
    fn snapshot(&self) -> Option<Arc<SessionState>> {
        Some(self.rx.borrow().clone())
    }
}

/// View backed by the file a separate speech loop writes
///
/// The file is small, so every call reads it afresh. A missing file means
/// no speech loop is running.
pub struct FileSessionView {
    path: PathBuf,
    last: Mutex<Option<Arc<SessionState>>>,
}

impl FileSessionView {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(None),
        }
    }

    fn load(&self) -> Option<Arc<SessionState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(error = %e, "session file unreadable");
                }
                return None;
            }
        };

        let Ok(mut last) = self.last.lock() else {
            return None;
        };
        match serde_json::from_slice::<SessionState>(&bytes) {
            Ok(state) => {
                let state = Arc::new(state);
                *last = Some(state.clone());
                Some(state)
            }
            Err(e) => {
                tracing::debug!(error = %e, "session file unparseable");
                last.clone()
            }
        }
    }
}

impl SessionView for FileSessionView {
    fn snapshot(&self) -> Option<Arc<SessionState>> {
        self.load()
    }
}
