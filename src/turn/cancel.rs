//! Per-turn cancellation and deadlines

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Stage;
use crate::{Error, Result};

/// Cancels every provider call of one turn
///
/// Cloning shares the same underlying token.
#[derive(Debug, Clone, Default)]
pub struct CallHandle {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CallHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the turn; returns `true` only for the call that fired it
    pub fn cancel(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token to select on
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Await `fut` under a deadline attributed to `stage`
///
/// # Errors
///
/// Returns [`Error::Timeout`] when the deadline passes, otherwise the
/// future's own error
pub async fn with_deadline<T>(
    stage: Stage,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout(stage))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_idempotent() {
        let handle = CallHandle::new();
        let clone = handle.clone();

        assert!(!handle.is_cancelled());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!clone.cancel());
        assert!(clone.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        };
        let result = with_deadline(Stage::Generation, Duration::from_secs(1), slow).await;
        assert!(matches!(result, Err(Error::Timeout(Stage::Generation))));

        let fast = async { Ok(2) };
        assert_eq!(
            with_deadline(Stage::Generation, Duration::from_secs(1), fast)
                .await
                .unwrap(),
            2
        );
    }
}
