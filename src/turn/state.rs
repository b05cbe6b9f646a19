//! Turn status and transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of the current turn, or `Idle` when there is none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Idle,
    Listening,
    Transcribing,
    Retrieving,
    Generating,
    Speaking,
    Interrupted,
    Completed,
    Failed,
}

impl TurnStatus {
    /// Whether a turn in this status is still in progress
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Listening | Self::Transcribing | Self::Retrieving | Self::Generating | Self::Speaking
        )
    }

    /// Whether a turn in this status is finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Interrupted | Self::Completed | Self::Failed)
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        use TurnStatus::{
            Completed, Failed, Generating, Idle, Interrupted, Listening, Retrieving, Speaking,
            Transcribing,
        };

        match (self, to) {
            (Idle, Listening)
            | (Listening, Transcribing | Failed)
            | (Transcribing, Retrieving)
            | (Retrieving, Generating)
            | (Generating, Speaking)
            | (Speaking, Completed)
            | (Transcribing | Retrieving | Generating | Speaking, Failed)
            | (Completed | Failed, Idle) => true,
            (from, Interrupted) => from.is_active(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status change, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnTransition {
    pub turn_id: u64,
    pub from: TurnStatus,
    pub to: TurnStatus,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            TurnStatus::Idle,
            TurnStatus::Listening,
            TurnStatus::Transcribing,
            TurnStatus::Retrieving,
            TurnStatus::Generating,
            TurnStatus::Speaking,
            TurnStatus::Completed,
            TurnStatus::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_interrupt_only_from_active() {
        assert!(TurnStatus::Speaking.can_transition(TurnStatus::Interrupted));
        assert!(TurnStatus::Transcribing.can_transition(TurnStatus::Interrupted));
        assert!(!TurnStatus::Idle.can_transition(TurnStatus::Interrupted));
        assert!(!TurnStatus::Completed.can_transition(TurnStatus::Interrupted));
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!TurnStatus::Listening.can_transition(TurnStatus::Generating));
        assert!(!TurnStatus::Generating.can_transition(TurnStatus::Completed));
        assert!(!TurnStatus::Interrupted.can_transition(TurnStatus::Idle));
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&TurnStatus::Speaking).unwrap(),
            "\"speaking\""
        );
    }
}
