//! Conversation turns
//!
//! - **controller**: The select loop that owns turn status and playback
//! - **pipeline**: Provider calls for one utterance, run as a task
//! - **state**: Turn statuses and legal transitions
//! - **cancel**: Per-turn cancellation and deadlines
//! - **context**: Recent exchanges fed back to the generator

mod cancel;
mod context;
mod controller;
mod pipeline;
mod state;

pub use cancel::{CallHandle, with_deadline};
pub use context::ConversationContext;
pub use controller::{TurnConfig, TurnController};
pub use pipeline::{PipelineConfig, Providers, StageEvent, StageEventKind, TurnPipeline};
pub use state::{TurnStatus, TurnTransition};
