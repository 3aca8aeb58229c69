//! Turn-taking conversation state

mod coordinator;
mod history;
mod objective;

pub use coordinator::{CallState, CallSummary, CoordinatorSettings, EndReason, TurnCoordinator, TurnOutcome};
pub use history::{ConversationHistory, ConversationTurn, PromptContext, PromptMessage, Role, TurnMetadata};
pub use objective::{CompletionPolicy, CoverageAnswered, NeverComplete};
