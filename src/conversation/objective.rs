//! Pluggable call-objective completion check

use super::history::ConversationHistory;

/// Decides after each assistant turn whether the call has achieved its goal
pub trait CompletionPolicy: Send + Sync {
    /// Whether the conversation can end now
    fn is_complete(&self, history: &ConversationHistory) -> bool;
}

/// Never ends the call on its own
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverComplete;

impl CompletionPolicy for NeverComplete {
    fn is_complete(&self, _history: &ConversationHistory) -> bool {
        false
    }
}

/// Complete once the last assistant turn recorded a coverage answer
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageAnswered;

impl CompletionPolicy for CoverageAnswered {
    fn is_complete(&self, history: &ConversationHistory) -> bool {
        history
            .last_assistant()
            .and_then(|t| t.metadata)
            .is_some_and(|m| m.coverage_confirmed.is_some())
    }
}

impl<F> CompletionPolicy for F
where
    F: Fn(&ConversationHistory) -> bool + Send + Sync,
{
    fn is_complete(&self, history: &ConversationHistory) -> bool {
        self(history)
    }
}
