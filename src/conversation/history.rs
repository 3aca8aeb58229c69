//! Conversation turns and prompt assembly

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions to the model
    System,
    /// The remote party
    User,
    /// The agent
    Assistant,
}

/// Structured fields attached to an assistant reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// Whether the remote party confirmed coverage; unknown when `None`
    #[serde(default)]
    pub coverage_confirmed: Option<bool>,
    /// The agent intends to end the call after this reply
    #[serde(default)]
    pub end_conversation: bool,
}

/// One exchange in the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker
    pub role: Role,
    /// What was said
    pub content: String,
    /// Reply metadata, assistant turns only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
    /// When the turn was recorded
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    /// User turn recorded now
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
            at: Utc::now(),
        }
    }

    /// Assistant turn recorded now
    #[must_use]
    pub fn assistant(content: impl Into<String>, metadata: Option<TurnMetadata>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata,
            at: Utc::now(),
        }
    }
}

/// Ordered, bounded turn log; oldest turns are dropped past the cap
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    cap: usize,
    trimmed: u64,
}

impl ConversationHistory {
    /// History holding at most `cap` turns
    #[must_use]
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            turns: VecDeque::with_capacity(cap),
            cap,
            trimmed: 0,
        }
    }

    /// Append a turn, trimming the head if over capacity
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.cap {
            self.turns.pop_front();
            self.trimmed += 1;
        }
    }

    /// All retained turns, oldest first
    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> + ExactSizeIterator {
        self.turns.iter()
    }

    /// The last `n` turns, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<&ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    /// Most recent assistant turn
    #[must_use]
    pub fn last_assistant(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }

    /// Retained turn count
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether nothing has been said
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns dropped from the head so far
    #[must_use]
    pub const fn trimmed(&self) -> u64 {
        self.trimmed
    }
}

/// One message sent to the language model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    /// Speaker
    pub role: Role,
    /// Text
    pub content: String,
}

/// Everything the language model sees for one reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptContext {
    /// System prompt first, then recent turns
    pub messages: Vec<PromptMessage>,
}

impl PromptContext {
    /// System prompt followed by the last `max_turns` turns of `history`
    #[must_use]
    pub fn build(system_prompt: &str, history: &ConversationHistory, max_turns: usize) -> Self {
        let mut messages = Vec::with_capacity(max_turns + 1);
        if !system_prompt.trim().is_empty() {
            messages.push(PromptMessage {
                role: Role::System,
                content: system_prompt.to_string(),
            });
        }
        messages.extend(history.recent(max_turns).into_iter().map(|t| PromptMessage {
            role: t.role,
            content: t.content.clone(),
        }));
        Self { messages }
    }

    /// Text of the newest user message
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_trims_oldest() {
        let mut history = ConversationHistory::new(3);
        for i in 0..5 {
            history.push(ConversationTurn::user(format!("turn {i}")));
        }
        let contents: Vec<&str> = history.turns().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(history.trimmed(), 2);
    }

    #[test]
    fn prompt_includes_system_and_recent_turns() {
        let mut history = ConversationHistory::new(10);
        history.push(ConversationTurn::user("hello"));
        history.push(ConversationTurn::assistant("hi, calling about a booking", None));
        history.push(ConversationTurn::user("sure"));

        let ctx = PromptContext::build("You are an agent.", &history, 2);
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0].role, Role::System);
        assert_eq!(ctx.messages[1].content, "hi, calling about a booking");
        assert_eq!(ctx.last_user_message(), Some("sure"));
    }

    #[test]
    fn last_assistant_finds_latest() {
        let mut history = ConversationHistory::new(10);
        assert!(history.last_assistant().is_none());
        history.push(ConversationTurn::assistant("a", None));
        history.push(ConversationTurn::assistant(
            "b",
            Some(TurnMetadata {
                coverage_confirmed: Some(true),
                end_conversation: false,
            }),
        ));
        history.push(ConversationTurn::user("c"));
        let last = history.last_assistant().unwrap();
        assert_eq!(last.content, "b");
        assert_eq!(last.metadata.unwrap().coverage_confirmed, Some(true));
    }

    #[test]
    fn metadata_deserializes_with_null_coverage() {
        let meta: TurnMetadata =
            serde_json::from_str(r#"{"coverage_confirmed":null,"end_conversation":true}"#).unwrap();
        assert_eq!(meta.coverage_confirmed, None);
        assert!(meta.end_conversation);
    }
}
