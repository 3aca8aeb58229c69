//! Keyword inference of reply metadata
//!
//! Used when a streamed reply carries no metadata block. This is an
//! approximation: it only looks for common phrasings in English.

use std::sync::LazyLock;

use regex::Regex;

use crate::conversation::TurnMetadata;

/// Infers structured metadata from free text
pub trait IntentClassifier: Send + Sync {
    /// Metadata for `reply`, given the user message it answers
    fn classify(&self, user_message: Option<&str>, reply: &str) -> TurnMetadata;
}

static FAREWELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(good\s?bye|bye now|have a (great|good|nice|lovely) (day|evening|afternoon)|thank you for your time|thanks for your time)\b")
        .expect("valid regex")
});

static NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not covered|no coverage|(do not|don't|doesn't|does not|can't|cannot|won't) (accept|cover|bill|do direct billing)|unable to (accept|cover|bill)|decline[ds]?)\b")
        .expect("valid regex")
});

static POSITIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(is covered|are covered|(we|they) (do )?accept|(we|they) (do )?(cover|bill directly)|direct billing is (fine|ok|okay|possible|accepted)|confirmed|approved)\b")
        .expect("valid regex")
});

/// Regex-based classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    fn coverage(text: &str) -> Option<bool> {
        if NEGATIVE.is_match(text) {
            Some(false)
        } else if POSITIVE.is_match(text) {
            Some(true)
        } else {
            None
        }
    }
}

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, user_message: Option<&str>, reply: &str) -> TurnMetadata {
        // the remote party's words decide coverage; the reply may only echo it
        let coverage_confirmed = user_message
            .and_then(Self::coverage)
            .or_else(|| Self::coverage(reply));

        TurnMetadata {
            coverage_confirmed,
            end_conversation: FAREWELL.is_match(reply),
        }
    }
}
