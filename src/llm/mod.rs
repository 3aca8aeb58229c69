//! Language-model backends
//!
//! Replies come back either whole ([`LanguageModel::complete`]) or as a
//! channel of [`LlmEvent`]s ([`LanguageModel::stream`]). A stream channel
//! that closes without [`LlmEvent::Done`] means the stream failed.

mod http;
mod intent;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use http::{META_MARKER, MetaSplitter, OpenAiCompatibleModel, parse_batch_reply};
pub use intent::{IntentClassifier, KeywordIntentClassifier};

use crate::Result;
use crate::conversation::{PromptContext, TurnMetadata};

/// A complete reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Text to speak
    pub message: String,
    /// Structured fields
    pub metadata: TurnMetadata,
}

/// Streaming reply event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmEvent {
    /// More reply text
    TextFragment(String),
    /// Reply finished; metadata when the model supplied or it was inferred
    Done {
        /// Structured fields
        metadata: Option<TurnMetadata>,
    },
}

/// A conversational language model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model name for logs
    fn name(&self) -> &str;

    /// Request a complete structured reply
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the reply is malformed
    async fn complete(&self, context: &PromptContext) -> Result<Reply>;

    /// Request a streamed reply
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened
    async fn stream(&self, context: &PromptContext) -> Result<mpsc::Receiver<LlmEvent>>;
}
