//! Speech-to-text clients
//!
//! [`SpeechClient`] fronts a batch [`SpeechService`] and an optional
//! [`StreamingSpeechService`]. Streaming is tried first and falls back to
//! batch transparently; both paths are guarded by circuit breakers and
//! transient-failure retries.

mod cloud;
mod http;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

pub use cloud::{CloudSpeechService, SttProvider};
pub use http::SidecarSpeechService;

use crate::retry::{RetryPolicy, with_retry};
use crate::supervisor::CircuitBreaker;
use crate::voice::Utterance;
use crate::voice::audio::samples_for;
use crate::{Error, Result};

/// Result of transcribing audio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Recognized text
    pub text: String,
    /// Length of the transcribed audio
    pub duration: Duration,
    /// Engine confidence, when reported
    pub confidence: Option<f32>,
    /// Intermediate result from a streaming session
    pub partial: bool,
}

impl Transcript {
    /// Final transcript with no confidence
    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

static ENGINE_ARTIFACTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[[a-z_ ]+\]|\((?:silence|inaudible|music|noise|blank_audio|background noise)\)|\*[a-z ]+\*")
        .expect("valid regex")
});

/// Normalize raw engine output
///
/// Removes engine markers such as `[BLANK_AUDIO]` or `(silence)`, collapses
/// whitespace, and capitalizes the first letter.
#[must_use]
pub fn clean_transcript(raw: &str) -> String {
    let stripped = ENGINE_ARTIFACTS.replace_all(raw, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut chars = collapsed.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Batch speech recognizer
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Whether the provider is reachable and ready
    ///
    /// # Errors
    ///
    /// Returns error if the health endpoint cannot be reached
    async fn health(&self) -> Result<bool>;

    /// Transcribe a complete utterance
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` on refused connections, `Timeout` on deadline,
    /// `Protocol` on malformed responses
    async fn transcribe(&self, utterance: &Utterance) -> Result<Transcript>;
}

/// Recognizer that accepts audio incrementally
#[async_trait]
pub trait StreamingSpeechService: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Begin a new recognition session
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be opened
    async fn open_session(&self) -> Result<Box<dyn SpeechSession>>;
}

/// One open streaming recognition session
#[async_trait]
pub trait SpeechSession: Send {
    /// Send a chunk of audio and get the running partial transcript
    ///
    /// # Errors
    ///
    /// Returns error if the chunk is rejected
    async fn feed_chunk(&mut self, samples: &[f32], sample_rate: u32) -> Result<Transcript>;

    /// Close the session and get the final transcript
    ///
    /// # Errors
    ///
    /// Returns error if finalization fails
    async fn finalize(self: Box<Self>) -> Result<Transcript>;
}

/// Speech client settings
#[derive(Debug, Clone)]
pub struct SpeechClientSettings {
    /// Length of audio per streaming chunk
    pub chunk: Duration,
    /// Retry policy for the batch path
    pub retry: RetryPolicy,
}

impl Default for SpeechClientSettings {
    fn default() -> Self {
        Self {
            chunk: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// Uniform transcription entry point with fallback and breakers
pub struct SpeechClient {
    batch: Arc<dyn SpeechService>,
    streaming: Option<Arc<dyn StreamingSpeechService>>,
    batch_breaker: CircuitBreaker,
    stream_breaker: CircuitBreaker,
    settings: SpeechClientSettings,
}

impl SpeechClient {
    /// Client over a batch service
    #[must_use]
    pub fn new(batch: Arc<dyn SpeechService>, breaker: CircuitBreaker, settings: SpeechClientSettings) -> Self {
        let stream_breaker = CircuitBreaker::new(
            &format!("{}-stream", breaker.name()),
            crate::supervisor::DEFAULT_FAILURE_THRESHOLD,
            crate::supervisor::DEFAULT_COOLDOWN,
        );
        Self {
            batch,
            streaming: None,
            batch_breaker: breaker,
            stream_breaker,
            settings,
        }
    }

    /// Prefer `streaming` before falling back to batch
    #[must_use]
    pub fn with_streaming(mut self, streaming: Arc<dyn StreamingSpeechService>, breaker: CircuitBreaker) -> Self {
        self.streaming = Some(streaming);
        self.stream_breaker = breaker;
        self
    }

    /// Whether the batch provider reports ready
    pub async fn health(&self) -> bool {
        match self.batch.health().await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::debug!(service = %self.batch.name(), error = %e, "stt health check failed");
                false
            }
        }
    }

    /// Transcribe an utterance, consuming it
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` if the batch breaker is open after streaming
    /// failed, or the last batch error
    pub async fn transcribe(&self, utterance: Utterance) -> Result<Transcript> {
        if let Some(streaming) = &self.streaming {
            if self.stream_breaker.allow() {
                match self.transcribe_streaming(streaming.as_ref(), &utterance).await {
                    Ok(transcript) => {
                        self.stream_breaker.record_success();
                        return Ok(finish(transcript));
                    }
                    Err(e) => {
                        self.stream_breaker.record_failure();
                        tracing::warn!(
                            id = %utterance.id,
                            service = %streaming.name(),
                            error = %e,
                            "streaming transcription failed, falling back to batch"
                        );
                    }
                }
            }
        }

        if !self.batch_breaker.allow() {
            return Err(Error::CircuitOpen(self.batch.name().to_string()));
        }

        let batch = Arc::clone(&self.batch);
        let result = with_retry(&self.settings.retry, "transcribe", || batch.transcribe(&utterance)).await;
        match result {
            Ok(transcript) => {
                self.batch_breaker.record_success();
                tracing::debug!(id = %utterance.id, chars = transcript.text.len(), "transcription complete");
                Ok(finish(transcript))
            }
            Err(e) => {
                self.batch_breaker.record_failure();
                tracing::warn!(id = %utterance.id, error = %e, "transcription failed");
                Err(e)
            }
        }
    }

    async fn transcribe_streaming(
        &self,
        streaming: &dyn StreamingSpeechService,
        utterance: &Utterance,
    ) -> Result<Transcript> {
        let mut session = streaming.open_session().await?;
        let chunk_len = samples_for(self.settings.chunk, utterance.sample_rate).max(1);

        for chunk in utterance.samples.chunks(chunk_len) {
            let partial = session.feed_chunk(chunk, utterance.sample_rate).await?;
            tracing::trace!(id = %utterance.id, text = %partial.text, "partial transcript");
        }

        let mut transcript = session.finalize().await?;
        if transcript.duration.is_zero() {
            transcript.duration = utterance.duration();
        }
        Ok(transcript)
    }
}

fn finish(mut transcript: Transcript) -> Transcript {
    transcript.text = clean_transcript(&transcript.text);
    transcript.partial = false;
    transcript
}
