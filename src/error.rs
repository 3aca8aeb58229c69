//! Error types for the voice-call agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice-call agent
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error
    #[error("vad error: {0}")]
    Vad(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model error
    #[error("llm error: {0}")]
    Llm(String),

    /// Sidecar refused the connection or is not running
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Request exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Sidecar returned a payload we could not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Call short-circuited because the breaker is open
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Process supervision error
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// Synthesis pipeline error
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV codec error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::ServiceUnavailable(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::Protocol(e.to_string())
        } else {
            Self::ServiceUnavailable(e.to_string())
        }
    }
}

impl Error {
    /// Whether retrying the same call could plausibly succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("read".to_string()).is_transient());
        assert!(Error::ServiceUnavailable("refused".to_string()).is_transient());
        assert!(!Error::Protocol("bad json".to_string()).is_transient());
        assert!(!Error::CircuitOpen("tts".to_string()).is_transient());
        assert!(!Error::Config("missing".to_string()).is_transient());
    }

    #[test]
    fn display_includes_context() {
        let e = Error::CircuitOpen("kokoro".to_string());
        assert_eq!(e.to_string(), "circuit open for kokoro");
    }
}
