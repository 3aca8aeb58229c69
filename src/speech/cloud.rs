//! Hosted speech-to-text (Whisper / Deepgram)

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{SpeechService, Transcript};
use crate::voice::Utterance;
use crate::{Error, Result};

#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Hosted STT backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// `OpenAI` Whisper
    Whisper,
    /// Deepgram
    Deepgram,
}

/// Batch transcription through a hosted API
pub struct CloudSpeechService {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
}

impl CloudSpeechService {
    /// Create a hosted STT client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty or the client cannot be built
    pub fn new(provider: SttProvider, api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} STT")));
        }

        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            provider,
        })
    }

    async fn transcribe_whisper(&self, audio: Vec<u8>) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(status_error("Whisper", status, &body));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(Transcript::final_text(result.text))
    }

    async fn transcribe_deepgram(&self, audio: Vec<u8>) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(status_error("Deepgram", status, &body));
        }

        let result: DeepgramResponse = response.json().await?;
        let best = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next());

        Ok(best.map_or_else(Transcript::default, |a| Transcript {
            confidence: a.confidence,
            ..Transcript::final_text(a.transcript)
        }))
    }
}

fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::ServiceUnavailable(format!("{provider} API error {status}: {body}"))
    } else {
        Error::Stt(format!("{provider} API error {status}: {body}"))
    }
}

#[async_trait]
impl SpeechService for CloudSpeechService {
    fn name(&self) -> &str {
        match self.provider {
            SttProvider::Whisper => "whisper",
            SttProvider::Deepgram => "deepgram",
        }
    }

    async fn health(&self) -> Result<bool> {
        Ok(true)
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<Transcript> {
        let audio = utterance.to_wav()?;
        let mut transcript = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(audio).await?,
        };
        transcript.duration = utterance.duration();
        tracing::info!(transcript = %transcript.text, provider = self.name(), "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let result = CloudSpeechService::new(
            SttProvider::Whisper,
            SecretString::from(String::new()),
            "whisper-1".to_string(),
            Duration::from_secs(10),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(status_error("x", reqwest::StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error("x", reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!status_error("x", reqwest::StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn deepgram_body_parses() {
        let body = r#"{"results":{"channels":[{"alternatives":[{"transcript":"hello","confidence":0.9}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.channels[0].alternatives[0].transcript, "hello");
    }
}
