//! HTTP client for the local speech-recognition sidecar

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{SpeechService, SpeechSession, StreamingSpeechService, Transcript};
use crate::voice::Utterance;
use crate::voice::audio::samples_to_wav;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct FileResponse {
    status: String,
    #[serde(default)]
    transcription: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    session: String,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    status: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial: bool,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    message: Option<String>,
}

fn is_ok_status(status: &str) -> bool {
    matches!(status, "success" | "ok")
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Protocol(format!("unexpected STT response: {e}")))
}

fn seconds(value: Option<f64>) -> Duration {
    value
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map_or(Duration::ZERO, Duration::from_secs_f64)
}

/// Parse a `/transcribe_file` body
///
/// # Errors
///
/// `Protocol` if the body is malformed, `Stt` if the engine reports failure
pub fn parse_file_response(body: &str) -> Result<Transcript> {
    let response: FileResponse = decode(body)?;
    if !is_ok_status(&response.status) {
        return Err(Error::Stt(response.message.unwrap_or(response.status)));
    }
    Ok(Transcript {
        text: response.transcription,
        duration: seconds(response.duration),
        confidence: response.confidence,
        partial: false,
    })
}

fn parse_chunk_response(body: &str, final_result: bool) -> Result<Transcript> {
    let response: ChunkResponse = decode(body)?;
    if !is_ok_status(&response.status) {
        return Err(Error::Stt(response.message.unwrap_or(response.status)));
    }
    Ok(Transcript {
        text: response.text,
        duration: seconds(response.duration),
        confidence: response.confidence,
        partial: !final_result && response.partial,
    })
}

/// Sidecar speaking the file and session HTTP protocol
#[derive(Clone)]
pub struct SidecarSpeechService {
    name: String,
    base_url: Url,
    client: reqwest::Client,
}

impl SidecarSpeechService {
    /// Client for the sidecar at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(name: &str, base_url: Url, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            name: name.to_string(),
            base_url,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid STT endpoint {path}: {e}")))
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        let response = self.client.post(self.endpoint(path)?).json(body).send().await?;
        read_body(response).await
    }

    async fn post_wav(&self, path: &str, wav: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint(path)?)
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;
        read_body(response).await
    }
}

async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_server_error() {
        return Err(Error::ServiceUnavailable(format!("STT sidecar {status}: {body}")));
    }
    if !status.is_success() {
        return Err(Error::Protocol(format!("STT sidecar {status}: {body}")));
    }
    Ok(body)
}

#[async_trait]
impl SpeechService for SidecarSpeechService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> Result<bool> {
        let response = self.client.get(self.endpoint("health")?).send().await?;
        Ok(response.status().is_success())
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<Transcript> {
        // removed when dropped, on success or error
        let wav = utterance.to_temp_wav()?;
        let path = wav.to_string_lossy().to_string();
        tracing::debug!(id = %utterance.id, path = %path, "sending utterance to STT sidecar");

        let body = self
            .post_json("transcribe_file", &serde_json::json!({ "audio_file": path }))
            .await?;
        let mut transcript = parse_file_response(&body)?;
        if transcript.duration.is_zero() {
            transcript.duration = utterance.duration();
        }
        Ok(transcript)
    }
}

#[async_trait]
impl StreamingSpeechService for SidecarSpeechService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_session(&self) -> Result<Box<dyn SpeechSession>> {
        let body = self.post_json("stream/open", &serde_json::json!({})).await?;
        let open: OpenResponse = decode(&body)?;
        tracing::debug!(session = %open.session, "STT stream opened");
        Ok(Box::new(SidecarSession {
            service: self.clone(),
            session: open.session,
        }))
    }
}

struct SidecarSession {
    service: SidecarSpeechService,
    session: String,
}

#[async_trait]
impl SpeechSession for SidecarSession {
    async fn feed_chunk(&mut self, samples: &[f32], sample_rate: u32) -> Result<Transcript> {
        let wav = samples_to_wav(samples, sample_rate)?;
        let body = self
            .service
            .post_wav(&format!("stream/{}/chunk", self.session), wav)
            .await?;
        parse_chunk_response(&body, false)
    }

    async fn finalize(self: Box<Self>) -> Result<Transcript> {
        let body = self
            .service
            .post_json(&format!("stream/{}/finalize", self.session), &serde_json::json!({}))
            .await?;
        tracing::debug!(session = %self.session, "STT stream finalized");
        parse_chunk_response(&body, true)
    }
}
