//! HTTP client for the local speech-synthesis sidecar

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{SynthesisHealth, SynthesisRequest, SynthesisService};
use crate::voice::AudioArtifact;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    voice: &'a str,
    speed: f32,
    trim_silence: bool,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    status: String,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    model_loaded: bool,
}

/// Parse a `/tts` body into an ephemeral artifact
///
/// # Errors
///
/// `Protocol` if malformed or missing the file, `Tts` if the engine reports
/// failure
pub fn parse_tts_response(body: &str) -> Result<AudioArtifact> {
    let response: TtsResponse = serde_json::from_str(body)
        .map_err(|e| Error::Protocol(format!("unexpected TTS response: {e}")))?;

    if response.status != "success" && response.status != "ok" {
        return Err(Error::Tts(response.message.unwrap_or(response.status)));
    }

    let file = response
        .file
        .ok_or_else(|| Error::Protocol("TTS response missing file".to_string()))?;
    let duration = response
        .duration
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map_or(Duration::ZERO, Duration::from_secs_f64);

    tracing::trace!(file = %file.display(), ?duration, sample_rate = ?response.sample_rate, "TTS artifact");
    Ok(AudioArtifact::ephemeral(file, duration))
}

/// Sidecar speaking the `/tts` protocol
pub struct SidecarSynthesisService {
    name: String,
    base_url: Url,
    client: reqwest::Client,
}

impl SidecarSynthesisService {
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
            .map_err(|e| Error::Config(format!("invalid TTS endpoint {path}: {e}")))
    }
}

#[async_trait]
impl SynthesisService for SidecarSynthesisService {
    fn name(&self) -> &str {
        &self.name
    }

    fn trims_silence(&self) -> bool {
        true
    }

    async fn health(&self) -> Result<SynthesisHealth> {
        let response = self.client.get(self.endpoint("health")?).send().await?;
        if !response.status().is_success() {
            return Ok(SynthesisHealth::default());
        }
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("unexpected TTS health response: {e}")))?;
        Ok(SynthesisHealth {
            ready: matches!(health.status.as_str(), "ok" | "healthy" | "ready") && health.model_loaded,
            model_loaded: health.model_loaded,
        })
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact> {
        let body = TtsBody {
            text: &request.text,
            voice: &request.voice,
            speed: request.speed,
            trim_silence: request.trim_silence,
        };

        let response = self.client.post(self.endpoint("tts")?).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_server_error() {
            return Err(Error::ServiceUnavailable(format!("TTS sidecar {status}: {text}")));
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!("TTS sidecar {status}: {text}")));
        }

        let artifact = parse_tts_response(&text)?;
        if !artifact.path.exists() {
            return Err(Error::Protocol(format!(
                "TTS sidecar reported missing file {}",
                artifact.path.display()
            )));
        }
        Ok(artifact)
    }
}
