//! Hosted text-to-speech (`OpenAI` / `ElevenLabs`), used as the fallback engine

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{SynthesisHealth, SynthesisRequest, SynthesisService};
use crate::voice::AudioArtifact;
use crate::voice::audio::{decode_mp3, duration_of};
use crate::{Error, Result};

/// Hosted TTS backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// `OpenAI` speech API
    OpenAI,
    /// `ElevenLabs`
    ElevenLabs,
}

/// Synthesizes speech through a hosted API
pub struct CloudSynthesisService {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    voice: String,
    provider: TtsProvider,
    artifact_dir: PathBuf,
}

impl CloudSynthesisService {
    /// Create a hosted TTS client writing artifacts under `artifact_dir`
    ///
    /// `voice` overrides the request voice, since sidecar voice names rarely
    /// exist on hosted engines.
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty or the client cannot be built
    pub fn new(
        provider: TtsProvider,
        api_key: SecretString,
        model: String,
        voice: String,
        artifact_dir: PathBuf,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("API key required for {provider:?} TTS")));
        }
        std::fs::create_dir_all(&artifact_dir)?;

        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            voice,
            provider,
            artifact_dir,
        })
    }

    async fn synthesize_openai(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let body = TtsRequest {
            model: &self.model,
            input: &request.text,
            voice: &self.voice,
            speed: request.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &body));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn synthesize_elevenlabs(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", self.voice);

        let body = ElevenLabsRequest {
            text: &request.text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("ElevenLabs", status, &body));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::ServiceUnavailable(format!("{provider} TTS error {status}: {body}"))
    } else {
        Error::Tts(format!("{provider} TTS error {status}: {body}"))
    }
}

#[async_trait]
impl SynthesisService for CloudSynthesisService {
    fn name(&self) -> &str {
        match self.provider {
            TtsProvider::OpenAI => "openai-tts",
            TtsProvider::ElevenLabs => "elevenlabs",
        }
    }

    async fn health(&self) -> Result<SynthesisHealth> {
        Ok(SynthesisHealth {
            ready: true,
            model_loaded: true,
        })
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact> {
        let mp3 = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(request).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(request).await?,
        };

        let (samples, rate) = decode_mp3(&mp3)?;
        let file = tempfile::Builder::new()
            .prefix("tts-")
            .suffix(".mp3")
            .tempfile_in(&self.artifact_dir)?;
        tokio::fs::write(file.path(), &mp3).await?;
        let path = file.into_temp_path().keep().map_err(std::io::Error::from)?;

        tracing::debug!(provider = self.name(), bytes = mp3.len(), path = %path.display(), "hosted synthesis complete");
        Ok(AudioArtifact::ephemeral(path, duration_of(samples.len(), rate)))
    }
}
