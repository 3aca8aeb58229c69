//! Text-to-speech clients
//!
//! [`SynthesisClient`] checks the phrase cache, then the primary engine
//! (breaker-guarded, with retries), then the fallback engine.

mod cache;
mod cloud;
mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use cache::{AudioCacheEntry, CacheStats, SynthesisCache};
pub use cloud::{CloudSynthesisService, TtsProvider};
pub use http::{SidecarSynthesisService, parse_tts_response};

use crate::retry::{RetryPolicy, with_retry};
use crate::supervisor::CircuitBreaker;
use crate::voice::AudioArtifact;
use crate::voice::audio::{duration_of, trim_silence, write_wav};
use crate::{Error, Result};

/// Energy below which synthesized audio counts as silence when trimming
const TRIM_THRESHOLD: f32 = 0.01;

/// Audio kept around speech when trimming
const TRIM_PAD: Duration = Duration::from_millis(40);

/// One phrase to synthesize
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Engine voice id
    pub voice: String,
    /// Speaking rate multiplier
    pub speed: f32,
    /// Strip leading and trailing silence
    pub trim_silence: bool,
}

/// Readiness reported by a synthesis engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisHealth {
    /// Accepting requests
    pub ready: bool,
    /// Model weights are loaded
    pub model_loaded: bool,
}

/// A text-to-speech engine
#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Whether the engine honors `trim_silence` itself
    fn trims_silence(&self) -> bool {
        false
    }

    /// Query readiness
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be reached
    async fn health(&self) -> Result<SynthesisHealth>;

    /// Produce an audio artifact for `request`
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable`, `Timeout`, `Protocol` or `Tts` on failure
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioArtifact>;
}

/// Text-in, artifact-out capability used by the synthesis pipeline
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the configured voice
    ///
    /// # Errors
    ///
    /// Returns error if no engine could produce audio
    async fn synthesize(&self, text: &str) -> Result<AudioArtifact>;
}

/// Voice settings applied to every request
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// Engine voice id
    pub voice: String,
    /// Speaking rate multiplier
    pub speed: f32,
    /// Strip leading and trailing silence
    pub trim_silence: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "af_heart".to_string(),
            speed: 1.0,
            trim_silence: true,
        }
    }
}

/// Cached, breaker-guarded synthesis with a fallback engine
pub struct SynthesisClient {
    primary: Arc<dyn SynthesisService>,
    fallback: Option<Arc<dyn SynthesisService>>,
    breaker: CircuitBreaker,
    cache: Option<Arc<SynthesisCache>>,
    retry: RetryPolicy,
    voice: VoiceSettings,
    artifact_dir: PathBuf,
}

impl SynthesisClient {
    /// Client over `primary`, guarded by `breaker`
    #[must_use]
    pub fn new(primary: Arc<dyn SynthesisService>, breaker: CircuitBreaker, voice: VoiceSettings) -> Self {
        Self {
            primary,
            fallback: None,
            breaker,
            cache: None,
            retry: RetryPolicy::default(),
            voice,
            artifact_dir: std::env::temp_dir(),
        }
    }

    /// Engine used when the primary fails or its breaker is open
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn SynthesisService>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Serve repeated phrases from `cache`
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<SynthesisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Retry policy for the primary engine
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Directory for locally post-processed artifacts
    #[must_use]
    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = dir;
        self
    }

    /// Phrase cache, if enabled
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<SynthesisCache>> {
        self.cache.as_ref()
    }

    /// Request for `text` using the configured voice
    #[must_use]
    pub fn request(&self, text: &str) -> SynthesisRequest {
        SynthesisRequest {
            text: text.to_string(),
            voice: self.voice.voice.clone(),
            speed: self.voice.speed,
            trim_silence: self.voice.trim_silence,
        }
    }

    /// Primary engine readiness
    pub async fn health(&self) -> SynthesisHealth {
        match self.primary.health().await {
            Ok(health) => health,
            Err(e) => {
                tracing::debug!(service = %self.primary.name(), error = %e, "tts health check failed");
                SynthesisHealth::default()
            }
        }
    }

    /// Synthesize `request`, consulting the cache first
    ///
    /// # Errors
    ///
    /// Returns the primary error (or `CircuitOpen`) when no fallback exists,
    /// otherwise the fallback's error
    pub async fn synthesize_request(&self, request: &SynthesisRequest) -> Result<AudioArtifact> {
        let key = SynthesisCache::key(&request.text, &request.voice, request.speed);
        if let Some(cache) = &self.cache {
            if let Some(artifact) = cache.get(&key).await {
                return Ok(artifact);
            }
        }

        let (service, artifact) = self.synthesize_uncached(request).await?;

        let artifact = if request.trim_silence && !service.trims_silence() {
            match trim_artifact(artifact.clone(), self.artifact_dir.clone()).await {
                Ok(trimmed) => trimmed,
                Err(e) => {
                    tracing::debug!(error = %e, "silence trim failed, using untrimmed audio");
                    artifact
                }
            }
        } else {
            artifact
        };

        let Some(cache) = &self.cache else {
            return Ok(artifact);
        };
        match cache.insert(&key, &artifact).await {
            Ok(cached) => Ok(cached),
            Err(e) => {
                tracing::warn!(error = %e, "failed to cache synthesized phrase");
                Ok(artifact)
            }
        }
    }

    async fn synthesize_uncached(
        &self,
        request: &SynthesisRequest,
    ) -> Result<(Arc<dyn SynthesisService>, AudioArtifact)> {
        let primary_error = if self.breaker.allow() {
            let primary = Arc::clone(&self.primary);
            match with_retry(&self.retry, "synthesize", || primary.synthesize(request)).await {
                Ok(artifact) => {
                    self.breaker.record_success();
                    return Ok((primary, artifact));
                }
                Err(e) => {
                    self.breaker.record_failure();
                    tracing::warn!(service = %self.primary.name(), error = %e, "primary synthesis failed");
                    e
                }
            }
        } else {
            Error::CircuitOpen(self.primary.name().to_string())
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_error);
        };

        tracing::info!(service = %fallback.name(), "using fallback synthesis");
        let artifact = fallback.synthesize(request).await?;
        Ok((Arc::clone(fallback), artifact))
    }
}

#[async_trait]
impl Synthesizer for SynthesisClient {
    async fn synthesize(&self, text: &str) -> Result<AudioArtifact> {
        let request = self.request(text);
        self.synthesize_request(&request).await
    }
}

/// Re-encode `artifact` without leading and trailing silence
async fn trim_artifact(artifact: AudioArtifact, dir: PathBuf) -> Result<AudioArtifact> {
    tokio::task::spawn_blocking(move || {
        let (samples, rate) = artifact.load()?;
        let trimmed = trim_silence(&samples, rate, TRIM_THRESHOLD, TRIM_PAD);
        if trimmed.is_empty() || trimmed.len() == samples.len() {
            return Ok(artifact);
        }

        let file = tempfile::Builder::new()
            .prefix("tts-trim-")
            .suffix(".wav")
            .tempfile_in(&dir)?;
        let path = file.into_temp_path().keep().map_err(std::io::Error::from)?;
        write_wav(&path, &trimmed, rate)?;
        artifact.discard();

        Ok(AudioArtifact::ephemeral(path, duration_of(trimmed.len(), rate)))
    })
    .await
    .map_err(|e| Error::Tts(format!("trim task failed: {e}")))?
}
