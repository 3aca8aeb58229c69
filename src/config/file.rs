//! TOML configuration file loading
//!
//! Supports `~/.config/voicecall/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoicecallConfigFile {
    /// Capture and utterance detection
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Speech-to-text
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Text-to-speech
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Language model
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Synthesis queue and playback
    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    /// Call script
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Circuit breaker
    #[serde(default)]
    pub breaker: BreakerFileConfig,

    /// Retry policy for sidecar calls
    #[serde(default)]
    pub retry: RetryFileConfig,

    /// Sidecar processes to supervise
    #[serde(default)]
    pub services: Vec<ServiceFileConfig>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Capture sample rate in Hz
    pub sample_rate: Option<u32>,
    /// VAD window length in milliseconds
    pub window_ms: Option<u64>,
    /// Trailing silence that ends an utterance, in milliseconds
    pub silence_ms: Option<u64>,
    /// Shortest utterance kept, in milliseconds
    pub min_speech_ms: Option<u64>,
    /// Longest utterance before a forced cut, in milliseconds
    pub max_speech_ms: Option<u64>,
    /// Ambient-noise calibration length, in milliseconds
    pub calibration_ms: Option<u64>,
    /// Fixed energy threshold; skips calibration when set
    pub energy_threshold: Option<f32>,
    /// Multiplier applied to calibrated ambient energy
    pub threshold_multiplier: Option<f32>,
    /// What to do with speech captured while the agent is processing
    /// ("discard" or "defer")
    pub gate_policy: Option<String>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Sidecar base URL
    pub url: Option<String>,
    /// Batch engine: "sidecar" (default), "whisper" or "deepgram"
    pub provider: Option<String>,
    /// Model for hosted engines
    pub cloud_model: Option<String>,
    /// Use the chunked streaming endpoints first
    pub streaming: Option<bool>,
    /// Streaming chunk length in milliseconds
    pub chunk_ms: Option<u64>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// Request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// Sidecar base URL
    pub url: Option<String>,
    /// Voice identifier (e.g. "`af_heart`")
    pub voice: Option<String>,
    /// Speed multiplier
    pub speed: Option<f32>,
    /// Ask the engine to trim leading and trailing silence
    pub trim_silence: Option<bool>,
    /// Cache directory
    pub cache_dir: Option<String>,
    /// Cache capacity in entries (0 disables the cache)
    pub cache_capacity: Option<usize>,
    /// Directory for generated artifacts
    pub artifact_dir: Option<String>,
    /// Cloud fallback provider ("openai" or "elevenlabs")
    pub fallback: Option<String>,
    /// Cloud fallback model
    pub fallback_model: Option<String>,
    /// Cloud fallback voice
    pub fallback_voice: Option<String>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// Request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    /// API key (prefer the `VOICECALL_LLM_API_KEY` env var)
    pub api_key: Option<String>,
    /// Request streamed replies first
    pub streaming: Option<bool>,
    /// History turns sent per request
    pub context_turns: Option<usize>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion length cap
    pub max_tokens: Option<u32>,
    /// Request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Synthesis pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    /// Maximum artifacts concatenated into one playback
    pub batch_size: Option<usize>,
    /// Play the first sentence alone to cut latency
    pub first_bypass: Option<bool>,
    /// Drain deadline in seconds
    pub drain_timeout_secs: Option<u64>,
    /// Playback worker poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// Consecutive no-progress drain checks before a forced cleanup
    pub stall_checks: Option<u32>,
}

/// Call script configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// System prompt text
    pub system_prompt: Option<String>,
    /// File holding the system prompt; wins over `system_prompt`
    pub system_prompt_file: Option<String>,
    /// Spoken before listening
    pub opening_phrase: Option<String>,
    /// Phrases that end the call without a model request
    pub termination_phrases: Option<Vec<String>>,
    /// Spoken when the call ends
    pub closing_phrase: Option<String>,
    /// Spoken when no reply could be produced
    pub apology_phrase: Option<String>,
    /// History turns retained
    pub history_cap: Option<usize>,
    /// End the call once coverage has been answered
    pub end_on_coverage: Option<bool>,
}

/// Circuit breaker configuration
#[derive(Debug, Default, Deserialize)]
pub struct BreakerFileConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: Option<u32>,
    /// Cooldown in seconds
    pub cooldown_secs: Option<u64>,
}

/// Retry configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,
    /// Initial backoff in milliseconds
    pub base_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds
    pub max_delay_ms: Option<u64>,
}

/// One supervised sidecar
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceFileConfig {
    /// Name used in logs ("stt", "tts")
    pub name: String,
    /// Script or binary to launch
    pub program: String,
    /// Extra arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Host the service binds
    pub host: Option<String>,
    /// Port the service binds
    pub port: u16,
    /// Extra environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Startup deadline in seconds
    pub startup_timeout_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `VoicecallConfigFile::default()` if the file doesn't exist or
/// can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VoicecallConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VoicecallConfigFile::default();
    };

    if !path.exists() {
        return VoicecallConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoicecallConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoicecallConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is invalid or a field has the wrong type
pub fn parse_config(content: &str) -> crate::Result<VoicecallConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/voicecall/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicecall").join("config.toml"))
}
