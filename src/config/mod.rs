//! Configuration management for the voice-call agent
//!
//! Every value resolves env var → config file → default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::conversation::CoordinatorSettings;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryPolicy;
use crate::speech::{SpeechClientSettings, SttProvider};
use crate::supervisor::{DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, SidecarSpec, SupervisorSettings};
use crate::synthesis::{TtsProvider, VoiceSettings};
use crate::voice::{DEFAULT_ENERGY_THRESHOLD, GatePolicy, RecorderSettings, SAMPLE_RATE};
use crate::{Error, Result};

const DEFAULT_SYSTEM_PROMPT: &str = "You are calling a hotel front desk on behalf of a guest to confirm \
whether the hotel accepts direct billing to the guest's insurer. Be brief and polite: one or two short \
sentences per reply, suitable for speech. Never use lists or markdown. \
When replying in JSON, answer with an object {\"message\": string, \"coverage_confirmed\": true|false|null, \
\"end_conversation\": bool}. When streaming, speak the message, then write ###META followed by the same \
object without the message field.";

/// Voice-call agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Capture and utterance detection
    pub audio: AudioConfig,
    /// Speech-to-text
    pub speech: SpeechConfig,
    /// Text-to-speech
    pub synthesis: SynthesisConfig,
    /// Language model
    pub llm: LlmConfig,
    /// Synthesis queue
    pub pipeline: PipelineSettings,
    /// Call script
    pub conversation: ConversationConfig,
    /// Breaker threshold and cooldown
    pub breaker: BreakerConfig,
    /// Retry policy for sidecar calls
    pub retry: RetryPolicy,
    /// Supervised sidecars
    pub services: Vec<ServiceConfig>,
    /// Data directory for artifacts and cache
    pub data_dir: PathBuf,
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate
    pub sample_rate: u32,
    /// Recorder timing
    pub recorder: RecorderSettings,
    /// Fixed VAD threshold; `None` calibrates on start
    pub energy_threshold: Option<f32>,
    /// Multiplier over ambient energy when calibrating
    pub threshold_multiplier: f32,
}

/// Which engine transcribes batch utterances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechProvider {
    /// Local HTTP sidecar
    Sidecar,
    /// Hosted engine
    Cloud(SttProvider),
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Sidecar base URL, always ending in `/`
    pub url: String,
    /// Batch engine
    pub provider: SpeechProvider,
    /// Model for hosted engines
    pub cloud_model: String,
    /// API key for hosted engines
    pub api_key: Option<SecretString>,
    /// Try the streaming endpoints first
    pub streaming: bool,
    /// Chunk length and retry policy
    pub client: SpeechClientSettings,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

/// Hosted fallback synthesis engine
#[derive(Debug, Clone)]
pub struct FallbackTts {
    /// Provider
    pub provider: TtsProvider,
    /// API key
    pub api_key: SecretString,
    /// Model
    pub model: String,
    /// Voice on the hosted engine
    pub voice: String,
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Sidecar base URL, always ending in `/`
    pub url: String,
    /// Voice applied to every request
    pub voice: VoiceSettings,
    /// Cache directory
    pub cache_dir: PathBuf,
    /// Cache entries; 0 disables the cache
    pub cache_capacity: usize,
    /// Where generated artifacts are written
    pub artifact_dir: PathBuf,
    /// Hosted fallback, when configured with a key
    pub fallback: Option<FallbackTts>,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, always ending in `/`
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Bearer key
    pub api_key: Option<SecretString>,
    /// Request streamed replies first
    pub streaming: bool,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion length cap
    pub max_tokens: u32,
    /// Request timeout
    pub request_timeout: Duration,
}

/// Call script configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Coordinator settings (prompt, phrases, history)
    pub coordinator: CoordinatorSettings,
    /// End the call once coverage has been answered
    pub end_on_coverage: bool,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time the breaker stays open
    pub cooldown: Duration,
}

/// One supervised sidecar
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Launch description
    pub spec: SidecarSpec,
    /// Startup deadline
    pub startup_timeout: Duration,
}

impl ServiceConfig {
    /// Supervisor settings for this service
    #[must_use]
    pub fn supervisor_settings(&self, breaker: BreakerConfig) -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: self.startup_timeout,
            failure_threshold: breaker.failure_threshold,
            cooldown: breaker.cooldown,
            ..SupervisorSettings::default()
        }
    }
}

/// Ensure a base URL ends with `/` so relative joins keep its path
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn parse_url(what: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("invalid {what} URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!("{what} URL must be http or https: {raw}")));
    }
    Ok(url)
}

fn parse_gate_policy(raw: &str) -> Option<GatePolicy> {
    match raw.trim().to_lowercase().as_str() {
        "discard" => Some(GatePolicy::Discard),
        "defer" => Some(GatePolicy::Defer),
        other => {
            tracing::warn!(value = other, "unknown gate policy, using discard");
            None
        }
    }
}

fn parse_speech_provider(raw: &str) -> SpeechProvider {
    match raw.trim().to_lowercase().as_str() {
        "whisper" | "openai" => SpeechProvider::Cloud(SttProvider::Whisper),
        "deepgram" => SpeechProvider::Cloud(SttProvider::Deepgram),
        "sidecar" | "" => SpeechProvider::Sidecar,
        other => {
            tracing::warn!(value = other, "unknown speech provider, using sidecar");
            SpeechProvider::Sidecar
        }
    }
}

fn parse_tts_provider(raw: &str) -> Option<TtsProvider> {
    match raw.trim().to_lowercase().as_str() {
        "openai" => Some(TtsProvider::OpenAI),
        "elevenlabs" => Some(TtsProvider::ElevenLabs),
        other => {
            tracing::warn!(value = other, "unknown fallback TTS provider, fallback disabled");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Default data directory (`~/.local/share/voicecall` on Linux)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from(".voicecall"), |d| d.data_dir().join("voicecall"))
}

impl Config {
    /// Load from the environment and the config file at `path` (or the
    /// standard location)
    ///
    /// # Errors
    ///
    /// Returns error if a configured prompt file cannot be read
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a configured prompt file cannot be read
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: file::VoicecallConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|s| s.trim().parse::<u64>().ok());

        let data_dir = env("VOICECALL_DATA_DIR").map_or_else(default_data_dir, PathBuf::from);

        // Retry and breaker (toml > default)
        let default_retry = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: fc.retry.max_retries.unwrap_or(default_retry.max_retries),
            base_delay: fc.retry.base_delay_ms.map_or(default_retry.base_delay, ms),
            max_delay: fc.retry.max_delay_ms.map_or(default_retry.max_delay, ms),
        };
        let breaker = BreakerConfig {
            failure_threshold: fc
                .breaker
                .failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD)
                .max(1),
            cooldown: fc.breaker.cooldown_secs.map_or(DEFAULT_COOLDOWN, secs),
        };

        // Audio (env > toml > default)
        let default_recorder = RecorderSettings::default();
        let recorder = RecorderSettings {
            window: fc.audio.window_ms.map_or(default_recorder.window, ms),
            silence_threshold: env_parse("VOICECALL_SILENCE_MS")
                .or(fc.audio.silence_ms)
                .map_or(default_recorder.silence_threshold, ms),
            min_speech: fc.audio.min_speech_ms.map_or(default_recorder.min_speech, ms),
            max_speech: fc.audio.max_speech_ms.map_or(default_recorder.max_speech, ms),
            calibration: fc.audio.calibration_ms.map_or(default_recorder.calibration, ms),
            gate_policy: env("VOICECALL_GATE_POLICY")
                .or(fc.audio.gate_policy)
                .and_then(|p| parse_gate_policy(&p))
                .unwrap_or_default(),
            read_retry: default_recorder.read_retry,
        };
        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(SAMPLE_RATE),
            recorder,
            energy_threshold: env("VOICECALL_ENERGY_THRESHOLD")
                .and_then(|s| s.trim().parse().ok())
                .or(fc.audio.energy_threshold),
            threshold_multiplier: fc.audio.threshold_multiplier.unwrap_or(3.0),
        };

        // Speech (env > toml > default)
        let provider = env("VOICECALL_STT_PROVIDER")
            .or(fc.speech.provider)
            .map_or(SpeechProvider::Sidecar, |p| parse_speech_provider(&p));
        let speech_key = match provider {
            SpeechProvider::Cloud(SttProvider::Deepgram) => env("DEEPGRAM_API_KEY"),
            SpeechProvider::Cloud(SttProvider::Whisper) => env("OPENAI_API_KEY"),
            SpeechProvider::Sidecar => None,
        };
        let speech = SpeechConfig {
            url: normalize_base_url(
                &env("VOICECALL_STT_URL")
                    .or(fc.speech.url)
                    .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            ),
            provider,
            cloud_model: fc.speech.cloud_model.unwrap_or_else(|| match provider {
                SpeechProvider::Cloud(SttProvider::Deepgram) => "nova-2".to_string(),
                _ => "whisper-1".to_string(),
            }),
            api_key: speech_key.map(SecretString::from),
            streaming: env("VOICECALL_STT_STREAMING")
                .and_then(|s| parse_bool(&s))
                .or(fc.speech.streaming)
                .unwrap_or(false),
            client: SpeechClientSettings {
                chunk: fc.speech.chunk_ms.map_or(ms(500), ms),
                retry: retry.clone(),
            },
            connect_timeout: secs(fc.speech.connect_timeout_secs.unwrap_or(2)),
            request_timeout: secs(fc.speech.request_timeout_secs.unwrap_or(30)),
        };

        // Synthesis (env > toml > default)
        let fallback = fc
            .synthesis
            .fallback
            .as_deref()
            .and_then(parse_tts_provider)
            .and_then(|provider| {
                let key = match provider {
                    TtsProvider::OpenAI => env("OPENAI_API_KEY"),
                    TtsProvider::ElevenLabs => env("ELEVENLABS_API_KEY"),
                };
                let Some(key) = key else {
                    tracing::warn!(?provider, "fallback TTS configured without an API key, disabled");
                    return None;
                };
                Some(FallbackTts {
                    provider,
                    api_key: SecretString::from(key),
                    model: fc.synthesis.fallback_model.clone().unwrap_or_else(|| match provider {
                        TtsProvider::OpenAI => "tts-1".to_string(),
                        TtsProvider::ElevenLabs => "eleven_turbo_v2_5".to_string(),
                    }),
                    voice: fc.synthesis.fallback_voice.clone().unwrap_or_else(|| match provider {
                        TtsProvider::OpenAI => "alloy".to_string(),
                        TtsProvider::ElevenLabs => "21m00Tcm4TlvDq8ikWAM".to_string(),
                    }),
                })
            });
        let default_voice = VoiceSettings::default();
        let synthesis = SynthesisConfig {
            url: normalize_base_url(
                &env("VOICECALL_TTS_URL")
                    .or(fc.synthesis.url)
                    .unwrap_or_else(|| "http://127.0.0.1:8001".to_string()),
            ),
            voice: VoiceSettings {
                voice: env("VOICECALL_TTS_VOICE")
                    .or(fc.synthesis.voice)
                    .unwrap_or(default_voice.voice),
                speed: fc.synthesis.speed.unwrap_or(default_voice.speed).clamp(0.25, 4.0),
                trim_silence: fc.synthesis.trim_silence.unwrap_or(default_voice.trim_silence),
            },
            cache_dir: fc
                .synthesis
                .cache_dir
                .map_or_else(|| data_dir.join("tts-cache"), PathBuf::from),
            cache_capacity: fc.synthesis.cache_capacity.unwrap_or(256),
            artifact_dir: fc
                .synthesis
                .artifact_dir
                .map_or_else(|| data_dir.join("artifacts"), PathBuf::from),
            fallback,
            connect_timeout: secs(fc.synthesis.connect_timeout_secs.unwrap_or(2)),
            request_timeout: secs(fc.synthesis.request_timeout_secs.unwrap_or(30)),
        };

        // LLM (env > toml > default)
        let llm = LlmConfig {
            base_url: normalize_base_url(
                &env("VOICECALL_LLM_BASE_URL")
                    .or(fc.llm.base_url)
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            ),
            model: env("VOICECALL_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: env("VOICECALL_LLM_API_KEY")
                .or_else(|| env("OPENAI_API_KEY"))
                .or(fc.llm.api_key)
                .map(SecretString::from),
            streaming: env("VOICECALL_LLM_STREAMING")
                .and_then(|s| parse_bool(&s))
                .or(fc.llm.streaming)
                .unwrap_or(true),
            temperature: fc.llm.temperature.unwrap_or(0.4),
            max_tokens: fc.llm.max_tokens.unwrap_or(300),
            request_timeout: secs(fc.llm.request_timeout_secs.unwrap_or(30)),
        };

        // Pipeline (toml > default)
        let default_pipeline = PipelineSettings::default();
        let pipeline = PipelineSettings {
            batch_size: fc.pipeline.batch_size.unwrap_or(default_pipeline.batch_size).max(1),
            first_bypass: fc.pipeline.first_bypass.unwrap_or(default_pipeline.first_bypass),
            poll_interval: fc.pipeline.poll_interval_ms.map_or(default_pipeline.poll_interval, ms),
            drain_check_interval: default_pipeline.drain_check_interval,
            stall_checks: fc.pipeline.stall_checks.unwrap_or(default_pipeline.stall_checks).max(1),
            drain_timeout: fc.pipeline.drain_timeout_secs.map_or(default_pipeline.drain_timeout, secs),
        };

        // Conversation (env > toml > default)
        let prompt_file = env("VOICECALL_SYSTEM_PROMPT_FILE").or(fc.conversation.system_prompt_file);
        let system_prompt = match prompt_file {
            Some(path) => std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("cannot read system prompt {path}: {e}")))?,
            None => fc
                .conversation
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };
        let default_coordinator = CoordinatorSettings::default();
        let history_cap = fc
            .conversation
            .history_cap
            .unwrap_or(default_coordinator.history_cap)
            .max(2);
        let conversation = ConversationConfig {
            coordinator: CoordinatorSettings {
                system_prompt,
                opening_phrase: fc.conversation.opening_phrase.filter(|s| !s.trim().is_empty()),
                termination_phrases: fc
                    .conversation
                    .termination_phrases
                    .unwrap_or(default_coordinator.termination_phrases),
                closing_phrase: fc
                    .conversation
                    .closing_phrase
                    .unwrap_or(default_coordinator.closing_phrase),
                apology_phrase: fc
                    .conversation
                    .apology_phrase
                    .unwrap_or(default_coordinator.apology_phrase),
                history_cap,
                context_turns: fc.llm.context_turns.unwrap_or(default_coordinator.context_turns),
                streaming: llm.streaming,
                min_transcript_chars: default_coordinator.min_transcript_chars,
            },
            end_on_coverage: fc.conversation.end_on_coverage.unwrap_or(false),
        };

        // Sidecars (toml only)
        let services = fc
            .services
            .into_iter()
            .map(|s| ServiceConfig {
                spec: SidecarSpec {
                    name: s.name,
                    program: PathBuf::from(s.program),
                    args: s.args,
                    host: s.host.unwrap_or_else(|| "127.0.0.1".to_string()),
                    port: s.port,
                    env: s.env.into_iter().collect(),
                },
                startup_timeout: s.startup_timeout_secs.map_or(secs(30), secs),
            })
            .collect();

        Ok(Self {
            audio,
            speech,
            synthesis,
            llm,
            pipeline,
            conversation,
            breaker,
            retry,
            services,
            data_dir,
        })
    }

    /// Reject configuration that cannot work, before anything starts
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        self.speech_url()?;
        self.synthesis_url()?;
        self.llm_url()?;

        if self.audio.sample_rate < 8000 {
            return Err(Error::Config(format!("sample rate too low: {}", self.audio.sample_rate)));
        }
        let r = &self.audio.recorder;
        if r.window.is_zero() || r.window > r.silence_threshold {
            return Err(Error::Config("audio window must be non-zero and shorter than the silence threshold".to_string()));
        }
        if r.min_speech >= r.max_speech {
            return Err(Error::Config("min speech must be shorter than max speech".to_string()));
        }
        if let Some(threshold) = self.audio.energy_threshold {
            if !(threshold.is_finite() && threshold > 0.0) {
                return Err(Error::Config(format!("invalid energy threshold {threshold}")));
            }
        }
        if matches!(self.speech.provider, SpeechProvider::Cloud(_)) && self.speech.api_key.is_none() {
            return Err(Error::Config("hosted speech provider needs an API key".to_string()));
        }

        let mut names = std::collections::HashSet::new();
        for service in &self.services {
            let spec = &service.spec;
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Config(format!("duplicate service name {}", spec.name)));
            }
            if spec.port == 0 {
                return Err(Error::Config(format!("{}: port must be set", spec.name)));
            }
            let is_script = spec
                .program
                .extension()
                .is_some_and(|ext| matches!(ext.to_str(), Some("py" | "js" | "sh")));
            if is_script && !spec.program.exists() {
                return Err(Error::Config(format!(
                    "{}: script not found: {}",
                    spec.name,
                    spec.program.display()
                )));
            }
            if !is_script && which::which(&spec.program).is_err() {
                return Err(Error::Config(format!(
                    "{}: program not found: {}",
                    spec.name,
                    spec.program.display()
                )));
            }
        }
        Ok(())
    }

    /// Parsed speech sidecar URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid
    pub fn speech_url(&self) -> Result<Url> {
        parse_url("speech", &self.speech.url)
    }

    /// Parsed synthesis sidecar URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid
    pub fn synthesis_url(&self) -> Result<Url> {
        parse_url("synthesis", &self.synthesis.url)
    }

    /// Parsed language-model base URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid
    pub fn llm_url(&self) -> Result<Url> {
        parse_url("llm", &self.llm.base_url)
    }

    /// Energy threshold to start the VAD with
    #[must_use]
    pub fn initial_threshold(&self) -> f32 {
        self.audio.energy_threshold.unwrap_or(DEFAULT_ENERGY_THRESHOLD)
    }

    /// Recorder settings, with calibration skipped when a fixed threshold is set
    #[must_use]
    pub fn recorder_settings(&self) -> RecorderSettings {
        let mut settings = self.audio.recorder.clone();
        if self.audio.energy_threshold.is_some() {
            settings.calibration = Duration::ZERO;
        }
        settings
    }
}
