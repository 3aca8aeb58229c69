//! Voicecall Agent - autonomous spoken conversations over local audio
//!
//! This library provides the call runtime:
//! - Silence-gated capture with voice activity detection
//! - Speech-to-text and text-to-speech sidecar clients with breakers and fallbacks
//! - Streamed language-model replies split into sentences
//! - Ordered, concurrent synthesis with gapless playback
//! - Sidecar process supervision
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   Utterance   ┌──────────────┐  Transcript  ┌──────────────────┐
//! │ Recorder │──────────────▶│ SpeechClient │─────────────▶│ TurnCoordinator  │
//! └────▲─────┘               └──────────────┘              └───┬──────────▲───┘
//!      │ ListenGate                                 LlmEvent   │          │
//!      │                     ┌──────────────┐  SentenceUnit ┌──▼───────┐  │
//!      └─────────────────────│ AgentFlags   │               │ LLM +    │  │
//!                            └──────────────┘               │ Segmenter│  │
//!                                                           └──┬───────┘  │
//!                  ┌─────────────────┐   AudioArtifact   ┌─────▼──────┐   │
//!                  │ SynthesisClient │◀──────────────────│ Synthesis  │───┘
//!                  │ cache, fallback │──────────────────▶│ Pipeline   │ drained
//!                  └─────────────────┘                   └────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod speech;
pub mod supervisor;
pub mod synthesis;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
