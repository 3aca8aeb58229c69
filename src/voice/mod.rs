//! Audio capture, utterance detection, and playback
//!
//! Device access sits behind [`AudioSource`] and [`AudioSink`]; the cpal
//! adapters are compiled only with the `device-audio` feature.

pub mod audio;
mod gate;
mod recorder;
mod vad;

#[cfg(feature = "device-audio")]
mod capture;
#[cfg(feature = "device-audio")]
mod playback;

use async_trait::async_trait;

pub use audio::{AudioArtifact, SAMPLE_RATE, samples_to_wav};
pub use gate::{AgentFlags, ListenGate};
pub use recorder::{
    DetectorEvent, DetectorSettings, GatePolicy, RecorderSettings, RecorderStats,
    SilenceGatedRecorder, Utterance, UtteranceDetector, calibrate_vad,
};
pub use vad::{DEFAULT_ENERGY_THRESHOLD, EnergyVad, VoiceActivityDetector};

#[cfg(feature = "device-audio")]
pub use capture::MicrophoneSource;
#[cfg(feature = "device-audio")]
pub use playback::SpeakerSink;

use crate::Result;

/// Blocking source of mono audio windows
pub trait AudioSource {
    /// Sample rate of produced windows
    fn sample_rate(&self) -> u32;

    /// Read exactly `len` samples, blocking until available
    ///
    /// Returns `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns error on a device read failure; callers may retry
    fn read_window(&mut self, len: usize) -> Result<Option<Vec<f32>>>;
}

/// Destination for synthesized audio
#[async_trait]
pub trait AudioSink: Send {
    /// Play a group of artifacts back-to-back as one stream
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    async fn play(&mut self, group: &[AudioArtifact]) -> Result<()>;
}
