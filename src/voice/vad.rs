//! Voice activity detection

use super::audio::rms;
use crate::{Error, Result};

/// Default energy threshold before calibration
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 0.03;

/// Calibrated threshold never drops below this
const MIN_ENERGY_THRESHOLD: f32 = 0.005;

/// Classifies a window of audio as speech or silence
pub trait VoiceActivityDetector: Send {
    /// Whether `window` contains speech
    ///
    /// # Errors
    ///
    /// Returns error if the window cannot be classified
    fn classify(&mut self, window: &[f32]) -> Result<bool>;

    /// Adapt to the ambient noise level measured over `ambient`
    fn calibrate(&mut self, ambient: &[f32]);
}

/// RMS energy detector with a calibratable threshold
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
    multiplier: f32,
}

impl EnergyVad {
    /// Detector with an explicit threshold
    ///
    /// `multiplier` scales the ambient baseline on calibration.
    #[must_use]
    pub const fn new(threshold: f32, multiplier: f32) -> Self {
        Self {
            threshold,
            multiplier,
        }
    }

    /// Current speech threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_ENERGY_THRESHOLD, 3.0)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, window: &[f32]) -> Result<bool> {
        if window.iter().any(|s| !s.is_finite()) {
            return Err(Error::Vad("non-finite sample in window".to_string()));
        }
        let energy = rms(window);
        Ok(energy > self.threshold)
    }

    fn calibrate(&mut self, ambient: &[f32]) {
        if ambient.is_empty() {
            return;
        }
        let baseline = rms(ambient);
        let previous = self.threshold;
        self.threshold = (baseline * self.multiplier).max(MIN_ENERGY_THRESHOLD);
        tracing::info!(baseline, previous, threshold = self.threshold, "vad calibrated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_not_speech() {
        let mut vad = EnergyVad::default();
        assert!(!vad.classify(&[0.0; 480]).unwrap());
    }

    #[test]
    fn loud_window_is_speech() {
        let mut vad = EnergyVad::default();
        assert!(vad.classify(&[0.3; 480]).unwrap());
    }

    #[test]
    fn calibration_raises_threshold_above_noise() {
        let mut vad = EnergyVad::new(0.01, 3.0);
        vad.calibrate(&[0.02; 1600]);

        assert!((vad.threshold() - 0.06).abs() < 1e-4);
        assert!(!vad.classify(&[0.04; 480]).unwrap());
        assert!(vad.classify(&[0.1; 480]).unwrap());
    }

    #[test]
    fn calibration_respects_floor() {
        let mut vad = EnergyVad::new(0.03, 3.0);
        vad.calibrate(&[0.0; 1600]);
        assert!((vad.threshold() - MIN_ENERGY_THRESHOLD).abs() < f32::EPSILON);
    }

    #[test]
    fn nan_window_is_an_error() {
        let mut vad = EnergyVad::default();
        assert!(vad.classify(&[f32::NAN; 4]).is_err());
    }
}
