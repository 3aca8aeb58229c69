//! Silence-gated utterance recorder
//!
//! Reads fixed-size windows from an [`AudioSource`] on a dedicated OS thread,
//! classifies each with a [`VoiceActivityDetector`], and emits an
//! [`Utterance`] once trailing silence exceeds the configured threshold.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::AudioSource;
use super::audio::{duration_of, samples_for, samples_to_wav};
use super::gate::ListenGate;
use super::vad::VoiceActivityDetector;
use crate::retry::{RetryPolicy, delay_for_attempt};
use crate::{Error, Result};

/// A completed span of user speech
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Unique id for log correlation
    pub id: Uuid,
    /// When speech began
    pub started_at: DateTime<Utc>,
    /// When the trailing silence threshold was reached
    pub ended_at: DateTime<Utc>,
    /// Mono samples
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

impl Utterance {
    /// Audio length
    #[must_use]
    pub fn duration(&self) -> Duration {
        duration_of(self.samples.len(), self.sample_rate)
    }

    /// Encode as WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }

    /// Write to a temporary WAV file that is deleted when the path drops
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub fn to_temp_wav(&self) -> Result<tempfile::TempPath> {
        let file = tempfile::Builder::new()
            .prefix("utterance-")
            .suffix(".wav")
            .tempfile()?;
        std::fs::write(file.path(), self.to_wav()?)?;
        Ok(file.into_temp_path())
    }
}

/// What to do with speech captured while the agent is busy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    /// Drop audio while the gate is closed
    #[default]
    Discard,
    /// Hold utterances captured while processing and hand them over once the
    /// gate reopens; audio captured while the agent speaks is still dropped
    Defer,
}

/// Window sizes in samples
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    /// Trailing silence that ends an utterance
    pub silence: usize,
    /// Utterances with less voiced audio are dropped
    pub min_speech: usize,
    /// Utterances are force-finalized at this length
    pub max_speech: usize,
}

/// Result of feeding one window to the detector
#[derive(Debug, PartialEq)]
pub enum DetectorEvent {
    /// Nothing to report
    Pending,
    /// Silence turned into speech
    SpeechStarted,
    /// Utterance complete
    Completed {
        /// Buffered samples
        samples: Vec<f32>,
        /// Time of the first voiced window
        started_at: DateTime<Utc>,
        /// Ended by the max-length cap rather than silence
        forced: bool,
    },
    /// Utterance ended but was shorter than the minimum
    Discarded,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Speaking {
        started_at: DateTime<Utc>,
        silence_run: usize,
        voiced: usize,
    },
}

/// Silence-countdown state machine, independent of any device
#[derive(Debug)]
pub struct UtteranceDetector {
    settings: DetectorSettings,
    phase: Phase,
    buffer: Vec<f32>,
}

impl UtteranceDetector {
    /// Detector in the idle state
    #[must_use]
    pub const fn new(settings: DetectorSettings) -> Self {
        Self {
            settings,
            phase: Phase::Idle,
            buffer: Vec::new(),
        }
    }

    /// Whether speech is currently being buffered
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        matches!(self.phase, Phase::Speaking { .. })
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.buffer.clear();
    }

    /// Feed one classified window
    pub fn push(&mut self, window: &[f32], is_speech: bool, now: DateTime<Utc>) -> DetectorEvent {
        match &mut self.phase {
            Phase::Idle => {
                if !is_speech {
                    return DetectorEvent::Pending;
                }
                self.buffer.clear();
                self.buffer.extend_from_slice(window);
                self.phase = Phase::Speaking {
                    started_at: now,
                    silence_run: 0,
                    voiced: window.len(),
                };
                DetectorEvent::SpeechStarted
            }
            Phase::Speaking {
                started_at,
                silence_run,
                voiced,
            } => {
                self.buffer.extend_from_slice(window);
                if is_speech {
                    *silence_run = 0;
                    *voiced += window.len();
                } else {
                    *silence_run += window.len();
                }

                let started_at = *started_at;
                let voiced = *voiced;
                let silence_done = *silence_run >= self.settings.silence;
                let forced = !silence_done && self.buffer.len() >= self.settings.max_speech;

                if !silence_done && !forced {
                    return DetectorEvent::Pending;
                }

                let samples = std::mem::take(&mut self.buffer);
                self.phase = Phase::Idle;

                if voiced < self.settings.min_speech {
                    return DetectorEvent::Discarded;
                }
                DetectorEvent::Completed {
                    samples,
                    started_at,
                    forced,
                }
            }
        }
    }
}

/// Recorder timing settings
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Capture window length
    pub window: Duration,
    /// Trailing silence that ends an utterance
    pub silence_threshold: Duration,
    /// Minimum voiced audio for an utterance to count
    pub min_speech: Duration,
    /// Force-finalize length
    pub max_speech: Duration,
    /// Ambient sampling on start; zero skips calibration
    pub calibration: Duration,
    /// Behavior while the agent is busy
    pub gate_policy: GatePolicy,
    /// Backoff for device read failures
    pub read_retry: RetryPolicy,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(30),
            silence_threshold: Duration::from_millis(1200),
            min_speech: Duration::from_millis(300),
            max_speech: Duration::from_secs(30),
            calibration: Duration::from_secs(1),
            gate_policy: GatePolicy::Discard,
            read_retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

impl RecorderSettings {
    fn detector_settings(&self, sample_rate: u32) -> DetectorSettings {
        DetectorSettings {
            silence: samples_for(self.silence_threshold, sample_rate).max(1),
            min_speech: samples_for(self.min_speech, sample_rate),
            max_speech: samples_for(self.max_speech, sample_rate).max(1),
        }
    }
}

/// Recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Windows read
    pub windows: u64,
    /// Windows classified as speech
    pub speech_windows: u64,
    /// Windows dropped by the gate
    pub gated_windows: u64,
    /// Utterances handed to the coordinator
    pub utterances_emitted: u64,
    /// Utterances dropped as too short or gated
    pub utterances_discarded: u64,
    /// Device read failures
    pub read_failures: u64,
    /// VAD failures (treated as speech)
    pub vad_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    windows: AtomicU64,
    speech_windows: AtomicU64,
    gated_windows: AtomicU64,
    utterances_emitted: AtomicU64,
    utterances_discarded: AtomicU64,
    read_failures: AtomicU64,
    vad_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            windows: self.windows.load(Ordering::Relaxed),
            speech_windows: self.speech_windows.load(Ordering::Relaxed),
            gated_windows: self.gated_windows.load(Ordering::Relaxed),
            utterances_emitted: self.utterances_emitted.load(Ordering::Relaxed),
            utterances_discarded: self.utterances_discarded.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            vad_failures: self.vad_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Sample `duration` of ambient audio from `source` and calibrate `vad`
///
/// # Errors
///
/// Returns error if the source fails or ends before any audio is read
pub fn calibrate_vad<S: AudioSource + ?Sized>(
    source: &mut S,
    vad: &mut dyn VoiceActivityDetector,
    window: Duration,
    duration: Duration,
) -> Result<usize> {
    let rate = source.sample_rate();
    let window_len = samples_for(window, rate).max(1);
    let target = samples_for(duration, rate);
    let mut ambient = Vec::with_capacity(target);

    while ambient.len() < target {
        match source.read_window(window_len)? {
            Some(w) => ambient.extend(w),
            None => break,
        }
    }

    if ambient.is_empty() {
        return Err(Error::Audio("no audio available for calibration".to_string()));
    }
    vad.calibrate(&ambient);
    Ok(ambient.len())
}

/// Captures utterances on a background thread
pub struct SilenceGatedRecorder {
    settings: RecorderSettings,
    gate: ListenGate,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl SilenceGatedRecorder {
    /// Recorder gated by `gate`
    #[must_use]
    pub fn new(settings: RecorderSettings, gate: ListenGate) -> Self {
        Self {
            settings,
            gate,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            thread: None,
        }
    }

    /// Start capturing
    ///
    /// The source is constructed on the recorder thread since device streams
    /// are usually not `Send`. The returned channel closes when the recorder
    /// stops or the source ends.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder is already running or the thread cannot
    /// be spawned
    pub fn start<S, F, V>(&mut self, make_source: F, vad: V) -> Result<mpsc::UnboundedReceiver<Utterance>>
    where
        S: AudioSource,
        F: FnOnce() -> Result<S> + Send + 'static,
        V: VoiceActivityDetector + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Audio("recorder already running".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            settings: self.settings.clone(),
            gate: self.gate.clone(),
            running: Arc::clone(&self.running),
            counters: Arc::clone(&self.counters),
            tx,
        };

        let handle = std::thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || worker.run(make_source, vad))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Audio(format!("failed to spawn recorder thread: {e}"))
            })?;

        self.thread = Some(handle);
        Ok(rx)
    }

    /// Stop capturing; a partially buffered utterance is discarded
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("recorder thread panicked");
            }
            tracing::debug!("recorder stopped");
        }
    }

    /// Whether the capture thread is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.counters.snapshot()
    }
}

impl Drop for SilenceGatedRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    settings: RecorderSettings,
    gate: ListenGate,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    tx: mpsc::UnboundedSender<Utterance>,
}

impl Worker {
    fn run<S, F, V>(self, make_source: F, mut vad: V)
    where
        S: AudioSource,
        F: FnOnce() -> Result<S>,
        V: VoiceActivityDetector,
    {
        let mut source = match make_source() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to open audio source");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let rate = source.sample_rate();
        if !self.settings.calibration.is_zero() {
            if let Err(e) =
                calibrate_vad(&mut source, &mut vad, self.settings.window, self.settings.calibration)
            {
                tracing::warn!(error = %e, "calibration failed, using default threshold");
            }
        }

        let window_len = samples_for(self.settings.window, rate).max(1);
        let mut detector = UtteranceDetector::new(self.settings.detector_settings(rate));
        let mut deferred: VecDeque<Utterance> = VecDeque::new();
        let mut read_attempt = 0u32;

        tracing::debug!(sample_rate = rate, window_len, policy = ?self.settings.gate_policy, "recorder started");

        while self.running.load(Ordering::SeqCst) {
            if self.gate.is_open() {
                while let Some(utterance) = deferred.pop_front() {
                    tracing::debug!(id = %utterance.id, "re-offering deferred utterance");
                    self.emit(utterance);
                }
            }

            let window = match source.read_window(window_len) {
                Ok(Some(w)) => {
                    read_attempt = 0;
                    w
                }
                Ok(None) => {
                    tracing::debug!("audio source ended");
                    break;
                }
                Err(e) => {
                    bump(&self.counters.read_failures);
                    let delay = delay_for_attempt(&self.settings.read_retry, read_attempt);
                    if read_attempt >= self.settings.read_retry.max_retries {
                        tracing::error!(error = %e, attempt = read_attempt, ?delay, "audio read keeps failing");
                    } else {
                        tracing::warn!(error = %e, attempt = read_attempt, ?delay, "audio read failed, retrying");
                    }
                    read_attempt = read_attempt.saturating_add(1);
                    std::thread::sleep(delay);
                    continue;
                }
            };
            bump(&self.counters.windows);

            let speaking = self.gate.agent_speaking();
            let processing = self.gate.agent_processing();
            let hold = processing && !speaking && self.settings.gate_policy == GatePolicy::Defer;

            if (speaking || processing) && !hold {
                bump(&self.counters.gated_windows);
                if detector.in_speech() {
                    tracing::trace!("gate closed, dropping partial utterance");
                    detector.reset();
                }
                continue;
            }

            let is_speech = match vad.classify(&window) {
                Ok(v) => v,
                Err(e) => {
                    bump(&self.counters.vad_failures);
                    tracing::warn!(error = %e, "vad failed, treating window as speech");
                    true
                }
            };
            if is_speech {
                bump(&self.counters.speech_windows);
            }

            match detector.push(&window, is_speech, Utc::now()) {
                DetectorEvent::Pending => {}
                DetectorEvent::SpeechStarted => tracing::trace!("speech started"),
                DetectorEvent::Discarded => {
                    bump(&self.counters.utterances_discarded);
                    tracing::debug!("utterance below minimum speech duration, dropped");
                }
                DetectorEvent::Completed {
                    samples,
                    started_at,
                    forced,
                } => {
                    let utterance = Utterance {
                        id: Uuid::new_v4(),
                        started_at,
                        ended_at: Utc::now(),
                        samples,
                        sample_rate: rate,
                    };
                    tracing::debug!(
                        id = %utterance.id,
                        duration = ?utterance.duration(),
                        forced,
                        "utterance complete"
                    );
                    self.deliver(utterance, &mut deferred);
                }
            }
        }

        if detector.in_speech() {
            tracing::debug!("discarding partial utterance on stop");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Emit a finished utterance, or apply the gate policy if the gate
    /// closed while it was being captured
    fn deliver(&self, utterance: Utterance, deferred: &mut VecDeque<Utterance>) {
        if self.gate.is_open() {
            self.emit(utterance);
        } else if self.settings.gate_policy == GatePolicy::Defer {
            deferred.push_back(utterance);
        } else {
            bump(&self.counters.utterances_discarded);
            tracing::debug!(id = %utterance.id, "gate closed as utterance completed, dropped");
        }
    }

    fn emit(&self, utterance: Utterance) {
        if self.tx.send(utterance).is_ok() {
            bump(&self.counters.utterances_emitted);
        } else {
            bump(&self.counters.utterances_discarded);
        }
    }
}
