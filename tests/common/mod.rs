//! Shared test utilities

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use voicecall_agent::conversation::{PromptContext, TurnMetadata};
use voicecall_agent::llm::{LanguageModel, LlmEvent, Reply};
use voicecall_agent::speech::{SpeechService, Transcript};
use voicecall_agent::supervisor::ManagedProcess;
use voicecall_agent::synthesis::Synthesizer;
use voicecall_agent::voice::{AudioArtifact, AudioSink, AudioSource, SAMPLE_RATE, Utterance};
use voicecall_agent::{Error, Result};

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// An utterance of `secs` of tone, for feeding a coordinator directly
pub fn utterance(secs: f32) -> Utterance {
    let now = chrono::Utc::now();
    Utterance {
        id: uuid::Uuid::new_v4(),
        started_at: now,
        ended_at: now,
        samples: generate_sine_samples(220.0, secs, 0.4),
        sample_rate: SAMPLE_RATE,
    }
}

/// Audio source replaying fixed samples window by window, then ending
pub struct ScriptedSource {
    samples: VecDeque<f32>,
    pace: Duration,
}

impl ScriptedSource {
    /// Replay `samples` as fast as they are read
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
            pace: Duration::ZERO,
        }
    }

    /// Sleep this long per window, like a real device
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

impl AudioSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn read_window(&mut self, len: usize) -> Result<Option<Vec<f32>>> {
        if self.samples.len() < len {
            return Ok(None);
        }
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
        Ok(Some(self.samples.drain(..len).collect()))
    }
}

/// Speech service returning scripted transcripts in order
#[derive(Default)]
pub struct ScriptedSpeech {
    transcripts: Mutex<VecDeque<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedSpeech {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| (*t).to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpeechService for ScriptedSpeech {
    fn name(&self) -> &str {
        "scripted-stt"
    }

    async fn health(&self) -> Result<bool> {
        Ok(true)
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Stt("script exhausted".to_string()))?;
        Ok(Transcript {
            text,
            duration: utterance.duration(),
            confidence: Some(0.9),
            partial: false,
        })
    }
}

/// One scripted model turn
#[derive(Clone)]
pub enum ScriptedTurn {
    /// Stream these fragments, then finish with the metadata
    Stream(Vec<String>, Option<TurnMetadata>),
    /// Stream fails to open; batch returns this reply
    Batch(Reply),
    /// Both paths fail
    Fail,
}

/// Language model replaying scripted turns
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    current: Mutex<Option<ScriptedTurn>>,
    pub stream_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub contexts: Mutex<Vec<PromptContext>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            current: Mutex::new(None),
            stream_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst) + self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted-llm"
    }

    async fn complete(&self, context: &PromptContext) -> Result<Reply> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());
        // a batch call follows the failed stream of the same turn
        let turn = self
            .current
            .lock()
            .unwrap()
            .take()
            .or_else(|| self.turns.lock().unwrap().pop_front());
        match turn {
            Some(ScriptedTurn::Batch(reply)) => Ok(reply),
            _ => Err(Error::Llm("no batch reply scripted".to_string())),
        }
    }

    async fn stream(&self, context: &PromptContext) -> Result<mpsc::Receiver<LlmEvent>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(ScriptedTurn::Stream(fragments, metadata)) => {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    for fragment in fragments {
                        if tx.send(LlmEvent::TextFragment(fragment)).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    let _ = tx.send(LlmEvent::Done { metadata }).await;
                });
                Ok(rx)
            }
            other => {
                *self.current.lock().unwrap() = other;
                Err(Error::ServiceUnavailable("stream refused".to_string()))
            }
        }
    }
}

/// Synthesizer with per-text delays; texts starting with "FAIL" error
#[derive(Default)]
pub struct DelayedSynthesizer {
    delays: HashMap<String, Duration>,
    pub calls: AtomicUsize,
}

impl DelayedSynthesizer {
    pub fn new(delays: &[(&str, u64)]) -> Self {
        Self {
            delays: delays
                .iter()
                .map(|(t, ms)| ((*t).to_string(), Duration::from_millis(*ms)))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delays(delays: HashMap<String, Duration>) -> Self {
        Self {
            delays,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Synthesizer for DelayedSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.get(text).copied().unwrap_or_default();
        tokio::time::sleep(delay).await;
        if text.starts_with("FAIL") {
            return Err(Error::Tts("scripted failure".to_string()));
        }
        // the path carries the text so sinks can report what played
        Ok(AudioArtifact::persistent(text.into(), Duration::from_millis(1)))
    }
}

/// Sink recording what was played; optionally flags speech while playing
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub groups: Arc<Mutex<Vec<Vec<String>>>>,
    pub play_time: Duration,
}

impl RecordingSink {
    pub fn played(&self) -> Vec<String> {
        self.groups.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&mut self, group: &[AudioArtifact]) -> Result<()> {
        if !self.play_time.is_zero() {
            tokio::time::sleep(self.play_time).await;
        }
        self.groups
            .lock()
            .unwrap()
            .push(group.iter().map(|a| a.path.display().to_string()).collect());
        Ok(())
    }
}

/// Managed process whose health is controlled by the test
pub struct FakeProcess {
    pub name: String,
    pub healthy: Arc<AtomicBool>,
    pub spawns: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
    pub kills: Arc<AtomicUsize>,
    pub ignores_terminate: bool,
    running: bool,
}

impl FakeProcess {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: Arc::new(AtomicBool::new(true)),
            spawns: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
            ignores_terminate: false,
            running: false,
        }
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        8000
    }

    async fn spawn(&mut self) -> Result<Option<u32>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.running = true;
        Ok(Some(4242))
    }

    async fn probe(&self) -> Result<bool> {
        if !self.running {
            return Err(Error::ServiceUnavailable("not running".to_string()));
        }
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignores_terminate {
            self.running = false;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.running = false;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }
}
