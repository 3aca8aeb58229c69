//! Sidecar resilience tests
//!
//! Breakers, the phrase cache and supervisor lifecycle against fakes.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

use voicecall_agent::retry::RetryPolicy;
use voicecall_agent::speech::{SpeechClient, SpeechClientSettings};
use voicecall_agent::supervisor::{CircuitBreaker, HealthStatus, ServiceSupervisor, SupervisorSettings};
use voicecall_agent::synthesis::{
    SynthesisCache, SynthesisClient, SynthesisHealth, SynthesisRequest, SynthesisService, Synthesizer, VoiceSettings,
};
use voicecall_agent::voice::audio::write_wav;
use voicecall_agent::voice::{AudioArtifact, SAMPLE_RATE};
use voicecall_agent::{Error, Result};

mod common;

use common::{FakeProcess, ScriptedSpeech};

/// Engine writing a short tone per request, or refusing while `down`
struct ToneEngine {
    dir: PathBuf,
    calls: AtomicUsize,
    down: AtomicBool,
}

impl ToneEngine {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            calls: AtomicUsize::new(0),
            down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SynthesisService for ToneEngine {
    fn name(&self) -> &str {
        "tone"
    }

    fn trims_silence(&self) -> bool {
        true
    }

    async fn health(&self) -> Result<SynthesisHealth> {
        let ready = !self.down.load(Ordering::SeqCst);
        Ok(SynthesisHealth {
            ready,
            model_loaded: ready,
        })
    }

    async fn synthesize(&self, _request: &SynthesisRequest) -> Result<AudioArtifact> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable("connection refused".to_string()));
        }
        let path = self.dir.join(format!("tone-{n}.wav"));
        write_wav(&path, &common::generate_sine_samples(440.0, 0.2, 0.3), SAMPLE_RATE)?;
        Ok(AudioArtifact::ephemeral(path, Duration::from_millis(200)))
    }
}

fn supervisor_settings() -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout: Duration::from_secs(2),
        health_interval: Duration::from_millis(10),
        grace_period: Duration::from_millis(100),
        failure_threshold: 2,
        cooldown: Duration::from_millis(150),
    }
}

#[tokio::test]
async fn test_synthesis_breaker_short_circuits_then_recovers() {
    let scratch = tempfile::tempdir().unwrap();
    let engine = Arc::new(ToneEngine::new(scratch.path().to_path_buf()));
    engine.down.store(true, Ordering::SeqCst);
    let breaker = CircuitBreaker::new("tts", 2, Duration::from_millis(150));
    let client = SynthesisClient::new(engine.clone(), breaker.clone(), VoiceSettings::default())
        .with_retry(RetryPolicy::none());

    assert_err!(client.synthesize("Hello.").await);
    assert_err!(client.synthesize("Hello.").await);
    assert!(breaker.is_open());

    // open breaker: no call reaches the engine
    let err = assert_err!(client.synthesize("Hello.").await);
    assert!(matches!(err, Error::CircuitOpen(_)), "got {err}");
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);

    engine.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let artifact = assert_ok!(client.synthesize("Hello.").await);
    assert!(artifact.path.exists());
    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);
    assert!(!breaker.is_open());
    assert_eq!(breaker.consecutive_failures(), 0);
    assert_eq!(breaker.trips(), 1);
    artifact.discard();
}

#[tokio::test]
async fn test_repeated_phrase_synthesized_once() {
    let scratch = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ToneEngine::new(scratch.path().to_path_buf()));
    let cache = Arc::new(SynthesisCache::new(cache_dir.path(), NonZeroUsize::new(2).unwrap()).unwrap());
    let client = SynthesisClient::new(engine.clone(), CircuitBreaker::default(), VoiceSettings::default())
        .with_cache(Arc::clone(&cache));

    let mut paths = Vec::new();
    for _ in 0..3 {
        let artifact = client.synthesize("Thank you for your help.").await.unwrap();
        assert!(!artifact.ephemeral);
        // playback discards; cached files must survive it
        artifact.discard();
        paths.push(artifact.path);
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert!(paths[0].starts_with(cache_dir.path()));

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);

    // a different voice is a different entry
    let other = SynthesisClient::new(
        engine.clone(),
        CircuitBreaker::default(),
        VoiceSettings {
            voice: "af_bella".to_string(),
            ..VoiceSettings::default()
        },
    )
    .with_cache(Arc::clone(&cache));
    other.synthesize("Thank you for your help.").await.unwrap();
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);

    // capacity 2: a third phrase evicts the oldest
    client.synthesize("Goodbye!").await.unwrap();
    let stats = cache.stats().await;
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 1);
    assert!(!paths[0].exists());
}

#[tokio::test]
async fn test_speech_breaker_stops_calls() {
    let speech = Arc::new(ScriptedSpeech::default());
    let client = SpeechClient::new(
        speech.clone(),
        CircuitBreaker::new("stt", 2, Duration::from_secs(60)),
        SpeechClientSettings {
            retry: RetryPolicy::none(),
            ..SpeechClientSettings::default()
        },
    );

    for _ in 0..2 {
        assert_err!(client.transcribe(common::utterance(0.3)).await);
    }
    let err = assert_err!(client.transcribe(common::utterance(0.3)).await);
    assert!(matches!(err, Error::CircuitOpen(_)));
    assert_eq!(speech.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_supervisor_lifecycle() {
    let process = FakeProcess::new("tts");
    let healthy = Arc::clone(&process.healthy);
    let spawns = Arc::clone(&process.spawns);
    let mut supervisor = ServiceSupervisor::new(Box::new(process), supervisor_settings());
    let breaker = supervisor.breaker();

    assert_eq!(supervisor.status(), HealthStatus::Unknown);
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status(), HealthStatus::Healthy);
    let handle = supervisor.handle();
    assert_eq!(handle.name, "tts");
    assert_eq!(handle.process_id, Some(4242));
    assert_eq!(handle.port, 8000);

    // idempotent while healthy
    supervisor.start().await.unwrap();
    assert_eq!(spawns.load(Ordering::SeqCst), 1);

    healthy.store(false, Ordering::SeqCst);
    assert_eq!(supervisor.check_health().await, HealthStatus::Unhealthy);
    assert_eq!(supervisor.check_health().await, HealthStatus::Disabled);
    assert!(breaker.is_open());
    assert!(supervisor.handle().disabled_until.is_some());

    // still cooling down
    assert_eq!(supervisor.check_health().await, HealthStatus::Disabled);

    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(supervisor.check_health().await, HealthStatus::Healthy);
    assert_eq!(spawns.load(Ordering::SeqCst), 2);
    assert!(!breaker.is_open());

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.status(), HealthStatus::Stopped);
    assert_eq!(supervisor.handle().process_id, None);
}

#[tokio::test]
async fn test_stubborn_process_is_killed_once() {
    let mut process = FakeProcess::new("stt");
    process.ignores_terminate = true;
    let terminations = Arc::clone(&process.terminations);
    let kills = Arc::clone(&process.kills);
    let mut supervisor = ServiceSupervisor::new(Box::new(process), supervisor_settings());

    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
    assert_eq!(terminations.load(Ordering::SeqCst), 1);
    assert_eq!(kills.load(Ordering::SeqCst), 1);

    supervisor.stop().await.unwrap();
    assert_eq!(terminations.load(Ordering::SeqCst), 1);
    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.status(), HealthStatus::Stopped);
}

#[tokio::test]
async fn test_unready_process_times_out_and_is_stopped() {
    let process = FakeProcess::new("stt");
    process.healthy.store(false, Ordering::SeqCst);
    let terminations = Arc::clone(&process.terminations);
    let mut supervisor = ServiceSupervisor::new(
        Box::new(process),
        SupervisorSettings {
            startup_timeout: Duration::from_millis(100),
            ..supervisor_settings()
        },
    );

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(terminations.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.status(), HealthStatus::Unhealthy);
}
