//! Daemon - the call runtime
//!
//! Starts the sidecars, builds the speech, synthesis and language-model
//! clients around their breakers, and runs one call from capture to hang-up.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, SpeechProvider};
use crate::conversation::{CallSummary, CoverageAnswered, TurnCoordinator};
use crate::llm::{KeywordIntentClassifier, LanguageModel, OpenAiCompatibleModel};
use crate::pipeline::SynthesisPipeline;
use crate::speech::{CloudSpeechService, SidecarSpeechService, SpeechClient, SpeechService};
use crate::supervisor::{
    CircuitBreaker, ManagedProcess, ServiceHandle, ServiceSupervisor, SidecarProcess, SupervisorSettings,
    spawn_monitor,
};
use crate::synthesis::{CloudSynthesisService, SynthesisCache, SynthesisClient, Synthesizer};
use crate::voice::{AudioSink, AudioSource, EnergyVad, SilenceGatedRecorder};
use crate::{Error, Result};

/// Service name whose breaker guards speech-to-text
pub const STT_SERVICE: &str = "stt";

/// Service name whose breaker guards text-to-speech
pub const TTS_SERVICE: &str = "tts";

type SharedSupervisor = Arc<Mutex<ServiceSupervisor>>;

/// Running sidecars and their health monitors
pub struct Services {
    supervisors: Vec<(String, SharedSupervisor, CircuitBreaker)>,
    monitors: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

impl Services {
    /// No supervised sidecars
    #[must_use]
    pub fn empty() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            supervisors: Vec::new(),
            monitors: Vec::new(),
            stop_tx,
        }
    }

    /// Spawn every configured sidecar
    ///
    /// # Errors
    ///
    /// Returns error if a sidecar cannot be launched or never becomes healthy;
    /// sidecars already started are stopped first
    pub async fn start(config: &Config) -> Result<Self> {
        let mut processes: Vec<(Box<dyn ManagedProcess>, SupervisorSettings)> = Vec::new();
        for service in &config.services {
            let process = SidecarProcess::new(service.spec.clone())?;
            processes.push((Box::new(process), service.supervisor_settings(config.breaker)));
        }
        Self::start_with(processes).await
    }

    /// Start the given processes in order, then monitor them
    ///
    /// # Errors
    ///
    /// Returns the first startup failure after stopping what already started
    pub async fn start_with(processes: Vec<(Box<dyn ManagedProcess>, SupervisorSettings)>) -> Result<Self> {
        let mut services = Self::empty();

        for (process, settings) in processes {
            let name = process.name().to_string();
            let mut supervisor = ServiceSupervisor::new(process, settings);
            if let Err(e) = supervisor.start().await {
                tracing::error!(service = %name, error = %e, "sidecar failed to start");
                if let Err(stop) = supervisor.stop().await {
                    tracing::warn!(service = %name, error = %stop, "cleanup after failed start");
                }
                services.stop().await;
                return Err(e);
            }
            let breaker = supervisor.breaker();
            services.supervisors.push((name, Arc::new(Mutex::new(supervisor)), breaker));
        }

        for (_, supervisor, _) in &services.supervisors {
            let monitor = spawn_monitor(Arc::clone(supervisor), services.stop_tx.subscribe());
            services.monitors.push(monitor);
        }
        Ok(services)
    }

    /// Breaker shared with the named sidecar
    #[must_use]
    pub fn breaker(&self, name: &str) -> Option<CircuitBreaker> {
        self.supervisors
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, breaker)| breaker.clone())
    }

    /// Snapshot of every sidecar
    pub async fn handles(&self) -> Vec<ServiceHandle> {
        let mut handles = Vec::with_capacity(self.supervisors.len());
        for (_, supervisor, _) in &self.supervisors {
            handles.push(supervisor.lock().await.handle());
        }
        handles
    }

    /// Stop monitors, then every sidecar in reverse start order
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        for monitor in self.monitors.drain(..) {
            let _ = monitor.await;
        }
        for (name, supervisor, _) in self.supervisors.drain(..).rev() {
            if let Err(e) = supervisor.lock().await.stop().await {
                tracing::warn!(service = %name, error = %e, "sidecar stop failed");
            }
        }
    }
}

/// Call runtime
pub struct Daemon {
    config: Config,
    services: Services,
}

impl Daemon {
    /// Validate `config` and start its sidecars
    ///
    /// # Errors
    ///
    /// Returns error on fatal misconfiguration or sidecar startup failure
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let services = Services::start(&config).await?;
        Ok(Self { config, services })
    }

    /// Runtime over already-started services
    #[must_use]
    pub const fn with_services(config: Config, services: Services) -> Self {
        Self { config, services }
    }

    /// Loaded configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Supervised sidecars
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    fn breaker_for(&self, name: &str) -> CircuitBreaker {
        self.services.breaker(name).unwrap_or_else(|| {
            CircuitBreaker::new(name, self.config.breaker.failure_threshold, self.config.breaker.cooldown)
        })
    }

    /// Speech client with its configured engines
    ///
    /// # Errors
    ///
    /// Returns error if an HTTP client cannot be built
    pub fn speech_client(&self) -> Result<SpeechClient> {
        let cfg = &self.config.speech;
        let sidecar = SidecarSpeechService::new(
            STT_SERVICE,
            self.config.speech_url()?,
            cfg.connect_timeout,
            cfg.request_timeout,
        )?;

        let batch: Arc<dyn SpeechService> = match cfg.provider {
            SpeechProvider::Sidecar => Arc::new(sidecar.clone()),
            SpeechProvider::Cloud(provider) => {
                let key = cfg
                    .api_key
                    .clone()
                    .ok_or_else(|| Error::Config("hosted speech provider needs an API key".to_string()))?;
                Arc::new(CloudSpeechService::new(provider, key, cfg.cloud_model.clone(), cfg.request_timeout)?)
            }
        };

        let mut client = SpeechClient::new(batch, self.breaker_for(STT_SERVICE), cfg.client.clone());
        if cfg.streaming {
            let breaker = CircuitBreaker::new(
                &format!("{STT_SERVICE}-stream"),
                self.config.breaker.failure_threshold,
                self.config.breaker.cooldown,
            );
            client = client.with_streaming(Arc::new(sidecar), breaker);
        }
        Ok(client)
    }

    /// Synthesis client with cache and fallback
    ///
    /// # Errors
    ///
    /// Returns error if a client or the cache directory cannot be created
    pub fn synthesis_client(&self) -> Result<SynthesisClient> {
        let cfg = &self.config.synthesis;
        std::fs::create_dir_all(&cfg.artifact_dir)?;

        let primary = crate::synthesis::SidecarSynthesisService::new(
            TTS_SERVICE,
            self.config.synthesis_url()?,
            cfg.connect_timeout,
            cfg.request_timeout,
        )?;
        let mut client = SynthesisClient::new(Arc::new(primary), self.breaker_for(TTS_SERVICE), cfg.voice.clone())
            .with_retry(self.config.retry.clone())
            .with_artifact_dir(cfg.artifact_dir.clone());

        if let Some(capacity) = NonZeroUsize::new(cfg.cache_capacity) {
            client = client.with_cache(Arc::new(SynthesisCache::new(&cfg.cache_dir, capacity)?));
        }

        if let Some(fallback) = &cfg.fallback {
            let service = CloudSynthesisService::new(
                fallback.provider,
                fallback.api_key.clone(),
                fallback.model.clone(),
                fallback.voice.clone(),
                cfg.artifact_dir.clone(),
                cfg.request_timeout,
            )?;
            client = client.with_fallback(Arc::new(service));
        }
        Ok(client)
    }

    /// Language model client
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid or the client cannot be built
    pub fn language_model(&self) -> Result<Arc<dyn LanguageModel>> {
        let cfg = &self.config.llm;
        let model = OpenAiCompatibleModel::new(
            self.config.llm_url()?,
            cfg.model.clone(),
            cfg.api_key.clone(),
            cfg.request_timeout,
            Arc::new(KeywordIntentClassifier),
        )?
        .with_temperature(Some(cfg.temperature))
        .with_max_tokens(Some(cfg.max_tokens));
        Ok(Arc::new(model))
    }

    /// Coordinator playing through `sink`
    ///
    /// # Errors
    ///
    /// Returns error if a client cannot be built
    pub fn coordinator(&self, synthesizer: Arc<dyn Synthesizer>, sink: Box<dyn AudioSink>) -> Result<TurnCoordinator> {
        let pipeline = SynthesisPipeline::new(synthesizer, sink, self.config.pipeline.clone());
        let coordinator = TurnCoordinator::new(
            self.speech_client()?,
            self.language_model()?,
            pipeline,
            self.config.conversation.coordinator.clone(),
        );
        Ok(if self.config.conversation.end_on_coverage {
            coordinator.with_policy(CoverageAnswered)
        } else {
            coordinator
        })
    }

    /// Run one call: capture from the source built by `make_source`, play to
    /// `sink`, until the call ends or Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if a client cannot be built or the recorder cannot start
    pub async fn run_call<S, F>(&self, make_source: F, sink: Box<dyn AudioSink>) -> Result<CallSummary>
    where
        S: AudioSource,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let synthesizer: Arc<dyn Synthesizer> = Arc::new(self.synthesis_client()?);
        let mut coordinator = self.coordinator(synthesizer, sink)?;

        let vad = EnergyVad::new(self.config.initial_threshold(), self.config.audio.threshold_multiplier);
        let mut recorder = SilenceGatedRecorder::new(self.config.recorder_settings(), coordinator.flags().gate());
        let utterances = recorder.start(make_source, vad)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });

        let summary = coordinator.run(utterances, shutdown_rx).await;
        signal.abort();

        let stats = tokio::task::spawn_blocking(move || {
            recorder.stop();
            recorder.stats()
        })
        .await
        .map_err(|e| Error::Audio(format!("recorder shutdown failed: {e}")))?;
        tracing::info!(?stats, "recorder stopped");

        summary
    }

    /// Stop every sidecar
    pub async fn shutdown(mut self) {
        self.services.stop().await;
    }
}
