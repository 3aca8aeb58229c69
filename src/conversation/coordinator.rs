//! Conversation turn coordinator
//!
//! Drives one call: wait for an utterance, transcribe it, check for a
//! termination phrase, stream the reply into the sentence segmenter and the
//! synthesis pipeline, then listen again. The coordinator owns the agent
//! flags the recorder reads through its [`ListenGate`](crate::voice::ListenGate).

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::history::{ConversationHistory, ConversationTurn, PromptContext, TurnMetadata};
use super::objective::{CompletionPolicy, NeverComplete};
use crate::llm::{IntentClassifier, KeywordIntentClassifier, LanguageModel, LlmEvent};
use crate::pipeline::{DrainReport, SentenceSegmenter, SentenceUnit, SynthesisPipeline, segment_all};
use crate::speech::{SpeechClient, Transcript};
use crate::voice::{AgentFlags, Utterance};
use crate::{Error, Result};

/// Where the call is in its turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Not started
    Idle,
    /// Waiting for the remote party
    Listening,
    /// Speech-to-text in progress
    Transcribing,
    /// Waiting on the language model
    Generating,
    /// Reply audio is playing
    Speaking,
    /// Saying goodbye
    Ending,
    /// Call finished
    Ended,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
            Self::Ending => "ending",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The remote party said a termination phrase
    TerminationPhrase,
    /// The model's reply ended the conversation
    AgentFinished,
    /// The completion policy reported the objective met
    ObjectiveComplete,
    /// Shutdown was requested
    Shutdown,
    /// The utterance source closed
    InputClosed,
}

/// What a single turn did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Transcript empty or too short to act on
    Ignored,
    /// Transcription failed; still listening
    TranscriptionFailed,
    /// Agent replied; call continues
    Replied {
        /// Spoken reply text
        reply: String,
    },
    /// Neither streaming nor batch produced a reply
    Apologized,
    /// The call moved to `Ending`
    Ending(EndReason),
}

/// Summary returned when a call finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    /// Why the call ended
    pub reason: EndReason,
    /// Turns retained in history
    pub turns: usize,
    /// Last coverage answer recorded, if any
    pub coverage_confirmed: Option<bool>,
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// System prompt sent with every request
    pub system_prompt: String,
    /// Spoken first, before listening; skipped when `None`
    pub opening_phrase: Option<String>,
    /// Case-insensitive phrases that end the call without a model request
    pub termination_phrases: Vec<String>,
    /// Spoken when the call ends
    pub closing_phrase: String,
    /// Spoken when no reply could be produced
    pub apology_phrase: String,
    /// History turns retained
    pub history_cap: usize,
    /// History turns sent to the model
    pub context_turns: usize,
    /// Request streamed replies first
    pub streaming: bool,
    /// Transcripts at or below this many characters are ignored
    pub min_transcript_chars: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            opening_phrase: None,
            termination_phrases: vec![
                "goodbye".to_string(),
                "bye bye".to_string(),
                "hang up".to_string(),
                "end the call".to_string(),
            ],
            closing_phrase: "Thank you for your help. Goodbye!".to_string(),
            apology_phrase: "I'm sorry, I need a moment. Could you repeat that?".to_string(),
            history_cap: 40,
            context_turns: 20,
            streaming: true,
            min_transcript_chars: 2,
        }
    }
}

/// Sequential turn-taking loop for one call
pub struct TurnCoordinator {
    speech: SpeechClient,
    llm: Arc<dyn LanguageModel>,
    pipeline: SynthesisPipeline,
    classifier: Arc<dyn IntentClassifier>,
    policy: Box<dyn CompletionPolicy>,
    settings: CoordinatorSettings,
    history: ConversationHistory,
    flags: AgentFlags,
    state: watch::Sender<CallState>,
}

impl TurnCoordinator {
    /// Coordinator over the given collaborators
    #[must_use]
    pub fn new(
        speech: SpeechClient,
        llm: Arc<dyn LanguageModel>,
        pipeline: SynthesisPipeline,
        settings: CoordinatorSettings,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        Self {
            speech,
            llm,
            pipeline,
            classifier: Arc::new(KeywordIntentClassifier),
            policy: Box::new(NeverComplete),
            history: ConversationHistory::new(settings.history_cap),
            settings,
            flags: AgentFlags::new(),
            state,
        }
    }

    /// Objective check run after each assistant turn
    #[must_use]
    pub fn with_policy(mut self, policy: impl CompletionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Metadata inference for replies that carry none
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Flags to hand to the recorder's gate
    #[must_use]
    pub fn flags(&self) -> AgentFlags {
        self.flags.clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// Conversation so far
    #[must_use]
    pub const fn history(&self) -> &ConversationHistory {
        &self.history
    }

    fn transition(&self, next: CallState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "call state");
        }
    }

    /// Run the call until it ends, the input closes, or shutdown is signaled
    ///
    /// Shutdown interrupts a turn in progress: queued speech is cancelled
    /// rather than drained.
    ///
    /// # Errors
    ///
    /// Returns error only if the call was already ended
    pub async fn run(
        &mut self,
        mut utterances: mpsc::UnboundedReceiver<Utterance>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<CallSummary> {
        if self.state() == CallState::Ended {
            return Err(Error::Pipeline("call already ended".to_string()));
        }

        let reason = 'call: {
            if let Some(opening) = self.settings.opening_phrase.clone() {
                self.history.push(ConversationTurn::assistant(opening.clone(), None));
                tokio::select! {
                    _ = self.speak(&opening) => {}
                    () = shutdown_requested(&mut shutdown) => {
                        self.interrupt();
                        break 'call EndReason::Shutdown;
                    }
                }
            }
            self.transition(CallState::Listening);
            tracing::info!("listening");

            loop {
                let utterance = tokio::select! {
                    () = shutdown_requested(&mut shutdown) => break 'call EndReason::Shutdown,
                    next = utterances.recv() => match next {
                        Some(u) => u,
                        None => break 'call EndReason::InputClosed,
                    },
                };

                let outcome = tokio::select! {
                    outcome = self.handle_utterance(utterance) => outcome,
                    () = shutdown_requested(&mut shutdown) => {
                        self.interrupt();
                        break 'call EndReason::Shutdown;
                    }
                };
                if let TurnOutcome::Ending(reason) = outcome {
                    break 'call reason;
                }
            }
        };

        if matches!(reason, EndReason::Shutdown | EndReason::InputClosed) {
            self.finish(reason, false).await;
        }

        let summary = self.summary(reason);
        tracing::info!(?summary, "call ended");
        Ok(summary)
    }

    /// Abandon the turn in progress without waiting for playback
    fn interrupt(&mut self) {
        let report = self.pipeline.cancel_session();
        self.flags.set_speaking(false);
        self.flags.set_processing(false);
        tracing::info!(state = %self.state(), discarded = report.discarded, "turn interrupted");
    }

    fn summary(&self, reason: EndReason) -> CallSummary {
        CallSummary {
            reason,
            turns: self.history.len(),
            coverage_confirmed: self
                .history
                .turns()
                .rev()
                .find_map(|t| t.metadata.and_then(|m| m.coverage_confirmed)),
        }
    }

    /// Process one utterance end to end
    pub async fn handle_utterance(&mut self, utterance: Utterance) -> TurnOutcome {
        self.flags.set_processing(true);
        self.transition(CallState::Transcribing);

        let id = utterance.id;
        let transcript = match self.speech.transcribe(utterance).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(utterance = %id, error = %e, "transcription failed");
                self.flags.set_processing(false);
                self.transition(CallState::Listening);
                return TurnOutcome::TranscriptionFailed;
            }
        };

        let outcome = self.handle_transcript(&transcript).await;
        self.flags.set_processing(false);
        outcome
    }

    /// Act on a final transcript
    pub async fn handle_transcript(&mut self, transcript: &Transcript) -> TurnOutcome {
        let text = transcript.text.trim();
        if transcript.partial || text.chars().count() <= self.settings.min_transcript_chars {
            tracing::debug!(text, "ignoring short transcript");
            self.transition(CallState::Listening);
            return TurnOutcome::Ignored;
        }
        tracing::info!(text, confidence = ?transcript.confidence, "heard");

        if let Some(phrase) = self.termination_phrase(text) {
            tracing::info!(phrase, "termination phrase heard");
            self.finish(EndReason::TerminationPhrase, true).await;
            return TurnOutcome::Ending(EndReason::TerminationPhrase);
        }

        self.history.push(ConversationTurn::user(text));

        self.transition(CallState::Generating);
        let context = PromptContext::build(&self.settings.system_prompt, &self.history, self.settings.context_turns);

        let Some((reply, metadata)) = self.reply(&context).await else {
            let apology = self.settings.apology_phrase.clone();
            self.speak(&apology).await;
            self.transition(CallState::Listening);
            return TurnOutcome::Apologized;
        };

        tracing::info!(reply = %reply, ?metadata, "replied");
        self.history.push(ConversationTurn::assistant(reply.clone(), Some(metadata)));

        if metadata.end_conversation {
            // the reply already said goodbye
            self.finish(EndReason::AgentFinished, false).await;
            return TurnOutcome::Ending(EndReason::AgentFinished);
        }
        if self.policy.is_complete(&self.history) {
            self.finish(EndReason::ObjectiveComplete, true).await;
            return TurnOutcome::Ending(EndReason::ObjectiveComplete);
        }

        self.transition(CallState::Listening);
        TurnOutcome::Replied { reply }
    }

    fn termination_phrase(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.settings
            .termination_phrases
            .iter()
            .map(String::as_str)
            .find(|p| !p.trim().is_empty() && lower.contains(&p.to_lowercase()))
    }

    /// Produce and speak a reply; `None` when both paths failed before any
    /// audio was queued
    async fn reply(&mut self, context: &PromptContext) -> Option<(String, TurnMetadata)> {
        if self.settings.streaming {
            match self.reply_streaming(context).await {
                Ok(reply) => return Some(reply),
                Err(e) => tracing::warn!(model = %self.llm.name(), error = %e, "streamed reply failed, trying batch"),
            }
        }

        match self.llm.complete(context).await {
            Ok(reply) => {
                self.speak(&reply.message).await;
                Some((reply.message, reply.metadata))
            }
            Err(e) => {
                tracing::error!(model = %self.llm.name(), error = %e, "batch reply failed");
                None
            }
        }
    }

    /// Stream a reply into the pipeline sentence by sentence
    ///
    /// Fails only if nothing was spoken yet, so the batch fallback never
    /// repeats audio already played.
    async fn reply_streaming(&mut self, context: &PromptContext) -> Result<(String, TurnMetadata)> {
        let mut events = self.llm.stream(context).await?;
        let mut segmenter = SentenceSegmenter::new();
        let mut text = String::new();
        let mut speaking = false;
        let mut done = None;

        while let Some(event) = events.recv().await {
            match event {
                LlmEvent::TextFragment(fragment) => {
                    text.push_str(&fragment);
                    for unit in segmenter.push(&fragment) {
                        self.submit(unit, &mut speaking);
                    }
                }
                LlmEvent::Done { metadata } => {
                    done = Some(metadata);
                    break;
                }
            }
        }

        if done.is_none() && !speaking {
            return Err(Error::Llm("reply stream ended early".to_string()));
        }
        if done.is_none() {
            tracing::warn!(chars = text.len(), "reply stream cut off, keeping partial reply");
        }

        if let Some(unit) = segmenter.finish() {
            self.submit(unit, &mut speaking);
        }
        if speaking {
            self.drain().await;
        }

        let reply = text.trim().to_string();
        if reply.is_empty() {
            return Err(Error::Llm("empty reply".to_string()));
        }

        let user = context.last_user_message();
        let metadata = done
            .flatten()
            .unwrap_or_else(|| self.classifier.classify(user, &reply));
        Ok((reply, metadata))
    }

    fn submit(&mut self, unit: SentenceUnit, speaking: &mut bool) {
        if !*speaking {
            self.flags.set_speaking(true);
            self.pipeline.start_session();
            self.transition(CallState::Speaking);
            *speaking = true;
        }
        let sequence = unit.sequence;
        if let Err(e) = self.pipeline.submit(unit) {
            tracing::warn!(sequence, error = %e, "sentence not queued");
        }
    }

    async fn drain(&mut self) -> DrainReport {
        let report = self.pipeline.stop_session().await;
        self.flags.set_speaking(false);
        report
    }

    /// Speak complete text through the pipeline and wait for it to play
    pub async fn speak(&mut self, text: &str) -> DrainReport {
        let units = segment_all(text);
        if units.is_empty() {
            return DrainReport::default();
        }
        let mut speaking = false;
        for unit in units {
            self.submit(unit, &mut speaking);
        }
        self.drain().await
    }

    async fn finish(&mut self, reason: EndReason, say_goodbye: bool) {
        self.transition(CallState::Ending);
        tracing::info!(?reason, "ending call");
        if say_goodbye {
            let closing = self.settings.closing_phrase.clone();
            self.speak(&closing).await;
        }
        self.flags.set_processing(false);
        self.transition(CallState::Ended);
    }
}

/// Resolves once shutdown is signaled or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::Reply;
    use crate::pipeline::PipelineSettings;
    use crate::speech::{SpeechClientSettings, SpeechService};
    use crate::supervisor::CircuitBreaker;
    use crate::synthesis::Synthesizer;
    use crate::voice::{AudioArtifact, AudioSink};

    struct NoSpeech;

    #[async_trait]
    impl SpeechService for NoSpeech {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn health(&self) -> Result<bool> {
            Ok(true)
        }

        async fn transcribe(&self, _utterance: &Utterance) -> Result<Transcript> {
            Err(Error::ServiceUnavailable("offline".to_string()))
        }
    }

    struct EchoSynth;

    #[async_trait]
    impl Synthesizer for EchoSynth {
        async fn synthesize(&self, text: &str) -> Result<AudioArtifact> {
            Ok(AudioArtifact::persistent(text.into(), Duration::from_millis(10)))
        }
    }

    struct Sink(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl AudioSink for Sink {
        async fn play(&mut self, group: &[AudioArtifact]) -> Result<()> {
            let mut played = self.0.lock().unwrap();
            played.extend(group.iter().map(|a| a.path.display().to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Model {
        stream: Option<Vec<&'static str>>,
        batch: Option<Reply>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for Model {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, _context: &PromptContext) -> Result<Reply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch.clone().ok_or_else(|| Error::Llm("no batch".to_string()))
        }

        async fn stream(&self, _context: &PromptContext) -> Result<mpsc::Receiver<LlmEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(fragments) = self.stream.clone() else {
                return Err(Error::ServiceUnavailable("no stream".to_string()));
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for f in fragments {
                    let _ = tx.send(LlmEvent::TextFragment(f.to_string())).await;
                }
                let _ = tx.send(LlmEvent::Done { metadata: None }).await;
            });
            Ok(rx)
        }
    }

    fn coordinator(model: Arc<Model>) -> (TurnCoordinator, Arc<Mutex<Vec<String>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        let speech = SpeechClient::new(Arc::new(NoSpeech), CircuitBreaker::default(), SpeechClientSettings::default());
        let settings = PipelineSettings {
            poll_interval: Duration::from_millis(2),
            drain_check_interval: Duration::from_millis(5),
            ..PipelineSettings::default()
        };
        let pipeline = SynthesisPipeline::new(Arc::new(EchoSynth), Box::new(Sink(Arc::clone(&played))), settings);
        let coordinator = TurnCoordinator::new(speech, model, pipeline, CoordinatorSettings::default());
        (coordinator, played)
    }

    #[tokio::test]
    async fn short_transcripts_are_ignored() {
        let model = Arc::new(Model::default());
        let (mut c, _) = coordinator(Arc::clone(&model));
        let outcome = c.handle_transcript(&Transcript::final_text("ok")).await;
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert!(c.history().is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streamed_reply_plays_in_order() {
        let model = Arc::new(Model {
            stream: Some(vec!["Hello. How ", "are you?"]),
            ..Model::default()
        });
        let (mut c, played) = coordinator(model);
        let outcome = c.handle_transcript(&Transcript::final_text("Hi, front desk.")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                reply: "Hello. How are you?".to_string()
            }
        );
        assert_eq!(*played.lock().unwrap(), vec!["Hello.", "How are you?"]);
        assert!(!c.flags().is_speaking());
        assert_eq!(c.state(), CallState::Listening);
        assert_eq!(c.history().len(), 2);
    }

    #[tokio::test]
    async fn batch_fallback_when_stream_fails() {
        let model = Arc::new(Model {
            batch: Some(Reply {
                message: "Sure thing.".to_string(),
                metadata: TurnMetadata::default(),
            }),
            ..Model::default()
        });
        let (mut c, played) = coordinator(Arc::clone(&model));
        let outcome = c.handle_transcript(&Transcript::final_text("Can you hold?")).await;
        assert!(matches!(outcome, TurnOutcome::Replied { .. }));
        assert_eq!(*played.lock().unwrap(), vec!["Sure thing."]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn apology_when_both_paths_fail() {
        let (mut c, played) = coordinator(Arc::new(Model::default()));
        let outcome = c.handle_transcript(&Transcript::final_text("Hello there")).await;
        assert_eq!(outcome, TurnOutcome::Apologized);
        assert!(played.lock().unwrap().iter().any(|p| p.contains("I need a moment")));
        assert_eq!(c.history().len(), 1);
    }

    #[tokio::test]
    async fn reply_ending_conversation_skips_closing() {
        let model = Arc::new(Model {
            batch: Some(Reply {
                message: "Thanks, goodbye.".to_string(),
                metadata: TurnMetadata {
                    coverage_confirmed: Some(true),
                    end_conversation: true,
                },
            }),
            ..Model::default()
        });
        let (mut c, played) = coordinator(model);
        let outcome = c.handle_transcript(&Transcript::final_text("Yes that works.")).await;
        assert_eq!(outcome, TurnOutcome::Ending(EndReason::AgentFinished));
        assert_eq!(*played.lock().unwrap(), vec!["Thanks, goodbye."]);
        assert_eq!(c.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn failed_transcription_keeps_listening() {
        let (mut c, _) = coordinator(Arc::new(Model::default()));
        let utterance = Utterance {
            id: uuid::Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            samples: vec![0.1; 1600],
            sample_rate: 16_000,
        };
        assert_eq!(c.handle_utterance(utterance).await, TurnOutcome::TranscriptionFailed);
        assert_eq!(c.state(), CallState::Listening);
        assert!(!c.flags().is_processing());
    }
}
