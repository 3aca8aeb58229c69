//! Streaming synthesis queue with ordered playback
//!
//! Every submitted sentence is synthesized on its own task. A single
//! playback worker per session plays jobs strictly in sequence order: it
//! waits on the lowest unplayed sequence, skips it if synthesis failed, and
//! optionally groups contiguous ready artifacts into one gapless stream.
//!
//! Synthesis tasks are never aborted. Ending a session bumps its epoch, and a
//! task that finishes for a dead session deletes its own artifact.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::segmenter::SentenceUnit;
use crate::synthesis::Synthesizer;
use crate::voice::{AudioArtifact, AudioSink};
use crate::{Error, Result};

/// Lifecycle of one sentence's audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued, task not yet running
    Pending,
    /// Synthesis in progress
    Generating,
    /// Audio available
    Ready,
    /// Synthesis failed; playback skips it
    Failed,
}

/// One sentence awaiting playback
#[derive(Debug, Clone)]
pub struct SynthesisJob {
    /// Play order
    pub sequence: u64,
    /// Sentence text
    pub text: String,
    /// Current state
    pub state: JobState,
    /// Synthesized audio once ready
    pub audio: Option<AudioArtifact>,
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum artifacts joined into one playback stream (1 disables batching)
    pub batch_size: usize,
    /// Play the first artifact of a session alone for lower latency
    pub first_bypass: bool,
    /// Worker sleep between queue checks
    pub poll_interval: Duration,
    /// Interval between drain progress checks
    pub drain_check_interval: Duration,
    /// Consecutive drain checks without progress before forcing cleanup
    pub stall_checks: u32,
    /// Upper bound on `stop_session`
    pub drain_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            first_bypass: true,
            poll_interval: Duration::from_millis(10),
            drain_check_interval: Duration::from_millis(250),
            stall_checks: 40,
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of draining one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Artifacts played this session
    pub played: u64,
    /// Jobs skipped because synthesis failed
    pub failed: u64,
    /// Jobs thrown away by a forced cleanup
    pub discarded: u64,
    /// Whether the drain had to be forced
    pub forced: bool,
    /// Time spent draining
    pub elapsed: Duration,
}

/// Cumulative counters across sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Sessions started
    pub sessions: u64,
    /// Sentences submitted
    pub submitted: u64,
    /// Artifacts played
    pub played: u64,
    /// Playback groups (one sink call each)
    pub groups: u64,
    /// Failed syntheses
    pub failed: u64,
    /// Results that arrived after their session ended
    pub late_results: u64,
    /// Drains that timed out or stalled
    pub forced_drains: u64,
    /// Sessions cancelled without draining
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions: AtomicU64,
    submitted: AtomicU64,
    played: AtomicU64,
    groups: AtomicU64,
    failed: AtomicU64,
    late_results: AtomicU64,
    forced_drains: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: BTreeMap<u64, SynthesisJob>,
    next_to_play: u64,
    session: u64,
    active_session: bool,
    closing: bool,
    playing: bool,
    played: u64,
    failed: u64,
}

impl QueueState {
    /// Remove all jobs, deleting any synthesized audio
    fn purge(&mut self) -> u64 {
        let discarded = self.jobs.len() as u64;
        for job in std::mem::take(&mut self.jobs).into_values() {
            if let Some(audio) = job.audio {
                audio.discard();
            }
        }
        discarded
    }

    /// Pop the next playable group, skipping failed jobs
    ///
    /// Returns `None` while the lowest unplayed job is still being generated.
    fn take_group(&mut self, limit: usize) -> Option<Vec<(u64, AudioArtifact)>> {
        let mut group = Vec::new();

        while group.len() < limit {
            let Some(job) = self.jobs.get(&self.next_to_play) else {
                break;
            };
            match job.state {
                JobState::Pending | JobState::Generating => break,
                JobState::Failed => {
                    tracing::debug!(sequence = self.next_to_play, "skipping failed job");
                    self.jobs.remove(&self.next_to_play);
                    self.failed += 1;
                    self.next_to_play += 1;
                }
                JobState::Ready => {
                    let sequence = self.next_to_play;
                    if let Some(audio) = self.jobs.remove(&sequence).and_then(|j| j.audio) {
                        group.push((sequence, audio));
                    }
                    self.next_to_play += 1;
                }
            }
        }

        if group.is_empty() { None } else { Some(group) }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    active: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Decrement the active counter without wrapping below zero
    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn AudioSink>>>;

/// Ordered, concurrent sentence-to-speech pipeline
pub struct SynthesisPipeline {
    synthesizer: Arc<dyn Synthesizer>,
    sink: SharedSink,
    settings: PipelineSettings,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SynthesisPipeline {
    /// Pipeline synthesizing with `synthesizer` and playing to `sink`
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sink: Box<dyn AudioSink>, settings: PipelineSettings) -> Self {
        Self {
            synthesizer,
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                active: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
            worker: None,
        }
    }

    /// Begin a new turn, discarding anything left from the previous one
    pub fn start_session(&mut self) {
        self.abort_worker();

        let session = {
            let mut state = self.shared.lock();
            let stale = state.purge();
            if stale > 0 {
                tracing::warn!(stale, "purged stale synthesis jobs");
            }
            state.session += 1;
            state.next_to_play = 0;
            state.active_session = true;
            state.closing = false;
            state.playing = false;
            state.played = 0;
            state.failed = 0;
            state.session
        };
        self.shared.active.store(0, Ordering::SeqCst);
        self.shared.counters.sessions.fetch_add(1, Ordering::Relaxed);

        let worker = PlaybackWorker {
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
            settings: self.settings.clone(),
            session,
        };
        self.worker = Some(tokio::spawn(worker.run()));
        tracing::debug!(session, "synthesis session started");
    }

    /// Queue a sentence for synthesis
    ///
    /// # Errors
    ///
    /// Returns `Error::Pipeline` if no session is active, the session is
    /// draining, or the sequence was already submitted or played
    pub fn submit(&mut self, unit: SentenceUnit) -> Result<()> {
        let session = {
            let mut state = self.shared.lock();
            if !state.active_session || state.closing {
                return Err(Error::Pipeline("no open synthesis session".to_string()));
            }
            if unit.sequence < state.next_to_play || state.jobs.contains_key(&unit.sequence) {
                return Err(Error::Pipeline(format!("duplicate sequence {}", unit.sequence)));
            }
            state.jobs.insert(
                unit.sequence,
                SynthesisJob {
                    sequence: unit.sequence,
                    text: unit.text.clone(),
                    state: JobState::Pending,
                    audio: None,
                },
            );
            state.session
        };

        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let synthesizer = Arc::clone(&self.synthesizer);
        tokio::spawn(synthesize_job(shared, synthesizer, session, unit));
        Ok(())
    }

    /// Wait for every queued sentence to play, then end the session
    ///
    /// Bounded by the drain timeout; a stalled or overdue drain is forced,
    /// discarding remaining jobs.
    pub async fn stop_session(&mut self) -> DrainReport {
        let started = Instant::now();
        let deadline = started + self.settings.drain_timeout;

        {
            let mut state = self.shared.lock();
            if !state.active_session {
                return DrainReport::default();
            }
            state.closing = true;
        }

        let mut forced = false;
        let mut stall = 0u32;
        let mut last = self.progress();

        loop {
            let (active, queued, playing, _) = last;
            if active == 0 && queued == 0 && !playing {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(active, queued, "synthesis drain timed out");
                forced = true;
                break;
            }

            tokio::time::sleep(self.settings.drain_check_interval).await;

            let now = self.progress();
            if now == last && !now.2 {
                stall += 1;
                if stall >= self.settings.stall_checks {
                    tracing::warn!(active = now.0, queued = now.1, stall, "synthesis pipeline stalled");
                    forced = true;
                    break;
                }
            } else {
                stall = 0;
            }
            last = now;
        }

        if !forced {
            if let Some(worker) = self.worker.as_mut() {
                let remaining = deadline
                    .saturating_duration_since(Instant::now())
                    .max(self.settings.poll_interval * 10);
                if tokio::time::timeout(remaining, worker).await.is_err() {
                    tracing::warn!("playback worker did not exit in time");
                    forced = true;
                }
            }
        }

        if forced {
            self.shared.counters.forced_drains.fetch_add(1, Ordering::Relaxed);
        }

        let report = self.close(started, forced);
        if forced {
            tracing::warn!(?report, "forced synthesis pipeline cleanup");
        } else {
            tracing::debug!(?report, "synthesis session drained");
        }
        report
    }

    /// End the session now, without waiting for queued sentences to play
    ///
    /// Playback stops at once. Results still being synthesized are deleted
    /// by their own tasks when they finish.
    pub fn cancel_session(&mut self) -> DrainReport {
        if !self.in_session() {
            return DrainReport::default();
        }
        self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        let report = self.close(Instant::now(), false);
        tracing::info!(?report, "synthesis session cancelled");
        report
    }

    fn close(&mut self, started: Instant, forced: bool) -> DrainReport {
        self.abort_worker();

        let (played, failed, discarded) = {
            let mut state = self.shared.lock();
            let discarded = state.purge();
            state.active_session = false;
            state.closing = false;
            state.playing = false;
            // results still in flight land in a dead session
            state.session += 1;
            (state.played, state.failed, discarded)
        };
        self.shared.active.store(0, Ordering::SeqCst);

        DrainReport {
            played,
            failed,
            discarded,
            forced,
            elapsed: started.elapsed(),
        }
    }

    /// Whether a session is open
    #[must_use]
    pub fn in_session(&self) -> bool {
        self.shared.lock().active_session
    }

    /// Synthesis tasks still running
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Copy of the queued jobs
    #[must_use]
    pub fn jobs(&self) -> Vec<SynthesisJob> {
        self.shared.lock().jobs.values().cloned().collect()
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            sessions: c.sessions.load(Ordering::Relaxed),
            submitted: c.submitted.load(Ordering::Relaxed),
            played: c.played.load(Ordering::Relaxed),
            groups: c.groups.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            late_results: c.late_results.load(Ordering::Relaxed),
            forced_drains: c.forced_drains.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }

    fn progress(&self) -> (usize, usize, bool, u64) {
        let state = self.shared.lock();
        (
            self.shared.active.load(Ordering::SeqCst),
            state.jobs.len(),
            state.playing,
            state.played,
        )
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for SynthesisPipeline {
    fn drop(&mut self) {
        self.abort_worker();
        let mut state = self.shared.lock();
        state.purge();
        state.session += 1;
    }
}

async fn synthesize_job(shared: Arc<Shared>, synthesizer: Arc<dyn Synthesizer>, session: u64, unit: SentenceUnit) {
    {
        let mut state = shared.lock();
        // the session's active count was reset when it ended
        if state.session != session {
            return;
        }
        if let Some(job) = state.jobs.get_mut(&unit.sequence) {
            job.state = JobState::Generating;
        }
    }

    let started = Instant::now();
    let result = synthesizer.synthesize(&unit.text).await;

    let mut state = shared.lock();
    if state.session != session {
        shared.counters.late_results.fetch_add(1, Ordering::Relaxed);
        if let Ok(audio) = &result {
            audio.discard();
        }
        tracing::debug!(sequence = unit.sequence, "discarding late synthesis result");
        return;
    }

    if let Some(job) = state.jobs.get_mut(&unit.sequence) {
        match result {
            Ok(audio) => {
                tracing::debug!(sequence = unit.sequence, elapsed = ?started.elapsed(), "job ready");
                job.state = JobState::Ready;
                job.audio = Some(audio);
            }
            Err(e) => {
                tracing::warn!(sequence = unit.sequence, text = %unit.text, error = %e, "synthesis failed");
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                job.state = JobState::Failed;
            }
        }
    }
    drop(state);
    shared.release();
}

struct PlaybackWorker {
    shared: Arc<Shared>,
    sink: SharedSink,
    settings: PipelineSettings,
    session: u64,
}

impl PlaybackWorker {
    async fn run(self) {
        let mut first = true;
        loop {
            let group = {
                let mut state = self.shared.lock();
                if state.session != self.session {
                    return;
                }
                let limit = if (first && self.settings.first_bypass) || self.settings.batch_size <= 1 {
                    1
                } else {
                    self.settings.batch_size
                };
                let group = state.take_group(limit);
                if group.is_some() {
                    state.playing = true;
                } else if state.closing
                    && state.jobs.is_empty()
                    && self.shared.active.load(Ordering::SeqCst) == 0
                {
                    return;
                }
                group
            };

            let Some(group) = group else {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            };
            first = false;

            let sequences: Vec<u64> = group.iter().map(|(s, _)| *s).collect();
            let artifacts: Vec<AudioArtifact> = group.into_iter().map(|(_, a)| a).collect();
            tracing::debug!(?sequences, "playing");

            let result = self.sink.lock().await.play(&artifacts).await;
            if let Err(e) = result {
                tracing::warn!(?sequences, error = %e, "playback failed");
            }
            for artifact in &artifacts {
                artifact.discard();
            }

            let mut state = self.shared.lock();
            state.playing = false;
            if state.session == self.session {
                state.played += artifacts.len() as u64;
            }
            drop(state);
            self.shared
                .counters
                .played
                .fetch_add(artifacts.len() as u64, Ordering::Relaxed);
            self.shared.counters.groups.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;

    /// Synthesizer with per-text delays; texts starting with "FAIL" error
    struct DelayedSynthesizer {
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl Synthesizer for DelayedSynthesizer {
        async fn synthesize(&self, text: &str) -> Result<AudioArtifact> {
            let delay = self.delays.get(text).copied().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if text.starts_with("FAIL") {
                return Err(Error::Tts("boom".to_string()));
            }
            Ok(AudioArtifact::persistent(text.into(), Duration::from_millis(1)))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        groups: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&mut self, group: &[AudioArtifact]) -> Result<()> {
            self.groups
                .lock()
                .unwrap()
                .push(group.iter().map(|a| a.path.display().to_string()).collect());
            Ok(())
        }
    }

    fn settings(batch_size: usize) -> PipelineSettings {
        PipelineSettings {
            batch_size,
            first_bypass: true,
            poll_interval: Duration::from_millis(2),
            drain_check_interval: Duration::from_millis(5),
            stall_checks: 200,
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn unit(sequence: u64, text: &str) -> SentenceUnit {
        SentenceUnit {
            sequence,
            text: text.to_string(),
        }
    }

    fn pipeline(delays: &[(&str, u64)], batch_size: usize) -> (SynthesisPipeline, RecordingSink) {
        let synthesizer = DelayedSynthesizer {
            delays: delays
                .iter()
                .map(|(t, ms)| ((*t).to_string(), Duration::from_millis(*ms)))
                .collect(),
        };
        let sink = RecordingSink::default();
        let pipeline = SynthesisPipeline::new(Arc::new(synthesizer), Box::new(sink.clone()), settings(batch_size));
        (pipeline, sink)
    }

    fn flat(sink: &RecordingSink) -> Vec<String> {
        sink.groups.lock().unwrap().iter().flatten().cloned().collect()
    }

    #[tokio::test]
    async fn out_of_order_completion_plays_in_order() {
        let (mut p, sink) = pipeline(&[("Hi there.", 40), ("How can I help?", 5), ("Thanks!", 70)], 1);

        p.start_session();
        p.submit(unit(0, "Hi there.")).unwrap();
        p.submit(unit(1, "How can I help?")).unwrap();
        p.submit(unit(2, "Thanks!")).unwrap();
        let report = p.stop_session().await;

        assert_eq!(flat(&sink), vec!["Hi there.", "How can I help?", "Thanks!"]);
        assert_eq!(report.played, 3);
        assert!(!report.forced);
        assert!(!p.in_session());
    }

    #[tokio::test]
    async fn failed_job_is_skipped() {
        let (mut p, sink) = pipeline(&[("FAIL one", 20)], 1);

        p.start_session();
        p.submit(unit(0, "A.")).unwrap();
        p.submit(unit(1, "FAIL one")).unwrap();
        p.submit(unit(2, "C.")).unwrap();
        let report = p.stop_session().await;

        assert_eq!(flat(&sink), vec!["A.", "C."]);
        assert_eq!(report.failed, 1);
        assert_eq!(p.stats().failed, 1);
    }

    #[tokio::test]
    async fn contiguous_ready_jobs_are_batched_after_first() {
        let (mut p, sink) = pipeline(&[("one", 30)], 3);

        p.start_session();
        for (i, t) in ["one", "two", "three", "four"].iter().enumerate() {
            p.submit(unit(i as u64, t)).unwrap();
        }
        p.stop_session().await;

        let groups = sink.groups.lock().unwrap().clone();
        assert_eq!(groups[0], vec!["one"]);
        assert_eq!(groups[1], vec!["two", "three", "four"]);
    }

    #[tokio::test]
    async fn submit_requires_session() {
        let (mut p, _sink) = pipeline(&[], 1);
        assert!(p.submit(unit(0, "x")).is_err());

        p.start_session();
        p.submit(unit(0, "x")).unwrap();
        assert!(p.submit(unit(0, "x")).is_err());
        p.stop_session().await;
    }

    #[tokio::test]
    async fn stuck_job_forces_cleanup() {
        let (mut p, sink) = pipeline(&[("slow", 10_000)], 1);
        p.settings.drain_timeout = Duration::from_millis(100);

        p.start_session();
        p.submit(unit(0, "slow")).unwrap();
        p.submit(unit(1, "fast")).unwrap();
        let report = p.stop_session().await;

        assert!(report.forced);
        assert_eq!(report.discarded, 2);
        assert!(flat(&sink).is_empty());
        assert_eq!(p.stats().forced_drains, 1);
        assert_eq!(p.active_tasks(), 0);
    }

    #[tokio::test]
    async fn new_session_starts_clean() {
        let (mut p, sink) = pipeline(&[], 1);

        p.start_session();
        p.submit(unit(0, "first turn")).unwrap();
        p.stop_session().await;

        p.start_session();
        p.submit(unit(0, "second turn")).unwrap();
        p.stop_session().await;

        assert_eq!(flat(&sink), vec!["first turn", "second turn"]);
        assert_eq!(p.stats().sessions, 2);
    }

    /// Writes an ephemeral WAV per sentence after a delay
    struct SlowFileSynthesizer {
        dir: std::path::PathBuf,
        delay: Duration,
    }

    #[async_trait]
    impl Synthesizer for SlowFileSynthesizer {
        async fn synthesize(&self, text: &str) -> Result<AudioArtifact> {
            tokio::time::sleep(self.delay).await;
            let path = self.dir.join(format!("{}.wav", text.trim_end_matches('.')));
            std::fs::write(&path, b"RIFF")?;
            Ok(AudioArtifact::ephemeral(path, Duration::from_millis(1)))
        }
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn forced_drain_removes_results_that_finish_later() {
        let scratch = tempfile::tempdir().unwrap();
        let synthesizer = SlowFileSynthesizer {
            dir: scratch.path().to_path_buf(),
            delay: Duration::from_millis(150),
        };
        let mut p = SynthesisPipeline::new(
            Arc::new(synthesizer),
            Box::new(RecordingSink::default()),
            PipelineSettings {
                drain_timeout: Duration::from_millis(40),
                ..settings(1)
            },
        );

        p.start_session();
        p.submit(unit(0, "first.")).unwrap();
        p.submit(unit(1, "second.")).unwrap();
        let report = p.stop_session().await;
        assert!(report.forced);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(files_in(scratch.path()), 0);
        assert_eq!(p.stats().late_results, 2);
        assert_eq!(p.active_tasks(), 0);
    }

    /// Sink that records each group when playback starts, then plays slowly
    #[derive(Clone, Default)]
    struct SlowSink {
        started: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&mut self, group: &[AudioArtifact]) -> Result<()> {
            self.started
                .lock()
                .unwrap()
                .extend(group.iter().map(|a| a.path.display().to_string()));
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_stops_playback_at_once() {
        let sink = SlowSink::default();
        let synthesizer = DelayedSynthesizer { delays: HashMap::new() };
        let mut p = SynthesisPipeline::new(Arc::new(synthesizer), Box::new(sink.clone()), settings(1));

        p.start_session();
        for (i, t) in ["one", "two", "three"].iter().enumerate() {
            p.submit(unit(i as u64, t)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let report = p.cancel_session();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!report.forced);
        assert_eq!(report.discarded, 2);
        assert!(!p.in_session());
        assert_eq!(*sink.started.lock().unwrap(), vec!["one"]);
        assert_eq!(p.stats().cancelled, 1);
        assert_eq!(p.cancel_session(), DrainReport::default());

        // the sink is free again for the next turn
        p.start_session();
        p.submit(unit(0, "next")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.started.lock().unwrap().last().map(String::as_str), Some("next"));
        p.cancel_session();
    }

    #[tokio::test]
    async fn stop_without_session_is_noop() {
        let (mut p, _sink) = pipeline(&[], 1);
        let report = p.stop_session().await;
        assert_eq!(report, DrainReport::default());
    }
}
