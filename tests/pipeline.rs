//! Synthesis pipeline integration tests
//!
//! Ordering and failure isolation with fake synthesizers and sinks

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use voicecall_agent::pipeline::{PipelineSettings, SentenceSegmenter, SentenceUnit, SynthesisPipeline, segment_all};

mod common;

use common::{DelayedSynthesizer, RecordingSink};

fn fast_settings(batch_size: usize) -> PipelineSettings {
    PipelineSettings {
        batch_size,
        first_bypass: true,
        poll_interval: Duration::from_millis(2),
        drain_check_interval: Duration::from_millis(5),
        stall_checks: 400,
        drain_timeout: Duration::from_secs(10),
    }
}

fn texts(units: &[SentenceUnit]) -> Vec<String> {
    units.iter().map(|u| u.text.clone()).collect()
}

#[tokio::test]
async fn test_playback_order_under_random_latency() {
    let mut rng = rand::thread_rng();

    for round in 0..5 {
        let sentences: Vec<String> = (0..12).map(|i| format!("Sentence {round}-{i}.")).collect();
        let delays: HashMap<String, Duration> = sentences
            .iter()
            .map(|s| (s.clone(), Duration::from_millis(rng.gen_range(0..40))))
            .collect();
        let batch_size = rng.gen_range(1..=4);

        let sink = RecordingSink::default();
        let mut pipeline = SynthesisPipeline::new(
            Arc::new(DelayedSynthesizer::with_delays(delays)),
            Box::new(sink.clone()),
            fast_settings(batch_size),
        );

        pipeline.start_session();
        for (i, text) in sentences.iter().enumerate() {
            pipeline
                .submit(SentenceUnit {
                    sequence: i as u64,
                    text: text.clone(),
                })
                .unwrap();
        }
        let report = pipeline.stop_session().await;

        assert!(!report.forced, "round {round} drain was forced");
        assert_eq!(report.played, 12);
        assert_eq!(sink.played(), sentences, "round {round} batch {batch_size}");
        assert!(sink.groups.lock().unwrap().iter().all(|g| g.len() <= batch_size));
    }
}

#[tokio::test]
async fn test_segmented_reply_plays_in_sequence() {
    // second finishes first, then first, then third
    let synthesizer = DelayedSynthesizer::new(&[("Hi there.", 30), ("How can I help?", 5), ("Thanks!", 60)]);
    let sink = RecordingSink::default();
    let mut pipeline = SynthesisPipeline::new(Arc::new(synthesizer), Box::new(sink.clone()), fast_settings(1));

    pipeline.start_session();
    for unit in segment_all("Hi there. How can I help? Thanks!") {
        pipeline.submit(unit).unwrap();
    }
    pipeline.stop_session().await;

    assert_eq!(sink.played(), vec!["Hi there.", "How can I help?", "Thanks!"]);
}

#[tokio::test]
async fn test_failed_job_never_blocks_playback() {
    let synthesizer = DelayedSynthesizer::new(&[("FAIL slow.", 50), ("After.", 1)]);
    let sink = RecordingSink::default();
    let mut pipeline = SynthesisPipeline::new(Arc::new(synthesizer), Box::new(sink.clone()), fast_settings(3));

    pipeline.start_session();
    pipeline.submit(SentenceUnit { sequence: 0, text: "Before.".to_string() }).unwrap();
    pipeline.submit(SentenceUnit { sequence: 1, text: "FAIL slow.".to_string() }).unwrap();
    pipeline.submit(SentenceUnit { sequence: 2, text: "After.".to_string() }).unwrap();
    let report = pipeline.stop_session().await;

    assert_eq!(sink.played(), vec!["Before.", "After."]);
    assert_eq!(report.failed, 1);
    assert!(!report.forced);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let synthesizer = Arc::new(DelayedSynthesizer::new(&[]));
    let sink = RecordingSink::default();
    let mut pipeline = SynthesisPipeline::new(synthesizer, Box::new(sink.clone()), fast_settings(2));

    for turn in ["One. Two.", "Three. Four. Five."] {
        pipeline.start_session();
        for unit in segment_all(turn) {
            pipeline.submit(unit).unwrap();
        }
        pipeline.stop_session().await;
    }

    assert_eq!(sink.played(), vec!["One.", "Two.", "Three.", "Four.", "Five."]);
    assert_eq!(pipeline.stats().sessions, 2);
    assert!(!pipeline.in_session());
}

#[test]
fn test_incremental_segmentation_matches_whole_text() {
    let mut segmenter = SentenceSegmenter::new();
    let mut units = segmenter.push("Hello. How are");
    units.extend(segmenter.push(" you?"));
    units.extend(segmenter.finish());
    assert_eq!(texts(&units), vec!["Hello.", "How are you?"]);

    let reply = "Good afternoon! I'm calling about a reservation for Ms. Lee. Could you check \
                 whether direct billing is possible? Thank you so much...";
    let whole = texts(&segment_all(reply));

    // every split point, including mid-word and mid-terminator
    for split in (0..reply.len()).filter(|i| reply.is_char_boundary(*i)) {
        let mut segmenter = SentenceSegmenter::new();
        let mut units = segmenter.push(&reply[..split]);
        units.extend(segmenter.push(&reply[split..]));
        units.extend(segmenter.finish());
        assert_eq!(texts(&units), whole, "split at {split}");
        assert!(units.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    }
}
