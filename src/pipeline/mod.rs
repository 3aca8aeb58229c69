//! Sentence segmentation and the ordered synthesis/playback queue

mod segmenter;
mod synthesis;

pub use segmenter::{SentenceSegmenter, SentenceUnit, segment_all};
pub use synthesis::{
    DrainReport, JobState, PipelineSettings, PipelineStats, SynthesisJob, SynthesisPipeline,
};
