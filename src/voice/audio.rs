//! Audio artifacts and sample helpers
//!
//! WAV encode/decode via `hound`, MP3 decode via `minimp3`, plus the small
//! amount of sample manipulation playback needs (concatenation, silence
//! trimming, rate matching via `rubato`).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Capture sample rate (16kHz mono for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// A playable audio file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArtifact {
    /// File location
    pub path: PathBuf,
    /// Playback length
    pub duration: Duration,
    /// Deleted after playback when true
    pub ephemeral: bool,
}

impl AudioArtifact {
    /// Artifact that outlives playback (e.g. cache entries)
    #[must_use]
    pub const fn persistent(path: PathBuf, duration: Duration) -> Self {
        Self {
            path,
            duration,
            ephemeral: false,
        }
    }

    /// Artifact owned by the pipeline and removed once played
    #[must_use]
    pub const fn ephemeral(path: PathBuf, duration: Duration) -> Self {
        Self {
            path,
            duration,
            ephemeral: true,
        }
    }

    /// Delete the file if the artifact is ephemeral
    pub fn discard(&self) {
        if !self.ephemeral {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove artifact");
            }
        }
    }

    /// Decode the artifact to mono f32 samples
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or decoded
    pub fn load(&self) -> Result<(Vec<f32>, u32)> {
        let bytes = std::fs::read(&self.path)?;
        let is_mp3 = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        if is_mp3 { decode_mp3(&bytes) } else { read_wav(&bytes) }
    }
}

/// Duration of `samples` at `sample_rate`
#[must_use]
pub fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    #[allow(clippy::cast_precision_loss)]
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

/// Number of samples covering `duration` at `sample_rate`
#[must_use]
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let n = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
    n
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Write samples to a WAV file
///
/// # Errors
///
/// Returns error if encoding or writing fails
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let bytes = samples_to_wav(samples, sample_rate)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Decode WAV bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not a supported WAV stream
pub fn read_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = f32::powi(2.0, i32::from(spec.bits_per_sample) - 1);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = v as f32;
                    v / scale
                }))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    Ok((downmix(&interleaved, usize::from(spec.channels)), spec.sample_rate))
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if decoding fails
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                {
                    sample_rate = frame.sample_rate as u32;
                }
                let frame_samples: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&frame_samples, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let divisor = channels as f32;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / divisor)
        .collect()
}

/// Input frames per resampler pass
const RESAMPLE_CHUNK: usize = 1024;

/// Sample-rate conversion using rubato
///
/// Only used to line up artifacts from different engines before
/// concatenation. The resampler delay is trimmed so the output length
/// matches the input duration.
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
    let delay = resampler.output_delay();
    let expected = (samples.len() as u64 * u64::from(to) / u64::from(from)) as usize;

    // the resampler may round the chunk up to its FFT size
    let chunk_len = resampler.input_frames_next();

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(expected + delay + resampler.output_frames_max());

    for chunk in input.chunks(chunk_len) {
        let wave: [&[f64]; 1] = [chunk];
        let result = if chunk.len() == chunk_len {
            resampler.process(&wave[..], None)
        } else {
            resampler.process_partial(Some(&wave[..]), None)
        };
        let frames = result.map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&frames[0]);
    }

    // flush the delay line
    while output.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f64]>(None, None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        if frames[0].is_empty() {
            break;
        }
        output.extend_from_slice(&frames[0]);
    }

    Ok(output.into_iter().skip(delay).take(expected).map(|s| s as f32).collect())
}

/// Decode and join artifacts into one stream at `target_rate`
///
/// # Errors
///
/// Returns error if any artifact cannot be decoded
pub fn concatenate(artifacts: &[AudioArtifact], target_rate: u32) -> Result<Vec<f32>> {
    let mut out = Vec::new();
    for artifact in artifacts {
        let (samples, rate) = artifact.load()?;
        out.extend(resample(&samples, rate, target_rate)?);
    }
    Ok(out)
}

/// Root-mean-square energy of a window
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    #[allow(clippy::cast_precision_loss)]
    let len = samples.len() as f32;
    (sum_squares / len).sqrt()
}

/// Strip leading and trailing windows quieter than `threshold`
///
/// Keeps `pad` of audio on each side of the voiced region. All-silent input
/// yields an empty buffer.
#[must_use]
pub fn trim_silence(samples: &[f32], sample_rate: u32, threshold: f32, pad: Duration) -> Vec<f32> {
    let window = samples_for(Duration::from_millis(10), sample_rate).max(1);
    let windows: Vec<&[f32]> = samples.chunks(window).collect();

    let Some(first) = windows.iter().position(|w| rms(w) >= threshold) else {
        return Vec::new();
    };
    let last = windows.iter().rposition(|w| rms(w) >= threshold).unwrap_or(first);

    let pad = samples_for(pad, sample_rate);
    let start = (first * window).saturating_sub(pad);
    let end = ((last + 1) * window + pad).min(samples.len());
    samples[start..end].to_vec()
}
