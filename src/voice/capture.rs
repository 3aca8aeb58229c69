//! Microphone capture via cpal

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::AudioSource;
use super::audio::SAMPLE_RATE;
use crate::{Error, Result};

/// How long `read_window` waits before treating the device as stalled
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Captures mono audio from the default input device
///
/// Not `Send`: construct it on the thread that reads from it.
pub struct MicrophoneSource {
    buffer: Arc<Mutex<Vec<f32>>>,
    _stream: Stream,
}

impl MicrophoneSource {
    /// Open the default input device and start streaming
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device is available
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!("audio capture started");

        Ok(Self {
            buffer,
            _stream: stream,
        })
    }
}

impl AudioSource for MicrophoneSource {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn read_window(&mut self, len: usize) -> Result<Option<Vec<f32>>> {
        let started = Instant::now();
        loop {
            {
                let mut buf = self
                    .buffer
                    .lock()
                    .map_err(|_| Error::Audio("capture buffer poisoned".to_string()))?;
                if buf.len() >= len {
                    let window: Vec<f32> = buf.drain(..len).collect();
                    return Ok(Some(window));
                }
            }
            if started.elapsed() > READ_TIMEOUT {
                return Err(Error::Audio("capture device stalled".to_string()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
