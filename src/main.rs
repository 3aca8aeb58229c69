use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voicecall_agent::synthesis::Synthesizer;
use voicecall_agent::{Config, Daemon};

/// Voicecall - autonomous voice-call agent
#[derive(Parser)]
#[command(name = "voicecall", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/voicecall/config.toml)
    #[arg(short, long, env = "VOICECALL_CONFIG")]
    config: Option<PathBuf>,

    /// Request whole replies instead of streaming them
    #[arg(long)]
    batch: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sidecars and run a call (default)
    Call,
    /// Measure ambient noise and print the resulting VAD threshold
    Calibrate {
        /// Sampling length in seconds
        #[arg(short, long, default_value = "3")]
        duration: u64,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Synthesize text through the configured engines and play it
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Start the sidecars, print their status, and stop them
    Services,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicecall_agent=info",
        1 => "info,voicecall_agent=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.batch {
        config.llm.streaming = false;
        config.conversation.coordinator.streaming = false;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Call) {
        Command::Call => call(config).await,
        Command::Calibrate { duration } => calibrate(config, duration).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(config, &text).await,
        Command::Services => services(config).await,
    }
}

/// Run a full call on the default devices
#[cfg(feature = "device-audio")]
async fn call(config: Config) -> anyhow::Result<()> {
    use voicecall_agent::voice::{MicrophoneSource, SpeakerSink};

    tracing::info!(
        model = %config.llm.model,
        streaming = config.llm.streaming,
        services = config.services.len(),
        "starting voicecall agent"
    );

    let daemon = Daemon::new(config).await?;
    let sink = SpeakerSink::open()?;
    let result = daemon.run_call(MicrophoneSource::open, Box::new(sink)).await;
    daemon.shutdown().await;

    let summary = result?;
    println!("Call ended: {:?}", summary.reason);
    match summary.coverage_confirmed {
        Some(true) => println!("Coverage: confirmed"),
        Some(false) => println!("Coverage: declined"),
        None => println!("Coverage: unknown"),
    }
    Ok(())
}

#[cfg(not(feature = "device-audio"))]
#[allow(clippy::unused_async)]
async fn call(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!("built without audio devices; rebuild with --features device-audio")
}

/// Sample ambient noise and print the calibrated threshold
#[cfg(feature = "device-audio")]
async fn calibrate(config: Config, duration: u64) -> anyhow::Result<()> {
    use std::time::Duration;

    use voicecall_agent::voice::{EnergyVad, MicrophoneSource, calibrate_vad};

    println!("Calibrating for {duration} seconds, stay quiet...");

    let window = config.audio.recorder.window;
    let multiplier = config.audio.threshold_multiplier;
    let threshold = tokio::task::spawn_blocking(move || -> voicecall_agent::Result<f32> {
        let mut mic = MicrophoneSource::open()?;
        let mut vad = EnergyVad::new(config.initial_threshold(), multiplier);
        calibrate_vad(&mut mic, &mut vad, window, Duration::from_secs(duration))?;
        Ok(vad.threshold())
    })
    .await??;

    println!("Energy threshold: {threshold:.4}");
    println!("To pin it, add to your config file:\n\n[audio]\nenergy_threshold = {threshold:.4}");
    Ok(())
}

#[cfg(not(feature = "device-audio"))]
#[allow(clippy::unused_async)]
async fn calibrate(_config: Config, _duration: u64) -> anyhow::Result<()> {
    anyhow::bail!("built without audio devices; rebuild with --features device-audio")
}

/// Test microphone input
#[cfg(feature = "device-audio")]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    use voicecall_agent::voice::audio::rms;
    use voicecall_agent::voice::{AudioSource, MicrophoneSource};

    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    tokio::task::spawn_blocking(move || -> voicecall_agent::Result<()> {
        let mut mic = MicrophoneSource::open()?;
        let rate = mic.sample_rate();
        println!("Sample rate: {rate} Hz");
        println!("---");

        for i in 0..duration {
            let Some(samples) = mic.read_window(rate as usize)? else {
                break;
            };
            let energy = rms(&samples);
            let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
        }
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

#[cfg(not(feature = "device-audio"))]
#[allow(clippy::unused_async)]
async fn test_mic(_duration: u64) -> anyhow::Result<()> {
    anyhow::bail!("built without audio devices; rebuild with --features device-audio")
}

/// Test speaker output with a sine wave
#[cfg(feature = "device-audio")]
async fn test_speaker() -> anyhow::Result<()> {
    use std::time::Duration;

    use voicecall_agent::voice::audio::write_wav;
    use voicecall_agent::voice::{AudioArtifact, AudioSink, SpeakerSink};

    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let path = tempfile::Builder::new().suffix(".wav").tempfile()?.into_temp_path();
    write_wav(&path, &samples, sample_rate)?;
    let artifact = AudioArtifact::persistent(path.to_path_buf(), Duration::from_secs(2));

    let mut sink = SpeakerSink::open()?;
    sink.play(&[artifact]).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

#[cfg(not(feature = "device-audio"))]
#[allow(clippy::unused_async)]
async fn test_speaker() -> anyhow::Result<()> {
    anyhow::bail!("built without audio devices; rebuild with --features device-audio")
}

/// Synthesize `text` and play it when a speaker is available
async fn test_tts(config: Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let daemon = Daemon::new(config).await?;
    let result = synthesize_and_play(&daemon, text).await;
    daemon.shutdown().await;
    result
}

async fn synthesize_and_play(daemon: &Daemon, text: &str) -> anyhow::Result<()> {
    let client = daemon.synthesis_client()?;
    let health = client.health().await;
    println!("Engine ready: {} (model loaded: {})", health.ready, health.model_loaded);

    println!("Synthesizing speech...");
    let artifact = client.synthesize(text).await?;
    println!("Artifact: {} ({:?})", artifact.path.display(), artifact.duration);

    #[cfg(feature = "device-audio")]
    {
        use voicecall_agent::voice::{AudioSink, SpeakerSink};

        println!("Playing audio...");
        let mut sink = SpeakerSink::open()?;
        sink.play(std::slice::from_ref(&artifact)).await?;
    }

    if let Some(cache) = client.cache() {
        println!("Cache: {:?}", cache.stats().await);
    }
    artifact.discard();

    println!("\n---");
    println!("If you heard the speech, TTS is working!");
    Ok(())
}

/// Start every sidecar, print its status, then stop it
async fn services(config: Config) -> anyhow::Result<()> {
    if config.services.is_empty() {
        println!("No services configured");
        return Ok(());
    }

    let daemon = Daemon::new(config).await?;
    for handle in daemon.services().handles().await {
        println!(
            "{:<8} {:<10} pid={:<8} {}:{} failures={}",
            handle.name,
            handle.health_status.to_string(),
            handle.process_id.map_or_else(|| "-".to_string(), |p| p.to_string()),
            handle.host,
            handle.port,
            handle.consecutive_failures,
        );
    }
    daemon.shutdown().await;
    Ok(())
}
