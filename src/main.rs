use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use lectern::db::{self, VectorStore};
use lectern::knowledge::Ingestor;
use lectern::voice::{AudioCapture, AudioOutput, AudioPlayback, calculate_energy};
use lectern::{Config, Daemon, daemon, setup};

/// Lectern - voice assistant grounded in your documents
#[derive(Parser)]
#[command(name = "lectern", version, about)]
struct Cli {
    /// Port for the web coordinator
    #[arg(long, env = "LECTERN_PORT", global = true)]
    port: Option<u16>,

    /// Data directory (database and session snapshot)
    #[arg(long, env = "LECTERN_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Speech loop and web coordinator in one process (default)
    Run,
    /// Speech loop only
    Listen,
    /// Web coordinator only
    Serve,
    /// Provision the knowledge store
    Setup {
        /// Only verify the store, exit non-zero if unprovisioned
        #[arg(long)]
        check: bool,
    },
    /// Ingest .txt and .md files from a directory
    Ingest {
        /// Directory to read recursively
        dir: PathBuf,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,lectern=info",
        1 => "info,lectern=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }
    if let Some(dir) = cli.data_dir {
        std::fs::create_dir_all(&dir)?;
        config.data_dir = dir;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => Daemon::new(config).run().await?,
        Command::Listen => Daemon::new(config).listen().await?,
        Command::Serve => Daemon::new(config).serve().await?,
        Command::Setup { check } => cmd_setup(&config, check)?,
        Command::Ingest { dir } => cmd_ingest(&config, &dir).await?,
        Command::TestMic { duration } => test_mic(&config, duration).await?,
        Command::TestSpeaker => test_speaker(&config).await?,
    }
    Ok(())
}

fn cmd_setup(config: &Config, check: bool) -> anyhow::Result<()> {
    let report = if check {
        setup::check(config)?
    } else {
        setup::provision(config)?
    };
    println!("{report}");
    Ok(())
}

async fn cmd_ingest(config: &Config, dir: &Path) -> anyhow::Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let pool = db::open(config.db_path())?;
    let embedder = daemon::build_embedder(config)?;
    let ingestor = Ingestor::new(VectorStore::new(pool), embedder);

    let report = ingestor.ingest_dir(dir).await?;
    println!(
        "Ingested {} files into {} chunks ({} replaced, {} skipped)",
        report.files, report.chunks, report.replaced, report.skipped
    );
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(config.audio.sample_rate)?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("VAD threshold: {:.4}", config.audio.vad_threshold);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Some(error) = capture.take_error() {
            anyhow::bail!("capture failed: {error}");
        }

        let samples = capture.take_buffer();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        let speech = if energy > config.audio.vad_threshold {
            "speech"
        } else {
            "quiet"
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | {speech:6} | [{meter}]",
            i + 1,
            energy,
            peak,
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let (events, _events_rx) = mpsc::channel(16);
    let mut playback =
        AudioPlayback::spawn(&config.audio, Arc::new(AtomicBool::new(false)), events)?;
    let output = playback.handle();

    let sample_rate = config.audio.playback_sample_rate;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    output.enqueue(&samples)?;

    while output.pending() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the device flush its own buffer
    tokio::time::sleep(Duration::from_millis(200)).await;
    playback.shutdown();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl list sinks short");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}
