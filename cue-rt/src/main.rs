//! cue-player - Main entry point
//!
//! Loads an event bank, fires events on a timeline and plays the result,
//! either live through the default (or named) output device or offline
//! into a 32-bit float WAV file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use cue_common::timing::ms_to_frames;
use cue_rt::audio::{AudioOutput, AudioRingBuffer};
use cue_rt::io::StdFileSystem;
use cue_rt::jobs::{InlineExecutor, JobExecutor, WorkerPool};
use cue_rt::mix::{MixEngine, SoftMixEngine};
use cue_rt::{BankHandle, Context, RuntimeConfig};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Control ticks per second in live mode
const CONTROL_INTERVAL: Duration = Duration::from_millis(10);

/// Command-line arguments for cue-player
#[derive(Parser, Debug)]
#[command(name = "cue-player")]
#[command(about = "Plays events from a cue bank")]
#[command(version)]
struct Args {
    /// Bank file
    #[arg(required_unless_present = "list_devices")]
    bank: Option<PathBuf>,

    /// Companion data file for banks without stream sources
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Config file (default: CUE_CONFIG, then the platform config dir)
    #[arg(short, long, env = "CUE_CONFIG")]
    config: Option<PathBuf>,

    /// Event to fire: name[@ms][#object], repeatable
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Render offline into this WAV file instead of playing live
    #[arg(long)]
    render: Option<PathBuf>,

    /// Length to play or render (live: until Ctrl+C when absent)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Frames per mixer block
    #[arg(long, default_value = "512")]
    block_size: usize,

    /// Print active groups as JSON once per second
    #[arg(long)]
    status_json: bool,

    /// Seed for random nodes (overrides the config)
    #[arg(long)]
    seed: Option<u64>,
}

/// Event fired at a point on the playback timeline
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimedEvent {
    name: String,
    at_ms: u64,
    object_id: u64,
}

impl TimedEvent {
    /// Parse `name[@ms][#object]`
    fn parse(spec: &str) -> Result<Self> {
        let (rest, object_id) = match spec.rsplit_once('#') {
            Some((rest, object)) => (
                rest,
                object
                    .parse()
                    .with_context(|| format!("bad object id in '{}'", spec))?,
            ),
            None => (spec, 0),
        };
        let (name, at_ms) = match rest.rsplit_once('@') {
            Some((name, ms)) => (
                name,
                ms.parse().with_context(|| format!("bad time in '{}'", spec))?,
            ),
            None => (rest, 0),
        };
        if name.is_empty() {
            return Err(anyhow!("empty event name in '{}'", spec));
        }
        Ok(Self {
            name: name.to_string(),
            at_ms,
            object_id,
        })
    }
}

/// Fires events as the engine clock passes them
struct Timeline {
    events: Vec<(u64, TimedEvent)>,
    next: usize,
}

impl Timeline {
    fn new(mut events: Vec<TimedEvent>, sample_rate: u32) -> Self {
        events.sort_by_key(|e| e.at_ms);
        Self {
            events: events
                .into_iter()
                .map(|e| (ms_to_frames(e.at_ms, sample_rate), e))
                .collect(),
            next: 0,
        }
    }

    fn fire_due(&mut self, ctx: &mut Context, bank: BankHandle, now: u64) {
        while let Some((frame, event)) = self.events.get(self.next) {
            if *frame > now {
                break;
            }
            if !ctx.fire_event(bank, &event.name, event.object_id) {
                warn!("Event '{}' not fired", event.name);
            }
            self.next += 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if args.seed.is_some() {
        config.random_seed = args.seed;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_devices {
        for name in AudioOutput::list_devices().context("Failed to list devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let events = args
        .events
        .iter()
        .map(|spec| TimedEvent::parse(spec))
        .collect::<Result<Vec<_>>>()?;

    match &args.render {
        Some(path) => render_offline(&args, config, events, path.clone()),
        None => play_live(&args, config, events).await,
    }
}

fn bank_path(args: &Args) -> Result<PathBuf> {
    args.bank.clone().ok_or_else(|| anyhow!("no bank given"))
}

/// Render the timeline into a WAV file as fast as possible
fn render_offline(args: &Args, config: RuntimeConfig, events: Vec<TimedEvent>, path: PathBuf) -> Result<()> {
    let rate = config.output_sample_rate;
    let engine = Arc::new(SoftMixEngine::new(rate));
    // Decode inline so every block is complete
    let jobs: Arc<dyn JobExecutor> = Arc::new(InlineExecutor);
    let mut ctx = Context::new(config, engine.clone(), Arc::new(StdFileSystem), jobs)
        .context("Failed to create runtime")?;
    let bank = ctx
        .load_bank(&bank_path(args)?, args.data.as_deref())
        .context("Failed to load bank")?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let total = ms_to_frames(args.duration_ms.unwrap_or(10_000), rate);
    let block = args.block_size.max(1);
    let mut timeline = Timeline::new(events, rate);
    let mut buffer = vec![0.0f32; block * 2];
    let mut rendered = 0u64;

    info!("Rendering {} frames to {}", total, path.display());
    while rendered < total {
        timeline.fire_due(&mut ctx, bank, rendered);
        ctx.process_frame();

        // Streamed chunks arrive on the reader thread; wait for them
        while ctx.cache().reader().pending() > 0 {
            thread::sleep(Duration::from_micros(200));
        }

        let frames = (total - rendered).min(block as u64) as usize;
        engine.render(&mut buffer[..frames * 2]);
        for sample in &buffer[..frames * 2] {
            writer.write_sample(*sample)?;
        }
        rendered += frames as u64;
    }
    ctx.process_frame();
    writer.finalize().context("Failed to finish WAV file")?;

    if args.status_json {
        println!("{}", serde_json::to_string(&ctx.active_groups())?);
    }
    info!("Render complete");
    Ok(())
}

/// Play through the output device until the duration elapses or Ctrl+C
async fn play_live(args: &Args, config: RuntimeConfig, events: Vec<TimedEvent>) -> Result<()> {
    let mut output = AudioOutput::new(args.device.as_deref(), config.output_sample_rate, None)
        .context("Failed to open audio output")?;
    let rate = output.sample_rate();
    info!("Playing on '{}' at {} Hz", output.device_name(), rate);

    let engine = Arc::new(SoftMixEngine::new(rate));
    let jobs: Arc<dyn JobExecutor> =
        Arc::new(WorkerPool::new(config.decode_workers).context("Failed to start decode workers")?);
    let mut ctx = Context::new(config, engine.clone(), Arc::new(StdFileSystem), jobs)
        .context("Failed to create runtime")?;
    let bank = ctx
        .load_bank(&bank_path(args)?, args.data.as_deref())
        .context("Failed to load bank")?;

    // ~100ms between the mixer and the device
    let (mut producer, mut consumer) = AudioRingBuffer::new(Some((rate as usize / 10).max(1024))).split();
    let running = Arc::new(AtomicBool::new(true));
    let block = args.block_size.max(1);

    let mixer = {
        let engine = Arc::clone(&engine);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("cue-mixer".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; block * 2];
                while running.load(Ordering::Relaxed) {
                    if producer.vacant_len() >= block {
                        engine.render(&mut buffer);
                        producer.push_interleaved(&buffer);
                    } else {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
                debug!("Mixer thread exiting after {} underrun frames", producer.underruns());
            })
            .context("Failed to spawn mixer thread")?
    };

    output.start(move || consumer.pop()).context("Failed to start audio")?;

    let mut timeline = Timeline::new(events, rate);
    let end = args.duration_ms.map(|ms| ms_to_frames(ms, rate));
    let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
    let mut status = tokio::time::interval(Duration::from_secs(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let now = engine.time_frames();
                timeline.fire_due(&mut ctx, bank, now);
                ctx.process_frame();
                if end.is_some_and(|end| now >= end) {
                    info!("Duration reached");
                    break;
                }
                if output.has_error() {
                    warn!("Audio stream reported an error, stopping");
                    break;
                }
            }
            _ = status.tick(), if args.status_json => {
                println!("{}", serde_json::to_string(&ctx.active_groups())?);
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    if mixer.join().is_err() {
        warn!("Mixer thread panicked");
    }
    output.stop().context("Failed to stop audio")?;
    ctx.unload_bank(bank);
    info!("Playback stopped after {} device frames", output.frames_played());
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
