//! Sonance player (sonance-aout) - Main entry point
//!
//! Decodes files (or generates tones) on one thread per input, mixes them in
//! real time and plays the result through the configured backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use sonance_aout::backend::create_backend;
use sonance_aout::config::BackendKind;
use sonance_aout::decoder::{AudioSource, DecoderFeed, FileDecoder, ToneGenerator};
use sonance_aout::format::{ChannelMask, SampleEncoding};
use sonance_aout::input::{DropReason, PlayStatus};
use sonance_aout::{AoutConfig, AudioInstance, AudioSampleFormat, MixerThread};
use sonance_common::timing::{frames_to_mtime, Clock, SystemClock};
use tracing::{debug, info, warn};

/// Frames per generated tone chunk
const TONE_CHUNK_FRAMES: usize = 1024;

/// Command-line arguments for sonance-aout
#[derive(Parser, Debug)]
#[command(name = "sonance-aout")]
#[command(about = "Mix audio files and tones through the sonance output pipeline")]
#[command(version)]
struct Args {
    /// Config file (overrides SONANCE_CONFIG and the per-user file)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to play through
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// WAV file written by the wav backend
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output sample rate
    #[arg(short, long)]
    rate: Option<u32>,

    /// Mix in fl32
    #[arg(long, conflicts_with = "no_float")]
    float: bool,

    /// Mix in s16l
    #[arg(long)]
    no_float: bool,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Add a sine input at this frequency (Hz); may be repeated
    #[arg(short, long)]
    tone: Vec<f32>,

    /// Audio files, each played as its own input
    files: Vec<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut AoutConfig) {
        if let Some(backend) = self.backend {
            config.output.backend = backend;
        }
        if let Some(path) = &self.output {
            config.output.wav_path = path.clone();
        }
        if let Some(rate) = self.rate {
            config.output.rate = rate;
        }
        if self.float {
            config.mixer.float = true;
        }
        if self.no_float {
            config.mixer.float = false;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AoutConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sonance_aout={}", config.logging.level).into()),
        )
        .init();

    info!("Starting sonance-aout with {:?} backend", config.output.backend);

    let mut sources = open_sources(&args, &config)?;
    if sources.is_empty() {
        info!("No input given, playing a 440 Hz tone");
        sources.push(Box::new(tone(&config, 440.0)?));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let backend = create_backend(&config.output, Arc::clone(&clock));
    let instance = Arc::new(
        AudioInstance::new(&config, backend, clock).context("Failed to create audio instance")?,
    );
    if instance.output().is_in_error() {
        warn!("Output is in error, nothing will be heard");
    }

    // mix twice per output buffer
    let mixed = instance.output().samples_per_buffer();
    let period = frames_to_mtime(mixed, instance.mixer_format().rate()) / 2;
    let mixer = MixerThread::spawn(Arc::clone(&instance), Duration::from_micros(period.max(1_000) as u64))
        .context("Failed to start mixer thread")?;

    let stop = Arc::new(AtomicBool::new(false));
    let feeders = sources
        .into_iter()
        .enumerate()
        .map(|(n, source)| spawn_feeder(n, Arc::clone(&instance), source, Arc::clone(&stop)))
        .collect::<Result<Vec<_>>>()?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    while !feeders.iter().all(|f| f.is_finished()) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Duration reached");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    stop.store(true, Ordering::Release);
    for feeder in feeders {
        if feeder.join().is_err() {
            warn!("Input thread panicked");
        }
    }
    mixer.stop();
    instance.shutdown();

    info!("Playback finished");
    Ok(())
}

fn tone(config: &AoutConfig, frequency: f32) -> Result<ToneGenerator> {
    let format = AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, config.output.rate);
    format.validate().context("Invalid tone format")?;
    Ok(ToneGenerator::new(format, frequency, 0.25, TONE_CHUNK_FRAMES))
}

fn open_sources(args: &Args, config: &AoutConfig) -> Result<Vec<Box<dyn AudioSource>>> {
    let mut sources: Vec<Box<dyn AudioSource>> = Vec::new();
    for path in &args.files {
        match FileDecoder::open(path) {
            Ok(decoder) => {
                info!("Input {}: {}", path.display(), decoder.format());
                sources.push(Box::new(decoder));
            }
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    for frequency in &args.tone {
        sources.push(Box::new(tone(config, *frequency)?));
    }
    Ok(sources)
}

/// Decode `source` into a new input, keeping at most two latencies queued
fn spawn_feeder(
    n: usize,
    instance: Arc<AudioInstance>,
    mut source: Box<dyn AudioSource>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("sonance-input-{}", n))
        .spawn(move || {
            let format = source.format();
            let id = instance.input_new(format, &format!("source-{}", n));
            let Ok(input) = instance.input(id) else {
                return;
            };
            let ahead = instance.latency() * 2;
            let mut feed = DecoderFeed::new(format, instance.now() + instance.latency());

            while !stop.load(Ordering::Acquire) {
                if input.queued_duration() > ahead {
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                let samples = match source.next_chunk() {
                    Ok(Some(samples)) => samples,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("{}: {}", id, e);
                        break;
                    }
                };
                match instance.input_play(id, feed.stamp(&samples)) {
                    Ok(PlayStatus::Dropped(DropReason::Late)) => {
                        // fell behind the clock: restart just ahead of it
                        debug!("{} late, re-anchoring", id);
                        feed = DecoderFeed::new(format, instance.now() + instance.latency());
                        input.mark_format_changed();
                    }
                    Ok(PlayStatus::Dropped(DropReason::InError | DropReason::Deleted)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("{}: {}", id, e);
                        break;
                    }
                }
            }

            // let the mixer drain what is queued
            while !stop.load(Ordering::Acquire) && input.queued_buffers() > 0 {
                thread::sleep(Duration::from_millis(10));
            }
            if let Err(e) = instance.input_delete(id) {
                debug!("{} already removed: {}", id, e);
            }
        })?;
    Ok(handle)
}
