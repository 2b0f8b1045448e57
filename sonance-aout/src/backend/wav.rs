//! Simulated sound card writing to a WAV file
//!
//! `play` pulls due buffers from the output fifo into a sample ring; a device
//! thread drains one period from the ring per period of wall-clock time and
//! writes it out, padding with silence when the ring runs dry. Besides the
//! ring, the device thread only shares its run, mute and flush flags.

use super::{AudioBackend, BackendSetup};
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::output::BufferSource;
use crate::sample;
use crate::throttle::LogThrottle;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use sonance_common::timing::{frames_to_mtime, Clock};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ring capacity, in periods
const RING_PERIODS: usize = 8;

type Writer = hound::WavWriter<BufWriter<File>>;

fn wav_error(e: hound::Error) -> AoutError {
    AoutError::Backend(format!("WAV writer: {}", e))
}

/// Flags shared with the device thread
#[derive(Debug, Default)]
struct DeviceFlags {
    running: AtomicBool,
    muted: AtomicBool,
    /// Drop the ring content before the next period
    flush: AtomicBool,
}

struct Device {
    source: BufferSource,
    format: AudioSampleFormat,
    producer: HeapProd<f32>,
    /// Decoded samples that did not fit in the ring yet
    pending: Vec<f32>,
    flags: Arc<DeviceFlags>,
    thread: Option<JoinHandle<Result<u64>>>,
    period_frames: usize,
}

/// File-backed output device
pub struct WavBackend {
    path: PathBuf,
    samples_per_buffer: usize,
    clock: Arc<dyn Clock>,
    muted: bool,
    device: Option<Device>,
}

impl WavBackend {
    pub fn new(path: PathBuf, samples_per_buffer: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            path,
            samples_per_buffer: samples_per_buffer.max(1),
            clock,
            muted: false,
            device: None,
        }
    }

    fn spec(format: &AudioSampleFormat) -> hound::WavSpec {
        let float = format.encoding() == SampleEncoding::Fl32;
        hound::WavSpec {
            channels: format.nb_channels() as u16,
            sample_rate: format.rate(),
            bits_per_sample: if float { 32 } else { 16 },
            sample_format: if float {
                hound::SampleFormat::Float
            } else {
                hound::SampleFormat::Int
            },
        }
    }
}

fn write_samples(writer: &mut Writer, format: &AudioSampleFormat, samples: &[f32]) -> Result<()> {
    match format.encoding() {
        SampleEncoding::Fl32 => {
            for s in samples {
                writer.write_sample(*s).map_err(wav_error)?;
            }
        }
        _ => {
            for s in samples {
                writer.write_sample(sample::f32_to_i16(*s)).map_err(wav_error)?;
            }
        }
    }
    Ok(())
}

/// Device thread body; returns the frames written
fn run_device(
    mut consumer: HeapCons<f32>,
    mut writer: Writer,
    format: AudioSampleFormat,
    period_frames: usize,
    flags: Arc<DeviceFlags>,
) -> Result<u64> {
    let channels = format.nb_channels();
    let mut period = vec![0.0f32; period_frames * channels];
    let period_duration = Duration::from_micros(frames_to_mtime(period_frames, format.rate()) as u64);
    let underruns = LogThrottle::default();
    let mut written = 0u64;
    let mut started = false;
    let mut deadline = Instant::now();

    while flags.running.load(Ordering::Acquire) {
        if flags.flush.swap(false, Ordering::AcqRel) {
            let dropped = consumer.clear();
            debug!("WAV output flushed {} samples", dropped);
            started = false;
        }

        let read = consumer.pop_slice(&mut period);
        started |= read > 0;
        if read < period.len() {
            period[read..].fill(0.0);
            if started {
                if let Some(suppressed) = underruns.check() {
                    warn!(
                        "WAV output underrun: {} of {} samples ({} more suppressed)",
                        read,
                        period.len(),
                        suppressed
                    );
                }
            }
        }
        if flags.muted.load(Ordering::Acquire) {
            period.fill(0.0);
        }
        write_samples(&mut writer, &format, &period)?;
        written += period_frames as u64;

        deadline += period_duration;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            deadline = now;
        }
    }

    // play out what is left
    loop {
        let read = consumer.pop_slice(&mut period);
        if read == 0 {
            break;
        }
        if flags.muted.load(Ordering::Acquire) {
            period[..read].fill(0.0);
        }
        write_samples(&mut writer, &format, &period[..read])?;
        written += (read / channels) as u64;
    }

    writer.finalize().map_err(wav_error)?;
    Ok(written)
}

impl AudioBackend for WavBackend {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn open(&mut self, requested: &AudioSampleFormat, source: BufferSource) -> Result<BackendSetup> {
        if self.device.is_some() {
            return Err(AoutError::Backend("WAV output already open".to_string()));
        }

        let encoding = match requested.encoding() {
            SampleEncoding::Fl32 => SampleEncoding::Fl32,
            _ => SampleEncoding::S16L,
        };
        let format = requested.with_encoding(encoding);
        format.validate()?;

        let writer = hound::WavWriter::create(&self.path, Self::spec(&format)).map_err(wav_error)?;

        let period_frames = self.samples_per_buffer;
        let ring = HeapRb::<f32>::new(period_frames * format.nb_channels() * RING_PERIODS);
        let (producer, consumer) = ring.split();

        let flags = Arc::new(DeviceFlags {
            running: AtomicBool::new(true),
            muted: AtomicBool::new(self.muted),
            flush: AtomicBool::new(false),
        });
        let thread_flags = Arc::clone(&flags);
        let thread = thread::Builder::new()
            .name("sonance-wav".to_string())
            .spawn(move || run_device(consumer, writer, format, period_frames, thread_flags))?;

        info!("WAV output {} opened for {}", self.path.display(), format);
        self.device = Some(Device {
            source,
            format,
            producer,
            pending: Vec::new(),
            flags,
            thread: Some(thread),
            period_frames,
        });

        Ok(BackendSetup {
            format,
            samples_per_buffer: Some(period_frames),
        })
    }

    fn play(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let channels = device.format.nb_channels();
        let period = frames_to_mtime(device.period_frames, device.format.rate());

        loop {
            if !device.pending.is_empty() {
                let pushed = device.producer.push_slice(&device.pending);
                device.pending.drain(..pushed);
                if !device.pending.is_empty() {
                    break;
                }
            }

            // date the ring's tail will be heard at
            let queued = device.producer.occupied_len() / channels;
            let tail = self.clock.now() + frames_to_mtime(queued, device.format.rate());
            let Some(buffer) = device.source.next_buffer(tail + period, false) else {
                break;
            };
            sample::decode_into(device.format.encoding(), buffer.data(), &mut device.pending);
        }
    }

    fn mute_get(&self) -> Result<bool> {
        Ok(self.muted)
    }

    fn mute_set(&mut self, mute: bool) -> Result<()> {
        self.muted = mute;
        if let Some(device) = self.device.as_ref() {
            device.flags.muted.store(mute, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.pending.clear();
            device.flags.flush.store(true, Ordering::Release);
        }
    }

    fn close(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        // hand over whatever fits before stopping the device
        let pushed = device.producer.push_slice(&device.pending);
        if pushed < device.pending.len() {
            debug!("WAV output closing with {} samples not played", device.pending.len() - pushed);
        }

        device.flags.running.store(false, Ordering::Release);
        let Some(thread) = device.thread.take() else {
            return;
        };
        match thread.join() {
            Ok(Ok(frames)) => info!("WAV output {} finalized, {} frames", self.path.display(), frames),
            Ok(Err(e)) => error!("WAV output {} failed: {}", self.path.display(), e),
            Err(_) => error!("WAV output thread panicked"),
        }
    }
}

impl Drop for WavBackend {
    fn drop(&mut self) {
        self.close();
    }
}
