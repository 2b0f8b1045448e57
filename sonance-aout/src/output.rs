//! Output pipeline: post-mixer filters, output fifo, backend boundary
//!
//! Mixed buffers go through the post-mixer chain (mixer format to the format
//! the backend agreed to, then the optional channel remap) into the output
//! fifo. Backends pull from that fifo through a [`BufferSource`], either from
//! their own I/O thread or when notified after a mixing cycle.
//!
//! Lock levels: the post-mixer chain and the fifo are both `OutputFifo` locks
//! taken one after the other; the backend sits behind a `Backend` lock so its
//! `play` may pull from the fifo while holding it.

use crate::backend::{AudioBackend, VolumeInfo};
use crate::buffer::AudioBuffer;
use crate::error::{AoutError, Result};
use crate::fifo::Fifo;
use crate::filter::{FilterChain, Remap};
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::locks::{LeveledMutex, LockLevel};
use crate::throttle::{LogThrottle, WarnLatch};
use sonance_common::timing::Mtime;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared between the pipeline and the backend's pull handle
#[derive(Debug)]
struct OutputShared {
    fifo: LeveledMutex<Fifo>,
    /// Backend found the fifo empty
    starving: WarnLatch,
    late_log: LogThrottle,
    /// How far past its end a buffer may still be handed out
    tolerance: Mtime,
}

/// Pull handle given to the backend at open time
#[derive(Debug, Clone)]
pub struct BufferSource {
    shared: Arc<OutputShared>,
}

impl BufferSource {
    /// Next buffer due by `request_time`
    ///
    /// Pops the head buffer when its start date is due (or at once when
    /// `forced`); returns `None` and leaves the fifo untouched otherwise, and
    /// the backend supplies silence itself. Buffers that ended more than the
    /// tolerance before `request_time` are dropped unless forced.
    pub fn next_buffer(&self, request_time: Mtime, forced: bool) -> Option<AudioBuffer> {
        let shared = &self.shared;
        let mut fifo = shared.fifo.lock();
        loop {
            let Some(head) = fifo.peek() else {
                if shared.starving.raise() {
                    warn!("Output starving at {}: no buffer queued", request_time);
                }
                return None;
            };

            if !forced {
                if head.start_date > request_time {
                    return None;
                }
                if head.end_date + shared.tolerance < request_time {
                    let late = request_time - head.end_date;
                    fifo.pop();
                    if let Some(suppressed) = shared.late_log.check() {
                        warn!(
                            "Output buffer too late by {}µs, dropped ({} more suppressed)",
                            late, suppressed
                        );
                    }
                    continue;
                }
            }

            if shared.starving.clear() {
                info!("Output recovered from starvation");
            }
            return fifo.pop();
        }
    }

    /// Start date of the head buffer
    pub fn first_date(&self) -> Option<Mtime> {
        self.shared.fifo.lock().first_date()
    }

    pub fn queued_buffers(&self) -> usize {
        self.shared.fifo.lock().len()
    }

    pub fn is_starving(&self) -> bool {
        self.shared.starving.is_raised()
    }
}

/// Sink side of the pipeline
pub struct OutputPipeline {
    backend: LeveledMutex<Box<dyn AudioBackend>>,
    backend_name: &'static str,
    shared: Arc<OutputShared>,
    filters: LeveledMutex<FilterChain>,
    format: AudioSampleFormat,
    mixer_format: AudioSampleFormat,
    samples_per_buffer: usize,
    in_error: AtomicBool,
    closed: AtomicBool,
    /// Mixer produced nothing (silence production disabled)
    mixer_starving: WarnLatch,
    failure_log: LogThrottle,
    /// Last volume set, as f32 bits
    volume: AtomicU32,
}

impl OutputPipeline {
    /// Open `backend` and build the post-mixer chain
    ///
    /// The backend may agree to a different format than `requested`. The
    /// mixer format follows the agreed rate and layout, in fl32 when
    /// `mixer_float` is set. Any failure leaves the pipeline in error: it
    /// then drops everything it is given.
    pub fn new(
        mut backend: Box<dyn AudioBackend>,
        requested: AudioSampleFormat,
        mixer_float: bool,
        samples_per_buffer: usize,
        remap: Option<Vec<usize>>,
        tolerance: Mtime,
    ) -> Self {
        let shared = Arc::new(OutputShared {
            fifo: LeveledMutex::new(LockLevel::OutputFifo, Fifo::new(requested.bytes_per_second())),
            starving: WarnLatch::new(),
            late_log: LogThrottle::default(),
            tolerance,
        });
        let source = BufferSource {
            shared: Arc::clone(&shared),
        };
        let backend_name = backend.name();

        let mut in_error = false;
        let mut samples = samples_per_buffer.max(1);
        let format = match backend.open(&requested, source) {
            Ok(setup) => {
                if let Some(n) = setup.samples_per_buffer.filter(|n| *n > 0) {
                    samples = n;
                }
                setup.format
            }
            Err(e) => {
                error!("Cannot open output backend '{}': {}", backend_name, e);
                in_error = true;
                requested
            }
        };
        if let Err(e) = format.validate() {
            error!("Backend '{}' agreed to an unusable format: {}", backend_name, e);
            in_error = true;
        }

        let mixer_format = if mixer_float {
            format.with_encoding(SampleEncoding::Fl32)
        } else {
            format
        };

        let filters = match Self::build_filters(&mixer_format, &format, remap) {
            Ok(chain) => chain,
            Err(e) => {
                error!("No post-mixer chain {} -> {}: {}", mixer_format, format, e);
                in_error = true;
                FilterChain::empty(mixer_format)
            }
        };

        if format != requested {
            *shared.fifo.lock() = Fifo::new(format.bytes_per_second());
        }

        info!(
            "Output '{}' {} ({}), mixer {}, {} frames per buffer, filters [{}]",
            backend_name,
            format,
            format.print_channels(),
            mixer_format,
            samples,
            filters.stage_names().join(", ")
        );

        Self {
            backend: LeveledMutex::new(LockLevel::Backend, backend),
            backend_name,
            shared,
            filters: LeveledMutex::new(LockLevel::OutputFifo, filters),
            format,
            mixer_format,
            samples_per_buffer: samples,
            in_error: AtomicBool::new(in_error),
            closed: AtomicBool::new(false),
            mixer_starving: WarnLatch::new(),
            failure_log: LogThrottle::default(),
            volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    fn build_filters(
        mixer_format: &AudioSampleFormat,
        format: &AudioSampleFormat,
        remap: Option<Vec<usize>>,
    ) -> Result<FilterChain> {
        let mut chain = FilterChain::build(mixer_format, format)?;
        if let Some(table) = remap {
            let identity =
                table.len() == format.nb_channels() && table.iter().enumerate().all(|(i, c)| i == *c);
            if !identity {
                chain.push_stage(Box::new(Remap::new(*format, table)?))?;
            }
        }
        Ok(chain)
    }

    /// Convert a mixed buffer and queue it for the backend
    pub fn play(&self, buffer: AudioBuffer) {
        if self.is_in_error() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let result = self.filters.lock().play(buffer);
        let buffer = match result {
            Ok(buffer) => buffer,
            Err(e) => {
                if let Some(suppressed) = self.failure_log.check() {
                    warn!("Output buffer dropped: {} ({} more suppressed)", e, suppressed);
                }
                return;
            }
        };
        if buffer.nb_samples == 0 {
            return;
        }
        self.shared.fifo.lock().push(buffer);
    }

    /// Tell the backend new buffers are queued
    ///
    /// Takes the backend lock; callers must not hold the mixer or any input
    /// lock beyond what the lock order allows.
    pub fn notify_backend(&self) {
        if self.is_in_error() || self.closed.load(Ordering::Acquire) {
            return;
        }
        self.backend.lock().play();
    }

    /// Record whether the mixer had anything to play this cycle
    pub fn set_starving(&self, starving: bool) {
        if starving {
            if self.mixer_starving.raise() {
                warn!("Mixer starving: no input has data");
            }
        } else if self.mixer_starving.clear() {
            debug!("Mixer has data again");
        }
    }

    pub fn is_starving(&self) -> bool {
        self.mixer_starving.is_raised()
    }

    pub fn volume_infos(&self) -> Option<VolumeInfo> {
        self.backend.lock().volume_infos()
    }

    /// Hardware volume from the backend
    pub fn volume_get(&self) -> Result<f32> {
        let volume = self.backend.lock().volume_get()?;
        self.volume.store(volume.to_bits(), Ordering::Release);
        Ok(volume)
    }

    pub fn volume_set(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(AoutError::Format(format!("invalid volume {}", volume)));
        }
        self.backend.lock().volume_set(volume)?;
        self.volume.store(volume.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Last volume set or read through the backend
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    /// Hardware mute state from the backend
    pub fn mute_get(&self) -> Result<bool> {
        self.backend.lock().mute_get()
    }

    pub fn mute_set(&self, mute: bool) -> Result<()> {
        self.backend.lock().mute_set(mute)
    }

    /// Drop everything queued here and in the device; the output stays open
    pub fn flush(&self) {
        let dropped = {
            let mut fifo = self.shared.fifo.lock();
            let dropped = fifo.len();
            fifo.destroy();
            dropped
        };
        self.filters.lock().reset();
        if !self.is_closed() {
            self.backend.lock().flush();
        }
        debug!("Output '{}' flushed, {} buffers dropped", self.backend_name, dropped);
    }

    /// Shift every queued buffer (pause/resume)
    pub fn move_dates(&self, delta: Mtime) {
        self.shared.fifo.lock().move_dates(delta);
    }

    /// Flush the fifo, reset the chain, close the backend; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.lock().close();
        self.filters.lock().reset();
        self.shared.fifo.lock().destroy();
        info!("Output '{}' closed", self.backend_name);
    }

    /// Date right after the last queued sample
    pub fn end_date(&self) -> Option<Mtime> {
        self.shared.fifo.lock().end_date()
    }

    pub fn queued_buffers(&self) -> usize {
        self.shared.fifo.lock().len()
    }

    pub fn queued_duration(&self) -> Mtime {
        self.shared.fifo.lock().queued_duration()
    }

    /// Pull handle on the output fifo
    pub fn buffer_source(&self) -> BufferSource {
        BufferSource {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Format the mixer must produce
    pub fn mixer_format(&self) -> &AudioSampleFormat {
        &self.mixer_format
    }

    /// Format agreed with the backend
    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.lock().stage_names()
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for OutputPipeline {
    fn drop(&mut self) {
        self.close();
    }
}
