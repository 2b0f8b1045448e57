//! Audio instance: the root owning the inputs, the mixer and the output
//!
//! # Lock order
//!
//! ```text
//! mixer -> input (one at a time) -> backend -> output fifo -> input registry
//! ```
//!
//! - Decoder threads only take their own input lock, except to rebuild a
//!   restarted input, which happens under the mixer lock.
//! - A mixing cycle holds the mixer lock, snapshots the registry (taking and
//!   releasing the registry lock), locks each input in turn, then queues the
//!   mixed buffer in the output fifo.
//! - The backend is notified after the mixer lock is released.
//! - Deleting an input holds the mixer lock, so it never races a cycle.
//! - A flush holds the mixer lock while it empties every input, then the
//!   output; the backend is flushed last.

use crate::backend::{AudioBackend, VolumeInfo};
use crate::buffer::AudioBuffer;
use crate::config::{AoutConfig, InputConfig};
use crate::error::{AoutError, Result};
use crate::format::AudioSampleFormat;
use crate::input::{InputId, InputPipeline, InputRegistry, InputSettings, PlayStatus};
use crate::locks::{LeveledMutex, LockLevel};
use crate::mixer::{MixOutcome, Mixer};
use crate::output::OutputPipeline;
use crate::throttle::LogThrottle;
use sonance_common::timing::{Clock, Mtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Upper bound of mixing cycles one tick may run
const MAX_TICK_CYCLES: usize = 64;

/// Software volume range offered when the backend has none
const SOFT_VOLUME: VolumeInfo = VolumeInfo {
    min: 0.0,
    max: 2.0,
    step: 0.01,
};

/// What one mixing cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixStatus {
    /// Mixed buffer queued, with the number of contributing inputs
    Mixed(usize),
    /// Silence queued
    Silence,
    /// Nothing queued: no input had data
    Starved,
    Paused,
}

/// Root of the audio output core
pub struct AudioInstance {
    mixer: LeveledMutex<Mixer>,
    registry: LeveledMutex<InputRegistry>,
    output: OutputPipeline,
    clock: Arc<dyn Clock>,
    input_config: InputConfig,
    latency: Mtime,
}

impl AudioInstance {
    /// Open the output on `backend` and create the mixer for its format
    ///
    /// Only an invalid configuration fails; backend and chain problems leave
    /// the output or mixer in error.
    pub fn new(config: &AoutConfig, backend: Box<dyn AudioBackend>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let requested = config.output_format()?;

        let output = OutputPipeline::new(
            backend,
            requested,
            config.mixer.float,
            config.output.samples_per_buffer,
            config.output.remap.clone(),
            config.input.pts_tolerance_us,
        );
        let mixer = Mixer::new(
            *output.mixer_format(),
            &config.mixer,
            output.samples_per_buffer(),
            config.input.pts_tolerance_us,
        );

        info!(
            "Audio instance ready: output {} via '{}', latency {}µs",
            output.format(),
            output.backend_name(),
            config.output.latency_us
        );

        Ok(Self {
            mixer: LeveledMutex::new(LockLevel::Mixer, mixer),
            registry: LeveledMutex::new(LockLevel::InputRegistry, InputRegistry::new()),
            output,
            clock,
            input_config: config.input.clone(),
            latency: config.output.latency_us,
        })
    }

    /// Register a new input producing `format`
    ///
    /// An input whose format cannot be converted is still registered, in
    /// error, and drops everything played into it.
    pub fn input_new(&self, format: AudioSampleFormat, name: &str) -> InputId {
        let mixer_format = *self.mixer.lock().format();
        let settings = InputSettings::from(&self.input_config).named(name);
        self.registry
            .lock()
            .insert_with(|id| InputPipeline::new(id, format, mixer_format, settings))
    }

    /// Live input behind `id`
    pub fn input(&self, id: InputId) -> Result<Arc<InputPipeline>> {
        self.registry.lock().get(id).ok_or(AoutError::InputNotFound(id))
    }

    /// Submit a decoded buffer to input `id`
    pub fn input_play(&self, id: InputId, buffer: AudioBuffer) -> Result<PlayStatus> {
        let input = self.input(id)?;
        if input.restart_requested() {
            let mixer = self.mixer.lock();
            input.rebuild(*mixer.format());
        }
        Ok(input.play(buffer, self.clock.now()))
    }

    /// Unregister input `id`, dropping whatever it still had queued
    pub fn input_delete(&self, id: InputId) -> Result<()> {
        let _mixer = self.mixer.lock();
        let input = self.input(id)?;
        input.delete();
        self.registry.lock().remove(id);
        info!("{} ({}) removed", id, input.name());
        Ok(())
    }

    /// Ids of every live input, lowest slot first
    pub fn inputs(&self) -> Vec<InputId> {
        self.registry.lock().snapshot().iter().map(|input| input.id()).collect()
    }

    /// Run one mixing cycle and queue its result for the backend
    pub fn mixer_run(&self) -> Result<MixStatus> {
        let now = self.clock.now();
        let status = {
            let mut mixer = self.mixer.lock();
            let inputs = self.registry.lock().snapshot();
            match mixer.run(&inputs, now)? {
                MixOutcome::Mixed { buffer, inputs } => {
                    self.output.set_starving(false);
                    self.output.play(buffer);
                    MixStatus::Mixed(inputs)
                }
                MixOutcome::Silence(buffer) => {
                    self.output.play(buffer);
                    MixStatus::Silence
                }
                MixOutcome::Starved => {
                    self.output.set_starving(true);
                    MixStatus::Starved
                }
                MixOutcome::Paused => MixStatus::Paused,
            }
        };
        self.output.notify_backend();
        Ok(status)
    }

    /// Mix until the output covers `now + latency`; returns the cycles run
    pub fn tick(&self) -> Result<usize> {
        let horizon = self.clock.now() + self.latency;
        let mut cycles = 0;
        while cycles < MAX_TICK_CYCLES {
            if self.mixer.lock().next_date().is_some_and(|date| date >= horizon) {
                break;
            }
            match self.mixer_run()? {
                MixStatus::Starved | MixStatus::Paused => break,
                MixStatus::Mixed(_) | MixStatus::Silence => cycles += 1,
            }
        }
        Ok(cycles)
    }

    /// Software gain of a fl32 mixer
    pub fn set_multiplier(&self, multiplier: f32) -> Result<()> {
        self.mixer.lock().set_multiplier(multiplier)
    }

    pub fn multiplier(&self) -> f32 {
        self.mixer.lock().multiplier()
    }

    /// Hardware range, else the software range of a fl32 mixer
    pub fn volume_infos(&self) -> Option<VolumeInfo> {
        if let Some(infos) = self.output.volume_infos() {
            return Some(infos);
        }
        self.mixer.lock().supports_multiplier().then_some(SOFT_VOLUME)
    }

    /// Hardware volume, else the mixer multiplier
    pub fn volume_get(&self) -> Result<f32> {
        match self.output.volume_get() {
            Err(AoutError::VolumeUnsupported(backend)) => {
                let mixer = self.mixer.lock();
                if mixer.supports_multiplier() {
                    Ok(mixer.multiplier())
                } else {
                    Err(AoutError::VolumeUnsupported(backend))
                }
            }
            other => other,
        }
    }

    pub fn volume_set(&self, volume: f32) -> Result<()> {
        match self.output.volume_set(volume) {
            Err(AoutError::VolumeUnsupported(backend)) => {
                let mut mixer = self.mixer.lock();
                if !mixer.supports_multiplier() {
                    return Err(AoutError::VolumeUnsupported(backend));
                }
                mixer.set_multiplier(volume.clamp(SOFT_VOLUME.min, SOFT_VOLUME.max))
            }
            other => other,
        }
    }

    /// Hardware mute, else the software mute of a fl32 mixer
    pub fn mute_get(&self) -> Result<bool> {
        match self.output.mute_get() {
            Err(AoutError::MuteUnsupported(backend)) => {
                let mixer = self.mixer.lock();
                if mixer.supports_multiplier() {
                    Ok(mixer.is_muted())
                } else {
                    Err(AoutError::MuteUnsupported(backend))
                }
            }
            other => other,
        }
    }

    pub fn mute_set(&self, mute: bool) -> Result<()> {
        match self.output.mute_set(mute) {
            Err(AoutError::MuteUnsupported(backend)) => self
                .mixer
                .lock()
                .set_muted(mute)
                .map_err(|_| AoutError::MuteUnsupported(backend)),
            other => other,
        }
    }

    /// Drop all queued audio, in the inputs, the output and the device
    ///
    /// Inputs stay registered; their next buffers start a new timeline.
    pub fn flush(&self) {
        let mut mixer = self.mixer.lock();
        let inputs = self.registry.lock().snapshot();
        for input in &inputs {
            input.flush();
        }
        mixer.reset_anchor();
        self.output.flush();
        info!("Flushed {} inputs", inputs.len());
    }

    pub fn pause(&self) {
        let now = self.clock.now();
        self.mixer.lock().pause(now);
        info!("Paused at {}", now);
    }

    /// Resume and move every queued date by the paused duration
    pub fn resume(&self) -> Mtime {
        let now = self.clock.now();
        let mut mixer = self.mixer.lock();
        let delta = mixer.resume(now);
        if delta > 0 {
            let inputs = self.registry.lock().snapshot();
            for input in &inputs {
                input.with_fifo(|fifo| fifo.move_dates(delta));
            }
            self.output.move_dates(delta);
        }
        info!("Resumed after {}µs", delta);
        delta
    }

    pub fn is_paused(&self) -> bool {
        self.mixer.lock().is_paused()
    }

    /// Rebuild every input's chains before its next buffer
    pub fn request_restart(&self) {
        let inputs = self.registry.lock().snapshot();
        for input in &inputs {
            input.request_restart();
        }
        debug!("Restart requested for {} inputs", inputs.len());
    }

    /// Delete every input and close the output
    pub fn shutdown(&self) {
        for id in self.inputs() {
            if let Err(e) = self.input_delete(id) {
                debug!("{} already gone at shutdown: {}", id, e);
            }
        }
        self.output.close();
    }

    pub fn output(&self) -> &OutputPipeline {
        &self.output
    }

    pub fn mixer_format(&self) -> AudioSampleFormat {
        *self.mixer.lock().format()
    }

    pub fn mixer_in_error(&self) -> bool {
        self.mixer.lock().is_in_error()
    }

    pub fn now(&self) -> Mtime {
        self.clock.now()
    }

    pub fn latency(&self) -> Mtime {
        self.latency
    }
}

/// Periodic mixing tick on its own thread
pub struct MixerThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MixerThread {
    pub fn spawn(instance: Arc<AudioInstance>, period: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("sonance-mixer".to_string())
            .spawn(move || {
                let failures = LogThrottle::default();
                while !thread_stop.load(Ordering::Acquire) {
                    if let Err(e) = instance.tick() {
                        if let Some(suppressed) = failures.check() {
                            error!("Mixing cycle failed: {} ({} more suppressed)", e, suppressed);
                        }
                    }
                    thread::sleep(period);
                }
                debug!("Mixer thread stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop ticking and wait for the thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Mixer thread panicked");
            }
        }
    }
}

impl Drop for MixerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
