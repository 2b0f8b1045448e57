//! Input pipelines and the input registry
//!
//! One [`InputPipeline`] per decoding source. Decoded buffers go through:
//!
//! 1. date bias (caching delay + desync)
//! 2. late check against the master clock
//! 3. drift measurement against the input fifo's end date, plus whatever
//!    input the resamplers still hold
//! 4. pre-filters (encoding and layout conversion to the mixer format)
//! 5. resamplers (rate conversion to the mixer rate)
//! 6. drift correction (linear resampler, only while correcting)
//! 7. push into the input fifo, consumed by the mixer
//!
//! All of it runs under the input's own lock. A pipeline whose chains cannot
//! be built, or that keeps failing, is marked in error and silently drops
//! every later buffer without touching its fifo.
//!
//! The [`InputRegistry`] owns the pipelines behind generation-tagged
//! [`InputId`]s; stale ids never resolve to a newer input in a reused slot.

use crate::buffer::{AllocationPolicy, AudioBuffer};
use crate::config::InputConfig;
use crate::error::Result;
use crate::fifo::Fifo;
use crate::filter::{self, DriftParams, DriftTracker, FilterChain, FilterStage, LinearResampler, Resampling};
use crate::format::AudioSampleFormat;
use crate::locks::{LeveledGuard, LeveledMutex, LockLevel};
use crate::throttle::LogThrottle;
use sonance_common::timing::{frames_to_mtime, Mtime};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Generation-tagged handle of a registered input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId {
    index: u32,
    generation: u32,
}

impl InputId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input#{}.{}", self.index, self.generation)
    }
}

/// Per-input tunables, taken at creation time
#[derive(Debug, Clone)]
pub struct InputSettings {
    /// Label for logs
    pub name: String,
    pub caching: Mtime,
    pub desync: Mtime,
    pub pts_tolerance: Mtime,
    pub max_drift: Mtime,
    pub resampler_step: i32,
    pub resampler_max_percent: u32,
    pub error_threshold: u32,
}

impl InputSettings {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Date bias applied to every buffer
    pub fn bias(&self) -> Mtime {
        self.caching + self.desync
    }
}

impl From<&InputConfig> for InputSettings {
    fn from(config: &InputConfig) -> Self {
        Self {
            name: String::from("input"),
            caching: config.caching_us,
            desync: config.desync_us,
            pts_tolerance: config.pts_tolerance_us,
            max_drift: config.max_drift_us,
            resampler_step: config.resampler_step_hz,
            resampler_max_percent: config.resampler_max_percent,
            error_threshold: config.error_threshold.max(1),
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self::from(&InputConfig::default())
    }
}

/// Why [`InputPipeline::play`] did not queue a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Pipeline is in error
    InError,
    /// Pipeline was deleted
    Deleted,
    /// Buffer ended before the current date
    Late,
    /// A filter stage failed on this buffer
    FilterFailed,
}

/// Outcome of [`InputPipeline::play`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStatus {
    /// Pushed into the input fifo
    Queued,
    /// Absorbed into a resampler's history; output follows with later buffers
    Pending,
    Dropped(DropReason),
}

/// Stages converting an input to the mixer format
struct Chains {
    filters: FilterChain,
    resamplers: FilterChain,
    linear: Option<LinearResampler>,
}

fn build_chains(format: &AudioSampleFormat, mixer_format: &AudioSampleFormat) -> Result<Chains> {
    // Pre-filters keep the input rate; resamplers only change the rate
    let pre_target = AudioSampleFormat::new(mixer_format.encoding(), mixer_format.channels(), format.rate());
    let filters = FilterChain::build(format, &pre_target)?;
    let resamplers = FilterChain::build(&pre_target, mixer_format)?;
    let linear = LinearResampler::new(*mixer_format).ok();
    Ok(Chains {
        filters,
        resamplers,
        linear,
    })
}

impl Chains {
    /// Input taken in but not yet output
    fn held_duration(&self) -> Mtime {
        self.filters.held_duration() + self.resamplers.held_duration()
    }
}

/// State serialized by the input lock
pub struct InputState {
    mixer_format: AudioSampleFormat,
    chains: Chains,
    drift: DriftTracker,
    fifo: Fifo,
    failures: u32,
    deleted: bool,
}

impl InputState {
    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    pub fn fifo_mut(&mut self) -> &mut Fifo {
        &mut self.fifo
    }

    pub fn drift(&self) -> &DriftTracker {
        &self.drift
    }

    fn reset_history(&mut self) {
        self.chains.filters.reset();
        self.chains.resamplers.reset();
        if let Some(linear) = self.chains.linear.as_mut() {
            linear.reset();
        }
        self.drift.reset();
    }

    /// Drop everything queued or held and restart the timeline
    fn flush(&mut self) {
        self.fifo.destroy();
        self.reset_history();
        self.failures = 0;
    }

    /// Run one buffer through every stage; `expected` is the fifo end date
    fn convert(&mut self, buffer: AudioBuffer, expected: Option<Mtime>) -> Result<AudioBuffer> {
        let discontinuity = buffer.discontinuity;
        let buffer = self.chains.filters.play(buffer)?;
        if buffer.nb_samples == 0 {
            return Ok(buffer);
        }
        let buffer = self.chains.resamplers.play(buffer)?;
        if buffer.nb_samples == 0 {
            return Ok(buffer);
        }

        let Some(linear) = self.chains.linear.as_mut() else {
            return Ok(buffer);
        };
        if discontinuity {
            linear.reset();
        }
        if !self.drift.is_active() {
            linear.note_passthrough(&buffer);
            return Ok(buffer);
        }

        linear.set_rate_offset(self.drift.offset());
        let policy = AllocationPolicy::Allocate {
            bytes_per_second: self.mixer_format.bytes_per_second(),
        };
        let mut corrected = filter::run_stage(linear, policy, buffer)?;
        if let Some(expected) = expected {
            corrected.start_date = expected;
            corrected.end_date = expected + frames_to_mtime(corrected.nb_samples, self.mixer_format.rate());
        }
        Ok(corrected)
    }
}

/// Per-source pipeline from decoded buffers to the mixer
pub struct InputPipeline {
    id: InputId,
    source_id: Uuid,
    format: AudioSampleFormat,
    settings: InputSettings,
    state: LeveledMutex<InputState>,
    restart: AtomicBool,
    in_error: AtomicBool,
    format_changed: AtomicBool,
    failure_log: LogThrottle,
    late_log: LogThrottle,
}

impl InputPipeline {
    /// Build the chains from `format` to `mixer_format`
    ///
    /// A chain that cannot be built leaves the pipeline in error; it still
    /// registers and accepts (and drops) buffers.
    pub fn new(
        id: InputId,
        format: AudioSampleFormat,
        mixer_format: AudioSampleFormat,
        settings: InputSettings,
    ) -> Self {
        let source_id = Uuid::new_v4();
        let (chains, in_error) = match build_chains(&format, &mixer_format) {
            Ok(chains) => (chains, false),
            Err(e) => {
                error!(
                    "{} ({}) [{}]: cannot convert {} to mixer format {}: {}",
                    id, settings.name, source_id, format, mixer_format, e
                );
                let chains = Chains {
                    filters: FilterChain::empty(format),
                    resamplers: FilterChain::empty(format),
                    linear: None,
                };
                (chains, true)
            }
        };

        if chains.linear.is_none() && !in_error {
            debug!("{}: no drift correction for mixer format {}", id, mixer_format);
        }

        let drift = DriftTracker::new(DriftParams::for_rate(
            mixer_format.rate(),
            settings.pts_tolerance,
            settings.resampler_step,
            settings.resampler_max_percent,
        ));

        info!(
            "{} ({}) [{}] created: {} -> {} [{}] [{}]",
            id,
            settings.name,
            source_id,
            format,
            mixer_format,
            chains.filters.stage_names().join(", "),
            chains.resamplers.stage_names().join(", ")
        );

        Self {
            id,
            source_id,
            format,
            state: LeveledMutex::new(
                LockLevel::Input,
                InputState {
                    mixer_format,
                    chains,
                    drift,
                    fifo: Fifo::new(mixer_format.bytes_per_second()),
                    failures: 0,
                    deleted: false,
                },
            ),
            settings,
            restart: AtomicBool::new(false),
            in_error: AtomicBool::new(in_error),
            format_changed: AtomicBool::new(false),
            failure_log: LogThrottle::default(),
            late_log: LogThrottle::default(),
        }
    }

    /// Submit a decoded buffer
    ///
    /// `now` is the master clock date. A pending restart rebuilds the chains
    /// against the current mixer format first. Never fails: per-buffer
    /// problems drop the buffer and are reported through the returned status.
    pub fn play(&self, mut buffer: AudioBuffer, now: Mtime) -> PlayStatus {
        let mut state = self.state.lock();
        if state.deleted {
            return PlayStatus::Dropped(DropReason::Deleted);
        }
        if self.restart_requested() {
            let mixer_format = state.mixer_format;
            self.rebuild_locked(&mut state, mixer_format);
        }
        if self.is_in_error() {
            return PlayStatus::Dropped(DropReason::InError);
        }

        buffer.shift(self.settings.bias());

        if buffer.end_date <= now {
            if let Some(suppressed) = self.late_log.check() {
                warn!(
                    "{}: late buffer dropped ({}µs late, {} more suppressed), flushing",
                    self.id,
                    now - buffer.start_date,
                    suppressed
                );
            }
            state.flush();
            return PlayStatus::Dropped(DropReason::Late);
        }

        if self.format_changed.swap(false, Ordering::AcqRel) {
            buffer.discontinuity = true;
        }

        let expected = state.fifo.end_date();
        match expected {
            _ if buffer.discontinuity => state.drift.reset(),
            Some(end) => {
                // rate conversion holds input back until a whole chunk is in
                let drift = buffer.start_date - (end + state.chains.held_duration());
                if drift.abs() > self.settings.max_drift {
                    warn!("{}: audio drift of {}µs is too big, flushing", self.id, drift);
                    state.flush();
                    buffer.discontinuity = true;
                } else {
                    state.drift.update(drift, buffer.start_date, buffer.nb_samples);
                }
            }
            None => {}
        }
        let expected = state.fifo.end_date();

        let buffer = match state.convert(buffer, expected) {
            Ok(buffer) => {
                state.failures = 0;
                buffer
            }
            Err(e) => {
                state.failures += 1;
                if let Some(suppressed) = self.failure_log.check() {
                    warn!(
                        "{}: buffer dropped: {} ({} more suppressed)",
                        self.id, e, suppressed
                    );
                }
                if state.failures >= self.settings.error_threshold {
                    error!(
                        "{} [{}]: {} consecutive failures, input disabled",
                        self.id, self.source_id, state.failures
                    );
                    self.in_error.store(true, Ordering::Release);
                    state.fifo.destroy();
                }
                return PlayStatus::Dropped(DropReason::FilterFailed);
            }
        };

        if buffer.nb_samples == 0 {
            return PlayStatus::Pending;
        }
        state.fifo.push(buffer);
        PlayStatus::Queued
    }

    /// Rebuild the chains against `mixer_format` and restart the timeline
    ///
    /// Callers hold the mixer lock so no mixing cycle sees a half-built input.
    pub fn rebuild(&self, mixer_format: AudioSampleFormat) {
        let mut state = self.state.lock();
        self.rebuild_locked(&mut state, mixer_format);
    }

    fn rebuild_locked(&self, state: &mut InputState, mixer_format: AudioSampleFormat) {
        match build_chains(&self.format, &mixer_format) {
            Ok(chains) => {
                state.chains = chains;
                self.in_error.store(false, Ordering::Release);
                info!("{}: chains rebuilt for {}", self.id, mixer_format);
            }
            Err(e) => {
                error!("{}: rebuild for {} failed: {}", self.id, mixer_format, e);
                self.in_error.store(true, Ordering::Release);
            }
        }
        if state.mixer_format != mixer_format {
            state.fifo = Fifo::new(mixer_format.bytes_per_second());
            state.mixer_format = mixer_format;
        } else {
            state.fifo.destroy();
        }
        state.drift.reset();
        state.failures = 0;
        self.format_changed.store(true, Ordering::Release);
        self.restart.store(false, Ordering::Release);
    }

    /// Drop queued buffers and resampler history; the input stays usable
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let dropped = state.fifo.len();
        state.flush();
        debug!("{}: flushed {} buffers", self.id, dropped);
    }

    /// Flush and disable; later buffers are dropped
    pub fn delete(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        state.fifo.destroy();
        debug!("{} ({}) [{}] deleted", self.id, self.settings.name, self.source_id);
    }

    /// Lock the pipeline state (input lock level)
    pub fn lock(&self) -> LeveledGuard<'_, InputState> {
        self.state.lock()
    }

    pub fn with_fifo<R>(&self, f: impl FnOnce(&mut Fifo) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.fifo)
    }

    pub fn queued_buffers(&self) -> usize {
        self.state.lock().fifo.len()
    }

    pub fn queued_duration(&self) -> Mtime {
        self.state.lock().fifo.queued_duration()
    }

    pub fn resampling(&self) -> Resampling {
        self.state.lock().drift.state()
    }

    pub fn id(&self) -> InputId {
        self.id
    }

    /// Unique per pipeline, unlike [`InputId`] whose slots are reused
    pub fn source_id(&self) -> Uuid {
        self.source_id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    /// Disable the input; its fifo is left as it is
    pub fn set_in_error(&self) {
        if !self.in_error.swap(true, Ordering::AcqRel) {
            warn!("{} ({}) marked in error", self.id, self.settings.name);
        }
    }

    /// Ask for a chain rebuild before the next buffer
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::Acquire)
    }

    /// Next buffer starts a new timeline (e.g. new stream format upstream)
    pub fn mark_format_changed(&self) {
        self.format_changed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for InputPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPipeline")
            .field("id", &self.id)
            .field("name", &self.settings.name)
            .field("source_id", &self.source_id)
            .field("format", &self.format)
            .field("in_error", &self.is_in_error())
            .finish()
    }
}

struct Slot {
    generation: u32,
    input: Option<Arc<InputPipeline>>,
}

/// Arena of live inputs; guarded by the registry lock
#[derive(Default)]
pub struct InputRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pipeline built by `build` under a fresh id
    pub fn insert_with(&mut self, build: impl FnOnce(InputId) -> InputPipeline) -> InputId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    input: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = InputId {
            index,
            generation: slot.generation,
        };
        slot.input = Some(Arc::new(build(id)));
        id
    }

    pub fn get(&self, id: InputId) -> Option<Arc<InputPipeline>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.input.clone())
    }

    /// Unregister; the slot's generation moves on so `id` goes stale
    pub fn remove(&mut self, id: InputId) -> Option<Arc<InputPipeline>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let input = slot.input.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(input)
    }

    /// Live inputs, lowest slot first
    pub fn snapshot(&self) -> Vec<Arc<InputPipeline>> {
        self.slots.iter().filter_map(|s| s.input.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.input.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelMask, SampleEncoding};

    fn s16_stereo() -> AudioSampleFormat {
        AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, 44_100)
    }

    fn pipeline(format: AudioSampleFormat, mixer: AudioSampleFormat) -> InputPipeline {
        let id = InputId {
            index: 0,
            generation: 0,
        };
        InputPipeline::new(id, format, mixer, InputSettings::default())
    }

    fn buffer(format: &AudioSampleFormat, frames: usize, start: Mtime) -> AudioBuffer {
        AudioBuffer::from_bytes(format, vec![0u8; frames * format.bytes_per_frame()], start)
    }

    #[test]
    fn test_registry_generations() {
        let format = s16_stereo();
        let mut registry = InputRegistry::new();
        let a = registry.insert_with(|id| InputPipeline::new(id, format, format, InputSettings::default()));
        assert!(registry.get(a).is_some());
        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert!(registry.remove(a).is_none());

        let b = registry.insert_with(|id| InputPipeline::new(id, format, format, InputSettings::default()));
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(b.to_string(), "input#0.1");
    }

    #[test]
    fn test_play_queues_and_keeps_order() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        assert_eq!(input.play(buffer(&format, 441, 0), 0), PlayStatus::Queued);
        assert_eq!(input.play(buffer(&format, 441, 10_000), 0), PlayStatus::Queued);
        assert_eq!(input.queued_buffers(), 2);
        input.with_fifo(|fifo| {
            assert_eq!(fifo.first_date(), Some(0));
            assert_eq!(fifo.end_date(), Some(20_000));
        });
    }

    #[test]
    fn test_in_error_never_touches_fifo() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.play(buffer(&format, 441, 0), 0);
        input.set_in_error();
        for n in 1..10 {
            assert_eq!(
                input.play(buffer(&format, 441, n * 10_000), 0),
                PlayStatus::Dropped(DropReason::InError)
            );
        }
        assert_eq!(input.queued_buffers(), 1);
    }

    #[test]
    fn test_unconvertible_input_starts_in_error() {
        let format = AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, 4_000);
        let mixer = s16_stereo().with_rate(48_000);
        let input = pipeline(format, mixer);
        assert!(input.is_in_error());
        assert_eq!(
            input.play(buffer(&format, 40, 0), 0),
            PlayStatus::Dropped(DropReason::InError)
        );
    }

    #[test]
    fn test_late_buffer_dropped() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        assert_eq!(
            input.play(buffer(&format, 441, 0), 50_000),
            PlayStatus::Dropped(DropReason::Late)
        );
        assert_eq!(input.queued_buffers(), 0);
    }

    #[test]
    fn test_bias_applied() {
        let format = s16_stereo();
        let settings = InputSettings {
            desync: 5_000,
            caching: 1_000,
            ..InputSettings::default()
        };
        let mut registry = InputRegistry::new();
        let id = registry.insert_with(|id| InputPipeline::new(id, format, format, settings));
        let input = registry.get(id).unwrap();
        input.play(buffer(&format, 441, 0), 0);
        assert_eq!(input.with_fifo(|f| f.first_date()), Some(6_000));
    }

    #[test]
    fn test_persistent_drift_starts_resampling() {
        let format = AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, 44_100);
        let input = pipeline(format, format);
        // 10ms buffers arriving with a growing 15ms gap each
        let mut start = 0;
        for _ in 0..4 {
            input.play(buffer(&format, 441, start), 0);
            start += 25_000;
        }
        assert_eq!(input.resampling(), Resampling::Up);
    }

    #[test]
    fn test_huge_drift_flushes() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.play(buffer(&format, 441, 0), 0);
        input.play(buffer(&format, 441, 10_000), 0);
        assert_eq!(input.play(buffer(&format, 441, 5_000_000), 0), PlayStatus::Queued);
        assert_eq!(input.queued_buffers(), 1);
        assert_eq!(input.with_fifo(|f| f.first_date()), Some(5_000_000));
    }

    #[test]
    fn test_rebuild_clears_restart() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.play(buffer(&format, 441, 0), 0);
        input.request_restart();
        assert!(input.restart_requested());
        input.rebuild(format.with_encoding(SampleEncoding::Fl32));
        assert!(!input.restart_requested());
        assert_eq!(input.queued_buffers(), 0);
        assert!(!input.is_in_error());
    }

    #[test]
    fn test_contiguous_resampled_input_stays_neutral() {
        let mixer = AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, 48_000);
        for rate in [8_000, 32_000] {
            let format = mixer.with_rate(rate);
            let input = pipeline(format, mixer);
            let frames = rate as usize / 100;
            let mut queued = 0;

            for n in 0..300 {
                let status = input.play(buffer(&format, frames, n * 10_000), 0);
                assert!(matches!(status, PlayStatus::Queued | PlayStatus::Pending), "{} Hz: {:?}", rate, status);
                assert_eq!(input.resampling(), Resampling::Neutral, "{} Hz, buffer {}", rate, n);

                let now_queued = input.queued_duration();
                assert!(now_queued >= queued, "{} Hz input flushed at buffer {}", rate, n);
                queued = now_queued;
            }
            // 3s in, at most one chunk still inside the converter
            assert!(queued > 2_800_000, "{} Hz: {}µs queued", rate, queued);
        }
    }

    #[test]
    fn test_format_change_starts_new_timeline() {
        let format = AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, 44_100);
        let input = pipeline(format, format);
        let mut start = 0;
        for _ in 0..4 {
            input.play(buffer(&format, 441, start), 0);
            start += 25_000;
        }
        assert_eq!(input.resampling(), Resampling::Up);

        input.mark_format_changed();
        let end = input.with_fifo(|f| f.end_date()).unwrap();
        assert_eq!(input.play(buffer(&format, 441, end), 0), PlayStatus::Queued);
        assert_eq!(input.resampling(), Resampling::Neutral);
        input.with_fifo(|fifo| {
            let last = fifo.iter().last().unwrap();
            assert!(last.discontinuity);
            assert_eq!(last.start_date, end);
        });
    }

    #[test]
    fn test_play_rebuilds_on_pending_restart() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.play(buffer(&format, 441, 0), 0);
        input.request_restart();

        assert_eq!(input.play(buffer(&format, 441, 1_000_000), 0), PlayStatus::Queued);
        assert!(!input.restart_requested());
        assert_eq!(input.queued_buffers(), 1);
        assert_eq!(input.with_fifo(|f| f.first_date()), Some(1_000_000));
    }

    #[test]
    fn test_flush_keeps_input_usable() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.play(buffer(&format, 441, 0), 0);
        input.play(buffer(&format, 441, 10_000), 0);
        input.flush();
        assert_eq!(input.queued_buffers(), 0);
        assert_eq!(input.with_fifo(|f| f.end_date()), None);

        // earlier than the flushed data: not shifted onto the old timeline
        assert_eq!(input.play(buffer(&format, 441, 5_000), 0), PlayStatus::Queued);
        assert_eq!(input.with_fifo(|f| f.first_date()), Some(5_000));
    }

    #[test]
    fn test_source_id_survives_rebuild_not_slot_reuse() {
        let format = s16_stereo();
        let mut registry = InputRegistry::new();
        let a = registry.insert_with(|id| InputPipeline::new(id, format, format, InputSettings::default()));
        let first = registry.get(a).unwrap().source_id();
        registry.remove(a);

        let b = registry.insert_with(|id| InputPipeline::new(id, format, format, InputSettings::default()));
        assert_eq!(a.index(), b.index());
        let input = registry.get(b).unwrap();
        let second = input.source_id();
        assert_ne!(first, second);

        input.rebuild(format);
        assert_eq!(input.source_id(), second);
        assert!(format!("{:?}", input).contains(&second.to_string()));
    }

    #[test]
    fn test_deleted_input_drops() {
        let format = s16_stereo();
        let input = pipeline(format, format);
        input.delete();
        assert_eq!(
            input.play(buffer(&format, 441, 0), 0),
            PlayStatus::Dropped(DropReason::Deleted)
        );
    }
}
