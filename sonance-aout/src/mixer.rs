//! Mixer: combines the due buffers of every input into one output buffer
//!
//! Each run covers a window of `samples_per_buffer` frames starting where the
//! previous window ended. Dates come from a [`SampleDate`], so consecutive
//! windows abut exactly whatever the rate.
//!
//! Input buffers are sliced by date: a buffer straddling the window end is
//! only partly consumed and stays at the head of its fifo; buffers ending
//! before the window are stale and dropped.
//!
//! Kernels:
//! - fl32: float sum, software multiplier (or software mute) applied last
//! - s16l: integer sum, saturating
//!
//! Any other mixer format has no kernel. The mixer is then in error and only
//! passes the first registered input through untouched.

use crate::buffer::AudioBuffer;
use crate::config::MixerConfig;
use crate::error::{AoutError, Result};
use crate::fifo::Fifo;
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::input::InputPipeline;
use crate::sample;
use crate::throttle::LogThrottle;
use serde::Deserialize;
use sonance_common::timing::{mtime_to_frames, Mtime, SampleDate};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Per-input weight when mixing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixPolicy {
    /// Plain sum (weight 1)
    #[default]
    Sum,
    /// Sum divided by the number of contributing inputs
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MixKernel {
    Float32,
    S16,
}

impl MixKernel {
    fn for_format(format: &AudioSampleFormat) -> Option<Self> {
        match format.encoding() {
            SampleEncoding::Fl32 => Some(Self::Float32),
            SampleEncoding::S16L => Some(Self::S16),
            _ => None,
        }
    }
}

/// Result of one [`Mixer::run`]
#[derive(Debug)]
pub enum MixOutcome {
    /// At least one input contributed
    Mixed { buffer: AudioBuffer, inputs: usize },
    /// No input had data; silence keeps the output clock going
    Silence(AudioBuffer),
    /// No input had data and silence production is disabled
    Starved,
    Paused,
}

impl MixOutcome {
    pub fn buffer(&self) -> Option<&AudioBuffer> {
        match self {
            Self::Mixed { buffer, .. } | Self::Silence(buffer) => Some(buffer),
            Self::Starved | Self::Paused => None,
        }
    }

    pub fn into_buffer(self) -> Option<AudioBuffer> {
        match self {
            Self::Mixed { buffer, .. } | Self::Silence(buffer) => Some(buffer),
            Self::Starved | Self::Paused => None,
        }
    }
}

/// Mixing accumulator, one slot per output sample
enum Accumulator {
    Float(Vec<f32>),
    Int(Vec<i32>),
    /// Passthrough bytes of a single input (errored mixer)
    Copy { data: Vec<u8>, width: usize },
}

impl Accumulator {
    fn new(kernel: Option<MixKernel>, format: &AudioSampleFormat, frames: usize) -> Self {
        let samples = frames * format.nb_channels();
        match kernel {
            Some(MixKernel::Float32) => Self::Float(vec![0.0; samples]),
            Some(MixKernel::S16) => Self::Int(vec![0; samples]),
            None => {
                let width = format.encoding().bytes_per_sample();
                Self::Copy {
                    data: vec![sample::silence_byte(format.encoding()); samples * width],
                    width,
                }
            }
        }
    }

    /// Add interleaved `bytes` starting at output sample `offset`
    fn add(&mut self, offset: usize, bytes: &[u8]) {
        match self {
            Self::Float(acc) => {
                for (slot, raw) in acc[offset..].iter_mut().zip(bytes.chunks_exact(4)) {
                    *slot += sample::read_sample(SampleEncoding::Fl32, raw);
                }
            }
            Self::Int(acc) => {
                for (slot, raw) in acc[offset..].iter_mut().zip(bytes.chunks_exact(2)) {
                    *slot += i16::from_le_bytes([raw[0], raw[1]]) as i32;
                }
            }
            Self::Copy { data, width } => {
                let at = offset * *width;
                let len = bytes.len().min(data.len().saturating_sub(at));
                data[at..at + len].copy_from_slice(&bytes[..len]);
            }
        }
    }

    fn finish(self, contributors: usize, policy: MixPolicy, multiplier: f32) -> Vec<u8> {
        let divisor = match policy {
            MixPolicy::Average if contributors > 1 => contributors,
            _ => 1,
        };
        match self {
            Self::Float(mut acc) => {
                let gain = multiplier / divisor as f32;
                if gain != 1.0 {
                    acc.iter_mut().for_each(|s| *s *= gain);
                }
                sample::f32_to_bytes(&acc)
            }
            Self::Int(acc) => {
                let mut data = Vec::with_capacity(acc.len() * 2);
                for value in acc {
                    let mixed = (value / divisor as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    data.extend_from_slice(&mixed.to_le_bytes());
                }
                data
            }
            Self::Copy { data, .. } => data,
        }
    }
}

/// Consume the part of `fifo` overlapping `[start, end)`
///
/// `sink` gets the output frame offset and the overlapping bytes. Returns
/// whether anything was contributed.
fn drain_window(
    fifo: &mut Fifo,
    format: &AudioSampleFormat,
    start: Mtime,
    end: Mtime,
    frames: usize,
    mut sink: impl FnMut(usize, &[u8]),
) -> bool {
    let rate = format.rate();
    let frame_size = format.bytes_per_frame();
    let mut contributed = false;

    while let Some(head) = fifo.peek() {
        if head.end_date <= start {
            trace!("Dropping stale buffer ending at {}", head.end_date);
            fifo.pop();
            continue;
        }
        if head.start_date >= end {
            break;
        }

        let segment_start = head.start_date.max(start);
        let segment_end = head.end_date.min(end);
        let out_offset = mtime_to_frames(segment_start - start, rate).min(frames);
        let in_offset = mtime_to_frames(segment_start - head.start_date, rate).min(head.nb_samples);
        let count = mtime_to_frames(segment_end - segment_start, rate)
            .min(frames - out_offset)
            .min(head.nb_samples - in_offset);
        if count > 0 {
            sink(out_offset, &head.data()[in_offset * frame_size..(in_offset + count) * frame_size]);
            contributed = true;
        }

        let consumed = head.end_date <= end;
        if !consumed {
            break;
        }
        fifo.pop();
    }
    contributed
}

/// Drop every buffer of `fifo` starting before `end`; returns how many
fn discard_due(fifo: &mut Fifo, end: Mtime) -> usize {
    let mut dropped = 0;
    while fifo.first_date().is_some_and(|date| date < end) {
        fifo.pop();
        dropped += 1;
    }
    dropped
}

/// The mixer; lives behind the mixer lock
#[derive(Debug)]
pub struct Mixer {
    format: AudioSampleFormat,
    kernel: Option<MixKernel>,
    policy: MixPolicy,
    multiplier: f32,
    /// Software mute; the multiplier is kept for unmute
    muted: bool,
    produce_silence: bool,
    samples_per_buffer: usize,
    /// How far behind the clock a window may start before re-anchoring
    tolerance: Mtime,
    next_date: Option<SampleDate>,
    paused_at: Option<Mtime>,
    discard_log: LogThrottle,
}

impl Mixer {
    pub fn new(
        format: AudioSampleFormat,
        config: &MixerConfig,
        samples_per_buffer: usize,
        tolerance: Mtime,
    ) -> Self {
        let kernel = MixKernel::for_format(&format);
        match kernel {
            Some(kernel) => info!("Mixer {:?} for {}, {:?} normalization", kernel, format, config.normalization),
            None => error!("No mixer for {}, passing a single input through", format),
        }

        let multiplier = if kernel == Some(MixKernel::Float32) {
            config.multiplier
        } else {
            if config.multiplier != 1.0 {
                warn!("Multiplier {} ignored by {} mixer", config.multiplier, format.encoding());
            }
            1.0
        };

        Self {
            format,
            kernel,
            policy: config.normalization,
            multiplier,
            muted: false,
            produce_silence: config.produce_silence,
            samples_per_buffer: samples_per_buffer.max(1),
            tolerance,
            next_date: None,
            paused_at: None,
            discard_log: LogThrottle::default(),
        }
    }

    /// First date of the next window
    fn window_start(&self, inputs: &[Arc<InputPipeline>], now: Mtime) -> SampleDate {
        let floor = now - self.tolerance;
        if let Some(date) = self.next_date {
            if date.get() >= floor {
                return date;
            }
            debug!("Mixer fell {}µs behind, re-anchoring", floor - date.get());
        }

        let earliest = inputs
            .iter()
            .filter(|input| !input.is_in_error())
            .filter_map(|input| input.with_fifo(|fifo| fifo.first_date()))
            .min();
        let mut date = SampleDate::new(self.format.rate());
        date.set(earliest.map_or(now, |first| first.max(floor)));
        date
    }

    /// Mix one window of every input's due data
    ///
    /// `inputs` is a registry snapshot; each input lock is taken in turn while
    /// the caller holds the mixer lock.
    pub fn run(&mut self, inputs: &[Arc<InputPipeline>], now: Mtime) -> Result<MixOutcome> {
        if self.paused_at.is_some() {
            return Ok(MixOutcome::Paused);
        }

        let frames = self.samples_per_buffer;
        let channels = self.format.nb_channels();
        let mut date = self.window_start(inputs, now);
        let start = date.get();
        let end = date.increment(frames);

        let mut acc = Accumulator::new(self.kernel, &self.format, frames);
        let mut contributors = 0;
        let mut passthrough_taken = false;

        for input in inputs {
            if input.is_in_error() {
                continue;
            }
            let mut state = input.lock();
            let fifo = state.fifo_mut();

            if self.kernel.is_none() && passthrough_taken {
                let dropped = discard_due(fifo, end);
                if dropped > 0 {
                    if let Some(suppressed) = self.discard_log.check() {
                        warn!(
                            "{}: {} buffers discarded, mixer can only pass one input ({} more suppressed)",
                            input.id(),
                            dropped,
                            suppressed
                        );
                    }
                }
                continue;
            }
            passthrough_taken = true;

            if drain_window(fifo, &self.format, start, end, frames, |offset, bytes| {
                acc.add(offset * channels, bytes)
            }) {
                contributors += 1;
            }
        }

        if contributors == 0 && !self.produce_silence {
            self.next_date = None;
            return Ok(MixOutcome::Starved);
        }

        self.next_date = Some(date);
        let gain = if self.muted { 0.0 } else { self.multiplier };
        let data = acc.finish(contributors, self.policy, gain);
        let buffer = AudioBuffer::new(data, frames, start, end);
        trace!("Mixed [{}, {}) from {} inputs", start, end, contributors);

        Ok(if contributors == 0 {
            MixOutcome::Silence(buffer)
        } else {
            MixOutcome::Mixed {
                buffer,
                inputs: contributors,
            }
        })
    }

    /// Set the software gain; fl32 mixers only
    pub fn set_multiplier(&mut self, multiplier: f32) -> Result<()> {
        if self.kernel != Some(MixKernel::Float32) {
            return Err(AoutError::MultiplierUnsupported(self.format.encoding().to_string()));
        }
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(AoutError::Format(format!("invalid multiplier {}", multiplier)));
        }
        self.multiplier = multiplier;
        Ok(())
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    /// Mute in software by zeroing the gain; fl32 mixers only
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        if !self.supports_multiplier() {
            return Err(AoutError::MultiplierUnsupported(self.format.encoding().to_string()));
        }
        self.muted = muted;
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Forget the timeline; the next run anchors on the inputs again
    pub fn reset_anchor(&mut self) {
        self.next_date = None;
    }

    pub fn supports_multiplier(&self) -> bool {
        self.kernel == Some(MixKernel::Float32)
    }

    pub fn is_in_error(&self) -> bool {
        self.kernel.is_none()
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer
    }

    /// Date the next window starts at, once anchored
    pub fn next_date(&self) -> Option<Mtime> {
        self.next_date.map(|d| d.get())
    }

    pub fn pause(&mut self, now: Mtime) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Leave pause; returns the paused duration the timeline moves by
    pub fn resume(&mut self, now: Mtime) -> Mtime {
        let Some(paused_at) = self.paused_at.take() else {
            return 0;
        };
        let delta = (now - paused_at).max(0);
        if let Some(date) = self.next_date.as_mut() {
            date.shift(delta);
        }
        delta
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelMask;
    use crate::input::{InputRegistry, InputSettings};

    fn s16() -> AudioSampleFormat {
        AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, 44_100)
    }

    fn fl32() -> AudioSampleFormat {
        AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, 48_000)
    }

    fn config(policy: MixPolicy) -> MixerConfig {
        MixerConfig {
            normalization: policy,
            ..MixerConfig::default()
        }
    }

    fn add_input(registry: &mut InputRegistry, format: AudioSampleFormat) -> Arc<InputPipeline> {
        let id = registry.insert_with(|id| InputPipeline::new(id, format, format, InputSettings::default()));
        registry.get(id).unwrap()
    }

    fn constant(format: &AudioSampleFormat, value: f32, frames: usize, start: Mtime) -> AudioBuffer {
        let samples = vec![value; frames * format.nb_channels()];
        let mut data = vec![0u8; frames * format.bytes_per_frame()];
        sample::encode_into(format.encoding(), &samples, &mut data);
        AudioBuffer::from_bytes(format, data, start)
    }

    fn s16_values(buffer: &AudioBuffer) -> Vec<i16> {
        buffer
            .data()
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn f32_values(buffer: &AudioBuffer) -> Vec<f32> {
        let mut out = Vec::new();
        sample::decode_into(SampleEncoding::Fl32, buffer.data(), &mut out);
        out
    }

    #[test]
    fn test_zero_inputs_produce_silence() {
        let mut mixer = Mixer::new(s16(), &MixerConfig::default(), 512, 40_000);
        let outcome = mixer.run(&[], 1_000).unwrap();
        let MixOutcome::Silence(buffer) = outcome else {
            panic!("expected silence, got {:?}", outcome);
        };
        assert_eq!(buffer.nb_samples, 512);
        assert_eq!(buffer.byte_count(), 512 * 4);
        assert_eq!(buffer.start_date, 1_000);
        assert!(s16_values(&buffer).iter().all(|v| *v == 0));
    }

    #[test]
    fn test_starved_without_silence() {
        let config = MixerConfig {
            produce_silence: false,
            ..MixerConfig::default()
        };
        let mut mixer = Mixer::new(s16(), &config, 512, 40_000);
        assert!(matches!(mixer.run(&[], 0).unwrap(), MixOutcome::Starved));
        assert_eq!(mixer.next_date(), None);
    }

    #[test]
    fn test_sum_of_two_float_inputs() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let a = add_input(&mut registry, format);
        let b = add_input(&mut registry, format);
        a.play(constant(&format, 0.25, 480, 0), 0);
        b.play(constant(&format, 0.5, 480, 0), 0);

        let mut mixer = Mixer::new(format, &config(MixPolicy::Sum), 480, 40_000);
        let outcome = mixer.run(&registry.snapshot(), 0).unwrap();
        let MixOutcome::Mixed { buffer, inputs } = outcome else {
            panic!("expected a mix");
        };
        assert_eq!(inputs, 2);
        assert_eq!(buffer.end_date, 10_000);
        assert!(f32_values(&buffer).iter().all(|v| (*v - 0.75).abs() < 1e-6));
        assert_eq!(a.queued_buffers(), 0);
        assert_eq!(b.queued_buffers(), 0);
    }

    #[test]
    fn test_average_policy_halves() {
        let format = s16();
        let mut registry = InputRegistry::new();
        let a = add_input(&mut registry, format);
        let b = add_input(&mut registry, format);
        a.play(constant(&format, 1_000.0 / 32_768.0, 441, 0), 0);
        b.play(constant(&format, 3_000.0 / 32_768.0, 441, 0), 0);

        let mut mixer = Mixer::new(format, &config(MixPolicy::Average), 441, 40_000);
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert!(s16_values(&buffer).iter().all(|v| *v == 2_000));
    }

    #[test]
    fn test_integer_sum_saturates() {
        let format = s16();
        let mut registry = InputRegistry::new();
        for _ in 0..2 {
            let input = add_input(&mut registry, format);
            input.play(constant(&format, 30_000.0 / 32_768.0, 441, 0), 0);
        }
        let mut mixer = Mixer::new(format, &config(MixPolicy::Sum), 441, 40_000);
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert!(s16_values(&buffer).iter().all(|v| *v == i16::MAX));
    }

    #[test]
    fn test_partial_buffer_stays_queued() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let input = add_input(&mut registry, format);
        input.play(constant(&format, 0.5, 960, 0), 0);

        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        let first = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert_eq!((first.start_date, first.end_date), (0, 10_000));
        assert_eq!(input.queued_buffers(), 1);

        let second = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert_eq!((second.start_date, second.end_date), (10_000, 20_000));
        assert!(f32_values(&second).iter().all(|v| (*v - 0.5).abs() < 1e-6));
        assert_eq!(input.queued_buffers(), 0);
    }

    #[test]
    fn test_late_input_fills_its_slot_only() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let input = add_input(&mut registry, format);
        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        // anchor the timeline at 0 with a silent window
        mixer.run(&[], 0).unwrap();

        // starts half way into the next window
        input.play(constant(&format, 1.0, 480, 15_000), 0);
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        let values = f32_values(&buffer);
        assert_eq!(buffer.start_date, 10_000);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[2 * 239], 0.0);
        assert_eq!(values[2 * 240], 1.0);
        assert_eq!(values[2 * 479 + 1], 1.0);
        assert_eq!(input.queued_buffers(), 1);
    }

    #[test]
    fn test_multiplier_float_only() {
        let mut float_mixer = Mixer::new(fl32(), &MixerConfig::default(), 480, 40_000);
        assert!(float_mixer.set_multiplier(0.5).is_ok());
        assert_eq!(float_mixer.multiplier(), 0.5);
        assert!(float_mixer.set_multiplier(f32::NAN).is_err());
        assert!(float_mixer.set_multiplier(-1.0).is_err());
        assert_eq!(float_mixer.multiplier(), 0.5);

        let mut int_mixer = Mixer::new(s16(), &MixerConfig::default(), 441, 40_000);
        assert!(matches!(
            int_mixer.set_multiplier(0.5),
            Err(AoutError::MultiplierUnsupported(_))
        ));
        assert_eq!(int_mixer.multiplier(), 1.0);
    }

    #[test]
    fn test_multiplier_scales_float_mix() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let input = add_input(&mut registry, format);
        input.play(constant(&format, 0.5, 480, 0), 0);

        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        mixer.set_multiplier(0.5).unwrap();
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert!(f32_values(&buffer).iter().all(|v| (*v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_software_mute_keeps_multiplier() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let input = add_input(&mut registry, format);
        input.play(constant(&format, 0.5, 960, 0), 0);

        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        mixer.set_multiplier(0.5).unwrap();
        mixer.set_muted(true).unwrap();
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert!(f32_values(&buffer).iter().all(|v| *v == 0.0));

        mixer.set_muted(false).unwrap();
        assert_eq!(mixer.multiplier(), 0.5);
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert!(f32_values(&buffer).iter().all(|v| (*v - 0.25).abs() < 1e-6));

        let mut int_mixer = Mixer::new(s16(), &MixerConfig::default(), 441, 40_000);
        assert!(int_mixer.set_muted(true).is_err());
        assert!(!int_mixer.is_muted());
    }

    #[test]
    fn test_reset_anchor_follows_inputs() {
        let format = fl32();
        let mut registry = InputRegistry::new();
        let input = add_input(&mut registry, format);
        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        mixer.run(&[], 0).unwrap();
        assert_eq!(mixer.next_date(), Some(10_000));

        mixer.reset_anchor();
        assert_eq!(mixer.next_date(), None);
        input.play(constant(&format, 0.5, 480, 300_000), 0);
        let buffer = mixer.run(&registry.snapshot(), 0).unwrap().into_buffer().unwrap();
        assert_eq!(buffer.start_date, 300_000);
    }

    #[test]
    fn test_errored_mixer_passes_first_input_only() {
        let format = AudioSampleFormat::new(SampleEncoding::S24L, ChannelMask::STEREO, 48_000);
        let mut registry = InputRegistry::new();
        let first = add_input(&mut registry, format);
        let second = add_input(&mut registry, format);
        let a = constant(&format, 0.25, 480, 0);
        let expected = a.data().to_vec();
        first.play(a, 0);
        second.play(constant(&format, 0.5, 480, 0), 0);

        let mut mixer = Mixer::new(format, &MixerConfig::default(), 480, 40_000);
        assert!(mixer.is_in_error());
        assert!(mixer.set_multiplier(0.5).is_err());

        let outcome = mixer.run(&registry.snapshot(), 0).unwrap();
        let MixOutcome::Mixed { buffer, inputs } = outcome else {
            panic!("expected passthrough");
        };
        assert_eq!(inputs, 1);
        assert_eq!(buffer.data(), &expected[..]);
        assert_eq!(second.queued_buffers(), 0);
    }

    #[test]
    fn test_pause_resume_shifts_timeline() {
        let mut mixer = Mixer::new(s16(), &MixerConfig::default(), 441, 40_000);
        mixer.run(&[], 0).unwrap();
        assert_eq!(mixer.next_date(), Some(10_000));

        mixer.pause(5_000);
        assert!(matches!(mixer.run(&[], 6_000).unwrap(), MixOutcome::Paused));
        assert_eq!(mixer.resume(505_000), 500_000);
        assert_eq!(mixer.next_date(), Some(510_000));
        assert_eq!(mixer.resume(600_000), 0);
    }

    #[test]
    fn test_stale_window_reanchors() {
        let mut mixer = Mixer::new(s16(), &MixerConfig::default(), 441, 40_000);
        mixer.run(&[], 0).unwrap();
        let buffer = mixer.run(&[], 1_000_000).unwrap().into_buffer().unwrap();
        assert_eq!(buffer.start_date, 1_000_000);
    }
}
