//! Sample-rate conversion stages
//!
//! - [`Resample`]: fixed-ratio conversion between two rates using rubato.
//!   Input is queued per channel and processed in whole chunks, so a buffer
//!   may come out shorter than its input (or empty) while history builds up.
//!   Output dates follow a [`SampleDate`] anchored on the first buffer after a
//!   reset.
//! - [`LinearResampler`]: small, adjustable rate offsets for drift correction.
//!   Linear interpolation between consecutive frames, carrying the last frame
//!   and the fractional read position across buffers.

use super::FilterStage;
use crate::buffer::AudioBuffer;
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::sample;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use sonance_common::timing::{frames_to_mtime, Mtime, SampleDate};
use tracing::debug;

/// Largest conversion ratio (either direction) the rate converter accepts
pub const MAX_RESAMPLE_RATIO: f64 = 8.0;

/// Frames handed to rubato per process call
const CHUNK_FRAMES: usize = 1024;

/// Fixed-ratio sample-rate conversion on fl32
pub struct Resample {
    input: AudioSampleFormat,
    output: AudioSampleFormat,
    resampler: FastFixedIn<f32>,
    /// Planar input not yet consumed by rubato
    pending: Vec<Vec<f32>>,
    date: SampleDate,
    anchored: bool,
    scratch: Vec<f32>,
    interleaved: Vec<f32>,
}

impl Resample {
    pub fn can_handle(input: &AudioSampleFormat, output: &AudioSampleFormat) -> bool {
        if input.encoding() != SampleEncoding::Fl32
            || output.encoding() != SampleEncoding::Fl32
            || input.channels() != output.channels()
            || input.rate() == output.rate()
            || input.rate() == 0
        {
            return false;
        }
        let ratio = output.rate() as f64 / input.rate() as f64;
        (1.0 / MAX_RESAMPLE_RATIO..=MAX_RESAMPLE_RATIO).contains(&ratio)
    }

    pub fn create(input: &AudioSampleFormat, output: &AudioSampleFormat) -> Result<Box<dyn FilterStage>> {
        Ok(Box::new(Self::new(input, output)?))
    }

    pub fn new(input: &AudioSampleFormat, output: &AudioSampleFormat) -> Result<Self> {
        if !Self::can_handle(input, output) {
            return Err(AoutError::Filter {
                stage: "resample",
                reason: format!("cannot resample {} to {}", input, output),
            });
        }

        let channels = input.nb_channels();
        // Polynomial interpolation: good quality at low CPU cost
        let resampler = FastFixedIn::<f32>::new(
            output.rate() as f64 / input.rate() as f64,
            1.0, // fixed ratio
            PolynomialDegree::Septic,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| AoutError::Filter {
            stage: "resample",
            reason: format!("Failed to create resampler: {}", e),
        })?;

        debug!("Resampler {}Hz -> {}Hz ({} channels)", input.rate(), output.rate(), channels);

        Ok(Self {
            input: *input,
            output: *output,
            resampler,
            pending: vec![Vec::new(); channels],
            date: SampleDate::new(output.rate()),
            anchored: false,
            scratch: Vec::new(),
            interleaved: Vec::new(),
        })
    }

    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, |c| c.len())
    }
}

impl FilterStage for Resample {
    fn name(&self) -> &'static str {
        "resample"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.input
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.output
    }

    fn keeps_history(&self) -> bool {
        true
    }

    fn max_output_frames(&self, input_frames: usize) -> usize {
        let chunks = (self.pending_frames() + input_frames) / CHUNK_FRAMES;
        chunks * self.resampler.output_frames_max()
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        if !self.anchored {
            self.date.set(input.start_date);
            self.anchored = true;
        }

        // De-interleave into the pending planar queues
        let channels = self.input.nb_channels();
        self.scratch.clear();
        sample::decode_into(SampleEncoding::Fl32, input.data(), &mut self.scratch);
        for frame in self.scratch.chunks_exact(channels) {
            for (queue, value) in self.pending.iter_mut().zip(frame) {
                queue.push(*value);
            }
        }

        self.interleaved.clear();
        while self.pending_frames() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let chunk: Vec<&[f32]> = self.pending.iter().map(|c| &c[..needed]).collect();
            let planar = self
                .resampler
                .process(&chunk, None)
                .map_err(|e| AoutError::Filter {
                    stage: "resample",
                    reason: format!("Resampling failed: {}", e),
                })?;

            let frames = planar.first().map_or(0, |c| c.len());
            for frame_idx in 0..frames {
                for channel in &planar {
                    self.interleaved.push(channel[frame_idx]);
                }
            }
            for queue in self.pending.iter_mut() {
                queue.drain(..needed);
            }
        }

        let frames = self.interleaved.len() / channels;
        output.resize(frames * self.output.bytes_per_frame(), frames)?;
        sample::encode_into(SampleEncoding::Fl32, &self.interleaved, output.data_mut());
        output.start_date = self.date.get();
        output.end_date = self.date.increment(frames);
        Ok(())
    }

    fn held_duration(&self) -> Mtime {
        frames_to_mtime(self.pending_frames(), self.input.rate())
    }

    fn reset(&mut self) {
        self.resampler.reset();
        for queue in self.pending.iter_mut() {
            queue.clear();
        }
        self.anchored = false;
    }
}

/// Drift-correcting resampler with an adjustable rate offset
///
/// With an offset of `+n` Hz, `rate` input frames become `rate + n` output
/// frames: the stream is stretched to fill a gap. A negative offset shrinks it.
/// Works on fl32 and s16l.
pub struct LinearResampler {
    format: AudioSampleFormat,
    offset: i32,
    /// Read position; 0 is the carried last frame, `k` is input frame `k - 1`
    position: f64,
    last_frame: Option<Vec<f32>>,
    scratch: Vec<f32>,
    interpolated: Vec<f32>,
}

impl LinearResampler {
    pub fn new(format: AudioSampleFormat) -> Result<Self> {
        if !matches!(format.encoding(), SampleEncoding::Fl32 | SampleEncoding::S16L) {
            return Err(AoutError::Format(format!(
                "linear resampler needs fl32 or s16l, got {}",
                format.encoding()
            )));
        }
        Ok(Self {
            format,
            offset: 0,
            position: 0.0,
            last_frame: None,
            scratch: Vec::new(),
            interpolated: Vec::new(),
        })
    }

    pub fn set_rate_offset(&mut self, offset: i32) {
        self.offset = offset;
    }

    pub fn rate_offset(&self) -> i32 {
        self.offset
    }

    /// Input frames consumed per output frame
    fn step(&self) -> f64 {
        let rate = self.format.rate() as f64;
        rate / (rate + self.offset as f64).max(1.0)
    }

    /// Record the tail of a buffer that bypassed this stage
    ///
    /// Keeps interpolation seamless when correction starts on the next buffer.
    pub fn note_passthrough(&mut self, buffer: &AudioBuffer) {
        let frame_size = self.format.bytes_per_frame();
        if buffer.nb_samples == 0 || buffer.byte_count() < frame_size {
            return;
        }
        let tail = &buffer.data()[buffer.byte_count() - frame_size..];
        let mut frame = Vec::with_capacity(self.format.nb_channels());
        sample::decode_into(self.format.encoding(), tail, &mut frame);
        self.last_frame = Some(frame);
        self.position = 1.0;
    }
}

impl FilterStage for LinearResampler {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.format
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.format
    }

    fn keeps_history(&self) -> bool {
        true
    }

    fn max_output_frames(&self, input_frames: usize) -> usize {
        ((input_frames + 1) as f64 / self.step()).ceil() as usize + 1
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        let channels = self.format.nb_channels();
        let frames_in = input.nb_samples;
        if frames_in == 0 {
            output.resize(0, 0)?;
            return Ok(());
        }

        self.scratch.clear();
        sample::decode_into(self.format.encoding(), input.data(), &mut self.scratch);

        // Frame 0 of the virtual input is the carried last frame
        let (previous, mut position) = match self.last_frame.take() {
            Some(frame) => (frame, self.position),
            None => (self.scratch[..channels].to_vec(), 1.0),
        };

        let step = self.step();
        self.interpolated.clear();
        while position <= frames_in as f64 {
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            for channel in 0..channels {
                let a = if index == 0 {
                    previous[channel]
                } else {
                    self.scratch[(index - 1) * channels + channel]
                };
                let value = if index < frames_in {
                    let b = self.scratch[index * channels + channel];
                    a + (b - a) * frac
                } else {
                    a
                };
                self.interpolated.push(value);
            }
            position += step;
        }

        self.position = position - frames_in as f64;
        self.last_frame = Some(self.scratch[(frames_in - 1) * channels..frames_in * channels].to_vec());

        let frames_out = self.interpolated.len() / channels;
        output.resize(frames_out * self.format.bytes_per_frame(), frames_out)?;
        sample::encode_into(self.format.encoding(), &self.interpolated, output.data_mut());
        output.end_date = output.start_date + frames_to_mtime(frames_out, self.format.rate());
        Ok(())
    }

    fn reset(&mut self) {
        self.last_frame = None;
        self.position = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{allocate, Allocation, AllocationPolicy};
    use crate::format::ChannelMask;

    fn fl32(rate: u32) -> AudioSampleFormat {
        AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, rate)
    }

    fn output_for(stage: &dyn FilterStage, input: &AudioBuffer) -> AudioBuffer {
        let frames = stage.max_output_frames(input.nb_samples);
        let duration = frames_to_mtime(frames + 1, stage.output_format().rate());
        let policy = AllocationPolicy::Allocate {
            bytes_per_second: stage.output_format().bytes_per_second(),
        };
        match allocate(policy, duration, Some(input)).unwrap() {
            Allocation::Owned(buffer) => buffer,
            Allocation::InPlace => unreachable!(),
        }
    }

    fn ramp(format: &AudioSampleFormat, frames: usize, start: i64) -> AudioBuffer {
        let samples: Vec<f32> = (0..frames).flat_map(|i| [i as f32 / 1000.0; 2]).collect();
        AudioBuffer::from_bytes(format, sample::f32_to_bytes(&samples), start)
    }

    #[test]
    fn test_resample_ratio_limits() {
        assert!(Resample::can_handle(&fl32(44_100), &fl32(48_000)));
        assert!(!Resample::can_handle(&fl32(8_000), &fl32(96_000)));
        assert!(!Resample::can_handle(&fl32(48_000), &fl32(48_000)));
    }

    #[test]
    fn test_resample_output_length_and_dates() {
        let input_format = fl32(48_000);
        let mut stage = Resample::new(&input_format, &fl32(24_000)).unwrap();

        let mut produced = 0;
        let mut next_date = None;
        for n in 0..10 {
            let input = ramp(&input_format, 4_800, n * 100_000);
            let mut output = output_for(&stage, &input);
            stage.process(&input, &mut output).unwrap();
            if output.nb_samples > 0 {
                if let Some(expected) = next_date {
                    assert_eq!(output.start_date, expected);
                }
                next_date = Some(output.end_date);
            }
            produced += output.nb_samples;
        }

        // 48000 frames in, half out, minus what is still pending inside
        assert!(produced <= 24_000);
        assert!(produced >= 24_000 - CHUNK_FRAMES);
    }

    #[test]
    fn test_resample_held_input_completes_the_timeline() {
        let input_format = fl32(8_000);
        let mut stage = Resample::new(&input_format, &fl32(48_000)).unwrap();

        // less than a chunk: everything is held
        let first = ramp(&input_format, 800, 0);
        let mut output = output_for(&stage, &first);
        stage.process(&first, &mut output).unwrap();
        assert_eq!(output.nb_samples, 0);
        assert_eq!(stage.held_duration(), 100_000);

        let second = ramp(&input_format, 800, 100_000);
        let mut output = output_for(&stage, &second);
        stage.process(&second, &mut output).unwrap();
        assert!(output.nb_samples > 0);
        // rubato's first chunk starts a few frames into its history
        let reached = output.end_date + stage.held_duration();
        assert!((reached - second.end_date).abs() < 2_000, "{} vs {}", reached, second.end_date);

        stage.reset();
        assert_eq!(stage.held_duration(), 0);
    }

    #[test]
    fn test_linear_neutral_is_identity_after_passthrough() {
        let format = fl32(48_000);
        let mut stage = LinearResampler::new(format).unwrap();
        let first = ramp(&format, 100, 0);
        stage.note_passthrough(&first);

        let second = ramp(&format, 100, 2_083);
        let mut output = output_for(&stage, &second);
        stage.process(&second, &mut output).unwrap();
        assert_eq!(output.nb_samples, 100);
        assert_eq!(output.data(), second.data());
    }

    #[test]
    fn test_linear_offset_changes_length() {
        let format = fl32(48_000);
        let mut stretch = LinearResampler::new(format).unwrap();
        stretch.set_rate_offset(480);
        let input = ramp(&format, 4_800, 0);
        let mut output = output_for(&stretch, &input);
        stretch.process(&input, &mut output).unwrap();
        // 1% more frames
        assert!((4_846..=4_850).contains(&output.nb_samples));

        let mut shrink = LinearResampler::new(format).unwrap();
        shrink.set_rate_offset(-480);
        let mut output = output_for(&shrink, &input);
        shrink.process(&input, &mut output).unwrap();
        assert!((4_750..=4_754).contains(&output.nb_samples));
    }

    #[test]
    fn test_linear_rejects_other_encodings() {
        let format = AudioSampleFormat::new(SampleEncoding::S24L, ChannelMask::STEREO, 48_000);
        assert!(LinearResampler::new(format).is_err());
    }
}
