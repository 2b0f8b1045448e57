//! Channel layout stages
//!
//! [`Remix`] converts between layouts with a mixing matrix: positions present
//! on both sides pass at unity gain, missing positions fold into their nearest
//! neighbours (-3dB for a centre or side split, half for a pair folding into
//! one), LFE is dropped on downmix. A mono source upmixes to both front
//! channels at unity gain.
//!
//! [`Remap`] permutes channels of an otherwise unchanged format, following the
//! configured remap table.

use super::FilterStage;
use crate::buffer::AudioBuffer;
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, ChannelMask, SampleEncoding};
use crate::sample;
use std::f32::consts::FRAC_1_SQRT_2;

const HALF: f32 = 0.5;

/// Where an input position goes in an output layout, with gains
fn routes(position: ChannelMask, input: ChannelMask, output: ChannelMask) -> Vec<(ChannelMask, f32)> {
    if output.contains(position) {
        return vec![(position, 1.0)];
    }

    let has_front_pair = output.contains(ChannelMask::STEREO);
    // side and rear channels fold towards the matching front side
    let fold = |alternate: ChannelMask, front: ChannelMask| {
        if output.contains(alternate) {
            vec![(alternate, 1.0)]
        } else if output.contains(front) {
            vec![(front, FRAC_1_SQRT_2)]
        } else if output.contains(ChannelMask::CENTER) {
            vec![(ChannelMask::CENTER, HALF)]
        } else {
            Vec::new()
        }
    };

    let rear = ChannelMask::REAR_LEFT | ChannelMask::REAR_RIGHT;
    let middle = ChannelMask::MIDDLE_LEFT | ChannelMask::MIDDLE_RIGHT;

    if position == ChannelMask::LEFT || position == ChannelMask::RIGHT {
        if output.contains(ChannelMask::CENTER) {
            vec![(ChannelMask::CENTER, HALF)]
        } else {
            Vec::new()
        }
    } else if position == ChannelMask::CENTER {
        if !has_front_pair {
            return Vec::new();
        }
        let gain = if input == ChannelMask::MONO { 1.0 } else { FRAC_1_SQRT_2 };
        vec![(ChannelMask::LEFT, gain), (ChannelMask::RIGHT, gain)]
    } else if position == ChannelMask::MIDDLE_LEFT {
        fold(ChannelMask::REAR_LEFT, ChannelMask::LEFT)
    } else if position == ChannelMask::MIDDLE_RIGHT {
        fold(ChannelMask::REAR_RIGHT, ChannelMask::RIGHT)
    } else if position == ChannelMask::REAR_LEFT {
        fold(ChannelMask::MIDDLE_LEFT, ChannelMask::LEFT)
    } else if position == ChannelMask::REAR_RIGHT {
        fold(ChannelMask::MIDDLE_RIGHT, ChannelMask::RIGHT)
    } else if position == ChannelMask::REAR_CENTER {
        if output.contains(rear) {
            vec![(ChannelMask::REAR_LEFT, FRAC_1_SQRT_2), (ChannelMask::REAR_RIGHT, FRAC_1_SQRT_2)]
        } else if output.contains(middle) {
            vec![
                (ChannelMask::MIDDLE_LEFT, FRAC_1_SQRT_2),
                (ChannelMask::MIDDLE_RIGHT, FRAC_1_SQRT_2),
            ]
        } else if has_front_pair {
            vec![(ChannelMask::LEFT, HALF), (ChannelMask::RIGHT, HALF)]
        } else if output.contains(ChannelMask::CENTER) {
            vec![(ChannelMask::CENTER, HALF)]
        } else {
            Vec::new()
        }
    } else {
        // LFE is dropped
        Vec::new()
    }
}

/// Mixing matrix: for each output channel, (input channel, gain) pairs
fn build_matrix(input: ChannelMask, output: ChannelMask) -> Vec<Vec<(usize, f32)>> {
    let mut matrix = vec![Vec::new(); output.count()];
    for (in_index, position) in input.positions().enumerate() {
        for (target, gain) in routes(position, input, output) {
            if let Some(out_index) = output.index_of(target) {
                matrix[out_index].push((in_index, gain));
            }
        }
    }
    matrix
}

/// Channel layout conversion on fl32
pub struct Remix {
    input: AudioSampleFormat,
    output: AudioSampleFormat,
    matrix: Vec<Vec<(usize, f32)>>,
    scratch: Vec<f32>,
    mixed: Vec<f32>,
}

impl Remix {
    pub fn can_handle(input: &AudioSampleFormat, output: &AudioSampleFormat) -> bool {
        input.encoding() == SampleEncoding::Fl32
            && output.encoding() == SampleEncoding::Fl32
            && input.rate() == output.rate()
            && input.channels() != output.channels()
            && !input.channels().is_empty()
            && !output.channels().is_empty()
    }

    pub fn create(input: &AudioSampleFormat, output: &AudioSampleFormat) -> Result<Box<dyn FilterStage>> {
        if !Self::can_handle(input, output) {
            return Err(AoutError::Filter {
                stage: "remix",
                reason: format!("cannot remix {} to {}", input, output),
            });
        }
        Ok(Box::new(Self {
            input: *input,
            output: *output,
            matrix: build_matrix(input.channels(), output.channels()),
            scratch: Vec::new(),
            mixed: Vec::new(),
        }))
    }
}

impl FilterStage for Remix {
    fn name(&self) -> &'static str {
        "remix"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.input
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.output
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        let in_channels = self.input.nb_channels();
        self.scratch.clear();
        sample::decode_into(SampleEncoding::Fl32, input.data(), &mut self.scratch);

        self.mixed.clear();
        for frame in self.scratch.chunks_exact(in_channels) {
            for sources in &self.matrix {
                let value: f32 = sources.iter().map(|(index, gain)| frame[*index] * gain).sum();
                self.mixed.push(value);
            }
        }

        let frames = input.nb_samples;
        output.resize(frames * self.output.bytes_per_frame(), frames)?;
        sample::encode_into(SampleEncoding::Fl32, &self.mixed, output.data_mut());
        Ok(())
    }
}

/// Channel permutation: output channel `i` takes input channel `table[i]`
pub struct Remap {
    format: AudioSampleFormat,
    table: Vec<usize>,
    frame: Vec<u8>,
}

impl Remap {
    pub fn new(format: AudioSampleFormat, table: Vec<usize>) -> Result<Self> {
        let channels = format.nb_channels();
        if table.len() != channels || table.iter().any(|&c| c >= channels) {
            return Err(AoutError::Format(format!(
                "remap table {:?} does not fit {} channels",
                table, channels
            )));
        }
        Ok(Self {
            format,
            table,
            frame: vec![0; format.bytes_per_frame()],
        })
    }

    fn permute(&mut self, data: &mut [u8]) {
        let width = self.format.encoding().bytes_per_sample();
        let frame_size = self.format.bytes_per_frame();
        for frame in data.chunks_exact_mut(frame_size) {
            self.frame.copy_from_slice(frame);
            for (out_channel, &in_channel) in self.table.iter().enumerate() {
                frame[out_channel * width..(out_channel + 1) * width]
                    .copy_from_slice(&self.frame[in_channel * width..(in_channel + 1) * width]);
            }
        }
    }
}

impl FilterStage for Remap {
    fn name(&self) -> &'static str {
        "remap"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.format
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.format
    }

    fn in_place(&self) -> bool {
        true
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        output.fill(input.data(), input.nb_samples)?;
        self.permute(output.data_mut());
        Ok(())
    }

    fn process_in_place(&mut self, buffer: &mut AudioBuffer) -> Result<()> {
        self.permute(buffer.data_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fl32(channels: ChannelMask) -> AudioSampleFormat {
        AudioSampleFormat::new(SampleEncoding::Fl32, channels, 48_000)
    }

    fn run(stage: &mut dyn FilterStage, samples: &[f32]) -> Vec<f32> {
        let input_format = *stage.input_format();
        let input = AudioBuffer::from_bytes(&input_format, sample::f32_to_bytes(samples), 0);
        let frames = input.nb_samples;
        let capacity = frames * stage.output_format().bytes_per_frame();
        let mut output = AudioBuffer::new(Vec::with_capacity(capacity), 0, 0, 0);
        stage.process(&input, &mut output).unwrap();
        let mut out = Vec::new();
        sample::decode_into(SampleEncoding::Fl32, output.data(), &mut out);
        out
    }

    #[test]
    fn test_mono_upmix_duplicates() {
        let mut stage = Remix::create(&fl32(ChannelMask::MONO), &fl32(ChannelMask::STEREO)).unwrap();
        assert_eq!(run(stage.as_mut(), &[0.5, -0.25]), vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn test_stereo_downmix_averages() {
        let mut stage = Remix::create(&fl32(ChannelMask::STEREO), &fl32(ChannelMask::MONO)).unwrap();
        assert_eq!(run(stage.as_mut(), &[0.5, 0.25]), vec![0.375]);
    }

    #[test]
    fn test_surround_downmix_to_stereo() {
        let mut stage =
            Remix::create(&fl32(ChannelMask::SURROUND_5_1), &fl32(ChannelMask::STEREO)).unwrap();
        // L R RL RR C LFE
        let out = run(stage.as_mut(), &[0.1, 0.2, 0.0, 0.0, 0.0, 1.0]);
        assert!((out[0] - 0.1).abs() < 1e-6);
        assert!((out[1] - 0.2).abs() < 1e-6);

        let out = run(stage.as_mut(), &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert!((out[0] - FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((out[1] - FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_remap_swaps_channels() {
        let format = AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, 44_100);
        let mut stage = Remap::new(format, vec![1, 0]).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&1i16.to_le_bytes());
        data.extend_from_slice(&2i16.to_le_bytes());
        let mut buffer = AudioBuffer::from_bytes(&format, data, 0);
        stage.process_in_place(&mut buffer).unwrap();
        assert_eq!(&buffer.data()[..2], &2i16.to_le_bytes());
        assert_eq!(&buffer.data()[2..], &1i16.to_le_bytes());
    }

    #[test]
    fn test_remap_rejects_bad_table() {
        let format = AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, 44_100);
        assert!(Remap::new(format, vec![0]).is_err());
        assert!(Remap::new(format, vec![0, 2]).is_err());
    }
}
