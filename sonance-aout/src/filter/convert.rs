//! Sample encoding stages: integer ↔ float conversion and byte swapping

use super::FilterStage;
use crate::buffer::AudioBuffer;
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::sample;

/// Integer encoding ↔ fl32, same layout and rate
pub struct Convert {
    input: AudioSampleFormat,
    output: AudioSampleFormat,
    scratch: Vec<f32>,
}

impl Convert {
    pub fn can_handle(input: &AudioSampleFormat, output: &AudioSampleFormat) -> bool {
        input.channels() == output.channels()
            && input.rate() == output.rate()
            && input.encoding().is_float() != output.encoding().is_float()
    }

    pub fn create(input: &AudioSampleFormat, output: &AudioSampleFormat) -> Result<Box<dyn FilterStage>> {
        if !Self::can_handle(input, output) {
            return Err(AoutError::Filter {
                stage: "convert",
                reason: format!("cannot convert {} to {}", input, output),
            });
        }
        Ok(Box::new(Self {
            input: *input,
            output: *output,
            scratch: Vec::new(),
        }))
    }
}

impl FilterStage for Convert {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.input
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.output
    }

    fn in_place(&self) -> bool {
        self.input.encoding().bytes_per_sample() == self.output.encoding().bytes_per_sample()
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        self.scratch.clear();
        sample::decode_into(self.input.encoding(), input.data(), &mut self.scratch);

        let frames = input.nb_samples;
        output.resize(frames * self.output.bytes_per_frame(), frames)?;
        sample::encode_into(self.output.encoding(), &self.scratch, output.data_mut());
        Ok(())
    }

    fn process_in_place(&mut self, buffer: &mut AudioBuffer) -> Result<()> {
        self.scratch.clear();
        sample::decode_into(self.input.encoding(), buffer.data(), &mut self.scratch);
        sample::encode_into(self.output.encoding(), &self.scratch, buffer.data_mut());
        Ok(())
    }
}

/// s16l ↔ s16b
pub struct ByteSwap {
    input: AudioSampleFormat,
    output: AudioSampleFormat,
}

impl ByteSwap {
    pub fn can_handle(input: &AudioSampleFormat, output: &AudioSampleFormat) -> bool {
        let pair = (input.encoding(), output.encoding());
        input.channels() == output.channels()
            && input.rate() == output.rate()
            && matches!(
                pair,
                (SampleEncoding::S16L, SampleEncoding::S16B) | (SampleEncoding::S16B, SampleEncoding::S16L)
            )
    }

    pub fn create(input: &AudioSampleFormat, output: &AudioSampleFormat) -> Result<Box<dyn FilterStage>> {
        if !Self::can_handle(input, output) {
            return Err(AoutError::Filter {
                stage: "byteswap",
                reason: format!("cannot swap {} to {}", input, output),
            });
        }
        Ok(Box::new(Self {
            input: *input,
            output: *output,
        }))
    }
}

fn swap_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

impl FilterStage for ByteSwap {
    fn name(&self) -> &'static str {
        "byteswap"
    }

    fn input_format(&self) -> &AudioSampleFormat {
        &self.input
    }

    fn output_format(&self) -> &AudioSampleFormat {
        &self.output
    }

    fn in_place(&self) -> bool {
        true
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) -> Result<()> {
        output.fill(input.data(), input.nb_samples)?;
        swap_pairs(output.data_mut());
        Ok(())
    }

    fn process_in_place(&mut self, buffer: &mut AudioBuffer) -> Result<()> {
        swap_pairs(buffer.data_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelMask;

    fn stereo(encoding: SampleEncoding) -> AudioSampleFormat {
        AudioSampleFormat::new(encoding, ChannelMask::STEREO, 48_000)
    }

    #[test]
    fn test_can_handle() {
        assert!(Convert::can_handle(&stereo(SampleEncoding::S16L), &stereo(SampleEncoding::Fl32)));
        assert!(Convert::can_handle(&stereo(SampleEncoding::Fl32), &stereo(SampleEncoding::U8)));
        assert!(!Convert::can_handle(&stereo(SampleEncoding::S16L), &stereo(SampleEncoding::S24L)));
        assert!(!Convert::can_handle(
            &stereo(SampleEncoding::S16L),
            &stereo(SampleEncoding::Fl32).with_rate(44_100)
        ));
        assert!(ByteSwap::can_handle(&stereo(SampleEncoding::S16B), &stereo(SampleEncoding::S16L)));
        assert!(!ByteSwap::can_handle(&stereo(SampleEncoding::S16L), &stereo(SampleEncoding::S16L)));
    }

    #[test]
    fn test_s32_to_float_in_place() {
        let input = stereo(SampleEncoding::S32L);
        let mut stage = Convert::create(&input, &stereo(SampleEncoding::Fl32)).unwrap();
        assert!(stage.in_place());

        let mut data = vec![0u8; 8];
        sample::encode_into(SampleEncoding::S32L, &[0.5, -0.25], &mut data);
        let mut buffer = AudioBuffer::from_bytes(&input, data, 0);
        stage.process_in_place(&mut buffer).unwrap();

        let mut out = Vec::new();
        sample::decode_into(SampleEncoding::Fl32, buffer.data(), &mut out);
        assert_eq!(out, vec![0.5, -0.25]);
    }

    #[test]
    fn test_byteswap() {
        let input = stereo(SampleEncoding::S16L);
        let mut stage = ByteSwap::create(&input, &stereo(SampleEncoding::S16B)).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_le_bytes());
        data.extend_from_slice(&(-2i16).to_le_bytes());
        let mut buffer = AudioBuffer::from_bytes(&input, data, 0);
        stage.process_in_place(&mut buffer).unwrap();

        assert_eq!(&buffer.data()[..2], &1000i16.to_be_bytes());
        assert_eq!(&buffer.data()[2..], &(-2i16).to_be_bytes());
    }
}
