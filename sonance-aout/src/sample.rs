//! Per-sample encode/decode between stored encodings and f32
//!
//! Integer encodings map onto the nominal float range [-1.0, 1.0) by dividing
//! by 2^(bits-1). Encoding back to an integer clamps out-of-range values.

use crate::format::SampleEncoding;

const S16_SCALE: f32 = 32_768.0;
const S24_SCALE: f32 = 8_388_608.0;
const S32_SCALE: f64 = 2_147_483_648.0;

/// Byte value a silent sample is made of
pub fn silence_byte(encoding: SampleEncoding) -> u8 {
    match encoding {
        SampleEncoding::U8 => 0x80,
        _ => 0,
    }
}

/// Decode one sample; `bytes` holds exactly one sample of `encoding`
#[inline]
pub fn read_sample(encoding: SampleEncoding, bytes: &[u8]) -> f32 {
    match encoding {
        SampleEncoding::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleEncoding::S16L => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / S16_SCALE,
        SampleEncoding::S16B => i16::from_be_bytes([bytes[0], bytes[1]]) as f32 / S16_SCALE,
        SampleEncoding::S24L => {
            // Sign-extend through the top byte
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            raw as f32 / S24_SCALE
        }
        SampleEncoding::S32L => {
            (i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64 / S32_SCALE) as f32
        }
        SampleEncoding::Fl32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Encode one sample into `out` (exactly one sample wide), clamping integers
#[inline]
pub fn write_sample(encoding: SampleEncoding, value: f32, out: &mut [u8]) {
    match encoding {
        SampleEncoding::U8 => {
            out[0] = (value * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8;
        }
        SampleEncoding::S16L => out.copy_from_slice(&f32_to_i16(value).to_le_bytes()),
        SampleEncoding::S16B => out.copy_from_slice(&f32_to_i16(value).to_be_bytes()),
        SampleEncoding::S24L => {
            let v = (value * S24_SCALE).round().clamp(-S24_SCALE, S24_SCALE - 1.0) as i32;
            out.copy_from_slice(&v.to_le_bytes()[..3]);
        }
        SampleEncoding::S32L => {
            let v = (value as f64 * S32_SCALE)
                .round()
                .clamp(-S32_SCALE, S32_SCALE - 1.0) as i32;
            out.copy_from_slice(&v.to_le_bytes());
        }
        SampleEncoding::Fl32 => out.copy_from_slice(&value.to_le_bytes()),
    }
}

/// Float to signed 16-bit with saturation
#[inline]
pub fn f32_to_i16(value: f32) -> i16 {
    (value * S16_SCALE).round().clamp(-S16_SCALE, S16_SCALE - 1.0) as i16
}

/// Decode a whole interleaved byte region, appending to `out`
pub fn decode_into(encoding: SampleEncoding, data: &[u8], out: &mut Vec<f32>) {
    let width = encoding.bytes_per_sample();
    out.reserve(data.len() / width);
    out.extend(data.chunks_exact(width).map(|s| read_sample(encoding, s)));
}

/// Encode samples into `out`, which must hold `samples.len()` samples
pub fn encode_into(encoding: SampleEncoding, samples: &[f32], out: &mut [u8]) {
    let width = encoding.bytes_per_sample();
    debug_assert!(out.len() >= samples.len() * width);
    for (value, slot) in samples.iter().zip(out.chunks_exact_mut(width)) {
        write_sample(encoding, *value, slot);
    }
}

/// Little-endian f32 samples as bytes
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}
