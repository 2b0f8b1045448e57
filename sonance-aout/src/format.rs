//! Audio sample format description
//!
//! An [`AudioSampleFormat`] names the sample encoding, the physical channel
//! layout and the sample rate of a stream. Bytes-per-frame is always derived:
//! `bytes_per_frame = nb_channels × bytes_per_sample` and
//! `nb_channels = popcount(physical_channels)`.
//!
//! Interleaved frames store channels in [`CHANNEL_ORDER`] order, skipping the
//! positions absent from the mask.

use crate::error::{AoutError, Result};
use bitflags::bitflags;
use serde::Deserialize;
use std::fmt;

/// Highest sample rate a format may declare
pub const MAX_RATE: u32 = 384_000;

bitflags! {
    /// Physical channel positions present in a stream
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelMask: u32 {
        const CENTER       = 0x0001;
        const LEFT         = 0x0002;
        const RIGHT        = 0x0004;
        const REAR_CENTER  = 0x0010;
        const REAR_LEFT    = 0x0020;
        const REAR_RIGHT   = 0x0040;
        const MIDDLE_LEFT  = 0x0100;
        const MIDDLE_RIGHT = 0x0200;
        const LFE          = 0x1000;

        const MONO = Self::CENTER.bits();
        const STEREO = Self::LEFT.bits() | Self::RIGHT.bits();
        const SURROUND_5_1 = Self::STEREO.bits() | Self::CENTER.bits()
            | Self::REAR_LEFT.bits() | Self::REAR_RIGHT.bits() | Self::LFE.bits();
    }
}

/// Interleave order of channel positions within a frame
pub const CHANNEL_ORDER: [ChannelMask; 9] = [
    ChannelMask::LEFT,
    ChannelMask::RIGHT,
    ChannelMask::MIDDLE_LEFT,
    ChannelMask::MIDDLE_RIGHT,
    ChannelMask::REAR_LEFT,
    ChannelMask::REAR_RIGHT,
    ChannelMask::REAR_CENTER,
    ChannelMask::CENTER,
    ChannelMask::LFE,
];

impl ChannelMask {
    /// Number of channels (one per set position)
    pub fn count(self) -> usize {
        self.bits().count_ones() as usize
    }

    /// Positions present in this mask, in interleave order
    pub fn positions(self) -> impl Iterator<Item = ChannelMask> {
        CHANNEL_ORDER.into_iter().filter(move |p| self.contains(*p))
    }

    /// Interleave index of `position` within a frame of this layout
    pub fn index_of(self, position: ChannelMask) -> Option<usize> {
        self.positions().position(|p| p == position)
    }

    /// Conventional layout for a bare channel count
    pub fn from_count(channels: usize) -> Option<Self> {
        let mask = match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            3 => Self::STEREO | Self::CENTER,
            4 => Self::STEREO | Self::REAR_LEFT | Self::REAR_RIGHT,
            5 => Self::STEREO | Self::CENTER | Self::REAR_LEFT | Self::REAR_RIGHT,
            6 => Self::SURROUND_5_1,
            7 => Self::SURROUND_5_1 | Self::REAR_CENTER,
            8 => Self::SURROUND_5_1 | Self::MIDDLE_LEFT | Self::MIDDLE_RIGHT,
            _ => return None,
        };
        Some(mask)
    }

    /// Parse a layout name as used in configuration files
    pub fn from_layout_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mono" | "1.0" => Some(Self::MONO),
            "stereo" | "2.0" => Some(Self::STEREO),
            "3.0" => Some(Self::STEREO | Self::CENTER),
            "quad" | "4.0" => Self::from_count(4),
            "5.0" => Self::from_count(5),
            "5.1" => Some(Self::SURROUND_5_1),
            "6.1" => Self::from_count(7),
            "7.1" => Self::from_count(8),
            _ => None,
        }
    }
}

/// Sample encoding: integer width, signedness or float, byte order
///
/// Multi-byte encodings are little-endian except `S16B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    /// Unsigned 8-bit, 128 is silence
    U8,
    /// Signed 16-bit little-endian
    S16L,
    /// Signed 16-bit big-endian
    S16B,
    /// Signed 24-bit little-endian, packed in 3 bytes
    S24L,
    /// Signed 32-bit little-endian
    S32L,
    /// 32-bit IEEE float little-endian, nominal range [-1.0, 1.0]
    Fl32,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::U8 => 1,
            SampleEncoding::S16L | SampleEncoding::S16B => 2,
            SampleEncoding::S24L => 3,
            SampleEncoding::S32L | SampleEncoding::Fl32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleEncoding::Fl32)
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleEncoding::U8 => "u8",
            SampleEncoding::S16L => "s16l",
            SampleEncoding::S16B => "s16b",
            SampleEncoding::S24L => "s24l",
            SampleEncoding::S32L => "s32l",
            SampleEncoding::Fl32 => "fl32",
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encoding, channel layout and rate of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioSampleFormat {
    encoding: SampleEncoding,
    physical_channels: ChannelMask,
    rate: u32,
    bytes_per_frame: usize,
}

impl AudioSampleFormat {
    /// Create a prepared format (bytes-per-frame derived)
    pub fn new(encoding: SampleEncoding, physical_channels: ChannelMask, rate: u32) -> Self {
        let mut format = Self {
            encoding,
            physical_channels,
            rate,
            bytes_per_frame: 0,
        };
        format.prepare();
        format
    }

    /// Recompute derived fields
    pub fn prepare(&mut self) {
        self.bytes_per_frame = self.nb_channels() * self.encoding.bytes_per_sample();
    }

    /// Reject formats no stage can process
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 || self.rate > MAX_RATE {
            return Err(AoutError::Format(format!("unsupported rate {}Hz", self.rate)));
        }
        if self.physical_channels.is_empty() {
            return Err(AoutError::Format("no channels".to_string()));
        }
        Ok(())
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    pub fn channels(&self) -> ChannelMask {
        self.physical_channels
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn nb_channels(&self) -> usize {
        self.physical_channels.count()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    pub fn bytes_per_second(&self) -> u32 {
        (self.bytes_per_frame as u64 * self.rate as u64) as u32
    }

    pub fn with_encoding(&self, encoding: SampleEncoding) -> Self {
        Self::new(encoding, self.physical_channels, self.rate)
    }

    pub fn with_channels(&self, physical_channels: ChannelMask) -> Self {
        Self::new(self.encoding, physical_channels, self.rate)
    }

    pub fn with_rate(&self, rate: u32) -> Self {
        Self::new(self.encoding, self.physical_channels, rate)
    }

    /// Human-readable channel layout, e.g. "Mono", "Stereo", "3F2R/LFE"
    pub fn print_channels(&self) -> String {
        print_channels(self.physical_channels)
    }
}

impl fmt::Display for AudioSampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}",
            self.encoding,
            self.rate,
            self.print_channels()
        )
    }
}

fn print_channels(mask: ChannelMask) -> String {
    if mask == ChannelMask::MONO {
        return "Mono".to_string();
    }
    if mask == ChannelMask::STEREO {
        return "Stereo".to_string();
    }
    if mask.is_empty() {
        return "None".to_string();
    }

    let front = (mask & (ChannelMask::STEREO | ChannelMask::CENTER)).count();
    let middle = (mask & (ChannelMask::MIDDLE_LEFT | ChannelMask::MIDDLE_RIGHT)).count();
    let rear = (mask & (ChannelMask::REAR_LEFT | ChannelMask::REAR_RIGHT | ChannelMask::REAR_CENTER))
        .count();

    let mut name = format!("{}F", front);
    if middle > 0 {
        name.push_str(&format!("{}M", middle));
    }
    if rear > 0 {
        name.push_str(&format!("{}R", rear));
    }
    if mask.contains(ChannelMask::LFE) {
        name.push_str("/LFE");
    }
    name
}
