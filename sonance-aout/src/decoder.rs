//! Decoder-side collaborators feeding input pipelines
//!
//! The output core never decodes anything itself; these are the minimal
//! producers the command-line player drives its inputs with:
//!
//! - [`FileDecoder`]: any container/codec symphonia knows, decoded to fl32
//!   in the file's own rate and channel count
//! - [`ToneGenerator`]: a sine, for testing without files
//! - [`DecoderFeed`]: stamps consecutive chunks with sample-exact dates

use crate::buffer::AudioBuffer;
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, ChannelMask, SampleEncoding};
use crate::sample;
use sonance_common::timing::{Mtime, SampleDate};
use std::f32::consts::TAU;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Something producing interleaved fl32 chunks
pub trait AudioSource: Send {
    fn format(&self) -> AudioSampleFormat;

    /// Next chunk of interleaved samples; `None` at end of stream
    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>>;
}

/// Symphonia-backed file decoder
pub struct FileDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: AudioSampleFormat,
}

impl FileDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening {}", path.display());
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| AoutError::Decode(format!("Failed to probe {}: {}", path.display(), e)))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AoutError::Decode("No audio track found".to_string()))?;
        let track_id = track.id;

        let rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| AoutError::Decode("Sample rate not found".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| AoutError::Decode("Channel count not found".to_string()))?;
        let mask = ChannelMask::from_count(channels)
            .ok_or_else(|| AoutError::Decode(format!("Unsupported channel count {}", channels)))?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AoutError::Decode(format!("Failed to create decoder: {}", e)))?;

        let format = AudioSampleFormat::new(SampleEncoding::Fl32, mask, rate);
        debug!("{}: {}", path.display(), format);

        Ok(Self {
            reader,
            decoder,
            track_id,
            format,
        })
    }
}

impl AudioSource for FileDecoder {
    fn format(&self) -> AudioSampleFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Reached end of stream");
                    return Ok(None);
                }
                Err(e) => return Err(AoutError::Decode(format!("Error reading packet: {}", e))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Decode error, packet skipped: {}", e);
                    continue;
                }
                Err(e) => return Err(AoutError::Decode(e.to_string())),
            };
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);
            return Ok(Some(samples.samples().to_vec()));
        }
    }
}

/// Sine generator
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    format: AudioSampleFormat,
    frequency: f32,
    amplitude: f32,
    phase: f32,
    chunk_frames: usize,
    remaining: Option<usize>,
}

impl ToneGenerator {
    pub fn new(format: AudioSampleFormat, frequency: f32, amplitude: f32, chunk_frames: usize) -> Self {
        Self {
            format: format.with_encoding(SampleEncoding::Fl32),
            frequency,
            amplitude,
            phase: 0.0,
            chunk_frames: chunk_frames.max(1),
            remaining: None,
        }
    }

    /// Stop after `duration` of audio
    pub fn with_duration(mut self, duration: Mtime) -> Self {
        self.remaining = Some(sonance_common::timing::mtime_to_frames(duration, self.format.rate()));
        self
    }
}

impl AudioSource for ToneGenerator {
    fn format(&self) -> AudioSampleFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        let frames = match self.remaining {
            Some(0) => return Ok(None),
            Some(remaining) => remaining.min(self.chunk_frames),
            None => self.chunk_frames,
        };
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= frames;
        }

        let channels = self.format.nb_channels();
        let step = TAU * self.frequency / self.format.rate() as f32;
        let mut samples = Vec::with_capacity(frames * channels);
        for _ in 0..frames {
            let value = self.amplitude * self.phase.sin();
            samples.extend(std::iter::repeat(value).take(channels));
            self.phase = (self.phase + step) % TAU;
        }
        Ok(Some(samples))
    }
}

/// Dates consecutive chunks of one stream
#[derive(Debug, Clone)]
pub struct DecoderFeed {
    format: AudioSampleFormat,
    date: SampleDate,
}

impl DecoderFeed {
    /// First chunk starts at `origin`
    pub fn new(format: AudioSampleFormat, origin: Mtime) -> Self {
        let mut date = SampleDate::new(format.rate().max(1));
        date.set(origin);
        Self { format, date }
    }

    /// Wrap interleaved fl32 samples into a dated buffer
    pub fn stamp(&mut self, samples: &[f32]) -> AudioBuffer {
        let frames = samples.len() / self.format.nb_channels().max(1);
        let mut data = vec![0u8; frames * self.format.bytes_per_frame()];
        sample::encode_into(self.format.encoding(), &samples[..frames * self.format.nb_channels()], &mut data);
        let start = self.date.get();
        let end = self.date.increment(frames);
        AudioBuffer::new(data, frames, start, end)
    }

    /// Move the stream (e.g. across a pause)
    pub fn shift(&mut self, delta: Mtime) {
        self.date.shift(delta);
    }

    /// Start date of the next chunk
    pub fn next_date(&self) -> Mtime {
        self.date.get()
    }

    pub fn format(&self) -> &AudioSampleFormat {
        &self.format
    }
}
