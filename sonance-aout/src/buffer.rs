//! Timestamped audio buffers and the allocation policy stages use
//!
//! A buffer owns its byte region outright. Pass-through allocation never
//! produces a second buffer: the stage writes into the buffer it was handed,
//! so there is nothing to free twice.

use crate::error::{AoutError, Result};
use crate::format::AudioSampleFormat;
use crate::sample;
use sonance_common::timing::{frames_to_mtime, Mtime, CLOCK_FREQ};
use std::fmt;

/// Interleaved audio samples with a presentation interval `[start_date, end_date)`
#[derive(Clone, PartialEq)]
pub struct AudioBuffer {
    data: Vec<u8>,
    /// Frames held (samples per channel)
    pub nb_samples: usize,
    pub start_date: Mtime,
    pub end_date: Mtime,
    /// Not contiguous with the previous buffer of the same stream
    pub discontinuity: bool,
}

impl AudioBuffer {
    /// Wrap an already filled byte region
    pub fn new(data: Vec<u8>, nb_samples: usize, start_date: Mtime, end_date: Mtime) -> Self {
        Self {
            data,
            nb_samples,
            start_date,
            end_date,
            discontinuity: false,
        }
    }

    /// Wrap `data` in `format`, deriving frame count and end date
    pub fn from_bytes(format: &AudioSampleFormat, data: Vec<u8>, start_date: Mtime) -> Self {
        let nb_samples = data.len() / format.bytes_per_frame().max(1);
        let end_date = start_date + frames_to_mtime(nb_samples, format.rate());
        Self::new(data, nb_samples, start_date, end_date)
    }

    /// A silent buffer of `nb_samples` frames starting at `start_date`
    pub fn silence(format: &AudioSampleFormat, nb_samples: usize, start_date: Mtime) -> Result<Self> {
        let bytes = nb_samples * format.bytes_per_frame();
        let mut data = try_alloc(bytes)?;
        data.resize(bytes, sample::silence_byte(format.encoding()));
        let end_date = start_date + frames_to_mtime(nb_samples, format.rate());
        Ok(Self::new(data, nb_samples, start_date, end_date))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_count(&self) -> usize {
        self.data.len()
    }

    /// Bytes this buffer can hold without reallocating
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn duration(&self) -> Mtime {
        self.end_date - self.start_date
    }

    /// Replace the payload with `bytes`, staying inside the allocated capacity
    pub fn fill(&mut self, bytes: &[u8], nb_samples: usize) -> Result<()> {
        if bytes.len() > self.data.capacity() {
            return Err(AoutError::BufferOverflow {
                needed: bytes.len(),
                capacity: self.data.capacity(),
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.nb_samples = nb_samples;
        Ok(())
    }

    /// Resize the payload to `len` bytes (new bytes zeroed), staying inside capacity
    pub fn resize(&mut self, len: usize, nb_samples: usize) -> Result<()> {
        if len > self.data.capacity() {
            return Err(AoutError::BufferOverflow {
                needed: len,
                capacity: self.data.capacity(),
            });
        }
        self.data.resize(len, 0);
        self.nb_samples = nb_samples;
        Ok(())
    }

    /// Shift both dates by `delta`
    pub fn shift(&mut self, delta: Mtime) {
        self.start_date += delta;
        self.end_date += delta;
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("bytes", &self.data.len())
            .field("nb_samples", &self.nb_samples)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("discontinuity", &self.discontinuity)
            .finish()
    }
}

/// How a stage obtains its output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Write into the buffer handed in (in-place processing)
    PassThrough,
    /// Allocate storage for a duration of playback at this byte rate
    Allocate { bytes_per_second: u32 },
}

/// Result of [`allocate`]
#[derive(Debug)]
pub enum Allocation {
    /// Reuse the caller's buffer; nothing was allocated
    InPlace,
    /// Fresh empty buffer with capacity for the requested duration
    Owned(AudioBuffer),
}

/// Bytes needed to hold `duration` of audio at `bytes_per_second`, rounded up
pub fn bytes_for_duration(duration: Mtime, bytes_per_second: u32) -> usize {
    if duration <= 0 {
        return 0;
    }
    let total = duration as u128 * bytes_per_second as u128;
    total.div_ceil(CLOCK_FREQ as u128) as usize
}

/// Obtain an output buffer under `policy` for `duration` microseconds
///
/// An owned buffer inherits `start_date`/`end_date` from `previous` when given;
/// otherwise both dates are 0 and the caller assigns them. The buffer is only
/// returned once its storage exists.
pub fn allocate(
    policy: AllocationPolicy,
    duration: Mtime,
    previous: Option<&AudioBuffer>,
) -> Result<Allocation> {
    match policy {
        AllocationPolicy::PassThrough => Ok(Allocation::InPlace),
        AllocationPolicy::Allocate { bytes_per_second } => {
            let bytes = bytes_for_duration(duration, bytes_per_second);
            let data = try_alloc(bytes)?;
            let (start_date, end_date) = previous
                .map(|p| (p.start_date, p.end_date))
                .unwrap_or((0, 0));
            Ok(Allocation::Owned(AudioBuffer::new(data, 0, start_date, end_date)))
        }
    }
}

fn try_alloc(bytes: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes)
        .map_err(|_| AoutError::Allocation { bytes })?;
    Ok(data)
}
