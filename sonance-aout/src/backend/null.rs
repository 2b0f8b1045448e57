//! Backend discarding everything it is given

use super::{AudioBackend, BackendSetup, VolumeInfo};
use crate::error::{AoutError, Result};
use crate::format::{AudioSampleFormat, SampleEncoding};
use crate::output::BufferSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Sink that drains the output fifo on every `play`
#[derive(Debug, Default)]
pub struct NullBackend {
    format: Option<AudioSampleFormat>,
    no_float: bool,
    volume: Option<f32>,
    muted: Option<bool>,
    source: Option<BufferSource>,
    frames: Arc<AtomicU64>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agree to `format` whatever is requested
    pub fn with_format(mut self, format: AudioSampleFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Refuse fl32; agree to s16l instead
    pub fn without_float(mut self) -> Self {
        self.no_float = true;
        self
    }

    /// Expose a hardware volume in [0, 2]
    pub fn with_volume(mut self) -> Self {
        self.volume = Some(1.0);
        self
    }

    /// Expose a hardware mute switch
    pub fn with_mute(mut self) -> Self {
        self.muted = Some(false);
        self
    }

    /// Frames discarded so far, shared with the backend
    pub fn frames_played(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames)
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&mut self, requested: &AudioSampleFormat, source: BufferSource) -> Result<BackendSetup> {
        let mut format = self.format.unwrap_or(*requested);
        if self.no_float && format.encoding().is_float() {
            format = format.with_encoding(SampleEncoding::S16L);
        }
        self.source = Some(source);
        debug!("Null output opened for {}", format);
        Ok(BackendSetup {
            format,
            samples_per_buffer: None,
        })
    }

    fn play(&mut self) {
        let Some(source) = self.source.as_ref() else {
            return;
        };
        while let Some(buffer) = source.next_buffer(0, true) {
            self.frames.fetch_add(buffer.nb_samples as u64, Ordering::Relaxed);
        }
    }

    fn volume_infos(&self) -> Option<VolumeInfo> {
        self.volume.map(|_| VolumeInfo {
            min: 0.0,
            max: 2.0,
            step: 0.01,
        })
    }

    fn volume_get(&self) -> Result<f32> {
        self.volume.ok_or(AoutError::VolumeUnsupported(self.name()))
    }

    fn volume_set(&mut self, volume: f32) -> Result<()> {
        match self.volume.as_mut() {
            Some(current) => {
                *current = volume.clamp(0.0, 2.0);
                Ok(())
            }
            None => Err(AoutError::VolumeUnsupported(self.name())),
        }
    }

    fn mute_get(&self) -> Result<bool> {
        self.muted.ok_or(AoutError::MuteUnsupported(self.name()))
    }

    fn mute_set(&mut self, mute: bool) -> Result<()> {
        match self.muted.as_mut() {
            Some(current) => {
                *current = mute;
                Ok(())
            }
            None => Err(AoutError::MuteUnsupported(self.name())),
        }
    }

    fn close(&mut self) {
        self.source = None;
    }
}
