//! Output backends
//!
//! A backend stands for the OS audio API. The pipeline only needs it to agree
//! on a format at open time and to accept "buffers are queued" notifications.
//! Hardware volume, mute and flushing are optional. Buffers are pulled through
//! the [`BufferSource`] handed over at open time.

mod null;
mod wav;

pub use null::NullBackend;
pub use wav::WavBackend;

use crate::config::{BackendKind, OutputConfig};
use crate::error::{AoutError, Result};
use crate::format::AudioSampleFormat;
use crate::output::BufferSource;
use sonance_common::timing::Clock;
use std::sync::Arc;

/// What the backend agreed to at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSetup {
    pub format: AudioSampleFormat,
    /// Preferred frames per mixed buffer, if the device has one
    pub samples_per_buffer: Option<usize>,
}

/// Hardware volume range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeInfo {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

/// Boundary to an audio device
pub trait AudioBackend: Send {
    fn name(&self) -> &'static str;

    /// Open the device for `requested`; the agreed format may differ
    fn open(&mut self, requested: &AudioSampleFormat, source: BufferSource) -> Result<BackendSetup>;

    /// New buffers are queued in the output fifo
    fn play(&mut self);

    fn volume_infos(&self) -> Option<VolumeInfo> {
        None
    }

    fn volume_get(&self) -> Result<f32> {
        Err(AoutError::VolumeUnsupported(self.name()))
    }

    fn volume_set(&mut self, _volume: f32) -> Result<()> {
        Err(AoutError::VolumeUnsupported(self.name()))
    }

    fn mute_get(&self) -> Result<bool> {
        Err(AoutError::MuteUnsupported(self.name()))
    }

    fn mute_set(&mut self, _mute: bool) -> Result<()> {
        Err(AoutError::MuteUnsupported(self.name()))
    }

    /// Drop whatever the device still holds, without playing it
    fn flush(&mut self) {}

    /// Stop pulling and release the device
    fn close(&mut self);
}

/// Backend selected by the output configuration
pub fn create_backend(config: &OutputConfig, clock: Arc<dyn Clock>) -> Box<dyn AudioBackend> {
    match config.backend {
        BackendKind::Null => Box::new(NullBackend::new()),
        BackendKind::Wav => Box::new(WavBackend::new(
            config.wav_path.clone(),
            config.samples_per_buffer,
            clock,
        )),
    }
}
