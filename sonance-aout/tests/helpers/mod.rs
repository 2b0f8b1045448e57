//! Shared fixtures for the integration tests

#![allow(dead_code)]

use sonance_aout::backend::{AudioBackend, BackendSetup};
use sonance_aout::config::{AoutConfig, BackendKind};
use sonance_aout::error::Result;
use sonance_aout::output::BufferSource;
use sonance_aout::sample;
use sonance_aout::{AudioBuffer, AudioSampleFormat, ChannelMask, SampleEncoding};
use sonance_common::timing::Mtime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Backend that never pulls: queued buffers stay in the output fifo
#[derive(Debug, Default)]
pub struct CollectingBackend {
    pub notifications: Arc<AtomicUsize>,
    pub source: Arc<Mutex<Option<BufferSource>>>,
}

impl AudioBackend for CollectingBackend {
    fn name(&self) -> &'static str {
        "collecting"
    }

    fn open(&mut self, requested: &AudioSampleFormat, source: BufferSource) -> Result<BackendSetup> {
        *self.source.lock().unwrap() = Some(source);
        Ok(BackendSetup {
            format: *requested,
            samples_per_buffer: None,
        })
    }

    fn play(&mut self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&mut self) {}
}

pub fn s16_stereo(rate: u32) -> AudioSampleFormat {
    AudioSampleFormat::new(SampleEncoding::S16L, ChannelMask::STEREO, rate)
}

pub fn fl32_stereo(rate: u32) -> AudioSampleFormat {
    AudioSampleFormat::new(SampleEncoding::Fl32, ChannelMask::STEREO, rate)
}

/// Buffer of `frames` frames where every sample is the s16 `value`
pub fn constant_s16(format: &AudioSampleFormat, frames: usize, value: i16, start: Mtime) -> AudioBuffer {
    let mut data = Vec::with_capacity(frames * format.bytes_per_frame());
    for _ in 0..frames * format.nb_channels() {
        data.extend_from_slice(&value.to_le_bytes());
    }
    AudioBuffer::from_bytes(format, data, start)
}

/// Buffer of `frames` frames where every sample is the fl32 `value`
pub fn constant_f32(format: &AudioSampleFormat, frames: usize, value: f32, start: Mtime) -> AudioBuffer {
    let samples = vec![value; frames * format.nb_channels()];
    AudioBuffer::from_bytes(format, sample::f32_to_bytes(&samples), start)
}

pub fn s16_samples(buffer: &AudioBuffer) -> Vec<i16> {
    buffer
        .data()
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn f32_samples(buffer: &AudioBuffer) -> Vec<f32> {
    let mut out = Vec::new();
    sample::decode_into(SampleEncoding::Fl32, buffer.data(), &mut out);
    out
}

/// s16l stereo configuration with an integer mixer
pub fn s16_config(rate: u32, samples_per_buffer: usize) -> AoutConfig {
    let mut config = AoutConfig::default();
    config.output.backend = BackendKind::Null;
    config.output.rate = rate;
    config.output.samples_per_buffer = samples_per_buffer;
    config.mixer.float = false;
    config
}
