//! # Sonance Audio Output Core (sonance-aout)
//!
//! Takes dated PCM buffers from any number of concurrent inputs, converts each
//! to the mixer format, keeps them in sync with the master clock, mixes them
//! and hands the result to an output backend.
//!
//! **Architecture:** input pipelines (filters, resamplers, drift correction,
//! fifo) → mixer → output pipeline (filters, fifo) → backend. Every lock in
//! the pipeline carries a level from [`locks::LockLevel`] and is taken in
//! increasing order only.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fifo;
pub mod filter;
pub mod format;
pub mod input;
pub mod instance;
pub mod locks;
pub mod mixer;
pub mod output;
pub mod sample;
pub mod throttle;

pub use buffer::AudioBuffer;
pub use config::AoutConfig;
pub use error::{AoutError, Result};
pub use fifo::Fifo;
pub use filter::FilterChain;
pub use format::{AudioSampleFormat, ChannelMask, SampleEncoding};
pub use input::{InputId, InputPipeline, PlayStatus};
pub use instance::{AudioInstance, MixStatus, MixerThread};
pub use mixer::{MixPolicy, Mixer};
pub use output::{BufferSource, OutputPipeline};
