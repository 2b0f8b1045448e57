//! Error types for sonance-aout
//!
//! Defines module-specific error types using thiserror for clear error propagation.
//! Configuration failures of a pipeline component are reported once through these
//! errors and then recorded as that component's `in_error` flag; they never cross
//! thread boundaries.

use crate::input::InputId;
use thiserror::Error;

/// Main error type for the audio output core
#[derive(Error, Debug)]
pub enum AoutError {
    /// Invalid or inconsistent sample format
    #[error("Invalid audio format: {0}")]
    Format(String),

    /// No sequence of filter stages converts between the two formats
    #[error("No filter chain from {from} to {to}")]
    NoFilterChain { from: String, to: String },

    /// Buffer storage could not be allocated
    #[error("Failed to allocate {bytes} bytes of audio buffer")]
    Allocation { bytes: usize },

    /// A stage tried to write more data than its output buffer holds
    #[error("Buffer overflow: {needed} bytes needed, {capacity} available")]
    BufferOverflow { needed: usize, capacity: usize },

    /// A single filter stage failed on one buffer
    #[error("Filter stage '{stage}' failed: {reason}")]
    Filter { stage: &'static str, reason: String },

    /// Software gain only exists for floating-point mixers
    #[error("Volume multiplier unsupported for {0} mixer")]
    MultiplierUnsupported(String),

    /// Input handle is stale or was never registered
    #[error("Input not found: {0}")]
    InputNotFound(InputId),

    /// Output backend errors
    #[error("Audio output error: {0}")]
    Backend(String),

    /// Backend has no hardware volume control
    #[error("Volume control unsupported by backend '{0}'")]
    VolumeUnsupported(&'static str),

    /// Backend cannot mute, and no fl32 mixer to mute in software
    #[error("Mute unsupported by backend '{0}'")]
    MuteUnsupported(&'static str),

    /// Audio decoding errors (decoder collaborators)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] sonance_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using AoutError
pub type Result<T> = std::result::Result<T, AoutError>;
