//! # Sonance Common Library
//!
//! Shared code for the sonance audio crates:
//! - Error type used by configuration and timing helpers
//! - Microsecond timing, sample-exact date accumulation and clocks
//! - Configuration file resolution and TOML loading

pub mod config;
pub mod error;
pub mod timing;

pub use error::{Error, Result};
pub use timing::{Clock, ManualClock, Mtime, SampleDate, SystemClock, CLOCK_FREQ};
