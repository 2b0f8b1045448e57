//! Microsecond timing for the audio pipeline
//!
//! All presentation dates in sonance are [`Mtime`] values: signed 64-bit
//! microsecond counts on the instance master clock.
//!
//! # Time Representations
//!
//! 1. **Mtime (dates and durations)**: i64 microseconds, `CLOCK_FREQ` per second
//! 2. **Frames (playback)**: usize frame counts at a stream's sample rate
//!
//! A frame duration is rarely a whole number of microseconds (one frame at
//! 44.1kHz lasts 22.675µs), so converting a running frame count to a date with
//! plain division accumulates error. [`SampleDate`] keeps the division remainder
//! between increments so that a stream's dates never drift from its frame count.
//!
//! # Examples
//!
//! ```rust
//! use sonance_common::timing::*;
//!
//! assert_eq!(frames_to_mtime(44_100, 44_100), 1_000_000);
//! assert_eq!(mtime_to_frames(500_000, 48_000), 24_000);
//!
//! let mut date = SampleDate::new(44_100);
//! date.set(0);
//! for _ in 0..100 {
//!     date.increment(441);
//! }
//! assert_eq!(date.get(), 1_000_000);
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

// ============================================================================
// Constants
// ============================================================================

/// Date and duration unit: signed microseconds
pub type Mtime = i64;

/// Mtime ticks per second
pub const CLOCK_FREQ: Mtime = 1_000_000;

// ============================================================================
// Core Conversion Functions
// ============================================================================

/// Convert a frame count to a duration, truncating
///
/// # Panics
///
/// Panics if `rate` is 0
///
/// # Examples
///
/// ```rust
/// use sonance_common::timing::frames_to_mtime;
///
/// assert_eq!(frames_to_mtime(0, 44_100), 0);
/// assert_eq!(frames_to_mtime(48_000, 48_000), 1_000_000);
/// assert_eq!(frames_to_mtime(1, 44_100), 22); // 22.675µs truncated
/// ```
pub fn frames_to_mtime(frames: usize, rate: u32) -> Mtime {
    assert!(rate > 0, "rate must be > 0");
    ((frames as i128 * CLOCK_FREQ as i128) / rate as i128) as Mtime
}

/// Convert a duration to a frame count, rounding to the nearest frame
///
/// Negative durations yield 0.
///
/// # Panics
///
/// Panics if `rate` is 0
///
/// # Examples
///
/// ```rust
/// use sonance_common::timing::mtime_to_frames;
///
/// assert_eq!(mtime_to_frames(1_000_000, 44_100), 44_100);
/// assert_eq!(mtime_to_frames(22, 44_100), 1);
/// assert_eq!(mtime_to_frames(-5, 44_100), 0);
/// ```
pub fn mtime_to_frames(duration: Mtime, rate: u32) -> usize {
    assert!(rate > 0, "rate must be > 0");
    if duration <= 0 {
        return 0;
    }
    let scaled = duration as i128 * rate as i128;
    ((scaled + CLOCK_FREQ as i128 / 2) / CLOCK_FREQ as i128) as usize
}

/// Convert a duration to seconds (f64), for display and logging
pub fn mtime_to_seconds(duration: Mtime) -> f64 {
    duration as f64 / CLOCK_FREQ as f64
}

/// Convert milliseconds to a duration
pub fn ms_to_mtime(milliseconds: i64) -> Mtime {
    milliseconds * 1_000
}

// ============================================================================
// Sample-exact date accumulator
// ============================================================================

/// Date accumulator advancing by whole frames without rounding drift
///
/// Keeps the integer date plus the remainder of the last division by the
/// sample rate, so `n` increments of `k` frames land on exactly the same date
/// as one increment of `n * k` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDate {
    date: Mtime,
    rate: u32,
    remainder: u64,
}

impl SampleDate {
    /// Create an accumulator for `rate` Hz, starting at date 0
    ///
    /// # Panics
    ///
    /// Panics if `rate` is 0
    pub fn new(rate: u32) -> Self {
        assert!(rate > 0, "rate must be > 0");
        Self {
            date: 0,
            rate,
            remainder: 0,
        }
    }

    /// Restart from `date`, discarding the accumulated remainder
    pub fn set(&mut self, date: Mtime) {
        self.date = date;
        self.remainder = 0;
    }

    /// Current date
    pub fn get(&self) -> Mtime {
        self.date
    }

    /// Sample rate this accumulator counts in
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Shift the date without touching the remainder
    pub fn shift(&mut self, delta: Mtime) {
        self.date += delta;
    }

    /// Advance by `frames` and return the new date
    pub fn increment(&mut self, frames: usize) -> Mtime {
        let total = frames as u64 * CLOCK_FREQ as u64 + self.remainder;
        self.date += (total / self.rate as u64) as Mtime;
        self.remainder = total % self.rate as u64;
        self.date
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Master clock the pipeline schedules against
pub trait Clock: Send + Sync {
    /// Current date in microseconds
    fn now(&self) -> Mtime;
}

/// Monotonic clock derived from system time
///
/// Uses `Instant` (monotonic) rather than `SystemTime`, which can go backwards.
/// Dates count from the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Mtime {
        self.origin.elapsed().as_micros() as Mtime
    }
}

/// Hand-driven clock for deterministic tests and offline rendering
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Mtime) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, date: Mtime) {
        self.now.store(date, Ordering::Release);
    }

    pub fn advance(&self, delta: Mtime) -> Mtime {
        self.now.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Mtime {
        self.now.load(Ordering::Acquire)
    }
}
