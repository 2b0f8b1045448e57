//! Log-flood control for recurring diagnostics
//!
//! Starvation, late buffers and per-buffer filter failures can repeat on every
//! mixing cycle. Two helpers keep the logs readable:
//!
//! - [`WarnLatch`]: "log once until the condition clears"
//! - [`LogThrottle`]: "at most one message per interval", counting the repeats
//!   that were suppressed in between
//!
//! Both are lock-free or leaf-locked and safe to use from any pipeline thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default minimum spacing between throttled messages
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Edge-triggered flag for one-shot warnings
#[derive(Debug, Default)]
pub struct WarnLatch {
    raised: AtomicBool,
}

impl WarnLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the condition present; true only on the transition, i.e. when
    /// the caller should log
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::AcqRel)
    }

    /// Mark the condition gone; true if it was present
    pub fn clear(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// Rate limiter for a single recurring message
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Record one occurrence
    ///
    /// Returns `Some(n)` when the caller should log, where `n` is the number of
    /// occurrences suppressed since the previous message; `None` otherwise.
    pub fn check(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}
