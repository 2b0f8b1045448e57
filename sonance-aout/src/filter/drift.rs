//! Drift-correction state machine for input resampling
//!
//! Drift is the difference between the date an input buffer claims and the
//! date its input fifo expects next. Positive drift means a gap (the input
//! clock runs slow against the output clock), negative drift an overlap.
//!
//! ```text
//!            |drift| > tolerance
//!   NEUTRAL ---------------------> UP (drift > 0) / DOWN (drift < 0)
//!      ^                                  |
//!      |      offset eased back to 0      |
//!      +----------------------------------+
//! ```
//!
//! While UP or DOWN the rate offset ramps by a fixed step per buffer up to a
//! cap, and eases back by the same step once the drift has been halved or is
//! back inside the tolerance. The state only returns to NEUTRAL once the
//! offset reaches zero, so a drift reversal always passes through NEUTRAL.

use sonance_common::timing::{mtime_to_seconds, Mtime};
use tracing::debug;

/// Resampling regime of one input
///
/// Named after what happens to the stream: `Up` stretches it to close a gap,
/// which lowers the conversion's effective input rate; `Down` shrinks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    Neutral,
    /// Stretching: more output frames than input frames
    Up,
    /// Shrinking: fewer output frames than input frames
    Down,
}

/// Tuning of the drift corrector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftParams {
    /// Drift tolerated without correction
    pub tolerance: Mtime,
    /// Rate offset change per buffer, in Hz
    pub step: i32,
    /// Largest rate offset, in Hz
    pub max_offset: i32,
}

impl DriftParams {
    /// Parameters for `rate`, capping the offset at `max_percent` of the rate
    pub fn for_rate(rate: u32, tolerance: Mtime, step: i32, max_percent: u32) -> Self {
        let max_offset = ((rate as u64 * max_percent as u64) / 100).max(1) as i32;
        Self {
            tolerance,
            step: step.clamp(1, max_offset),
            max_offset,
        }
    }
}

/// Drift tracker for one input
#[derive(Debug, Clone)]
pub struct DriftTracker {
    params: DriftParams,
    state: Resampling,
    offset: i32,
    easing: bool,
    /// Date, drift and cumulative sample count when the regime began
    start_date: Mtime,
    start_drift: Mtime,
    start_samples: u64,
    samples: u64,
}

impl DriftTracker {
    pub fn new(params: DriftParams) -> Self {
        Self {
            params,
            state: Resampling::Neutral,
            offset: 0,
            easing: false,
            start_date: 0,
            start_drift: 0,
            start_samples: 0,
            samples: 0,
        }
    }

    /// Feed the drift measured for a buffer of `frames` frames at `date`
    ///
    /// Returns the rate offset (Hz) to apply to that buffer.
    pub fn update(&mut self, drift: Mtime, date: Mtime, frames: usize) -> i32 {
        match self.state {
            Resampling::Neutral => {
                if drift.abs() > self.params.tolerance {
                    self.state = if drift > 0 { Resampling::Up } else { Resampling::Down };
                    self.easing = false;
                    self.start_date = date;
                    self.start_drift = drift;
                    self.start_samples = self.samples;
                    self.offset = self.direction() * self.params.step;
                    debug!(
                        "Drift of {}µs, starting {:?} resampling",
                        drift, self.state
                    );
                }
            }
            Resampling::Up | Resampling::Down => {
                let remaining = drift * self.direction() as Mtime;
                if !self.easing
                    && (remaining <= self.start_drift.abs() / 2
                        || drift.abs() <= self.params.tolerance)
                {
                    self.easing = true;
                }

                if self.easing {
                    let magnitude = (self.offset.abs() - self.params.step).max(0);
                    self.offset = self.direction() * magnitude;
                    if magnitude == 0 {
                        debug!(
                            "{:?} resampling stopped after {} samples ({:.3}s)",
                            self.state,
                            self.samples - self.start_samples,
                            mtime_to_seconds(date - self.start_date)
                        );
                        self.state = Resampling::Neutral;
                        self.easing = false;
                    }
                } else {
                    let magnitude = (self.offset.abs() + self.params.step).min(self.params.max_offset);
                    self.offset = self.direction() * magnitude;
                }
            }
        }

        self.samples += frames as u64;
        self.offset
    }

    fn direction(&self) -> i32 {
        match self.state {
            Resampling::Up => 1,
            Resampling::Down => -1,
            Resampling::Neutral => 0,
        }
    }

    /// Back to NEUTRAL with no offset (fifo flush, discontinuity)
    pub fn reset(&mut self) {
        self.state = Resampling::Neutral;
        self.offset = 0;
        self.easing = false;
    }

    pub fn state(&self) -> Resampling {
        self.state
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Correction in progress (the linear resampler must run)
    pub fn is_active(&self) -> bool {
        self.state != Resampling::Neutral || self.offset != 0
    }

    pub fn start_date(&self) -> Mtime {
        self.start_date
    }

    pub fn start_samples(&self) -> u64 {
        self.start_samples
    }

    pub fn params(&self) -> &DriftParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> DriftTracker {
        DriftTracker::new(DriftParams {
            tolerance: 40_000,
            step: 2,
            max_offset: 10,
        })
    }

    /// Feed a drift series, recording every state change
    fn run(tracker: &mut DriftTracker, drifts: &[Mtime], transitions: &mut Vec<Resampling>) {
        for (i, drift) in drifts.iter().enumerate() {
            let before = tracker.state();
            tracker.update(*drift, i as Mtime * 10_000, 441);
            if tracker.state() != before {
                transitions.push(tracker.state());
            }
        }
    }

    #[test]
    fn test_starts_neutral() {
        let tracker = tracker();
        assert_eq!(tracker.state(), Resampling::Neutral);
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_within_tolerance_stays_neutral() {
        let mut tracker = tracker();
        let mut transitions = Vec::new();
        run(&mut tracker, &[0, 10_000, -39_000, 40_000], &mut transitions);
        assert!(transitions.is_empty());
        assert_eq!(tracker.offset(), 0);
    }

    #[test]
    fn test_growing_positive_drift_goes_up_once_then_neutral() {
        let mut tracker = tracker();
        let mut transitions = Vec::new();
        run(
            &mut tracker,
            &[10_000, 30_000, 50_000, 70_000, 90_000, 110_000],
            &mut transitions,
        );
        assert_eq!(transitions, vec![Resampling::Up]);
        assert_eq!(tracker.offset(), 8);

        // corrective series
        run(&mut tracker, &[60_000, 30_000, 10_000, 0, 0, 0, 0], &mut transitions);
        assert_eq!(transitions, vec![Resampling::Up, Resampling::Neutral]);
        assert_eq!(tracker.offset(), 0);
    }

    #[test]
    fn test_negative_drift_goes_down() {
        let mut tracker = tracker();
        let offset = tracker.update(-50_000, 0, 441);
        assert_eq!(tracker.state(), Resampling::Down);
        assert_eq!(offset, -2);
        assert_eq!(tracker.update(-60_000, 10_000, 441), -4);
    }

    #[test]
    fn test_reversal_passes_through_neutral() {
        let mut tracker = tracker();
        let mut transitions = Vec::new();
        run(&mut tracker, &[50_000, 60_000, 70_000], &mut transitions);
        // sudden reversal: ease back first
        run(&mut tracker, &[-80_000; 8], &mut transitions);
        assert_eq!(
            transitions,
            vec![Resampling::Up, Resampling::Neutral, Resampling::Down]
        );
    }

    #[test]
    fn test_params_for_rate() {
        let params = DriftParams::for_rate(44_100, 40_000, 2, 1);
        assert_eq!(params.max_offset, 441);
        assert_eq!(params.step, 2);
    }
}
