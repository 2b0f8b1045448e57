//! Time-ordered queue of audio buffers
//!
//! Used for the per-input queues and for the output queue. The fifo tracks the
//! running end date (the date right after the last pushed sample) and keeps the
//! queued intervals strictly non-overlapping:
//!
//! - a buffer starting before the end date is shifted forward to abut it
//! - a buffer starting after the end date by at most the slack is snapped back
//! - a larger gap is kept but the buffer is flagged as a discontinuity
//!
//! Popped buffers therefore come out in non-decreasing start order with no
//! overlap between consecutive buffers.

use crate::buffer::AudioBuffer;
use sonance_common::timing::Mtime;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Largest forward gap bridged silently (40ms)
pub const DEFAULT_SLACK: Mtime = 40_000;

/// How [`Fifo::push`] reconciled a buffer with the running end date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// First buffer or exactly contiguous
    Contiguous,
    /// Started before the end date; shifted forward by the given amount
    Shifted(Mtime),
    /// Small gap removed; moved back by the given amount
    Snapped(Mtime),
    /// Gap larger than the slack; flagged, dates untouched
    Discontinuity(Mtime),
}

/// Ordered queue of [`AudioBuffer`]s; owns every buffer until popped
#[derive(Debug)]
pub struct Fifo {
    buffers: VecDeque<AudioBuffer>,
    end_date: Option<Mtime>,
    bytes_per_second: u32,
    slack: Mtime,
}

impl Fifo {
    /// Empty queue with no end date
    pub fn new(bytes_per_second: u32) -> Self {
        Self {
            buffers: VecDeque::new(),
            end_date: None,
            bytes_per_second,
            slack: DEFAULT_SLACK,
        }
    }

    pub fn with_slack(mut self, slack: Mtime) -> Self {
        self.slack = slack.max(0);
        self
    }

    /// Append `buffer`, correcting its dates against the running end date
    pub fn push(&mut self, mut buffer: AudioBuffer) -> PushOutcome {
        // A drained fifo keeps its end date: the consumer popped the data but
        // the producer's timeline goes on, so a buffer pushed after a drain is
        // still corrected against it. Only destroy() and set() start a new one.
        let outcome = match self.end_date {
            None => PushOutcome::Contiguous,
            Some(end) => {
                let gap = buffer.start_date - end;
                if gap < 0 {
                    buffer.shift(-gap);
                    trace!("Fifo push overlapped by {}µs, shifted forward", -gap);
                    PushOutcome::Shifted(-gap)
                } else if gap == 0 {
                    PushOutcome::Contiguous
                } else if gap <= self.slack {
                    buffer.shift(-gap);
                    trace!("Fifo push gap of {}µs snapped", gap);
                    PushOutcome::Snapped(gap)
                } else {
                    debug!("Fifo push gap of {}µs, flagged as discontinuity", gap);
                    buffer.discontinuity = true;
                    PushOutcome::Discontinuity(gap)
                }
            }
        };

        self.end_date = Some(buffer.end_date);
        self.buffers.push_back(buffer);
        outcome
    }

    /// Remove and return the head buffer
    pub fn pop(&mut self) -> Option<AudioBuffer> {
        self.buffers.pop_front()
    }

    pub fn peek(&self) -> Option<&AudioBuffer> {
        self.buffers.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioBuffer> {
        self.buffers.iter()
    }

    /// Start date of the head buffer
    pub fn first_date(&self) -> Option<Mtime> {
        self.buffers.front().map(|b| b.start_date)
    }

    /// Date right after the last sample of the head buffer
    pub fn next_start(&self) -> Option<Mtime> {
        self.buffers.front().map(|b| b.end_date)
    }

    /// Date right after the last pushed sample
    pub fn end_date(&self) -> Option<Mtime> {
        self.end_date
    }

    /// Shift every queued buffer and the end date by `delta`
    pub fn move_dates(&mut self, delta: Mtime) {
        for buffer in self.buffers.iter_mut() {
            buffer.shift(delta);
        }
        if let Some(end) = self.end_date.as_mut() {
            *end += delta;
        }
    }

    /// Drop every queued buffer and restart the timeline at `date`
    pub fn set(&mut self, date: Mtime) {
        self.buffers.clear();
        self.end_date = Some(date);
    }

    /// Drop every queued buffer and forget the end date
    pub fn destroy(&mut self) {
        let dropped = self.buffers.len();
        self.buffers.clear();
        self.end_date = None;
        if dropped > 0 {
            trace!("Fifo destroyed with {} buffers queued", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.byte_count()).sum()
    }

    /// Total playback time held, from the byte count
    pub fn queued_duration(&self) -> Mtime {
        if self.bytes_per_second == 0 {
            return 0;
        }
        (self.queued_bytes() as i128 * 1_000_000 / self.bytes_per_second as i128) as Mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(start: Mtime, end: Mtime) -> AudioBuffer {
        AudioBuffer::new(vec![0u8; 4], 1, start, end)
    }

    #[test]
    fn test_empty_fifo() {
        let mut fifo = Fifo::new(176_400);
        assert!(fifo.pop().is_none());
        assert!(fifo.first_date().is_none());
        assert!(fifo.next_start().is_none());
        assert!(fifo.end_date().is_none());
    }

    #[test]
    fn test_push_pop_identity() {
        let mut fifo = Fifo::new(176_400);
        let original = AudioBuffer::new(vec![1, 2, 3, 4, 5, 6, 7, 8], 2, 100, 145);
        fifo.push(original.clone());
        let popped = fifo.pop().unwrap();
        assert_eq!(popped.data(), original.data());
        assert_eq!(popped.nb_samples, 2);
        assert_eq!(popped.start_date, 100);
    }

    #[test]
    fn test_overlap_shifted_forward() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        let outcome = fifo.push(buffer(600, 1_600));
        assert_eq!(outcome, PushOutcome::Shifted(400));

        fifo.pop();
        let shifted = fifo.pop().unwrap();
        assert_eq!((shifted.start_date, shifted.end_date), (1_000, 2_000));
        assert_eq!(fifo.end_date(), Some(2_000));
    }

    #[test]
    fn test_drained_fifo_still_corrects() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        fifo.pop();
        assert!(fifo.is_empty());
        assert_eq!(fifo.push(buffer(600, 1_600)), PushOutcome::Shifted(400));
        assert_eq!(fifo.first_date(), Some(1_000));
    }

    #[test]
    fn test_small_gap_snapped() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        assert_eq!(fifo.push(buffer(1_500, 2_500)), PushOutcome::Snapped(500));
        assert_eq!(fifo.end_date(), Some(2_000));
    }

    #[test]
    fn test_large_gap_flags_discontinuity() {
        let mut fifo = Fifo::new(176_400).with_slack(1_000);
        fifo.push(buffer(0, 1_000));
        assert_eq!(fifo.push(buffer(5_000, 6_000)), PushOutcome::Discontinuity(4_000));
        fifo.pop();
        let flagged = fifo.pop().unwrap();
        assert!(flagged.discontinuity);
        assert_eq!(flagged.start_date, 5_000);
    }

    #[test]
    fn test_dates_queries() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        fifo.push(buffer(1_000, 2_000));
        assert_eq!(fifo.first_date(), Some(0));
        assert_eq!(fifo.next_start(), Some(1_000));
        assert_eq!(fifo.end_date(), Some(2_000));
    }

    #[test]
    fn test_move_dates() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        fifo.push(buffer(1_000, 2_000));
        fifo.move_dates(500);
        assert_eq!(fifo.first_date(), Some(500));
        assert_eq!(fifo.end_date(), Some(2_500));
        fifo.move_dates(-1_000);
        let dates: Vec<_> = fifo.iter().map(|b| (b.start_date, b.end_date)).collect();
        assert_eq!(dates, vec![(-500, 500), (500, 1_500)]);
    }

    #[test]
    fn test_set_and_destroy() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(buffer(0, 1_000));
        fifo.set(10_000);
        assert!(fifo.is_empty());
        assert_eq!(fifo.end_date(), Some(10_000));
        assert_eq!(fifo.push(buffer(10_000, 11_000)), PushOutcome::Contiguous);

        fifo.destroy();
        assert!(fifo.is_empty());
        assert!(fifo.end_date().is_none());
    }

    #[test]
    fn test_queued_duration() {
        let mut fifo = Fifo::new(176_400);
        fifo.push(AudioBuffer::new(vec![0u8; 176_400], 44_100, 0, 1_000_000));
        fifo.push(AudioBuffer::new(vec![0u8; 88_200], 22_050, 1_000_000, 1_500_000));
        assert_eq!(fifo.queued_bytes(), 264_600);
        assert_eq!(fifo.queued_duration(), 1_500_000);
    }
}
