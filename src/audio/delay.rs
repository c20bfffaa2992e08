//! Running delay estimation from decoded timecode frames
//!
//! Converts each decoded frame's timecode into the sample position it was
//! emitted at, folds the observed capture position into the same 24-hour
//! cycle, and keeps a running average of the accepted offsets. The average
//! resets after 3 seconds without an accepted measurement.

use crate::audio::ltc::{DecodedFrame, Timecode};

/// Seconds in one 24-hour timecode cycle.
const SECONDS_PER_DAY: u64 = 86_400;

/// Samples of silence after which the running average is discarded.
const SILENCE_SECONDS: u64 = 3;

/// Outcome of a reporting-interval poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayReport {
    /// Average accepted delay, in whole samples.
    Delay(i64),
    /// No delta accepted within the silence window.
    NoSignal,
}

/// Running-average delay estimator.
///
/// Accepts only deltas in `0 < delta < sample_rate`: negative values are
/// artifacts (output ahead of input) and values of a second or more come from
/// reversed playback or codec misdetection, so both are treated as noise
/// rather than delay.
pub struct DelayEstimator {
    sample_rate: u32,
    fps: u32,
    /// Samples per 24-hour timecode cycle.
    wraparound: u64,
    sum: i64,
    count: u32,
    /// Monotonic position of the last accepted delta.
    last_signal: u64,
    /// Monotonic position of the last emitted report.
    last_notify: u64,
    /// Minimum sample time between reports (half a second).
    notify_interval: u64,
}

impl DelayEstimator {
    pub fn new(sample_rate: u32, fps: u32) -> Self {
        Self {
            sample_rate,
            fps,
            wraparound: SECONDS_PER_DAY * u64::from(sample_rate) / u64::from(fps),
            sum: 0,
            count: 0,
            last_signal: 0,
            last_notify: 0,
            notify_interval: u64::from(sample_rate) / 2,
        }
    }

    /// Sample position at which a frame carrying `tc` was emitted, counted
    /// from 00:00:00:00 of the current cycle.
    pub fn expected_position(&self, tc: &Timecode) -> u64 {
        let frames = u64::from(tc.frame)
            + u64::from(self.fps)
                * (u64::from(tc.hours) * 3600
                    + u64::from(tc.minutes) * 60
                    + u64::from(tc.seconds));
        (frames as f64 * self.sample_rate as f64 / self.fps as f64) as u64
    }

    /// Fold a capture-stream offset into the current 24-hour cycle.
    pub fn fold(&self, offset: u64) -> u64 {
        offset % self.wraparound
    }

    /// Offer one decoded frame observed with the monotonic position `now`.
    ///
    /// Returns the computed delta; `accepted` tells whether it entered the
    /// running average.
    pub fn offer(&mut self, frame: &DecodedFrame, now: u64) -> Offered {
        let expected = self.expected_position(&frame.tc);
        let delta = self.fold(frame.off_start) as i64 - expected as i64;

        let accepted = delta > 0 && delta < i64::from(self.sample_rate);
        if accepted {
            self.sum += delta;
            self.count += 1;
            self.last_signal = now;
        }
        Offered { delta, accepted }
    }

    /// Rate-limited report: at most one per half second of sample time.
    ///
    /// Inside the gate the silence timeout is applied first, so a stale
    /// average is discarded rather than reported.
    pub fn poll(&mut self, now: u64) -> Option<DelayReport> {
        if now <= self.last_notify + self.notify_interval {
            return None;
        }
        self.last_notify = now;

        if now - self.last_signal > SILENCE_SECONDS * u64::from(self.sample_rate) {
            self.sum = 0;
            self.count = 0;
        }

        if self.count > 0 {
            Some(DelayReport::Delay(
                (self.sum as f64 / self.count as f64).round() as i64,
            ))
        } else {
            Some(DelayReport::NoSignal)
        }
    }

    /// Number of deltas in the current average.
    pub fn accepted_count(&self) -> u32 {
        self.count
    }

    /// Samples in one 24-hour timecode cycle.
    pub fn wraparound(&self) -> u64 {
        self.wraparound
    }
}

/// Result of offering a frame to the estimator.
#[derive(Debug, Clone, Copy)]
pub struct Offered {
    pub delta: i64,
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(tc: Timecode, off_start: u64) -> DecodedFrame {
        DecodedFrame {
            tc,
            fps: 25,
            off_start,
            off_end: off_start + 1920,
            reverse: false,
            drop_frame: false,
            volume_dbfs: -6.0,
        }
    }

    fn tc(h: u8, m: u8, s: u8, f: u8) -> Timecode {
        Timecode {
            hours: h,
            minutes: m,
            seconds: s,
            frame: f,
        }
    }

    #[test]
    fn test_expected_position() {
        let est = DelayEstimator::new(48000, 25);
        assert_eq!(est.expected_position(&tc(0, 0, 1, 0)), 48000);
        assert_eq!(est.expected_position(&tc(0, 0, 0, 1)), 1920);
        assert_eq!(est.expected_position(&tc(1, 0, 0, 0)), 3600 * 48000);
    }

    #[test]
    fn test_acceptance_window_bounds() {
        let mut est = DelayEstimator::new(48000, 25);
        let base = est.expected_position(&tc(0, 0, 1, 0));

        // delta == 0 rejected
        assert!(!est.offer(&frame_at(tc(0, 0, 1, 0), base), 0).accepted);
        // delta == 1 accepted
        assert!(est.offer(&frame_at(tc(0, 0, 1, 0), base + 1), 0).accepted);
        // delta == sample_rate - 1 accepted
        assert!(est.offer(&frame_at(tc(0, 0, 1, 0), base + 47999), 0).accepted);
        // delta == sample_rate rejected
        assert!(!est.offer(&frame_at(tc(0, 0, 1, 0), base + 48000), 0).accepted);
        // negative rejected
        assert!(!est.offer(&frame_at(tc(0, 0, 1, 0), base - 100), 0).accepted);

        assert_eq!(est.accepted_count(), 2);
    }

    #[test]
    fn test_rejected_deltas_do_not_move_average() {
        let mut est = DelayEstimator::new(48000, 25);
        let base = est.expected_position(&tc(0, 0, 1, 0));

        est.offer(&frame_at(tc(0, 0, 1, 0), base + 100), 0);
        est.offer(&frame_at(tc(0, 0, 1, 0), base - 500), 0);
        est.offer(&frame_at(tc(0, 0, 1, 0), base + 90_000), 0);

        let report = est.poll(30_000).unwrap();
        assert_eq!(report, DelayReport::Delay(100));
    }

    #[test]
    fn test_exact_average() {
        let mut est = DelayEstimator::new(48000, 25);
        let base = est.expected_position(&tc(0, 0, 1, 0));

        for d in [90u64, 100, 110] {
            est.offer(&frame_at(tc(0, 0, 1, 0), base + d), 0);
        }
        assert_eq!(est.poll(30_000).unwrap(), DelayReport::Delay(100));
    }

    #[test]
    fn test_fold_is_periodic() {
        let est = DelayEstimator::new(48000, 25);
        let w = est.wraparound();
        assert_eq!(w, 86_400 * 48000 / 25);
        for s in [0u64, 1, 48_100, w - 1, w, 3 * w + 12_345] {
            assert_eq!(est.fold(s), est.fold(s + w));
        }
    }

    #[test]
    fn test_report_rate_limit() {
        let mut est = DelayEstimator::new(48000, 25);
        assert!(est.poll(10_000).is_none(), "below half a second");
        assert!(est.poll(24_001).is_some());
        assert!(est.poll(30_000).is_none(), "gated after a report");
        assert!(est.poll(48_002).is_some());
    }

    #[test]
    fn test_silence_resets_average() {
        let mut est = DelayEstimator::new(48000, 25);
        let base = est.expected_position(&tc(0, 0, 1, 0));
        est.offer(&frame_at(tc(0, 0, 1, 0), base + 100), 48_000);

        // Within the silence window the average survives
        assert_eq!(est.poll(96_000).unwrap(), DelayReport::Delay(100));

        // More than 3s after the last accepted delta: reset, then NoSignal
        let later = 48_000 + 144_001;
        assert_eq!(est.poll(later).unwrap(), DelayReport::NoSignal);
        assert_eq!(est.accepted_count(), 0);

        // Still empty on the next report
        assert_eq!(est.poll(later + 24_001).unwrap(), DelayReport::NoSignal);
    }
}
