//! Playback ring buffer between the encode worker and the output callback
//!
//! A thin SPSC wrapper over [`ringbuf::HeapRb`] that pins down the two
//! policies the realtime path depends on:
//! - overflow: a write that does not fully fit writes the prefix that fits
//!   and reports the shortfall; it never blocks and never overwrites unread
//!   samples
//! - underflow: a read for a full period either succeeds completely or
//!   zero-fills the whole period; it never blocks and never returns a
//!   partial period

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Fixed-capacity SPSC sample queue holding pre-rendered timecode audio.
pub struct PlaybackRing;

impl PlaybackRing {
    /// Allocate a ring holding `capacity` samples and split it into its
    /// producer (worker) and consumer (output callback) halves.
    pub fn with_capacity(capacity: usize) -> (PlaybackProducer, PlaybackConsumer) {
        let (prod, cons) = HeapRb::<f32>::new(capacity).split();
        (
            PlaybackProducer { inner: prod },
            PlaybackConsumer { inner: cons },
        )
    }
}

/// Worker-side half: pushes encoded samples ahead of playback.
pub struct PlaybackProducer {
    inner: HeapProd<f32>,
}

impl PlaybackProducer {
    /// Append samples, returning how many were actually written.
    ///
    /// A return value smaller than `samples.len()` means the ring was full
    /// and the excess was dropped; the caller decides whether to log it.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        self.inner.push_slice(samples)
    }

    /// Number of samples currently buffered.
    pub fn occupied(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Total ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }
}

/// Callback-side half: drains one period per invocation.
pub struct PlaybackConsumer {
    inner: HeapCons<f32>,
}

impl PlaybackConsumer {
    /// Fill `out` from the ring if enough samples are buffered, otherwise
    /// zero-fill it entirely. Returns `true` on a successful drain.
    ///
    /// Underflow is routine while the worker precaches at startup, so the
    /// silent period is not an error and is not logged here.
    pub fn read_or_silence(&mut self, out: &mut [f32]) -> bool {
        if self.inner.occupied_len() >= out.len() {
            let read = self.inner.pop_slice(out);
            debug_assert_eq!(read, out.len());
            true
        } else {
            out.fill(0.0);
            false
        }
    }

    /// Number of samples currently buffered.
    pub fn occupied(&self) -> usize {
        self.inner.occupied_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_within_capacity() {
        let (mut prod, _cons) = PlaybackRing::with_capacity(8);
        let written = prod.write(&[0.1, 0.2, 0.3]);
        assert_eq!(written, 3);
        assert_eq!(prod.occupied(), 3);
    }

    #[test]
    fn test_overflow_writes_prefix_only() {
        let (mut prod, _cons) = PlaybackRing::with_capacity(4);
        let written = prod.write(&[1.0; 6]);
        assert_eq!(written, 4, "only the portion that fits is written");
        assert_eq!(prod.occupied(), 4);

        // Full ring rejects everything
        assert_eq!(prod.write(&[1.0]), 0);
    }

    #[test]
    fn test_underflow_zero_fills_whole_period() {
        let (mut prod, mut cons) = PlaybackRing::with_capacity(8);
        prod.write(&[0.5, 0.5, 0.5]);

        let mut out = [1.0f32; 4];
        let ok = cons.read_or_silence(&mut out);
        assert!(!ok, "3 buffered < 4 requested must underflow");
        assert_eq!(out, [0.0; 4], "underflow substitutes silence");
        // Buffered samples stay untouched for the next period
        assert_eq!(cons.occupied(), 3);
    }

    #[test]
    fn test_successful_drain_consumes_exactly_one_period() {
        let (mut prod, mut cons) = PlaybackRing::with_capacity(8);
        prod.write(&[0.25; 6]);

        let mut out = [0.0f32; 4];
        assert!(cons.read_or_silence(&mut out));
        assert_eq!(out, [0.25; 4]);
        assert_eq!(cons.occupied(), 2);
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let (mut prod, mut cons) = PlaybackRing::with_capacity(4);
        prod.write(&[1.0, 2.0, 3.0]);
        let mut out = [0.0f32; 3];
        assert!(cons.read_or_silence(&mut out));

        // Head/tail now mid-buffer; this write wraps the physical end
        prod.write(&[4.0, 5.0, 6.0, 7.0]);
        let mut out = [0.0f32; 4];
        assert!(cons.read_or_silence(&mut out));
        assert_eq!(out, [4.0, 5.0, 6.0, 7.0]);
    }
}
