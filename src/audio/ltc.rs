//! Linear timecode codec
//!
//! Encodes a time-of-day into an 80-bit biphase-mark SMPTE frame rendered as
//! unsigned 8-bit audio (low 38, high 218, centered on 128), and decodes a
//! captured sample stream back into completed frames tagged with the sample
//! position at which each frame was observed.
//!
//! The encoder renders one byte (8 bits) of the current frame per call so the
//! worker can interleave encoding with ring-buffer writes; the decoder
//! accumulates transitions across arbitrarily-sized input blocks and queues a
//! [`DecodedFrame`] whenever a sync word completes.

use std::collections::VecDeque;

/// Biphase output levels, libltc convention: 128 ± 90.
const LEVEL_LOW: u8 = 38;
const LEVEL_HIGH: u8 = 218;

/// Bits per LTC frame.
const FRAME_BITS: usize = 80;

/// Sync word occupying bits 64..80, transmitted LSB-first:
/// 0,0,1,1,1,1,1,1,1,1,1,1,1,1,0,1
const SYNC_WORD: [bool; 16] = [
    false, false, true, true, true, true, true, true, true, true, true, true, true, true, false,
    true,
];

/// One timecode value, hours:minutes:seconds:frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frame: u8,
}

impl std::fmt::Display for Timecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frame
        )
    }
}

/// A completed timecode frame recovered from the input stream.
///
/// `off_start`/`off_end` are positions in the decoder's input stream (the
/// monotonic sample position passed to [`LtcDecoder::write`] plus the offset
/// within the block). Immutable once queued; consumed exactly once.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub tc: Timecode,
    /// Frames-per-second context the decoder was configured with.
    pub fps: u32,
    /// Input-stream position of the frame's first bit.
    pub off_start: u64,
    /// Input-stream position of the frame's last transition.
    pub off_end: u64,
    /// Frame arrived time-reversed (tape played backwards).
    pub reverse: bool,
    /// Drop-frame flag from the frame's bit 10.
    pub drop_frame: bool,
    /// Peak input level over the frame, in dBFS.
    pub volume_dbfs: f32,
}

/// Build the 80-bit frame for a timecode, LSB-first per BCD field.
/// User-bit groups and binary-group flags are left zero.
fn frame_bits(tc: &Timecode, drop_frame: bool) -> [bool; FRAME_BITS] {
    let mut bits = [false; FRAME_BITS];

    let mut put = |base: usize, width: usize, value: u8| {
        for i in 0..width {
            bits[base + i] = (value >> i) & 1 == 1;
        }
    };

    put(0, 4, tc.frame % 10);
    put(8, 2, tc.frame / 10);
    put(16, 4, tc.seconds % 10);
    put(24, 3, tc.seconds / 10);
    put(32, 4, tc.minutes % 10);
    put(40, 3, tc.minutes / 10);
    put(48, 4, tc.hours % 10);
    put(56, 2, tc.hours / 10);
    bits[10] = drop_frame;
    bits[64..80].copy_from_slice(&SYNC_WORD);

    bits
}

/// Extract timecode fields from the 64 data bits of a frame.
fn parse_bits(bits: &[bool]) -> (Timecode, bool) {
    let get = |base: usize, width: usize| -> u8 {
        let mut v = 0u8;
        for i in 0..width {
            if bits[base + i] {
                v |= 1 << i;
            }
        }
        v
    };

    let tc = Timecode {
        frame: get(8, 2) * 10 + get(0, 4),
        seconds: get(24, 3) * 10 + get(16, 4),
        minutes: get(40, 3) * 10 + get(32, 4),
        hours: get(56, 2) * 10 + get(48, 4),
    };
    (tc, bits[10])
}

/// LTC encoder producing one frame's waveform byte by byte.
///
/// Bit boundaries are placed by rounding fractional sample positions over the
/// whole frame, so every frame is exactly `sample_rate / fps` samples long
/// even when that ratio is not a multiple of 80.
pub struct LtcEncoder {
    sample_rate: u32,
    fps: u32,
    timecode: Timecode,
    bits: [bool; FRAME_BITS],
    /// Current biphase level carried across bytes and frames.
    level: bool,
    buf: Vec<u8>,
}

impl LtcEncoder {
    pub fn new(sample_rate: u32, fps: u32) -> Self {
        let timecode = Timecode::default();
        Self {
            sample_rate,
            fps,
            timecode,
            bits: frame_bits(&timecode, false),
            level: false,
            buf: Vec::with_capacity((sample_rate / fps / 10 + 2) as usize),
        }
    }

    /// Current timecode of the frame being encoded.
    pub fn timecode(&self) -> Timecode {
        self.timecode
    }

    /// Samples per full encoded frame.
    pub fn samples_per_frame(&self) -> f64 {
        self.sample_rate as f64 / self.fps as f64
    }

    /// Render byte `idx` (0..10) of the current frame and return its
    /// waveform. Bytes must be rendered in order for the biphase level to
    /// chain correctly across byte boundaries.
    pub fn encode_byte(&mut self, idx: usize) -> &[u8] {
        debug_assert!(idx < 10);
        self.buf.clear();

        let spb = self.sample_rate as f64 / (self.fps as f64 * FRAME_BITS as f64);
        for bit in idx * 8..idx * 8 + 8 {
            let begin = (bit as f64 * spb).round() as usize;
            let end = ((bit + 1) as f64 * spb).round() as usize;
            let mid = ((bit as f64 + 0.5) * spb).round() as usize;

            // Biphase-mark: transition at every bit boundary, plus one at
            // mid-bit for a one.
            self.level = !self.level;
            for s in begin..end {
                if self.bits[bit] && s == mid {
                    self.level = !self.level;
                }
                self.buf
                    .push(if self.level { LEVEL_HIGH } else { LEVEL_LOW });
            }
        }
        &self.buf
    }

    /// Advance to the next frame, carrying through hh:mm:ss with a 24-hour
    /// wrap. Call exactly once per full set of 10 encoded bytes.
    pub fn inc_timecode(&mut self) {
        let tc = &mut self.timecode;
        tc.frame += 1;
        if u32::from(tc.frame) >= self.fps {
            tc.frame = 0;
            tc.seconds += 1;
            if tc.seconds >= 60 {
                tc.seconds = 0;
                tc.minutes += 1;
                if tc.minutes >= 60 {
                    tc.minutes = 0;
                    tc.hours = (tc.hours + 1) % 24;
                }
            }
        }
        self.bits = frame_bits(&self.timecode, false);
    }
}

/// LTC decoder recovering frames from a captured sample stream.
///
/// Classifies intervals between level transitions against the nominal bit
/// period: a short interval is half of a one, a full interval is a zero.
/// Completed frames are queued; the engine drains the queue every iteration.
pub struct LtcDecoder {
    /// Nominal samples per bit at the configured rate and fps.
    bit_period: f64,
    fps: u32,
    /// Current comparator level, with hysteresis against `envelope`.
    level: bool,
    /// Peak-tracking envelope with slow decay; sets the hysteresis band.
    envelope: f32,
    /// Peak level since the last emitted frame, for volume reporting.
    frame_peak: f32,
    last_transition: u64,
    /// A first half-interval was seen; the next half completes a one.
    pending_half: bool,
    pending_start: u64,
    bits: VecDeque<bool>,
    bit_starts: VecDeque<u64>,
    queue: VecDeque<DecodedFrame>,
}

impl LtcDecoder {
    pub fn new(sample_rate: u32, fps: u32) -> Self {
        Self {
            bit_period: sample_rate as f64 / (fps as f64 * FRAME_BITS as f64),
            fps,
            level: false,
            envelope: 0.0,
            frame_peak: 0.0,
            last_transition: 0,
            pending_half: false,
            pending_start: 0,
            bits: VecDeque::with_capacity(FRAME_BITS + 1),
            bit_starts: VecDeque::with_capacity(FRAME_BITS + 1),
            queue: VecDeque::new(),
        }
    }

    /// Feed a block of input samples. `start_pos` is the monotonic sample
    /// position at the first sample of the block; decoded frames report
    /// offsets in this position space.
    pub fn write<I>(&mut self, samples: I, start_pos: u64)
    where
        I: IntoIterator<Item = f32>,
    {
        for (i, s) in samples.into_iter().enumerate() {
            self.write_sample(s, start_pos + i as u64);
        }
    }

    /// Number of completed frames waiting to be read.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Take the oldest completed frame, if any.
    pub fn read_next(&mut self) -> Option<DecodedFrame> {
        self.queue.pop_front()
    }

    fn write_sample(&mut self, s: f32, pos: u64) {
        let a = s.abs();
        if a > self.envelope {
            self.envelope = a;
        } else {
            self.envelope *= 0.9999;
        }
        if a > self.frame_peak {
            self.frame_peak = a;
        }

        let threshold = (self.envelope * 0.25).max(1e-4);
        let new_level = if self.level {
            s > -threshold
        } else {
            s > threshold
        };
        if new_level != self.level {
            self.level = new_level;
            self.on_transition(pos);
        }
    }

    fn on_transition(&mut self, pos: u64) {
        let interval = pos.saturating_sub(self.last_transition) as f64;
        self.last_transition = pos;

        if interval < 0.75 * self.bit_period {
            if self.pending_half {
                self.pending_half = false;
                let start = self.pending_start;
                self.push_bit(true, start, pos);
            } else {
                self.pending_half = true;
                self.pending_start = pos - interval as u64;
            }
        } else if interval < 1.5 * self.bit_period {
            // A lone half followed by a full interval is a biphase
            // violation; drop the half and resync on the zero.
            self.pending_half = false;
            self.push_bit(false, pos - interval as u64, pos);
        } else {
            // Silence gap or unrelated signal; restart bit accumulation.
            self.pending_half = false;
            self.bits.clear();
            self.bit_starts.clear();
        }
    }

    fn push_bit(&mut self, bit: bool, start: u64, pos: u64) {
        self.bits.push_back(bit);
        self.bit_starts.push_back(start);
        if self.bits.len() > FRAME_BITS {
            self.bits.pop_front();
            self.bit_starts.pop_front();
        }
        if self.bits.len() == FRAME_BITS {
            self.try_emit(pos);
        }
    }

    fn try_emit(&mut self, pos: u64) {
        let forward = (0..16).all(|i| self.bits[64 + i] == SYNC_WORD[i]);
        let reversed = !forward && (0..16).all(|i| self.bits[15 - i] == SYNC_WORD[i]);
        if !forward && !reversed {
            return;
        }

        let data: Vec<bool> = if forward {
            self.bits.iter().take(64).copied().collect()
        } else {
            // Time-reversed stream: data bits trail the sync word and
            // arrive in reverse order.
            self.bits.iter().skip(16).rev().copied().collect()
        };
        let (tc, drop_frame) = parse_bits(&data);

        let volume_dbfs = if self.frame_peak > 0.0 {
            20.0 * self.frame_peak.log10()
        } else {
            f32::NEG_INFINITY
        };

        self.queue.push_back(DecodedFrame {
            tc,
            fps: self.fps,
            off_start: self.bit_starts[0],
            off_end: pos,
            reverse: reversed,
            drop_frame,
            volume_dbfs,
        });

        self.frame_peak = 0.0;
        self.bits.clear();
        self.bit_starts.clear();
    }
}
