//! Audio pipeline for round-trip delay measurement
//!
//! - [`ring`] — SPSC playback ring between worker and output callback
//! - [`ltc`] — linear timecode encoder/decoder
//! - [`delay`] — running-average delay estimation
//! - [`lifecycle`] — process state machine and worker wake protocol
//! - [`engine`] — cpal stream setup and the estimation worker loop

pub mod delay;
pub mod engine;
pub mod lifecycle;
pub mod ltc;
pub mod ring;
