//! ltc-delay - Measure audio-path round-trip delay with linear timecode
//!
//! Emits a continuous LTC signal on an output port, captures it back through
//! an input port after it has traversed external hardware/software, and
//! reports the measured offset in samples.

pub mod audio;

pub use audio::delay::{DelayEstimator, DelayReport};
pub use audio::engine::{DelayEngine, EngineConfig};
pub use audio::lifecycle::{Lifecycle, LifecycleState};
pub use audio::ltc::{DecodedFrame, LtcDecoder, LtcEncoder, Timecode};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default timecode frame rate (24, 25 or 30)
pub const DEFAULT_FPS: u32 = 25;
