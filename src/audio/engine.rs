//! Delay-measurement engine: stream setup and the estimation worker
//!
//! Owns the cpal input/output streams and the pieces they share with the
//! worker loop:
//! - the playback ring (worker produces encoded timecode, output callback
//!   consumes one period per invocation)
//! - the monotonic sample position (advanced by the output callback only on
//!   a successful drain)
//! - the decoded-frame channel (input callback to worker, lock-free bounded)
//! - the lifecycle condvar the worker sleeps on between periods
//!
//! The output callback never blocks: underflow plays silence, and the worker
//! wake is a try-lock that is skipped on contention.

use crate::audio::delay::{DelayEstimator, DelayReport};
use crate::audio::lifecycle::{Lifecycle, LifecycleState};
use crate::audio::ltc::{DecodedFrame, LtcDecoder, LtcEncoder};
use crate::audio::ring::{PlaybackConsumer, PlaybackProducer, PlaybackRing};
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Stream, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Bound on decoded frames in flight between the input callback and the
/// worker; a full channel drops the frame (one missed measurement, logged).
const FRAME_QUEUE_BOUND: usize = 64;

/// Errors raised during engine setup. All of these are fatal: the process
/// reports them and exits non-zero.
#[derive(Error, Debug)]
pub enum DelayEngineError {
    #[error("no output device available")]
    NoOutputDevice,

    #[error("no input device available")]
    NoInputDevice,

    #[error("failed to open stream: {0}")]
    StreamError(String),
}

/// Engine configuration assembled from the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Output level in dBFS, clamped to [-192, 0] by the CLI.
    pub level_dbfs: f32,
    /// Timecode frames per second (24, 25 or 30).
    pub fps: u32,
    /// Requested sample rate; `None` means the device default.
    pub sample_rate: Option<u32>,
    /// Capture device name; not-found falls back to the default with a warning.
    pub input_device: Option<String>,
    /// Playback device name; same fallback policy.
    pub output_device: Option<String>,
    /// Print per-frame decode diagnostics to stdout.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            level_dbfs: -6.0,
            fps: crate::DEFAULT_FPS,
            sample_rate: None,
            input_device: None,
            output_device: None,
            verbose: false,
        }
    }
}

/// The delay-measurement engine.
///
/// `start()` opens the streams, `run()` executes the estimation worker on the
/// calling thread until shutdown, `stop()` releases everything (also from
/// `Drop`, tolerating partially-initialized state).
pub struct DelayEngine {
    config: EngineConfig,
    lifecycle: Arc<Lifecycle>,
    /// Samples consumed by the output path since start. Written only by the
    /// output callback, read Relaxed by the input callback and the worker:
    /// a documented benign race, single-writer and monotonic, feeding only
    /// the human-facing average (staleness bounded by one period).
    monotonic: Arc<AtomicU64>,
    /// Effective sample rate once streams are open.
    sample_rate: u32,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    producer: Option<PlaybackProducer>,
    encoder: Option<LtcEncoder>,
    frame_rx: Option<crossbeam_channel::Receiver<DecodedFrame>>,
}

impl DelayEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            lifecycle: Arc::new(Lifecycle::new()),
            monotonic: Arc::new(AtomicU64::new(0)),
            sample_rate: 0,
            input_stream: None,
            output_stream: None,
            producer: None,
            encoder: None,
            frame_rx: None,
        }
    }

    /// Shared lifecycle handle, for wiring the stop signal.
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Effective sample rate; zero before `start()`.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn pick_output_device(host: &Host, name: Option<&str>) -> Result<Device> {
        if let Some(name) = name {
            match host
                .output_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            {
                Some(d) => return Ok(d),
                None => tracing::warn!("output device '{}' not found, using default", name),
            }
        }
        host.default_output_device()
            .ok_or_else(|| DelayEngineError::NoOutputDevice.into())
    }

    fn pick_input_device(host: &Host, name: Option<&str>) -> Result<Device> {
        if let Some(name) = name {
            match host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            {
                Some(d) => return Ok(d),
                None => tracing::warn!("input device '{}' not found, using default", name),
            }
        }
        host.default_input_device()
            .ok_or_else(|| DelayEngineError::NoInputDevice.into())
    }

    /// Open input/output streams, allocate the ring and codec instances and
    /// begin playback. Failures here are fatal to the process.
    pub fn start(&mut self) -> Result<()> {
        let host = cpal::default_host();

        let output_device = Self::pick_output_device(&host, self.config.output_device.as_deref())?;
        let input_device = Self::pick_input_device(&host, self.config.input_device.as_deref())?;

        let default_output = output_device
            .default_output_config()
            .context("query output config")?;
        let default_input = input_device
            .default_input_config()
            .context("query input config")?;

        let device_rate = default_output.sample_rate();
        let requested = self.config.sample_rate.unwrap_or(device_rate);

        let output_channels = default_output.channels();
        let input_channels = default_input.channels();

        let mut output_config = StreamConfig {
            channels: output_channels,
            sample_rate: requested,
            buffer_size: cpal::BufferSize::Default,
        };

        // Probe the requested rate with a throwaway stream; fall back to the
        // device default if the device refuses it.
        let mut effective_rate = requested;
        if requested != device_rate {
            let probe = output_device.build_output_stream(
                &output_config,
                |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
                |_| {},
                None,
            );
            if let Err(e) = probe {
                tracing::warn!(
                    "sample rate {} Hz rejected ({}), using device default {} Hz",
                    requested,
                    e,
                    device_rate
                );
                effective_rate = device_rate;
            }
        }
        output_config.sample_rate = effective_rate;
        let input_config = StreamConfig {
            channels: input_channels,
            sample_rate: effective_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        // One second of pre-renderable timecode audio
        let (producer, consumer) = PlaybackRing::with_capacity(effective_rate as usize);
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<DecodedFrame>(FRAME_QUEUE_BOUND);

        let encoder = LtcEncoder::new(effective_rate, self.config.fps);
        let decoder = LtcDecoder::new(effective_rate, self.config.fps);

        let output_stream = self.build_output_stream(
            &output_device,
            &output_config,
            consumer,
            output_channels as usize,
        )?;
        let input_stream = self.build_input_stream(
            &input_device,
            &input_config,
            decoder,
            frame_tx,
            input_channels as usize,
        )?;

        output_stream.play().context("start output stream")?;
        input_stream.play().context("start input stream")?;

        self.sample_rate = effective_rate;
        self.output_stream = Some(output_stream);
        self.input_stream = Some(input_stream);
        self.producer = Some(producer);
        self.encoder = Some(encoder);
        self.frame_rx = Some(frame_rx);

        tracing::info!(
            "engine started: {} Hz, {} fps, level {} dBFS",
            effective_rate,
            self.config.fps,
            self.config.level_dbfs
        );

        Ok(())
    }

    fn build_output_stream(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut consumer: PlaybackConsumer,
        channels: usize,
    ) -> Result<Stream> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let lifecycle_err = Arc::clone(&self.lifecycle);
        let monotonic = Arc::clone(&self.monotonic);
        let mut period: Vec<f32> = Vec::new();

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if lifecycle.state() != LifecycleState::Running {
                        data.fill(0.0);
                        return;
                    }

                    let frames = data.len() / channels;
                    if period.len() != frames {
                        period.resize(frames, 0.0);
                    }

                    // Advance the sample position only when a full period was
                    // drained; an underflow plays silence and holds position.
                    if consumer.read_or_silence(&mut period) {
                        monotonic.fetch_add(frames as u64, Ordering::Relaxed);
                    }

                    for (frame, &s) in data.chunks_mut(channels).zip(period.iter()) {
                        frame[0] = s;
                        for ch in frame.iter_mut().skip(1) {
                            *ch = 0.0;
                        }
                    }

                    // Never blocks: skipped on contention, retried next period
                    lifecycle.try_wake();
                },
                move |err| {
                    tracing::error!("output stream error: {}", err);
                    lifecycle_err.request_shutdown();
                },
                None,
            )
            .map_err(|e| DelayEngineError::StreamError(e.to_string()))?;
        Ok(stream)
    }

    fn build_input_stream(
        &self,
        device: &Device,
        config: &StreamConfig,
        mut decoder: LtcDecoder,
        frame_tx: crossbeam_channel::Sender<DecodedFrame>,
        channels: usize,
    ) -> Result<Stream> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let lifecycle_err = Arc::clone(&self.lifecycle);
        let monotonic = Arc::clone(&self.monotonic);

        let stream = device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if lifecycle.state() != LifecycleState::Running {
                        return;
                    }

                    // Benign race with the output callback's increment; at
                    // most one period stale, which only shifts off_start by
                    // an amount absorbed into the measured delay.
                    let pos = monotonic.load(Ordering::Relaxed);
                    decoder.write(data.iter().step_by(channels).copied(), pos);

                    while let Some(frame) = decoder.read_next() {
                        if frame_tx.try_send(frame).is_err() {
                            tracing::warn!("frame queue full, decoded frame dropped");
                        }
                    }
                },
                move |err| {
                    tracing::error!("input stream error: {}", err);
                    lifecycle_err.request_shutdown();
                },
                None,
            )
            .map_err(|e| DelayEngineError::StreamError(e.to_string()))?;
        Ok(stream)
    }

    /// Run the estimation worker on the calling thread until shutdown.
    ///
    /// One iteration per wake-up: refill the ring up to the precache mark,
    /// drain the decoded-frame queue into the estimator, emit a rate-limited
    /// report, then sleep on the lifecycle condvar.
    pub fn run(&mut self) -> Result<()> {
        let mut producer = self
            .producer
            .take()
            .ok_or_else(|| anyhow!("engine not started"))?;
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| anyhow!("engine not started"))?;
        let frame_rx = self
            .frame_rx
            .take()
            .ok_or_else(|| anyhow!("engine not started"))?;

        let sample_rate = self.sample_rate;
        let precache = (sample_rate / 2) as usize;
        let smult = 10f32.powf(self.config.level_dbfs / 20.0) / 90.0;
        let verbose = self.config.verbose;

        let mut estimator = DelayEstimator::new(sample_rate, self.config.fps);
        let mut scaled: Vec<f32> = Vec::with_capacity((sample_rate / self.config.fps) as usize);

        let lifecycle = Arc::clone(&self.lifecycle);
        let mut guard = lifecycle.worker_guard()?;
        lifecycle.advance(LifecycleState::Running);

        while lifecycle.state() == LifecycleState::Running {
            // Refill: keep at least half a second of timecode audio ahead of
            // the callback. Overflow drops samples and degrades waveform
            // continuity but never blocks or retries.
            while producer.occupied() < precache {
                for byte in 0..10 {
                    let wave = encoder.encode_byte(byte);
                    scaled.clear();
                    scaled.extend(wave.iter().map(|&u| (f32::from(u) - 128.0) * smult));
                    let wrote = producer.write(&scaled);
                    if wrote < scaled.len() {
                        tracing::error!(dropped = scaled.len() - wrote, "playback ring overflow");
                    }
                }
                encoder.inc_timecode();
            }

            // Drain every frame currently queued against one position snapshot
            let now = self.monotonic.load(Ordering::Relaxed);
            for frame in frame_rx.try_iter() {
                let offered = estimator.offer(&frame, now);
                if verbose {
                    println!(
                        "{:02}:{:02}:{:02}{}{:02} | {:8} {:8}{} | {:.1}dB | {}",
                        frame.tc.hours,
                        frame.tc.minutes,
                        frame.tc.seconds,
                        if frame.drop_frame { '.' } else { ':' },
                        frame.tc.frame,
                        frame.off_start,
                        frame.off_end,
                        if frame.reverse { " R" } else { "  " },
                        frame.volume_dbfs,
                        offered.delta,
                    );
                }
            }

            match estimator.poll(now) {
                Some(DelayReport::Delay(d)) => println!("Delay {}", d),
                Some(DelayReport::NoSignal) => println!(" -- no recent signal"),
                None => {}
            }

            if lifecycle.state() != LifecycleState::Running {
                break;
            }
            guard = lifecycle.wait(guard)?;
        }

        drop(guard);
        Ok(())
    }

    /// Release the ring, both codec instances and the streams, in that
    /// order. Any of them may already be absent.
    pub fn stop(&mut self) {
        self.lifecycle.request_shutdown();
        self.producer = None;
        self.encoder = None;
        self.frame_rx = None;
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("engine stopped");
    }
}

impl Drop for DelayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_starts_in_starting_state() {
        let engine = DelayEngine::new(EngineConfig::default());
        assert_eq!(engine.lifecycle().state(), LifecycleState::Starting);
        assert_eq!(engine.sample_rate(), 0);
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.level_dbfs, -6.0);
        assert_eq!(config.fps, 25);
        assert!(config.sample_rate.is_none());
        assert!(!config.verbose);
    }

    #[test]
    fn test_run_before_start_fails() {
        let mut engine = DelayEngine::new(EngineConfig::default());
        assert!(engine.run().is_err());
    }

    #[test]
    fn test_stop_tolerates_partial_init() {
        let mut engine = DelayEngine::new(EngineConfig::default());
        engine.stop();
        assert_eq!(engine.lifecycle().state(), LifecycleState::ShuttingDown);
        // Idempotent
        engine.stop();
    }
}
