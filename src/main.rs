//! ltc-delay - audio-path delay measurement over a timecode loopback
//!
//! Entry point: argument parsing, logging setup, stop-signal wiring and the
//! worker loop.

use anyhow::{Context, Result};
use ltc_delay::audio::engine::{DelayEngine, EngineConfig};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ltc_delay=info".parse().unwrap()),
        )
        .init();

    let mut config = EngineConfig::default();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("ltc-delay {}", ltc_delay::VERSION);
                return Ok(());
            }
            "--level" | "-l" => {
                let value = take_value(&args, i, "--level")?;
                let level: f32 = value
                    .parse()
                    .with_context(|| format!("invalid level: {}", value))?;
                config.level_dbfs = level.clamp(-192.0, 0.0);
                i += 2;
                continue;
            }
            "--fps" | "-f" => {
                let value = take_value(&args, i, "--fps")?;
                let fps: u32 = value
                    .parse()
                    .with_context(|| format!("invalid fps: {}", value))?;
                if !matches!(fps, 24 | 25 | 30) {
                    anyhow::bail!("fps must be 24, 25 or 30, got {}", fps);
                }
                config.fps = fps;
                i += 2;
                continue;
            }
            "--sample-rate" | "-r" => {
                let value = take_value(&args, i, "--sample-rate")?;
                let rate: u32 = value
                    .parse()
                    .with_context(|| format!("invalid sample rate: {}", value))?;
                config.sample_rate = Some(rate);
                i += 2;
                continue;
            }
            "--input" | "-i" => {
                config.input_device = Some(take_value(&args, i, "--input")?.to_string());
                i += 2;
                continue;
            }
            "--output" | "-o" => {
                config.output_device = Some(take_value(&args, i, "--output")?.to_string());
                i += 2;
                continue;
            }
            "--debug" | "-d" => {
                config.verbose = true;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    println!(
        "ltc-delay {} - output {:.2} dBFS, {} fps",
        ltc_delay::VERSION,
        config.level_dbfs,
        config.fps
    );

    let mut engine = DelayEngine::new(config);
    engine.start().context("audio setup failed")?;

    // Stop signal: flag plus best-effort wake, nothing else
    let lifecycle = engine.lifecycle();
    ctrlc::set_handler(move || {
        lifecycle.request_shutdown();
    })
    .context("install signal handler")?;

    engine.run()?;
    engine.stop();

    println!("bye.");
    Ok(())
}

fn take_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", flag))
}

fn print_help() {
    println!("ltc-delay - measure audio-path delay with a timecode loopback.");
    println!("Usage: ltc-delay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --level <dBFS>       output level, clamped to [-192, 0] (default -6)");
    println!("  -f, --fps <24|25|30>     timecode frame rate (default 25)");
    println!("  -r, --sample-rate <Hz>   requested sample rate (default: device rate)");
    println!("  -i, --input <name>       capture device to use (default: system default)");
    println!("  -o, --output <name>      playback device to use (default: system default)");
    println!("  -d, --debug              print per-frame decode diagnostics");
    println!("  -h, --help               display this help and exit");
    println!("  -V, --version            print version information and exit");
    println!();
    println!("Route the output port through the path under test and back into the");
    println!("input port; the measured round-trip delay is reported in samples.");
}
