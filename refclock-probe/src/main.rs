//! # refclock probe
//!
//! Starts a reference clock, paces a run of frames off `wait()` and reports
//! how the clock behaved: which backend came up, detected refresh rate,
//! frame intervals, and the tracking counters.

use anyhow::Result;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use refclock_core::{Backend, ClockConfig, ClockStats, ReferenceClock, StartStatus};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug)]
struct ProbeOptions {
    config: Option<PathBuf>,
    backend: Option<Backend>,
    device: Option<PathBuf>,
    refresh_hz: Option<u32>,
    frames: u64,
    speed: Option<f64>,
    start_timeout_ms: Option<u64>,
    json: bool,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            config: None,
            backend: None,
            device: None,
            refresh_hz: None,
            frames: 120,
            speed: None,
            start_timeout_ms: None,
            json: false,
        }
    }
}

const USAGE: &str = "\
Usage: refclock-probe [OPTIONS]

Options:
  --config PATH            Load clock config from PATH
  --backend NAME           auto | drm | timer | none
  --device PATH            DRM card node (default /dev/dri/card0)
  --refresh HZ             Refresh rate for the timer backend
  --frames N               Frames to pace (default 120)
  --speed X                Clock speed multiplier
  --start-timeout-ms MS    How long to wait for vblank tracking
  --json                   Print the report as JSON
  -h, --help               Show this help";

fn parse_args(args: &[String]) -> Result<ProbeOptions> {
    let mut options = ProbeOptions::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--json" => {
                options.json = true;
                i += 1;
                continue;
            }
            "--config" | "--backend" | "--device" | "--refresh" | "--frames" | "--speed"
            | "--start-timeout-ms" => {}
            other => return Err(anyhow::anyhow!("Unknown argument: {}\n\n{}", other, USAGE)),
        }

        let value = args
            .get(i + 1)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))?;
        match flag {
            "--config" => options.config = Some(PathBuf::from(value)),
            "--backend" => options.backend = Some(value.parse()?),
            "--device" => options.device = Some(PathBuf::from(value)),
            "--refresh" => {
                options.refresh_hz = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid refresh rate: {}", value))?,
                )
            }
            "--frames" => {
                options.frames = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid frame count: {}", value))?
            }
            "--speed" => {
                let speed: f64 = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid speed: {}", value))?;
                if !speed.is_finite() || speed <= 0.0 {
                    return Err(anyhow::anyhow!("Speed must be positive: {}", value));
                }
                options.speed = Some(speed);
            }
            "--start-timeout-ms" => {
                options.start_timeout_ms = Some(
                    value
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid timeout: {}", value))?,
                )
            }
            _ => unreachable!(),
        }
        i += 2;
    }

    Ok(options)
}

fn load_config(options: &ProbeOptions) -> Result<ClockConfig> {
    let mut config = match &options.config {
        Some(path) => ClockConfig::load(path)?,
        None => ClockConfig::load_default()?,
    };

    if let Some(backend) = options.backend {
        config.backend = backend;
    }
    if let Some(device) = &options.device {
        config.drm_device = device.clone();
    }
    if let Some(refresh_hz) = options.refresh_hz {
        config.timer_refresh_hz = refresh_hz;
    }
    if let Some(timeout) = options.start_timeout_ms {
        config.start_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Probe Run
// ============================================================================

#[derive(Debug, Serialize)]
struct ProbeReport {
    backend: Backend,
    start: StartStatus,
    refresh_rate: i32,
    speed: f64,
    frequency: i64,
    frames: u64,
    clock_elapsed_ms: f64,
    wall_elapsed_ms: f64,
    mean_frame_ms: f64,
    max_frame_ms: f64,
    stats: ClockStats,
}

fn run_probe(clock: &ReferenceClock, config: &ClockConfig, options: &ProbeOptions) -> ProbeReport {
    let start = clock.wait_started(clock.start_timeout_ms());
    match start {
        StartStatus::Live => info!("Vblank tracking live at {} Hz", clock.get_refresh_rate()),
        StartStatus::GaveUp => warn!("No vblank source, pacing off the system counter"),
        StartStatus::TimedOut => warn!(
            "Vblank tracking not live after {} ms",
            clock.start_timeout_ms()
        ),
    }

    if let Some(speed) = options.speed {
        clock.set_speed(speed);
    }

    // One nominal frame, used only when there is no sync source
    let refresh = clock.get_refresh_rate();
    let frame_timeout_ms = if refresh > 0 { 1000 / refresh as u64 } else { 16 };

    let frequency = clock.get_frequency();
    let clock_start = clock.get_time();
    let wall_start = Instant::now();
    let mut last = wall_start;
    let mut max_frame = Duration::ZERO;

    for _ in 0..options.frames {
        clock.wait(frame_timeout_ms);
        let now = Instant::now();
        max_frame = max_frame.max(now - last);
        last = now;
    }

    let wall_elapsed = wall_start.elapsed();
    let clock_elapsed = clock.get_time() - clock_start;
    let mean_frame_ms = if options.frames > 0 {
        wall_elapsed.as_secs_f64() * 1000.0 / options.frames as f64
    } else {
        0.0
    };

    ProbeReport {
        backend: config.backend,
        start,
        refresh_rate: clock.get_refresh_rate(),
        speed: clock.get_speed(),
        frequency,
        frames: options.frames,
        clock_elapsed_ms: clock_elapsed as f64 * 1000.0 / frequency as f64,
        wall_elapsed_ms: wall_elapsed.as_secs_f64() * 1000.0,
        mean_frame_ms,
        max_frame_ms: max_frame.as_secs_f64() * 1000.0,
        stats: clock.stats(),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("refclock_core=info".parse()?)
                .add_directive("refclock_probe=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    info!("refclock probe v{}", refclock_core::VERSION);

    let options = parse_args(&args)?;
    let config = load_config(&options)?;
    info!("Backend: {:?}, frames: {}", config.backend, options.frames);

    let clock = ReferenceClock::from_config(&config);
    clock.start()?;
    let report = run_probe(&clock, &config, &options);
    clock.stop();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "Refresh: {} Hz, speed: {:.3}, frames: {}",
            report.refresh_rate, report.speed, report.frames
        );
        info!(
            "Elapsed: clock {:.1} ms, wall {:.1} ms, frame mean {:.2} ms, max {:.2} ms",
            report.clock_elapsed_ms,
            report.wall_elapsed_ms,
            report.mean_frame_ms,
            report.max_frame_ms
        );
        info!(
            "Setups: {}, vblanks: {}, missed: {}, discontinuities: {}, mode changes: {}",
            report.stats.setups,
            report.stats.vblanks,
            report.stats.missed,
            report.stats.discontinuities,
            report.stats.mode_changes
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("refclock-probe")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&[
            "--backend", "timer", "--refresh", "50", "--frames", "10", "--speed", "1.5", "--json",
        ]))
        .unwrap();
        assert_eq!(options.backend, Some(Backend::Timer));
        assert_eq!(options.refresh_hz, Some(50));
        assert_eq!(options.frames, 10);
        assert_eq!(options.speed, Some(1.5));
        assert!(options.json);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["--frames"])).is_err());
        assert!(parse_args(&args(&["--frames", "many"])).is_err());
        assert!(parse_args(&args(&["--speed", "-2"])).is_err());
        assert!(parse_args(&args(&["--backend", "glx"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_probe_without_sync_source() {
        let options = ProbeOptions {
            backend: Some(Backend::None),
            frames: 5,
            start_timeout_ms: Some(500),
            ..Default::default()
        };
        let mut config = ClockConfig::default();
        config.backend = Backend::None;
        config.start_timeout_ms = 500;

        let clock = ReferenceClock::from_config(&config);
        clock.start().unwrap();
        let report = run_probe(&clock, &config, &options);
        clock.stop();

        assert_eq!(report.start, StartStatus::GaveUp);
        assert_eq!(report.refresh_rate, -1);
        assert_eq!(report.speed, 1.0);
        assert_eq!(report.stats.vblanks, 0);
        assert!(report.clock_elapsed_ms >= 0.0);
    }

    #[test]
    fn test_probe_timer_backend() {
        let options = ProbeOptions {
            frames: 10,
            ..Default::default()
        };
        let mut config = ClockConfig::default();
        config.backend = Backend::Timer;
        config.timer_refresh_hz = 100;

        let clock = ReferenceClock::from_config(&config);
        clock.start().unwrap();
        let report = run_probe(&clock, &config, &options);
        clock.stop();

        assert_eq!(report.start, StartStatus::Live);
        assert_eq!(report.refresh_rate, 100);
        assert!(report.stats.vblanks > 0);
        assert!(report.clock_elapsed_ms > 0.0);
    }
}
