// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use crate::error::CliError;
use crate::utils::{self, DeviceArgs};
use clap::Args as ClapArgs;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use yuvsnap::{
    backend::Driver, config::DeviceConfig, fake::FakeDriver, sink::JpegSink,
    stream::StreamController,
};

/// Longest uninterrupted sleep between signal checks
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Output JPEG file, replaced on every capture
    #[arg(default_value = "image.jpg")]
    output: PathBuf,

    #[command(flatten)]
    device: DeviceArgs,

    /// Milliseconds between captures
    #[arg(short, long, default_value = "1000")]
    interval: u64,

    /// Number of images to write (0=unlimited)
    #[arg(short, long, default_value = "0")]
    count: u64,

    /// JPEG quality (1-100)
    #[arg(long, default_value = "90")]
    quality: u8,
}

#[derive(Debug, Default, Serialize)]
struct WatchSummary {
    device: String,
    output: String,
    written: u64,
    timeouts: u64,
    interrupted: bool,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Watch parameters: {:?}", args);
    let config = args.device.config()?;
    let term = utils::install_signal_handler()?;

    let summary = if args.device.simulate {
        watch(StreamController::with_driver(FakeDriver::new()), &config, &args, &term)?
    } else {
        watch(StreamController::new(), &config, &args, &term)?
    };

    if json {
        let out = serde_json::to_string_pretty(&summary)
            .map_err(|e| CliError::General(format!("Failed to output JSON: {}", e)))?;
        println!("{}", out);
    } else {
        log::info!(
            "Wrote {} images to {} ({} timeouts)",
            summary.written,
            summary.output,
            summary.timeouts
        );
    }

    Ok(())
}

fn watch<D: Driver>(
    mut camera: StreamController<D>,
    config: &DeviceConfig,
    args: &Args,
    term: &AtomicBool,
) -> Result<WatchSummary, CliError> {
    let timeout = args.device.timeout();
    let interval = Duration::from_millis(args.interval);
    let temp = utils::temp_path(&args.output);
    let mut sink = JpegSink::new(&temp).with_quality(args.quality);

    let format = camera.configure(config)?;
    camera.stream_on()?;
    log::info!(
        "Writing {} to {} every {:?} (Ctrl+C to stop)...",
        format,
        args.output.display(),
        interval
    );

    let mut summary = WatchSummary {
        device: config.device().to_owned(),
        output: args.output.display().to_string(),
        ..Default::default()
    };

    while !term.load(Ordering::Relaxed) {
        let started = Instant::now();

        match camera.capture(timeout, &mut sink) {
            Ok(sequence) => {
                fs::rename(&temp, &args.output)?;
                summary.written += 1;
                log::debug!("Frame {} saved to {}", sequence, args.output.display());
            }
            Err(err) if err.is_recoverable() => {
                summary.timeouts += 1;
                log::warn!("{}", err);
            }
            Err(err) => return Err(err.into()),
        }

        if args.count != 0 && summary.written >= args.count {
            break;
        }
        sleep_until(started + interval, term);
    }

    summary.interrupted = term.load(Ordering::Relaxed);
    if summary.interrupted {
        log::info!("Received termination signal, stopping...");
    }

    camera.stream_off()?;
    camera.teardown()?;
    Ok(summary)
}

/// Sleeps until `deadline` or until `term` is raised.
fn sleep_until(deadline: Instant, term: &AtomicBool) {
    loop {
        let now = Instant::now();
        if now >= deadline || term.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_until_stops_on_signal() {
        let term = AtomicBool::new(true);
        let started = Instant::now();
        sleep_until(started + Duration::from_secs(10), &term);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_until_deadline() {
        let term = AtomicBool::new(false);
        let started = Instant::now();
        sleep_until(started + Duration::from_millis(120), &term);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }
}
