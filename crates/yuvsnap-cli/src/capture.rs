// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use crate::error::CliError;
use crate::utils::DeviceArgs;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use yuvsnap::{
    backend::Driver,
    config::DeviceConfig,
    fake::FakeDriver,
    sink::{FrameSink, FrameView, JpegSink},
    stream::StreamController,
    Error,
};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Output JPEG file
    #[arg(default_value = "image.jpg")]
    output: PathBuf,

    #[command(flatten)]
    device: DeviceArgs,

    /// Extra attempts when no frame arrives in time
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Frames to discard while the sensor settles
    #[arg(long, default_value = "0")]
    skip: u32,

    /// JPEG quality (1-100)
    #[arg(long, default_value = "90")]
    quality: u8,
}

#[derive(Debug, Serialize)]
struct CaptureSummary {
    device: String,
    output: String,
    width: u32,
    height: u32,
    format: String,
    sequence: u32,
    bytes: u64,
    elapsed_ms: u64,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Capture parameters: {:?}", args);
    let config = args.device.config()?;

    let summary = if args.device.simulate {
        capture(StreamController::with_driver(FakeDriver::new()), &config, &args)?
    } else {
        capture(StreamController::new(), &config, &args)?
    };

    if json {
        let out = serde_json::to_string_pretty(&summary)
            .map_err(|e| CliError::General(format!("Failed to output JSON: {}", e)))?;
        println!("{}", out);
    } else {
        log::info!(
            "Saved {}x{} frame {} to {} ({} bytes)",
            summary.width,
            summary.height,
            summary.sequence,
            summary.output,
            summary.bytes
        );
    }

    Ok(())
}

fn capture<D: Driver>(
    mut camera: StreamController<D>,
    config: &DeviceConfig,
    args: &Args,
) -> Result<CaptureSummary, CliError> {
    let started = Instant::now();
    let timeout = args.device.timeout();

    let format = camera.configure(config)?;
    camera.stream_on()?;

    let mut discard = |_: &FrameView<'_>| -> Result<(), Error> { Ok(()) };
    for _ in 0..args.skip {
        capture_with_retries(&mut camera, timeout, args.retries, &mut discard)?;
    }
    if args.skip > 0 {
        log::debug!("Discarded {} warm-up frames", args.skip);
    }

    let mut sink = JpegSink::new(&args.output).with_quality(args.quality);
    let sequence = capture_with_retries(&mut camera, timeout, args.retries, &mut sink)?;

    camera.stream_off()?;
    camera.teardown()?;

    let bytes = fs::metadata(&args.output)?.len();
    Ok(CaptureSummary {
        device: config.device().to_owned(),
        output: args.output.display().to_string(),
        width: format.width,
        height: format.height,
        format: format.fourcc.to_string(),
        sequence,
        bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Captures one frame, retrying up to `retries` times on timeouts and
/// interrupted waits.
fn capture_with_retries<D, S>(
    camera: &mut StreamController<D>,
    timeout: Duration,
    retries: u32,
    sink: &mut S,
) -> Result<u32, CliError>
where
    D: Driver,
    S: FrameSink,
{
    let mut attempt = 0;
    loop {
        match camera.capture(timeout, sink) {
            Ok(sequence) => return Ok(sequence),
            Err(err) if err.is_recoverable() && attempt < retries => {
                attempt += 1;
                log::warn!("{} (retry {}/{})", err, attempt, retries);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
