// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use crate::error::CliError;
use crate::utils::DeviceArgs;
use clap::Args as ClapArgs;
use serde::Serialize;
use yuvsnap::{
    backend::Driver, config::DeviceConfig, device::CaptureDevice, fake::FakeDriver,
    fourcc::Format, v4l2::V4l2Driver,
};

#[derive(ClapArgs, Debug)]
pub struct Args {
    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(Debug, Serialize)]
struct CameraInfo {
    device: String,
    driver: String,
    card: String,
    bus_info: String,
    version: String,
    capabilities: Vec<&'static str>,
    requested: String,
    format: FormatInfo,
}

#[derive(Debug, Serialize)]
struct FormatInfo {
    width: u32,
    height: u32,
    fourcc: String,
    bytes_per_line: u32,
    size_image: u32,
}

impl From<Format> for FormatInfo {
    fn from(format: Format) -> Self {
        FormatInfo {
            width: format.width,
            height: format.height,
            fourcc: format.fourcc.to_string(),
            bytes_per_line: format.bytes_per_line,
            size_image: format.size_image,
        }
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing info command: {:?}", args);
    let config = args.device.config()?;

    let info = if args.device.simulate {
        query_camera_info(&FakeDriver::new(), &config)?
    } else {
        query_camera_info(&V4l2Driver, &config)?
    };

    if json {
        let out = serde_json::to_string_pretty(&info)
            .map_err(|e| CliError::General(format!("Failed to output JSON: {}", e)))?;
        println!("{}", out);
    } else {
        print_text_info(&info);
    }

    Ok(())
}

/// Opens the camera, reads its capabilities and negotiates the configured
/// format without allocating buffers.
fn query_camera_info<D: Driver>(driver: &D, config: &DeviceConfig) -> Result<CameraInfo, CliError> {
    let mut device = CaptureDevice::open(driver, config.device())?;
    let caps = device.query_capabilities()?.clone();
    let format = device.set_format(config.width(), config.height(), config.pixel_format())?;
    device.close()?;

    Ok(CameraInfo {
        device: config.device().to_owned(),
        capabilities: caps.flag_names(),
        version: caps.version_string(),
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus_info,
        requested: format!(
            "{}x{} {}",
            config.width(),
            config.height(),
            config.pixel_format()
        ),
        format: format.into(),
    })
}

fn print_text_info(info: &CameraInfo) {
    println!("Camera: {}", info.device);
    println!("  Card: {}", info.card);
    println!("  Driver: {} {}", info.driver, info.version);
    println!("  Bus: {}", info.bus_info);
    println!("  Capabilities: {}", info.capabilities.join(", "));
    println!("  Requested: {}", info.requested);
    println!(
        "  Negotiated: {}x{} {} ({} bytes per line, {} bytes per frame)",
        info.format.width,
        info.format.height,
        info.format.fourcc,
        info.format.bytes_per_line,
        info.format.size_image
    );
}
