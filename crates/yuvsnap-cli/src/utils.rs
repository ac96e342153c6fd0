// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use crate::error::CliError;
use clap::Args as ClapArgs;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use yuvsnap::config::DeviceConfig;

/// Camera selection shared by every subcommand
#[derive(ClapArgs, Debug)]
pub struct DeviceArgs {
    /// Camera device
    #[arg(short, long, default_value = "/dev/video0")]
    pub device: String,

    /// Resolution in WxH format (the camera may pick another)
    #[arg(short, long, default_value = "640x480")]
    pub resolution: String,

    /// Number of capture buffers to request
    #[arg(short, long, default_value = "3")]
    pub buffers: u32,

    /// Seconds to wait for a frame
    #[arg(short, long, default_value = "10")]
    pub timeout: u64,

    /// Use the built-in simulated camera instead of a device node
    #[arg(long, hide = true)]
    pub simulate: bool,
}

impl DeviceArgs {
    pub fn config(&self) -> Result<DeviceConfig, CliError> {
        let (width, height) = parse_resolution(&self.resolution)?;
        let config = DeviceConfig::default()
            .with_device(&self.device)
            .with_resolution(width, height)
            .with_buffers(self.buffers);
        config.validate()?;
        log::debug!("Capture configuration: {}", config);
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Parse resolution string in format "WxH" or "W*H"
pub fn parse_resolution(s: &str) -> Result<(u32, u32), CliError> {
    let (width_str, height_str) = s
        .split_once('x')
        .or_else(|| s.split_once('*'))
        .ok_or_else(|| {
            CliError::InvalidArgs(format!(
                "Invalid resolution format (expected WxH or W*H): {}",
                s
            ))
        })?;

    let width = width_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = height_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width == 0 || height == 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Temporary file next to `output`, e.g. `image.jpg.tmp`
pub fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    output.with_file_name(name)
}

/// Install signal handler for graceful shutdown on Ctrl+C or SIGTERM
///
/// Returns an Arc<AtomicBool> that will be set to true when either signal is
/// received. Check this flag periodically in your main loop to exit gracefully.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));

    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, Arc::clone(&term))
            .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;
    }

    log::debug!("Installed SIGINT/SIGTERM handlers");
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
        assert_eq!(parse_resolution("640*480").unwrap(), (640, 480));
        assert!(parse_resolution("1920").is_err());
        assert!(parse_resolution("0x480").is_err());
        assert!(parse_resolution("-1x480").is_err());
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/tmp/out/image.jpg")),
            PathBuf::from("/tmp/out/image.jpg.tmp")
        );
        assert_eq!(temp_path(Path::new("snap.jpg")), PathBuf::from("snap.jpg.tmp"));
    }

    #[test]
    fn test_device_config() {
        let args = DeviceArgs {
            device: "/dev/video2".into(),
            resolution: "1280x720".into(),
            buffers: 4,
            timeout: 2,
            simulate: false,
        };
        let config = args.config().unwrap();
        assert_eq!(config.device(), "/dev/video2");
        assert_eq!((config.width(), config.height()), (1280, 720));
        assert_eq!(config.num_buffers(), 4);
        assert_eq!(args.timeout(), Duration::from_secs(2));

        let args = DeviceArgs { buffers: 0, ..args };
        assert!(matches!(args.config(), Err(CliError::InvalidArgs(_))));
    }
}
