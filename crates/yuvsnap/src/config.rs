// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use std::fmt;

use crate::{
    fourcc::{Format, PixelFormat},
    Error,
};

/// Buffer memory model. Only kernel-allocated, memory-mapped buffers are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMode {
    #[default]
    Mmap,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryMode::Mmap => write!(f, "mmap"),
        }
    }
}

/// Capture request handed to [`crate::stream::StreamController::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// video device file for the camera
    device: String,

    /// requested width, the negotiated width may differ
    width: u32,

    /// requested height, the negotiated height may differ
    height: u32,

    pixel_format: PixelFormat,

    /// number of buffers to request, the device may grant fewer
    num_buffers: u32,

    memory: MemoryMode,
}

impl DeviceConfig {
    pub fn with_device(self, device: &str) -> DeviceConfig {
        DeviceConfig {
            device: device.to_owned(),
            ..self
        }
    }

    pub fn with_resolution(self, width: u32, height: u32) -> DeviceConfig {
        DeviceConfig {
            width,
            height,
            ..self
        }
    }

    pub fn with_pixel_format(self, pixel_format: PixelFormat) -> DeviceConfig {
        DeviceConfig {
            pixel_format,
            ..self
        }
    }

    pub fn with_buffers(self, num_buffers: u32) -> DeviceConfig {
        DeviceConfig {
            num_buffers,
            ..self
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn num_buffers(&self) -> u32 {
        self.num_buffers
    }

    pub fn memory(&self) -> MemoryMode {
        self.memory
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.device.is_empty() {
            return Err(Error::InvalidConfig("device path is empty".to_owned()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "resolution must be positive: {}x{}",
                self.width, self.height
            )));
        }
        if self.num_buffers == 0 {
            return Err(Error::InvalidConfig(
                "at least one buffer is required".to_owned(),
            ));
        }
        Format::request(self.width, self.height, self.pixel_format)?;
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            device: "/dev/video0".to_owned(),
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Yuyv,
            num_buffers: 3,
            memory: MemoryMode::Mmap,
        }
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {} {} buffers ({})",
            self.device, self.width, self.height, self.pixel_format, self.num_buffers, self.memory
        )
    }
}
