// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors
#![forbid(unsafe_code)]

use core::fmt;

use crate::Error;

/// Four character code as stored by V4L2 (little-endian `u32`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const YUYV: FourCC = FourCC(*b"YUYV");

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        FourCC(val.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        val.to_u32()
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(buf: &[u8; 4]) -> FourCC {
        FourCC(*buf)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for b in self.0 {
                    write!(f, "{}", core::ascii::escape_default(b))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// Pixel layouts that can be requested from a device.
///
/// Only packed YUV 4:2:2 is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::YUYV,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Yuyv => 2,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

/// Format as negotiated with the device.
///
/// The device may adjust any field of a request; these are the values that
/// govern buffer sizes and conversion for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    /// Row stride in bytes; 0 when the device did not report one
    pub bytes_per_line: u32,
    /// Bytes needed for one frame; 0 when the device did not report one
    pub size_image: u32,
}

impl Format {
    /// Format request for the given geometry, with stride and size derived
    /// from the packed layout. Fails when a frame would not fit the 32-bit
    /// size fields of the device interface.
    pub fn request(width: u32, height: u32, pixel_format: PixelFormat) -> Result<Format, Error> {
        let too_large = || {
            Error::InvalidConfig(format!(
                "resolution {}x{} {} is too large",
                width, height, pixel_format
            ))
        };
        let bytes_per_line = width
            .checked_mul(pixel_format.bytes_per_pixel())
            .ok_or_else(too_large)?;
        let size_image = bytes_per_line.checked_mul(height).ok_or_else(too_large)?;

        Ok(Format {
            width,
            height,
            fourcc: pixel_format.fourcc(),
            bytes_per_line,
            size_image,
        })
    }

    /// Row stride, falling back to the packed 4:2:2 stride when the device
    /// left it unset.
    pub fn stride(&self) -> usize {
        if self.bytes_per_line == 0 {
            self.width as usize * 2
        } else {
            self.bytes_per_line as usize
        }
    }

    /// Smallest buffer that holds every visible pixel.
    pub fn min_frame_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.stride() * (self.height as usize - 1) + self.width as usize * 2
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}
