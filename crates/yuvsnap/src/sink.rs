// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! Frame consumers
//!
//! A [`FrameSink`] receives one frame while its buffer is held and must be
//! done reading before it returns; the buffer goes back to the device right
//! after. Closures taking a [`FrameView`] are sinks too:
//!
//! ```
//! use yuvsnap::{sink::{FrameSink, FrameView}, Error};
//!
//! let mut frames = 0;
//! let mut counter = |_: &FrameView<'_>| -> Result<(), Error> {
//!     frames += 1;
//!     Ok(())
//! };
//! # let _ = &mut counter;
//! ```

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};

use crate::{
    fourcc::{FourCC, Format},
    Error,
};

/// Borrowed contents of a held buffer together with its negotiated format.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    data: &'a [u8],
    format: Format,
}

impl<'a> FrameView<'a> {
    pub fn new(data: &'a [u8], format: Format) -> FrameView<'a> {
        FrameView { data, format }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn pixel_format(&self) -> FourCC {
        self.format.fourcc
    }
}

/// Consumer of raw frames.
pub trait FrameSink {
    fn consume(&mut self, frame: &FrameView<'_>) -> Result<(), Error>;
}

impl<F> FrameSink for F
where
    F: FnMut(&FrameView<'_>) -> Result<(), Error>,
{
    fn consume(&mut self, frame: &FrameView<'_>) -> Result<(), Error> {
        self(frame)
    }
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range to RGB.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8, out: &mut [u8]) {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    out[0] = clamp((c + 409 * e + 128) >> 8);
    out[1] = clamp((c - 100 * d - 208 * e + 128) >> 8);
    out[2] = clamp((c + 516 * d + 128) >> 8);
}

/// Converts a packed YUYV frame to tightly packed RGB24.
///
/// Each 4-byte macropixel `Y0 U Y1 V` yields two pixels sharing chroma. The
/// row stride of the frame is honoured, so padded rows are fine.
pub fn yuyv_to_rgb(frame: &FrameView<'_>) -> Result<Vec<u8>, Error> {
    let format = frame.format();
    if format.fourcc != FourCC::YUYV {
        return Err(Error::UnsupportedFormat(format.fourcc));
    }
    if format.width % 2 != 0 {
        return Err(Error::InvalidConfig(format!(
            "YUYV frame width must be even, got {}",
            format.width
        )));
    }

    let expected = format.min_frame_len();
    if frame.data().len() < expected {
        return Err(Error::ShortFrame {
            expected,
            actual: frame.data().len(),
        });
    }

    let width = format.width as usize;
    let stride = format.stride();
    let mut rgb = vec![0u8; width * format.height as usize * 3];

    for (row, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
        let line = &frame.data()[row * stride..row * stride + width * 2];
        for (yuyv, px) in line.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
            ycbcr_to_rgb(yuyv[0], yuyv[1], yuyv[3], &mut px[..3]);
            ycbcr_to_rgb(yuyv[2], yuyv[1], yuyv[3], &mut px[3..]);
        }
    }

    Ok(rgb)
}

/// Writes each consumed frame as a JPEG file, replacing the previous one.
#[derive(Debug, Clone)]
pub struct JpegSink {
    path: PathBuf,
    quality: u8,
}

impl JpegSink {
    pub fn new<P: AsRef<Path>>(path: P) -> JpegSink {
        JpegSink {
            path: path.as_ref().to_path_buf(),
            quality: 90,
        }
    }

    /// JPEG quality, clamped to 1..=100.
    pub fn with_quality(self, quality: u8) -> JpegSink {
        JpegSink {
            quality: quality.clamp(1, 100),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl FrameSink for JpegSink {
    fn consume(&mut self, frame: &FrameView<'_>) -> Result<(), Error> {
        let rgb = yuyv_to_rgb(frame)?;

        let mut writer = BufWriter::new(File::create(&self.path)?);
        JpegEncoder::new_with_quality(&mut writer, self.quality).encode(
            &rgb,
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )?;
        writer.flush()?;

        log::debug!(
            "wrote {} ({}, quality {})",
            self.path.display(),
            frame.format(),
            self.quality
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc::PixelFormat;
    use std::fs;

    fn uniform(width: u32, height: u32, yuyv: [u8; 4]) -> (Vec<u8>, Format) {
        let format = Format::request(width, height, PixelFormat::Yuyv).unwrap();
        let data = yuyv
            .iter()
            .copied()
            .cycle()
            .take(format.size_image as usize)
            .collect();
        (data, format)
    }

    #[test]
    fn test_black_and_white() {
        let (data, format) = uniform(2, 1, [16, 128, 16, 128]);
        let rgb = yuyv_to_rgb(&FrameView::new(&data, format)).unwrap();
        assert_eq!(rgb, vec![0; 6]);

        let (data, format) = uniform(2, 1, [235, 128, 235, 128]);
        let rgb = yuyv_to_rgb(&FrameView::new(&data, format)).unwrap();
        assert_eq!(rgb, vec![255; 6]);
    }

    #[test]
    fn test_chroma_is_shared() {
        // saturated red in BT.601: Y=81 U=90 V=240
        let (data, format) = uniform(2, 1, [81, 90, 81, 240]);
        let rgb = yuyv_to_rgb(&FrameView::new(&data, format)).unwrap();
        assert_eq!(&rgb[..3], &rgb[3..]);
        assert!(rgb[0] > 250, "red channel {}", rgb[0]);
        assert!(rgb[1] < 5 && rgb[2] < 5, "{:?}", &rgb[..3]);
    }

    #[test]
    fn test_padded_rows() {
        let format = Format {
            bytes_per_line: 8,
            size_image: 16,
            ..Format::request(2, 2, PixelFormat::Yuyv).unwrap()
        };
        // second row white, padding bytes would be green garbage if read
        let data = [
            16, 128, 16, 128, 0, 0, 0, 0, //
            235, 128, 235, 128, 0, 0, 0, 0,
        ];
        let rgb = yuyv_to_rgb(&FrameView::new(&data, format)).unwrap();
        assert_eq!(&rgb[..6], &[0; 6]);
        assert_eq!(&rgb[6..], &[255; 6]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let (data, format) = uniform(4, 4, [16, 128, 16, 128]);

        let short = FrameView::new(&data[..10], format);
        assert!(matches!(
            yuyv_to_rgb(&short),
            Err(Error::ShortFrame {
                expected: 32,
                actual: 10
            })
        ));

        let nv12 = Format {
            fourcc: FourCC(*b"NV12"),
            ..format
        };
        assert!(matches!(
            yuyv_to_rgb(&FrameView::new(&data, nv12)),
            Err(Error::UnsupportedFormat(_))
        ));

        let odd = Format { width: 3, ..format };
        assert!(yuyv_to_rgb(&FrameView::new(&data, odd)).is_err());
    }

    #[test]
    fn test_jpeg_sink_writes_file() {
        let path = std::env::temp_dir().join(format!("yuvsnap-sink-{}.jpg", std::process::id()));
        let (data, format) = uniform(16, 8, [120, 100, 140, 160]);

        let mut sink = JpegSink::new(&path).with_quality(150);
        assert_eq!(sink.quality(), 100);
        sink.consume(&FrameView::new(&data, format)).unwrap();

        let jpeg = fs::read(&path).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_closure_sink() {
        let (data, format) = uniform(2, 2, [16, 128, 16, 128]);
        let mut seen = Vec::new();
        let mut sink = |frame: &FrameView<'_>| -> Result<(), Error> {
            seen.push((frame.width(), frame.height(), frame.data().len()));
            Ok(())
        };
        sink.consume(&FrameView::new(&data, format)).unwrap();
        assert_eq!(seen, vec![(2, 2, 8)]);
    }
}
