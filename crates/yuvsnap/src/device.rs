// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

use std::io;

use crate::{
    backend::{Capabilities, DeviceHandle, Driver},
    fourcc::{Format, PixelFormat},
    Error,
};

/// An open capture device and what has been negotiated with it.
#[derive(Debug)]
pub struct CaptureDevice<H: DeviceHandle> {
    handle: H,
    path: String,
    capabilities: Option<Capabilities>,
    format: Option<Format>,
}

impl<H: DeviceHandle> CaptureDevice<H> {
    pub fn open<D>(driver: &D, path: &str) -> Result<Self, Error>
    where
        D: Driver<Handle = H>,
    {
        let handle = driver.open(path).map_err(|source| Error::CannotOpen {
            path: path.into(),
            source,
        })?;
        log::info!("{}: opened", path);

        Ok(CaptureDevice {
            handle,
            path: path.to_owned(),
            capabilities: None,
            format: None,
        })
    }

    /// Queries identity and capabilities, failing unless the device can
    /// stream.
    pub fn query_capabilities(&mut self) -> Result<&Capabilities, Error> {
        // a node that can not answer QUERYCAP is not a usable capture device
        let caps = self.handle.query_capabilities().map_err(|source| {
            log::debug!("{}: capability query failed: {}", self.path, source);
            Error::StreamingUnsupported(self.path.clone().into())
        })?;

        if !caps.supports_streaming() {
            log::error!("{}: not capable of streaming", self.path);
            return Err(Error::StreamingUnsupported(self.path.clone().into()));
        }
        log::info!(
            "{}: {} ({}) capable of streaming",
            self.path,
            caps.card,
            caps.driver
        );

        Ok(self.capabilities.insert(caps))
    }

    /// Negotiates the capture format.
    ///
    /// The device may substitute the geometry or stride of the request, and
    /// the returned format is authoritative and kept for
    /// [`CaptureDevice::format`]. A substituted pixel format is rejected with
    /// [`Error::FormatRejected`]: frames are only ever read as packed 4:2:2.
    pub fn set_format(
        &mut self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> Result<Format, Error> {
        let requested = Format::request(width, height, pixel_format)?;
        let actual = self
            .handle
            .set_format(&requested)
            .map_err(Error::FormatRejected)?;

        if actual.fourcc != requested.fourcc {
            log::error!(
                "{}: requested {} but device only offers {}",
                self.path,
                requested.fourcc,
                actual.fourcc
            );
            return Err(Error::FormatRejected(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("device substituted {} for {}", actual.fourcc, requested.fourcc),
            )));
        }

        if actual.width != width || actual.height != height {
            log::warn!(
                "{}: requested {} but device selected {}",
                self.path,
                requested,
                actual
            );
        } else {
            log::debug!("{}: format {}", self.path, actual);
        }

        self.format = Some(actual);
        Ok(actual)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub(crate) fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Closes the handle. Any buffer pool allocated on it must already be
    /// released.
    pub fn close(self) -> Result<(), Error> {
        let path = self.path;
        self.handle.close()?;
        log::debug!("{}: closed", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake::FakeDriver, fourcc::FourCC};

    #[test]
    fn test_open_failure() {
        let fake = FakeDriver::new().refuse_open();
        let err = CaptureDevice::open(&fake, "/dev/fake0").unwrap_err();
        assert!(matches!(err, Error::CannotOpen { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Unavailable);
    }

    #[test]
    fn test_streaming_required() {
        let fake = FakeDriver::new().without_streaming();
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let err = device.query_capabilities().unwrap_err();
        assert!(matches!(err, Error::StreamingUnsupported(_)));
        assert!(device.capabilities().is_none());
        device.close().unwrap();
    }

    #[test]
    fn test_capabilities() {
        let fake = FakeDriver::new();
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let caps = device.query_capabilities().unwrap();
        assert_eq!(caps.driver, "fake");
        assert!(caps.supports_capture());
        assert!(device.capabilities().is_some());
        device.close().unwrap();
        assert_eq!(fake.stats().open_handles(), 0);
    }

    #[test]
    fn test_device_adjusts_format() {
        let fake = FakeDriver::new().with_geometry(320, 240);
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let format = device.set_format(640, 480, PixelFormat::Yuyv).unwrap();
        assert_eq!((format.width, format.height), (320, 240));
        assert_eq!(format.fourcc, FourCC::YUYV);
        assert_eq!(device.format(), Some(format));
        device.close().unwrap();
    }

    #[test]
    fn test_substituted_pixel_format_rejected() {
        let fake = FakeDriver::new().with_fourcc(FourCC(*b"MJPG"));
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let err = device.set_format(640, 480, PixelFormat::Yuyv).unwrap_err();
        assert!(matches!(err, Error::FormatRejected(_)));
        assert_eq!(err.kind(), crate::ErrorKind::NegotiationFailed);
        assert!(err.to_string().contains("MJPG"));
        assert!(device.format().is_none());
        device.close().unwrap();
    }

    #[test]
    fn test_oversized_request() {
        let fake = FakeDriver::new();
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let err = device.set_format(70000, 70000, PixelFormat::Yuyv).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        device.close().unwrap();
        assert_eq!(fake.stats().open_handles(), 0);
    }

    #[test]
    fn test_format_rejected() {
        let fake = FakeDriver::new().reject_format();
        let mut device = CaptureDevice::open(&fake, "/dev/fake0").unwrap();

        let err = device.set_format(640, 480, PixelFormat::Yuyv).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NegotiationFailed);
        assert!(device.format().is_none());
        device.close().unwrap();
    }
}
