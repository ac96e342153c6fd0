// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! Device backend seam
//!
//! Every interaction with a capture device goes through [`Driver`] and
//! [`DeviceHandle`]. The V4L2 implementation lives in [`crate::v4l2`]; the
//! in-memory implementation in [`crate::fake`] lets the buffer-pool and
//! streaming logic be exercised without hardware.
//!
//! Handles are plain `io::Result` adapters. Classification into
//! [`crate::Error`] variants happens one level up, in the pool, device and
//! stream modules, where the meaning of a failure is known.

use std::{fmt, io, ptr::NonNull, slice, time::Duration};

use unix_ts::Timestamp;
use v4l::v4l_sys as sys;

use crate::fourcc::Format;

/// Opens device handles.
pub trait Driver {
    type Handle: DeviceHandle;

    fn open(&self, path: &str) -> io::Result<Self::Handle>;
}

/// An open capture device.
pub trait DeviceHandle {
    fn query_capabilities(&mut self) -> io::Result<Capabilities>;

    /// Applies `requested` and returns the format the device settled on.
    fn set_format(&mut self, requested: &Format) -> io::Result<Format>;

    /// Requests `count` memory-mapped buffers, returning the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferGeometry>;

    fn map(&mut self, geometry: &BufferGeometry) -> io::Result<Region>;

    fn unmap(&mut self, region: Region) -> io::Result<()>;

    fn queue(&mut self, index: u32) -> io::Result<()>;

    fn dequeue(&mut self) -> io::Result<Dequeued>;

    /// Blocks until a filled buffer can be dequeued or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. A wait disturbed by a signal returns
    /// an error of kind [`io::ErrorKind::Interrupted`].
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    fn close(self) -> io::Result<()>;
}

/// Device identity and capability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    /// Capability flags of the opened node (`V4L2_CAP_*`)
    pub flags: u32,
}

impl Capabilities {
    pub fn supports_streaming(&self) -> bool {
        self.flags & sys::V4L2_CAP_STREAMING != 0
    }

    pub fn supports_capture(&self) -> bool {
        self.flags & sys::V4L2_CAP_VIDEO_CAPTURE != 0
    }

    /// Names of the capability flags this crate knows about.
    pub fn flag_names(&self) -> Vec<&'static str> {
        [
            (sys::V4L2_CAP_VIDEO_CAPTURE, "video-capture"),
            (sys::V4L2_CAP_READWRITE, "readwrite"),
            (sys::V4L2_CAP_STREAMING, "streaming"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.flags & flag != 0)
        .map(|(_, name)| name)
        .collect()
    }

    /// Kernel-style `major.minor.patch` version string.
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }
}

/// Length and mmap offset of one device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    pub index: u32,
    pub length: usize,
    pub offset: u32,
}

/// Metadata of a dequeued buffer.
#[derive(Debug, Clone)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

/// A memory region shared with the device.
///
/// A region does not unmap itself; it has to be handed back to the
/// [`DeviceHandle`] that produced it.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

impl Region {
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid and readable until the
    /// region is passed to [`DeviceHandle::unmap`].
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Region {
        Region { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The device must not be writing to the region for the lifetime of the
    /// returned slice, i.e. the owning buffer has to be dequeued.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: validity of ptr/len is guaranteed by from_raw_parts, and
        // exclusion of device writes by the caller.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({:?}, {} bytes)", self.ptr, self.len)
    }
}
