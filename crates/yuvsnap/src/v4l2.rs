// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! V4L2 capture backend
//!
//! Single-planar `V4L2_BUF_TYPE_VIDEO_CAPTURE` with `V4L2_MEMORY_MMAP`
//! buffers. The node is opened non-blocking: readiness is waited for with
//! `poll(2)` so the wait honours a timeout, and `VIDIOC_DQBUF` never blocks.
//!
//! Kernel structures and request codes come from the generated bindings
//! re-exported by the `v4l` crate; buffer bookkeeping stays in
//! [`crate::pool`].

use std::{
    ffi::{c_int, c_void},
    fs::OpenOptions,
    io, mem,
    os::{
        fd::{AsRawFd, IntoRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    ptr::{self, NonNull},
    time::Duration,
};

use unix_ts::Timestamp;
use v4l::{
    buffer::Type,
    memory::Memory,
    v4l2::{self, vidioc},
    v4l_sys as sys,
};

use crate::{
    backend::{BufferGeometry, Capabilities, DeviceHandle, Dequeued, Driver, Region},
    fourcc::{FourCC, Format},
};

/// Opens `/dev/video*` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Driver;

impl Driver for V4l2Driver {
    type Handle = V4l2Handle;

    fn open(&self, path: &str) -> io::Result<V4l2Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        Ok(V4l2Handle {
            fd: OwnedFd::from(file),
        })
    }
}

/// An open V4L2 device node.
#[derive(Debug)]
pub struct V4l2Handle {
    fd: OwnedFd,
}

impl V4l2Handle {
    /// Issues `request`, retrying when a signal interrupts the call.
    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        loop {
            // SAFETY: `arg` is the structure `request` was encoded for and
            // stays borrowed for the duration of the call.
            let result = unsafe {
                v4l2::ioctl(self.fd.as_raw_fd(), request, (arg as *mut T).cast::<c_void>())
            };
            match result {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    fn capture_buffer(index: u32) -> sys::v4l2_buffer {
        sys::v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: all-zero is a valid bit pattern for the plain C struct.
            ..unsafe { mem::zeroed() }
        }
    }
}

/// Poll timeout in whole milliseconds, rounded up so a short wait still
/// waits.
fn poll_millis(timeout: Duration) -> u128 {
    (timeout.as_micros() + 999) / 1000
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl DeviceHandle for V4l2Handle {
    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        // SAFETY: all-zero is a valid bit pattern for the plain C struct.
        let mut cap: sys::v4l2_capability = unsafe { mem::zeroed() };
        self.ioctl(vidioc::VIDIOC_QUERYCAP, &mut cap)?;

        // device_caps describes the opened node, capabilities the whole device
        let flags = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };

        Ok(Capabilities {
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            bus_info: c_string(&cap.bus_info),
            version: cap.version,
            flags,
        })
    }

    fn set_format(&mut self, requested: &Format) -> io::Result<Format> {
        // field 0 is V4L2_FIELD_ANY
        // SAFETY: all-zero is a valid bit pattern for the plain C structs.
        let pix = sys::v4l2_pix_format {
            width: requested.width,
            height: requested.height,
            pixelformat: requested.fourcc.to_u32(),
            ..unsafe { mem::zeroed() }
        };
        let mut fmt = sys::v4l2_format {
            type_: Type::VideoCapture as u32,
            ..unsafe { mem::zeroed() }
        };
        fmt.fmt.pix = pix;

        self.ioctl(vidioc::VIDIOC_S_FMT, &mut fmt)?;

        // SAFETY: the driver fills the `pix` member for capture buffer types.
        let pix = unsafe { fmt.fmt.pix };
        Ok(Format {
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from(pix.pixelformat),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = sys::v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: all-zero is a valid bit pattern for the plain C struct.
            ..unsafe { mem::zeroed() }
        };
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferGeometry> {
        let mut buf = Self::capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf)?;

        Ok(BufferGeometry {
            index,
            length: buf.length as usize,
            // SAFETY: `offset` is the member used for MMAP buffers.
            offset: unsafe { buf.m.offset },
        })
    }

    fn map(&mut self, geometry: &BufferGeometry) -> io::Result<Region> {
        if geometry.length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer {} has zero length", geometry.index),
            ));
        }

        // SAFETY: a fresh shared mapping of the device at the offset the
        // driver handed out for this buffer; nothing aliases it yet.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                geometry.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                geometry.offset as _,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        // SAFETY: the mapping stays valid until unmap() below.
        Ok(unsafe { Region::from_raw_parts(ptr, geometry.length) })
    }

    fn unmap(&mut self, region: Region) -> io::Result<()> {
        // SAFETY: the region was produced by map() and is unmapped only once,
        // since unmap() takes it by value.
        unsafe { v4l2::munmap(region.as_ptr().cast(), region.len()) }
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        let mut buf = Self::capture_buffer(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;

        if buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0 {
            log::debug!("buffer {} dequeued with error flag", buf.index);
        }

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp: Timestamp::new(
                buf.timestamp.tv_sec as i64,
                (buf.timestamp.tv_usec as u32).saturating_mul(1000),
            ),
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = c_int::try_from(poll_millis(timeout)).unwrap_or(c_int::MAX);

        // SAFETY: one valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        match ret {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ if pfd.revents & libc::POLLIN != 0 => Ok(true),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("device poll error (revents 0x{:x})", pfd.revents),
            )),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut type_ = Type::VideoCapture as c_int;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut type_)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut type_ = Type::VideoCapture as c_int;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut type_)
    }

    fn close(self) -> io::Result<()> {
        let fd = self.fd.into_raw_fd();
        // SAFETY: ownership of fd was just released from OwnedFd.
        if unsafe { libc::close(fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
