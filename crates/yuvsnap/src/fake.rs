// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! In-memory capture device
//!
//! [`FakeDriver`] implements the [`Driver`] seam with heap memory standing in
//! for driver buffers. It follows the kernel's rules closely enough to catch
//! protocol mistakes (queuing an unknown or already queued buffer, requesting
//! buffers while mappings are live) and counts every open, map, unmap and
//! close so tests can check that resources balance out.
//!
//! Failures are scripted through [`Script`]. The script lives behind the
//! driver's shared state, so a test can change it after the device has been
//! opened:
//!
//! ```
//! use yuvsnap::{config::DeviceConfig, fake::FakeDriver, stream::StreamController};
//!
//! let fake = FakeDriver::new().grant_buffers(1);
//! let mut camera = StreamController::with_driver(fake.clone());
//! camera.configure(&DeviceConfig::default().with_device("/dev/fake0"))?;
//! assert_eq!(camera.pool_size(), 1);
//!
//! fake.update(|script| script.fail_stream_on = true);
//! assert!(camera.stream_on().is_err());
//! assert_eq!(fake.stats().live_mappings, 0);
//! # Ok::<(), yuvsnap::Error>(())
//! ```
//!
//! Waits never block: a wait with nothing queued reports a timeout at once.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    ptr::{self, NonNull},
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use unix_ts::Timestamp;
use v4l::v4l_sys as sys;

use crate::{
    backend::{BufferGeometry, Capabilities, DeviceHandle, Dequeued, Driver, Region},
    fourcc::{FourCC, Format},
};

const PAGE_SIZE: usize = 4096;

/// Scripted behaviour of the fake device.
#[derive(Debug, Clone)]
pub struct Script {
    /// `open` fails with `NotFound`
    pub refuse_open: bool,
    /// advertise `V4L2_CAP_STREAMING`
    pub streaming: bool,
    /// geometry the device substitutes for any request
    pub geometry: Option<(u32, u32)>,
    /// pixel format the device substitutes for any request
    pub fourcc: Option<FourCC>,
    pub reject_format: bool,
    /// upper bound on granted buffers
    pub grant: Option<u32>,
    pub reject_buffer_request: bool,
    pub fail_map_at: Option<u32>,
    pub fail_queue_at: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_stream_off: bool,
    pub fail_dequeue: bool,
    /// dequeued buffers report zero bytes used
    pub empty_frames: bool,
    /// no frame ever becomes ready
    pub stall: bool,
    /// number of upcoming waits that report `Interrupted`
    pub interrupt_waits: u32,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            refuse_open: false,
            streaming: true,
            geometry: None,
            fourcc: None,
            reject_format: false,
            grant: None,
            reject_buffer_request: false,
            fail_map_at: None,
            fail_queue_at: None,
            fail_stream_on: false,
            fail_stream_off: false,
            fail_dequeue: false,
            empty_frames: false,
            stall: false,
            interrupt_waits: 0,
        }
    }
}

/// Call accounting of the fake device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub opens: usize,
    pub closes: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub live_mappings: usize,
    /// Buffer indices in the order they were successfully queued
    pub queue_log: Vec<u32>,
    pub stream_on_calls: usize,
    pub stream_off_calls: usize,
    pub streaming: bool,
    /// Buffer count granted by the last request
    pub granted: u32,
}

impl FakeStats {
    pub fn open_handles(&self) -> usize {
        self.opens - self.closes
    }
}

#[derive(Debug)]
struct FakeBuffer {
    length: usize,
    memory: Option<NonNull<u8>>,
    queued: bool,
}

#[derive(Debug, Default)]
struct Inner {
    script: Script,
    stats: FakeStats,
    format: Option<Format>,
    buffers: Vec<FakeBuffer>,
    incoming: VecDeque<u32>,
    sequence: u32,
}

/// Driver for the in-memory device. Clones share the same device.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    inner: Rc<RefCell<Inner>>,
}

impl FakeDriver {
    pub fn new() -> FakeDriver {
        FakeDriver::default()
    }

    /// Changes the script of a live device.
    pub fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.inner.borrow_mut().script);
    }

    pub fn stats(&self) -> FakeStats {
        self.inner.borrow().stats.clone()
    }

    /// Indices currently queued on the device, in fill order.
    pub fn queued(&self) -> Vec<u32> {
        self.inner.borrow().incoming.iter().copied().collect()
    }

    pub fn refuse_open(self) -> FakeDriver {
        self.update(|s| s.refuse_open = true);
        self
    }

    pub fn without_streaming(self) -> FakeDriver {
        self.update(|s| s.streaming = false);
        self
    }

    pub fn with_geometry(self, width: u32, height: u32) -> FakeDriver {
        self.update(|s| s.geometry = Some((width, height)));
        self
    }

    pub fn with_fourcc(self, fourcc: FourCC) -> FakeDriver {
        self.update(|s| s.fourcc = Some(fourcc));
        self
    }

    pub fn reject_format(self) -> FakeDriver {
        self.update(|s| s.reject_format = true);
        self
    }

    pub fn grant_buffers(self, count: u32) -> FakeDriver {
        self.update(|s| s.grant = Some(count));
        self
    }

    pub fn reject_buffer_request(self) -> FakeDriver {
        self.update(|s| s.reject_buffer_request = true);
        self
    }

    pub fn fail_map_at(self, index: u32) -> FakeDriver {
        self.update(|s| s.fail_map_at = Some(index));
        self
    }

    pub fn fail_queue_at(self, index: u32) -> FakeDriver {
        self.update(|s| s.fail_queue_at = Some(index));
        self
    }

    pub fn fail_stream_on(self) -> FakeDriver {
        self.update(|s| s.fail_stream_on = true);
        self
    }

    pub fn fail_stream_off(self) -> FakeDriver {
        self.update(|s| s.fail_stream_off = true);
        self
    }

    pub fn fail_dequeue(self) -> FakeDriver {
        self.update(|s| s.fail_dequeue = true);
        self
    }

    pub fn empty_frames(self) -> FakeDriver {
        self.update(|s| s.empty_frames = true);
        self
    }

    pub fn stall(self) -> FakeDriver {
        self.update(|s| s.stall = true);
        self
    }

    pub fn interrupt_waits(self, count: u32) -> FakeDriver {
        self.update(|s| s.interrupt_waits = count);
        self
    }
}

impl Driver for FakeDriver {
    type Handle = FakeHandle;

    fn open(&self, path: &str) -> io::Result<FakeHandle> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.refuse_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such fake device", path),
            ));
        }

        inner.stats.opens += 1;
        Ok(FakeHandle {
            inner: Rc::clone(&self.inner),
            path: path.to_owned(),
        })
    }
}

/// Open handle on the in-memory device.
#[derive(Debug)]
pub struct FakeHandle {
    inner: Rc<RefCell<Inner>>,
    path: String,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Luma ramp across each row, neutral chroma.
fn fill_pattern(memory: NonNull<u8>, length: usize, format: &Format) -> usize {
    let stride = format.stride();
    let used = (stride * format.height as usize).min(length);

    // SAFETY: `memory` is a live allocation of `length` bytes owned by the
    // fake and not borrowed by anyone while the buffer is queued.
    let data = unsafe { std::slice::from_raw_parts_mut(memory.as_ptr(), used) };
    for (row, line) in data.chunks_mut(stride).enumerate() {
        for (i, byte) in line.iter_mut().enumerate() {
            *byte = if i % 2 == 0 {
                let x = i / 2;
                ((x * 219 / format.width.max(1) as usize) + 16 + row % 2) as u8
            } else {
                128
            };
        }
    }
    used
}

impl DeviceHandle for FakeHandle {
    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        let inner = self.inner.borrow();
        let mut flags = sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_READWRITE;
        if inner.script.streaming {
            flags |= sys::V4L2_CAP_STREAMING;
        }

        Ok(Capabilities {
            driver: "fake".to_owned(),
            card: format!("Fake camera ({})", self.path),
            bus_info: "platform:fake".to_owned(),
            version: 0x0001_0000,
            flags,
        })
    }

    fn set_format(&mut self, requested: &Format) -> io::Result<Format> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.reject_format {
            return Err(errno(libc::EINVAL));
        }
        if !inner.buffers.is_empty() {
            return Err(errno(libc::EBUSY));
        }

        let (width, height) = inner
            .script
            .geometry
            .unwrap_or((requested.width, requested.height));
        let bytes_per_line = width * 2;
        let format = Format {
            width,
            height,
            fourcc: inner.script.fourcc.unwrap_or(requested.fourcc),
            bytes_per_line,
            size_image: bytes_per_line * height,
        };

        inner.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.reject_buffer_request {
            return Err(errno(libc::ENOMEM));
        }
        if inner.buffers.iter().any(|b| b.memory.is_some()) {
            return Err(errno(libc::EBUSY));
        }
        let format = inner.format.ok_or_else(|| errno(libc::EINVAL))?;

        let granted = inner.script.grant.map_or(count, |g| g.min(count));
        inner.buffers = (0..granted)
            .map(|_| FakeBuffer {
                length: format.size_image as usize,
                memory: None,
                queued: false,
            })
            .collect();
        inner.incoming.clear();
        inner.stats.granted = granted;
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferGeometry> {
        let inner = self.inner.borrow();
        let buffer = inner
            .buffers
            .get(index as usize)
            .ok_or_else(|| errno(libc::EINVAL))?;

        let slot = (buffer.length + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        Ok(BufferGeometry {
            index,
            length: buffer.length,
            offset: (index as usize * slot) as u32,
        })
    }

    fn map(&mut self, geometry: &BufferGeometry) -> io::Result<Region> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.fail_map_at == Some(geometry.index) {
            return Err(errno(libc::ENOMEM));
        }

        let buffer = inner
            .buffers
            .get_mut(geometry.index as usize)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if buffer.memory.is_some() || geometry.length != buffer.length || buffer.length == 0 {
            return Err(errno(libc::EINVAL));
        }

        let memory = Box::into_raw(vec![0u8; buffer.length].into_boxed_slice());
        let ptr = NonNull::new(memory.cast::<u8>()).ok_or_else(|| errno(libc::ENOMEM))?;
        buffer.memory = Some(ptr);

        inner.stats.maps += 1;
        inner.stats.live_mappings += 1;

        // SAFETY: the allocation lives until unmap() reclaims it.
        Ok(unsafe { Region::from_raw_parts(ptr, geometry.length) })
    }

    fn unmap(&mut self, region: Region) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let buffer = inner
            .buffers
            .iter_mut()
            .find(|b| b.memory.map(NonNull::as_ptr) == Some(region.as_ptr()))
            .ok_or_else(|| errno(libc::EINVAL))?;

        if let Some(memory) = buffer.memory.take() {
            // SAFETY: reclaims the boxed slice leaked in map(), exactly once.
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(
                    memory.as_ptr(),
                    buffer.length,
                ))
            });
        }
        buffer.queued = false;

        inner.stats.unmaps += 1;
        inner.stats.live_mappings -= 1;
        Ok(())
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.fail_queue_at == Some(index) {
            return Err(errno(libc::EIO));
        }

        let buffer = inner
            .buffers
            .get_mut(index as usize)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if buffer.queued || buffer.memory.is_none() {
            return Err(errno(libc::EINVAL));
        }
        buffer.queued = true;

        inner.incoming.push_back(index);
        inner.stats.queue_log.push(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Dequeued> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.fail_dequeue {
            return Err(errno(libc::EIO));
        }
        if !inner.stats.streaming {
            return Err(errno(libc::EINVAL));
        }

        let index = inner
            .incoming
            .pop_front()
            .ok_or_else(|| errno(libc::EAGAIN))?;
        let format = inner.format.ok_or_else(|| errno(libc::EINVAL))?;

        let buffer = &mut inner.buffers[index as usize];
        buffer.queued = false;
        let filled = match buffer.memory {
            Some(memory) => fill_pattern(memory, buffer.length, &format),
            None => 0,
        };
        let bytes_used = if inner.script.empty_frames { 0 } else { filled };

        inner.sequence += 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Ok(Dequeued {
            index,
            bytes_used,
            sequence: inner.sequence - 1,
            timestamp: Timestamp::new(now.as_secs() as i64, now.subsec_nanos()),
        })
    }

    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        let mut inner = self.inner.borrow_mut();
        if inner.script.interrupt_waits > 0 {
            inner.script.interrupt_waits -= 1;
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }

        Ok(inner.stats.streaming && !inner.script.stall && !inner.incoming.is_empty())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.stats.stream_on_calls += 1;
        if inner.script.fail_stream_on {
            return Err(errno(libc::EIO));
        }

        inner.stats.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.stats.stream_off_calls += 1;
        if inner.script.fail_stream_off {
            return Err(errno(libc::EIO));
        }

        // the driver hands every queued buffer back
        inner.stats.streaming = false;
        inner.incoming.clear();
        for buffer in inner.buffers.iter_mut() {
            buffer.queued = false;
        }
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.stats.closes += 1;
        inner.stats.streaming = false;
        inner.incoming.clear();
        inner.format = None;
        if inner.stats.live_mappings == 0 {
            inner.buffers.clear();
        }
        Ok(())
    }
}
