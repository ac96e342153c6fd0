// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! Streaming state machine
//!
//! ```text
//!              configure            stream_on
//! Unconfigured ─────────► Configured ─────────► Streaming
//!      ▲                   │    ▲                  │
//!      └──── teardown ─────┘    └──── stream_off ──┘
//! ```
//!
//! While streaming, every buffer in rotation is either queued on the device
//! or held by the caller through a [`FrameHandle`]. A handle is consumed by
//! [`StreamController::release_frame`], and it stops being valid as soon as
//! the controller leaves the stream it came from.

use std::{fmt, io, time::Duration};

use unix_ts::Timestamp;

use crate::{
    backend::{Capabilities, DeviceHandle, Driver},
    config::DeviceConfig,
    device::CaptureDevice,
    fourcc::Format,
    pool::{BufferPool, BufferState},
    sink::{FrameSink, FrameView},
    v4l2::V4l2Driver,
    Error, ErrorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconfigured,
    Configured,
    Streaming,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamState::Unconfigured => write!(f, "unconfigured"),
            StreamState::Configured => write!(f, "configured"),
            StreamState::Streaming => write!(f, "streaming"),
        }
    }
}

/// A dequeued buffer held by the caller.
///
/// The handle is not `Clone`; giving it back with
/// [`StreamController::release_frame`] consumes it.
#[must_use = "a held frame must be released or the buffer is lost to the stream"]
#[derive(Debug)]
pub struct FrameHandle {
    index: u32,
    epoch: u64,
    format: Format,
    bytes_used: usize,
    sequence: u32,
    timestamp: Timestamp,
}

impl FrameHandle {
    /// Device index of the held buffer
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Negotiated format, which may differ from the one requested.
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    /// Bytes written by the device, 0 when the driver does not say.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "frame {} in buffer {} ({}, {} bytes)",
            self.sequence, self.index, self.format, self.bytes_used
        )
    }
}

/// Resources that exist between configure and teardown.
#[derive(Debug)]
struct Session<H: DeviceHandle> {
    device: CaptureDevice<H>,
    pool: BufferPool,
    format: Format,
    config: DeviceConfig,
}

impl<H: DeviceHandle> Session<H> {
    /// Queues every buffer in rotation and enables the stream.
    fn start(&mut self) -> Result<(), Error> {
        let handle = self.device.handle_mut();

        for index in 0..self.pool.len() as u32 {
            if let Err(source) = handle.queue(index) {
                if index == 0 {
                    return Err(Error::StreamOnFailed(source));
                }
                log::warn!("cannot queue buffer {}: {}", index, source);
                self.pool.truncate(index as usize);
                break;
            }
            self.pool
                .transition(index, BufferState::Free, BufferState::Queued);
        }

        if let Err(source) = handle.stream_on() {
            // reclaim whatever made it into the queue
            if let Err(err) = handle.stream_off() {
                log::warn!(
                    "{}: stream off after failed stream on: {}",
                    self.config.device(),
                    err
                );
            }
            return Err(Error::StreamOnFailed(source));
        }
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration, epoch: u64) -> Result<FrameHandle, Error> {
        let handle = self.device.handle_mut();

        match handle.wait_readable(timeout) {
            Ok(true) => {}
            Ok(false) => return Err(Error::Timeout(timeout)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Err(Error::Interrupted),
            Err(err) => return Err(Error::DequeueFailed(err)),
        }

        let dequeued = match handle.dequeue() {
            Ok(dequeued) => dequeued,
            // readiness without a frame, e.g. a dropped frame
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(Error::Timeout(timeout))
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Err(Error::Interrupted),
            Err(err) => return Err(Error::DequeueFailed(err)),
        };

        if !self
            .pool
            .transition(dequeued.index, BufferState::Queued, BufferState::Held)
        {
            return Err(Error::DequeueFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("device returned buffer {} which was not queued", dequeued.index),
            )));
        }

        log::trace!(
            "frame {} in buffer {} ({} bytes)",
            dequeued.sequence,
            dequeued.index,
            dequeued.bytes_used
        );

        Ok(FrameHandle {
            index: dequeued.index,
            epoch,
            format: self.format,
            bytes_used: dequeued.bytes_used,
            sequence: dequeued.sequence,
            timestamp: dequeued.timestamp,
        })
    }
}

/// Drives one capture device through its streaming lifecycle.
///
/// The controller owns the device handle and every mapping for as long as it
/// is configured. Dropping it tears everything down.
pub struct StreamController<D: Driver = V4l2Driver> {
    driver: D,
    state: StreamState,
    session: Option<Session<D::Handle>>,
    /// bumped whenever outstanding frame handles must stop being honoured
    epoch: u64,
}

impl StreamController<V4l2Driver> {
    pub fn new() -> Self {
        StreamController::with_driver(V4l2Driver)
    }
}

impl Default for StreamController<V4l2Driver> {
    fn default() -> Self {
        StreamController::new()
    }
}

impl<D: Driver> StreamController<D> {
    pub fn with_driver(driver: D) -> Self {
        StreamController {
            driver,
            state: StreamState::Unconfigured,
            session: None,
            epoch: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Configuration accepted by the last successful configure.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.session.as_ref().map(|s| &s.config)
    }

    /// Negotiated format.
    pub fn format(&self) -> Option<Format> {
        self.session.as_ref().map(|s| s.format)
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.session.as_ref().and_then(|s| s.device.capabilities())
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.session.as_ref().map(|s| &s.pool)
    }

    /// Buffers in rotation, 0 while unconfigured.
    pub fn pool_size(&self) -> usize {
        self.pool().map_or(0, BufferPool::len)
    }

    fn require(&self, operation: &'static str, state: StreamState) -> Result<(), Error> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn session_mut(&mut self, operation: &'static str) -> Result<&mut Session<D::Handle>, Error> {
        let state = self.state;
        self.session
            .as_mut()
            .ok_or(Error::InvalidState { operation, state })
    }

    /// Opens the device, negotiates the format and maps the buffer pool.
    ///
    /// Returns the negotiated format. On failure everything acquired so far
    /// is released and the controller stays unconfigured.
    pub fn configure(&mut self, config: &DeviceConfig) -> Result<Format, Error> {
        self.require("configure", StreamState::Unconfigured)?;
        config.validate()?;

        let mut device = CaptureDevice::open(&self.driver, config.device())?;
        let prepared = Self::prepare(&mut device, config);

        let (format, pool) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Err(close_err) = device.close() {
                    log::warn!("{}: close after failed configure: {}", config.device(), close_err);
                }
                return Err(err);
            }
        };

        log::info!("{}: configured {} with {} buffers", config.device(), format, pool.len());
        self.session = Some(Session {
            device,
            pool,
            format,
            config: config.clone(),
        });
        self.state = StreamState::Configured;
        self.epoch += 1;
        Ok(format)
    }

    fn prepare(
        device: &mut CaptureDevice<D::Handle>,
        config: &DeviceConfig,
    ) -> Result<(Format, BufferPool), Error> {
        device.query_capabilities()?;
        let format = device.set_format(config.width(), config.height(), config.pixel_format())?;
        let pool = BufferPool::allocate(device.handle_mut(), config.num_buffers())?;
        Ok((format, pool))
    }

    /// Queues every buffer and starts streaming.
    ///
    /// When the device refuses a buffer part way through, streaming starts
    /// with the buffers queued so far. Any other failure tears the controller
    /// down.
    pub fn stream_on(&mut self) -> Result<(), Error> {
        self.require("stream_on", StreamState::Configured)?;

        let session = self.session_mut("stream_on")?;
        if let Err(err) = session.start() {
            self.abort();
            return Err(err);
        }

        log::info!("{}: stream on", self.device_path());
        self.state = StreamState::Streaming;
        self.epoch += 1;
        Ok(())
    }

    /// Waits up to `timeout` for a filled buffer and takes it off the device.
    ///
    /// Fails with [`Error::AllBuffersHeld`] at once when nothing is queued.
    /// Timeouts and interrupted waits leave the controller as it was; a
    /// failed dequeue tears it down.
    pub fn acquire_frame(&mut self, timeout: Duration) -> Result<FrameHandle, Error> {
        self.require("acquire_frame", StreamState::Streaming)?;

        let epoch = self.epoch;
        let session = self.session_mut("acquire_frame")?;
        if session.pool.count(BufferState::Queued) == 0 {
            return Err(Error::AllBuffersHeld(session.pool.len()));
        }

        match session.next_frame(timeout, epoch) {
            Err(err) if err.kind() == ErrorKind::ProtocolFailure => {
                self.abort();
                Err(err)
            }
            result => result,
        }
    }

    /// Contents of the buffer behind `frame`, trimmed to the bytes the
    /// device reported.
    pub fn frame_data(&self, frame: &FrameHandle) -> Result<&[u8], Error> {
        let data = self
            .session
            .as_ref()
            .filter(|_| frame.epoch == self.epoch && self.state == StreamState::Streaming)
            .and_then(|session| session.pool.view(frame.index))
            .ok_or(Error::StaleFrame(frame.index))?;

        if frame.bytes_used == 0 {
            Ok(data)
        } else {
            Ok(&data[..frame.bytes_used.min(data.len())])
        }
    }

    /// Hands the buffer back to the device.
    pub fn release_frame(&mut self, frame: FrameHandle) -> Result<(), Error> {
        let index = frame.index;
        if frame.epoch != self.epoch || self.state != StreamState::Streaming {
            return Err(Error::StaleFrame(index));
        }

        let session = self.session_mut("release_frame")?;
        if session.pool.state(index) != Some(BufferState::Held) {
            return Err(Error::StaleFrame(index));
        }

        if let Err(source) = session.device.handle_mut().queue(index) {
            self.abort();
            return Err(Error::QueueFailed { index, source });
        }
        session
            .pool
            .transition(index, BufferState::Held, BufferState::Queued);
        Ok(())
    }

    /// Acquires one frame, passes it to `sink` and releases it.
    ///
    /// The buffer is handed back even when the sink fails. Returns the frame
    /// sequence number.
    pub fn capture<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<u32, Error>
    where
        S: FrameSink + ?Sized,
    {
        let frame = self.acquire_frame(timeout)?;
        let sequence = frame.sequence();

        let consumed = self
            .frame_data(&frame)
            .and_then(|data| sink.consume(&FrameView::new(data, frame.format())));
        self.release_frame(frame)?;

        consumed.map(|()| sequence)
    }

    /// Stops streaming. Every buffer returns to the pool and outstanding
    /// frame handles become stale.
    ///
    /// If the device refuses, the controller keeps streaming.
    pub fn stream_off(&mut self) -> Result<(), Error> {
        self.require("stream_off", StreamState::Streaming)?;

        let session = self.session_mut("stream_off")?;
        session
            .device
            .handle_mut()
            .stream_off()
            .map_err(Error::StreamOffFailed)?;
        session.pool.reset();

        log::info!("{}: stream off", self.device_path());
        self.state = StreamState::Configured;
        self.epoch += 1;
        Ok(())
    }

    /// Unmaps the pool and closes the device from any state.
    ///
    /// A streaming device is stopped first on a best-effort basis; a refusal
    /// is logged and teardown continues. Calling it again does nothing.
    pub fn teardown(&mut self) -> Result<(), Error> {
        let Some(mut session) = self.session.take() else {
            self.state = StreamState::Unconfigured;
            return Ok(());
        };
        let streaming = self.state == StreamState::Streaming;
        self.state = StreamState::Unconfigured;
        self.epoch += 1;

        let path = session.config.device().to_owned();
        if streaming {
            match session.device.handle_mut().stream_off() {
                Ok(()) => log::info!("{}: stream off", path),
                Err(err) => log::warn!("{}: stream off during teardown failed: {}", path, err),
            }
        }

        session.pool.release(session.device.handle_mut());
        session.device.close()?;
        log::info!("{}: released", path);
        Ok(())
    }

    /// Teardown after a fatal failure, which is already being reported.
    fn abort(&mut self) {
        if let Err(err) = self.teardown() {
            log::warn!("teardown after failure: {}", err);
        }
    }

    fn device_path(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.config.device())
    }
}

impl<D: Driver> fmt::Debug for StreamController<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("state", &self.state)
            .field("config", &self.config())
            .field("format", &self.format())
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

impl<D: Driver> Drop for StreamController<D> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            log::warn!("teardown on drop: {}", err);
        }
    }
}
