// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! yuvsnap
//!
//! Still-image capture from V4L2 cameras using memory-mapped streaming I/O.
//!
//! The library drives a capture device through its full streaming lifecycle:
//! format negotiation, allocation of a fixed ring of kernel-shared buffers,
//! stream on, the dequeue / consume / requeue loop, stream off and release.
//! Every buffer carries an explicit state tag (free, queued or held) and only
//! a held buffer can be read, so a frame is never observed while the device
//! may still be writing into it.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use yuvsnap::{config::DeviceConfig, sink::JpegSink, stream::StreamController};
//!
//! let config = DeviceConfig::default()
//!     .with_device("/dev/video0")
//!     .with_resolution(640, 480);
//!
//! let mut camera = StreamController::new();
//! camera.configure(&config)?;
//! camera.stream_on()?;
//! camera.capture(Duration::from_secs(10), &mut JpegSink::new("image.jpg"))?;
//! camera.stream_off()?;
//! camera.teardown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Testing without hardware
//!
//! The [`fake`] module provides an in-memory device implementing the same
//! [`backend::Driver`] seam as the V4L2 backend, with scriptable failures and
//! call accounting.

use std::{error, fmt, io, path::PathBuf, time::Duration};

use crate::{fourcc::FourCC, stream::StreamState};

/// Error type for capture operations
#[derive(Debug)]
pub enum Error {
    /// The configuration can not be used to open a device
    InvalidConfig(String),

    /// The operation is not allowed in the controller's current state
    InvalidState {
        operation: &'static str,
        state: StreamState,
    },

    /// The device node could not be opened
    CannotOpen { path: PathBuf, source: io::Error },

    /// The device does not support streaming I/O
    StreamingUnsupported(PathBuf),

    /// The device rejected the requested format
    FormatRejected(io::Error),

    /// The device rejected the buffer request or granted no buffers
    AllocationFailed(io::Error),

    /// Querying or mapping one of the granted buffers failed
    MappingFailed { index: u32, source: io::Error },

    /// Every buffer in rotation is held by the caller
    AllBuffersHeld(usize),

    /// No frame became ready within the wait window
    Timeout(Duration),

    /// The wait was interrupted by a signal
    Interrupted,

    /// The stream-enable command was rejected, or no buffer could be queued
    StreamOnFailed(io::Error),

    /// The stream-disable command was rejected
    StreamOffFailed(io::Error),

    /// Retrieving a filled buffer from the device failed
    DequeueFailed(io::Error),

    /// Returning a buffer to the device failed
    QueueFailed { index: u32, source: io::Error },

    /// The frame handle does not refer to a buffer currently held
    StaleFrame(u32),

    /// A frame is shorter than its format requires
    ShortFrame { expected: usize, actual: usize },

    /// A sink was given a pixel format it can not convert
    UnsupportedFormat(FourCC),

    /// Image encoding failed
    Encode(image::ImageError),

    /// I/O error outside of the device protocol (output files, etc.)
    Io(io::Error),
}

/// Broad classification of an [`Error`], used to decide whether a caller may
/// retry or must abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device missing, unopenable or unable to stream
    Unavailable,
    /// Format or geometry rejected
    NegotiationFailed,
    /// Buffer allocation or mapping failed, or no buffer left to wait on
    ResourceExhausted,
    /// No frame within the wait window
    Timeout,
    /// Wait disturbed by a signal
    Interrupted,
    /// Stream or buffer command rejected by the device
    ProtocolFailure,
    /// Caller misuse: bad configuration, wrong state or stale handle
    Usage,
    /// Frame conversion or output failure
    Sink,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CannotOpen { .. } | Error::StreamingUnsupported(_) => ErrorKind::Unavailable,
            Error::FormatRejected(_) => ErrorKind::NegotiationFailed,
            Error::AllocationFailed(_)
            | Error::MappingFailed { .. }
            | Error::AllBuffersHeld(_) => ErrorKind::ResourceExhausted,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::StreamOnFailed(_)
            | Error::StreamOffFailed(_)
            | Error::DequeueFailed(_)
            | Error::QueueFailed { .. } => ErrorKind::ProtocolFailure,
            Error::InvalidConfig(_) | Error::InvalidState { .. } | Error::StaleFrame(_) => {
                ErrorKind::Usage
            }
            Error::ShortFrame { .. }
            | Error::UnsupportedFormat(_)
            | Error::Encode(_)
            | Error::Io(_) => ErrorKind::Sink,
        }
    }

    /// Whether the failed operation may simply be retried.
    ///
    /// Only timeouts and interrupted waits qualify; both leave the controller
    /// state untouched.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::InvalidState { operation, state } => {
                write!(f, "{} is not allowed while {}", operation, state)
            }
            Error::CannotOpen { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            Error::StreamingUnsupported(path) => {
                write!(f, "{} is not capable of streaming", path.display())
            }
            Error::FormatRejected(err) => write!(f, "format rejected: {}", err),
            Error::AllocationFailed(err) => write!(f, "buffer allocation failed: {}", err),
            Error::MappingFailed { index, source } => {
                write!(f, "cannot map buffer {}: {}", index, source)
            }
            Error::AllBuffersHeld(count) => {
                write!(f, "all {} buffers are held, release a frame first", count)
            }
            Error::Timeout(timeout) => write!(f, "no frame within {:?}", timeout),
            Error::Interrupted => write!(f, "wait for frame interrupted"),
            Error::StreamOnFailed(err) => write!(f, "stream on failed: {}", err),
            Error::StreamOffFailed(err) => write!(f, "stream off failed: {}", err),
            Error::DequeueFailed(err) => write!(f, "dequeue failed: {}", err),
            Error::QueueFailed { index, source } => {
                write!(f, "cannot queue buffer {}: {}", index, source)
            }
            Error::StaleFrame(index) => write!(f, "frame handle for buffer {} is stale", index),
            Error::ShortFrame { expected, actual } => write!(
                f,
                "frame too short: expected at least {} bytes, got {}",
                expected, actual
            ),
            Error::UnsupportedFormat(fourcc) => write!(f, "unsupported pixel format {}", fourcc),
            Error::Encode(err) => write!(f, "image encoding failed: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::CannotOpen { source, .. }
            | Error::MappingFailed { source, .. }
            | Error::QueueFailed { source, .. } => Some(source),
            Error::FormatRejected(err)
            | Error::AllocationFailed(err)
            | Error::StreamOnFailed(err)
            | Error::StreamOffFailed(err)
            | Error::DequeueFailed(err)
            | Error::Io(err) => Some(err),
            Error::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Encode(err)
    }
}

/// Driver/handle traits isolating every device call.
pub mod backend;

/// Capture configuration builder.
pub mod config;

/// Device handle ownership, capability query and format negotiation.
pub mod device;

/// In-memory device backend for tests and simulation.
pub mod fake;

/// FourCC codes and negotiated formats.
pub mod fourcc;

/// The ring of memory-mapped buffers shared with the device.
pub mod pool;

/// Frame consumers, including the JPEG writer.
pub mod sink;

/// The streaming state machine.
pub mod stream;

/// V4L2 backend.
pub mod v4l2;
