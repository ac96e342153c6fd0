// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors

//! Buffer pool
//!
//! The pool is an arena of slots indexed by the device-assigned buffer index.
//! Each slot owns one mapping and a state tag:
//!
//! | State | Owner | Contents |
//! |-------|-------|----------|
//! | [`BufferState::Free`] | nobody, not in the device queue | undefined |
//! | [`BufferState::Queued`] | device | being written |
//! | [`BufferState::Held`] | caller | valid frame |
//!
//! Only a held slot yields a byte view.

use std::{fmt, io};

use crate::{
    backend::{DeviceHandle, Region},
    Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Queued,
    Held,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BufferState::Free => write!(f, "free"),
            BufferState::Queued => write!(f, "queued"),
            BufferState::Held => write!(f, "held"),
        }
    }
}

/// One mapped device buffer.
#[derive(Debug)]
pub struct MappedBuffer {
    index: u32,
    length: usize,
    offset: u32,
    region: Region,
    state: BufferState,
}

impl MappedBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Length in bytes, as reported by the device
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn state(&self) -> BufferState {
        self.state
    }
}

/// Fixed set of buffers shared with the device.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<MappedBuffer>,
    /// buffers in rotation; the rest stay mapped but are never queued
    active: usize,
}

impl BufferPool {
    /// Requests `requested` buffers from the device and maps each one.
    ///
    /// The device may grant fewer buffers than requested. If any query or
    /// mapping fails, every buffer mapped so far is unmapped before the error
    /// is returned; the device-side request is dropped when the caller closes
    /// the handle.
    pub fn allocate<H: DeviceHandle>(handle: &mut H, requested: u32) -> Result<BufferPool, Error> {
        let granted = handle
            .request_buffers(requested)
            .map_err(Error::AllocationFailed)?;
        if granted == 0 {
            return Err(Error::AllocationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "device granted no buffers",
            )));
        }
        if granted < requested {
            log::info!("requested {} buffers, device granted {}", requested, granted);
        } else {
            log::info!("number of requested buffers = {}", granted);
        }

        let mut pool = BufferPool {
            buffers: Vec::with_capacity(granted as usize),
            active: 0,
        };

        for index in 0..granted {
            match Self::map_buffer(handle, index) {
                Ok(buffer) => pool.buffers.push(buffer),
                Err(err) => {
                    log::debug!("rolling back {} mapped buffers", pool.buffers.len());
                    pool.release(handle);
                    return Err(err);
                }
            }
        }

        pool.active = pool.buffers.len();
        Ok(pool)
    }

    fn map_buffer<H: DeviceHandle>(handle: &mut H, index: u32) -> Result<MappedBuffer, Error> {
        let geometry = handle
            .query_buffer(index)
            .map_err(|source| Error::MappingFailed { index, source })?;
        let region = handle
            .map(&geometry)
            .map_err(|source| Error::MappingFailed { index, source })?;

        log::debug!(
            "buffer {}: {} bytes at offset 0x{:x} mapped to {:p}",
            index,
            geometry.length,
            geometry.offset,
            region.as_ptr()
        );

        Ok(MappedBuffer {
            index,
            length: geometry.length,
            offset: geometry.offset,
            region,
            state: BufferState::Free,
        })
    }

    /// Unmaps every buffer. Calling it again is a no-op.
    pub fn release<H: DeviceHandle>(&mut self, handle: &mut H) {
        for buffer in self.buffers.drain(..) {
            let index = buffer.index;
            if let Err(err) = handle.unmap(buffer.region) {
                log::warn!("unmapping buffer {} failed: {}", index, err);
            }
        }
        self.active = 0;
    }

    /// Buffers in rotation.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Buffers currently mapped, including any dropped from rotation.
    pub fn mapped(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_released(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, index: u32) -> Option<&MappedBuffer> {
        self.buffers[..self.active].get(index as usize)
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffer(index).map(MappedBuffer::state)
    }

    /// Buffers in rotation, in index order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.buffers[..self.active].iter()
    }

    pub fn count(&self, state: BufferState) -> usize {
        self.iter().filter(|b| b.state == state).count()
    }

    /// Contents of a held buffer. `None` for any other state.
    pub fn view(&self, index: u32) -> Option<&[u8]> {
        let buffer = self.buffer(index)?;
        if buffer.state != BufferState::Held {
            return None;
        }
        // SAFETY: a held buffer has been dequeued, so the device does not
        // write to it until it is queued again, which needs &mut self.
        Some(unsafe { buffer.region.as_slice() })
    }

    /// Moves buffer `index` from `from` to `to`. Returns false, leaving the
    /// buffer untouched, if it is out of rotation or not in `from`.
    pub(crate) fn transition(&mut self, index: u32, from: BufferState, to: BufferState) -> bool {
        match self.buffers[..self.active].get_mut(index as usize) {
            Some(buffer) if buffer.state == from => {
                buffer.state = to;
                true
            }
            _ => false,
        }
    }

    /// Takes buffers `len..` out of rotation. They stay mapped until release.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.active {
            log::warn!("pool reduced from {} to {} buffers", self.active, len);
            self.active = len;
        }
    }

    /// Marks every buffer free, e.g. after the device dropped its queue.
    pub(crate) fn reset(&mut self) {
        for buffer in self.buffers.iter_mut() {
            buffer.state = BufferState::Free;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::Driver,
        fake::{FakeDriver, FakeHandle},
        fourcc::{Format, PixelFormat},
    };

    fn open(fake: &FakeDriver) -> FakeHandle {
        let mut handle = fake.open("/dev/fake0").unwrap();
        handle
            .set_format(&Format::request(64, 48, PixelFormat::Yuyv).unwrap())
            .unwrap();
        handle
    }

    #[test]
    fn test_allocate_and_release() {
        let fake = FakeDriver::new();
        let mut handle = open(&fake);

        let mut pool = BufferPool::allocate(&mut handle, 4).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.mapped(), 4);
        assert_eq!(pool.count(BufferState::Free), 4);
        assert!(pool.iter().all(|b| b.length() == 64 * 48 * 2));
        assert_eq!(fake.stats().live_mappings, 4);

        pool.release(&mut handle);
        assert!(pool.is_released());
        assert_eq!(fake.stats().live_mappings, 0);

        pool.release(&mut handle);
        assert_eq!(fake.stats().unmaps, 4);
    }

    #[test]
    fn test_device_grants_fewer() {
        let fake = FakeDriver::new().grant_buffers(2);
        let mut handle = open(&fake);

        let mut pool = BufferPool::allocate(&mut handle, 5).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.buffer(2).is_none());
        pool.release(&mut handle);
    }

    #[test]
    fn test_zero_granted_is_allocation_failure() {
        let fake = FakeDriver::new().grant_buffers(0);
        let mut handle = open(&fake);

        let err = BufferPool::allocate(&mut handle, 3).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
    }

    #[test]
    fn test_rejected_request() {
        let fake = FakeDriver::new().reject_buffer_request();
        let mut handle = open(&fake);

        let err = BufferPool::allocate(&mut handle, 3).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(fake.stats().maps, 0);
    }

    #[test]
    fn test_mapping_failure_rolls_back() {
        let fake = FakeDriver::new().fail_map_at(2);
        let mut handle = open(&fake);

        let err = BufferPool::allocate(&mut handle, 4).unwrap_err();
        assert!(matches!(err, Error::MappingFailed { index: 2, .. }));

        let stats = fake.stats();
        assert_eq!(stats.maps, 2);
        assert_eq!(stats.unmaps, 2);
        assert_eq!(stats.live_mappings, 0);
    }

    #[test]
    fn test_view_requires_held() {
        let fake = FakeDriver::new();
        let mut handle = open(&fake);
        let mut pool = BufferPool::allocate(&mut handle, 2).unwrap();

        assert!(pool.view(0).is_none());
        assert!(pool.transition(0, BufferState::Free, BufferState::Queued));
        assert!(pool.view(0).is_none());
        assert!(!pool.transition(0, BufferState::Free, BufferState::Held));
        assert!(pool.transition(0, BufferState::Queued, BufferState::Held));
        assert_eq!(pool.view(0).map(<[u8]>::len), Some(64 * 48 * 2));
        assert!(pool.view(9).is_none());

        pool.reset();
        assert_eq!(pool.count(BufferState::Free), 2);
        pool.release(&mut handle);
    }

    #[test]
    fn test_truncate_keeps_mappings() {
        let fake = FakeDriver::new();
        let mut handle = open(&fake);
        let mut pool = BufferPool::allocate(&mut handle, 3).unwrap();

        pool.truncate(1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.mapped(), 3);
        assert!(!pool.transition(2, BufferState::Free, BufferState::Queued));

        pool.release(&mut handle);
        assert_eq!(fake.stats().live_mappings, 0);
    }
}
