// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Capture buffer pools.
//!
//! One pool per I/O method, chosen once from [`StreamOptions::io_method`]
//! and fixed for the engine's lifetime. A pool is allocated after format
//! negotiation and must be released (after stream-off) before the device is
//! closed or re-initialised.
//!
//! [`StreamOptions::io_method`]: crate::StreamOptions::io_method

use std::{
    alloc::{self, Layout},
    io,
    ptr::NonNull,
    slice,
};

use log::{debug, warn};
use nix::{errno::Errno, time::ClockId};
use vidcap_sys as sys;

use crate::{device::V4l2Device, format::IoMethod, Error};

/// A buffer handed back by the driver, owned by the application until it is
/// requeued.
#[derive(Clone, Copy)]
pub struct Dequeued {
    /// Pool slot, equal to the kernel buffer index for streaming I/O.
    pub index: usize,
    pub bytesused: usize,
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub flags: u32,
    raw: sys::v4l2_buffer,
}

impl Dequeued {
    pub(crate) fn from_raw(index: usize, raw: sys::v4l2_buffer) -> Self {
        Dequeued {
            index,
            bytesused: raw.bytesused as usize,
            tv_sec: raw.timestamp.tv_sec as i64,
            tv_usec: raw.timestamp.tv_usec as i64,
            flags: raw.flags,
            raw,
        }
    }

    /// True when the timestamp comes from `CLOCK_MONOTONIC`.
    pub fn is_monotonic(&self) -> bool {
        self.flags & sys::V4L2_BUF_FLAG_TIMESTAMP_MASK == sys::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC
    }

    /// Timestamp in seconds.
    pub fn seconds(&self) -> f64 {
        self.tv_sec as f64 + self.tv_usec as f64 / 1e6
    }
}

impl std::fmt::Debug for Dequeued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dequeued")
            .field("index", &self.index)
            .field("bytesused", &self.bytesused)
            .field("tv_sec", &self.tv_sec)
            .field("tv_usec", &self.tv_usec)
            .field("flags", &format_args!("{:#x}", self.flags))
            .finish()
    }
}

/// Acquire/release cycle shared by the three I/O methods.
pub trait BufferPool: Send {
    fn io_method(&self) -> IoMethod;

    /// Negotiate and allocate buffers for frames of `buffer_size` bytes.
    fn allocate(&mut self, device: &mut dyn V4l2Device, buffer_size: usize) -> Result<(), Error>;

    /// Number of allocated buffers.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand every buffer to the driver before stream-on.
    fn enqueue_all(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error>;

    /// Take one filled buffer from the driver.
    ///
    /// Errors carry the errno; `EAGAIN` means no frame is ready yet. With
    /// `tolerate_eio` an `EIO` failure is returned as a frame.
    fn dequeue(&mut self, device: &mut dyn V4l2Device, tolerate_eio: bool)
        -> Result<Dequeued, Error>;

    /// Memory of a dequeued buffer. Only valid until it is requeued.
    fn frame(&self, frame: &Dequeued) -> &[u8];

    /// Return a dequeued buffer to the driver.
    fn requeue(&mut self, device: &mut dyn V4l2Device, frame: &Dequeued) -> Result<(), Error>;

    /// Free every buffer. Safe to call when nothing is allocated.
    fn release(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error>;
}

/// Build the pool for `method`, requesting `count` buffers for streaming I/O.
pub fn create(method: IoMethod, count: u32) -> Box<dyn BufferPool> {
    match method {
        IoMethod::Read => Box::new(ReadIo::default()),
        IoMethod::Mmap => Box::new(MmapIo::new(count)),
        IoMethod::Userptr => Box::new(UserptrIo::new(count)),
    }
}

fn capture_buffer(memory: u32) -> sys::v4l2_buffer {
    sys::v4l2_buffer {
        type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        memory,
        ..Default::default()
    }
}

fn request(
    device: &mut dyn V4l2Device,
    count: u32,
    memory: u32,
    method: IoMethod,
) -> Result<u32, Error> {
    let mut req = sys::v4l2_requestbuffers {
        count,
        type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        memory,
        ..Default::default()
    };
    match device.request_buffers(&mut req) {
        Ok(()) => Ok(req.count),
        Err(err) if err.errno() == Some(Errno::EINVAL) => Err(Error::UnsupportedIoMethod(method)),
        Err(err) => Err(err),
    }
}

/// Drop the driver's buffer bookkeeping. Drivers that never granted any
/// reject this, which is harmless.
fn free_driver_buffers(device: &mut dyn V4l2Device, memory: u32) {
    let mut req = sys::v4l2_requestbuffers {
        count: 0,
        type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        memory,
        ..Default::default()
    };
    if let Err(err) = device.request_buffers(&mut req) {
        debug!("releasing driver buffers: {}", err);
    }
}

fn dequeue_raw(
    device: &mut dyn V4l2Device,
    memory: u32,
    tolerate_eio: bool,
) -> Result<sys::v4l2_buffer, Error> {
    let mut buf = capture_buffer(memory);
    match device.dequeue_buffer(&mut buf) {
        Ok(()) => Ok(buf),
        Err(err) if tolerate_eio && err.errno() == Some(Errno::EIO) => {
            warn!("{}, processing buffer {} anyway", err, buf.index);
            Ok(buf)
        }
        Err(err) => Err(err),
    }
}

/// `read(2)` into one heap buffer sized for a full frame.
#[derive(Debug, Default)]
pub struct ReadIo {
    buffer: Vec<u8>,
}

impl ReadIo {
    /// Read I/O carries no kernel timestamp; stamp frames on arrival.
    fn stamp() -> (i64, i64) {
        match nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(now) => (now.tv_sec() as i64, now.tv_nsec() as i64 / 1000),
            Err(_) => (0, 0),
        }
    }
}

impl BufferPool for ReadIo {
    fn io_method(&self) -> IoMethod {
        IoMethod::Read
    }

    fn allocate(&mut self, _device: &mut dyn V4l2Device, buffer_size: usize) -> Result<(), Error> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("zero-sized read buffer".to_owned()));
        }
        self.buffer = vec![0; buffer_size];
        Ok(())
    }

    fn len(&self) -> usize {
        usize::from(!self.buffer.is_empty())
    }

    fn enqueue_all(&mut self, _device: &mut dyn V4l2Device) -> Result<(), Error> {
        Ok(())
    }

    fn dequeue(
        &mut self,
        device: &mut dyn V4l2Device,
        tolerate_eio: bool,
    ) -> Result<Dequeued, Error> {
        let bytesused = match device.read(&mut self.buffer) {
            Ok(len) => len,
            Err(err) if tolerate_eio && err.errno() == Some(Errno::EIO) => {
                warn!("{}, processing read buffer anyway", err);
                0
            }
            Err(err) => return Err(err),
        };

        let (tv_sec, tv_usec) = Self::stamp();
        let mut raw = capture_buffer(0);
        raw.bytesused = u32::try_from(bytesused)?;
        raw.flags = sys::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC;
        raw.timestamp.tv_sec = tv_sec as libc::time_t;
        raw.timestamp.tv_usec = tv_usec as libc::suseconds_t;
        Ok(Dequeued::from_raw(0, raw))
    }

    fn frame(&self, _frame: &Dequeued) -> &[u8] {
        &self.buffer
    }

    fn requeue(&mut self, _device: &mut dyn V4l2Device, _frame: &Dequeued) -> Result<(), Error> {
        Ok(())
    }

    fn release(&mut self, _device: &mut dyn V4l2Device) -> Result<(), Error> {
        self.buffer = Vec::new();
        Ok(())
    }
}

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    length: usize,
}

/// Driver-allocated buffers mapped into the process.
#[derive(Debug)]
pub struct MmapIo {
    requested: u32,
    buffers: Vec<Mapping>,
}

// SAFETY: the mappings are plain shared memory owned by this pool; access is
// serialised by the engine's `&mut self` methods.
unsafe impl Send for MmapIo {}

impl MmapIo {
    pub fn new(requested: u32) -> Self {
        MmapIo {
            requested,
            buffers: Vec::new(),
        }
    }

    fn map_all(&mut self, device: &mut dyn V4l2Device, count: u32) -> Result<(), Error> {
        for index in 0..count {
            let mut buf = capture_buffer(sys::V4L2_MEMORY_MMAP);
            buf.index = index;
            device.query_buffer(&mut buf)?;
            // SAFETY: the driver reports the offset for MMAP buffers.
            let offset = unsafe { buf.m.offset };
            let length = buf.length as usize;
            let ptr = device.map(offset, length)?;
            self.buffers.push(Mapping { ptr, length });
        }
        Ok(())
    }
}

impl BufferPool for MmapIo {
    fn io_method(&self) -> IoMethod {
        IoMethod::Mmap
    }

    fn allocate(&mut self, device: &mut dyn V4l2Device, _buffer_size: usize) -> Result<(), Error> {
        let count = request(device, self.requested, sys::V4L2_MEMORY_MMAP, IoMethod::Mmap)?;
        if count < 2 {
            free_driver_buffers(device, sys::V4L2_MEMORY_MMAP);
            return Err(Error::InsufficientBuffers(count));
        }
        if let Err(err) = self.map_all(device, count) {
            // best effort, the original error is what matters
            let _ = self.release(device);
            return Err(err);
        }
        debug!("mapped {} buffers", self.buffers.len());
        Ok(())
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn enqueue_all(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error> {
        for index in 0..self.buffers.len() {
            let mut buf = capture_buffer(sys::V4L2_MEMORY_MMAP);
            buf.index = u32::try_from(index)?;
            device.queue_buffer(&mut buf)?;
        }
        Ok(())
    }

    fn dequeue(
        &mut self,
        device: &mut dyn V4l2Device,
        tolerate_eio: bool,
    ) -> Result<Dequeued, Error> {
        let raw = dequeue_raw(device, sys::V4L2_MEMORY_MMAP, tolerate_eio)?;
        let index = raw.index as usize;
        if index >= self.buffers.len() {
            return Err(Error::InvalidArgument(format!(
                "driver returned buffer {} of {}",
                index,
                self.buffers.len()
            )));
        }
        Ok(Dequeued::from_raw(index, raw))
    }

    fn frame(&self, frame: &Dequeued) -> &[u8] {
        let mapping = &self.buffers[frame.index];
        // SAFETY: the mapping stays valid until release and the buffer is
        // owned by the application between dequeue and requeue.
        unsafe { slice::from_raw_parts(mapping.ptr.as_ptr(), mapping.length) }
    }

    fn requeue(&mut self, device: &mut dyn V4l2Device, frame: &Dequeued) -> Result<(), Error> {
        let mut raw = frame.raw;
        device.queue_buffer(&mut raw)
    }

    fn release(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        let mut result = Ok(());
        for mapping in self.buffers.drain(..) {
            // SAFETY: produced by `device.map` and no frame slice outlives
            // the `&mut self` borrow.
            if let Err(err) = unsafe { device.unmap(mapping.ptr, mapping.length) } {
                warn!("{}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        free_driver_buffers(device, sys::V4L2_MEMORY_MMAP);
        result
    }
}

impl Drop for MmapIo {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            warn!("{} mapped buffers were never released", self.buffers.len());
        }
    }
}

#[derive(Debug)]
struct UserBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

/// Page-aligned process buffers the driver writes into directly.
#[derive(Debug)]
pub struct UserptrIo {
    requested: u32,
    buffers: Vec<UserBuffer>,
}

// SAFETY: the allocations are owned by this pool; access is serialised by the
// engine's `&mut self` methods.
unsafe impl Send for UserptrIo {}

impl UserptrIo {
    pub fn new(requested: u32) -> Self {
        UserptrIo {
            requested,
            buffers: Vec::new(),
        }
    }

    fn free_all(&mut self) {
        for buffer in self.buffers.drain(..) {
            // SAFETY: allocated below with exactly this layout.
            unsafe { alloc::dealloc(buffer.ptr.as_ptr(), buffer.layout) };
        }
    }

    fn slot_of(&self, raw: &sys::v4l2_buffer) -> Option<usize> {
        // SAFETY: USERPTR buffers report the user pointer in `m`.
        let userptr = unsafe { raw.m.userptr };
        self.buffers.iter().position(|b| {
            b.ptr.as_ptr() as libc::c_ulong == userptr && b.layout.size() == raw.length as usize
        })
    }
}

/// Round `size` up to a whole number of pages.
pub fn page_aligned(size: usize) -> usize {
    let page = page_size::get();
    (size + page - 1) & !(page - 1)
}

impl BufferPool for UserptrIo {
    fn io_method(&self) -> IoMethod {
        IoMethod::Userptr
    }

    fn allocate(&mut self, device: &mut dyn V4l2Device, buffer_size: usize) -> Result<(), Error> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("zero-sized user buffer".to_owned()));
        }
        let granted = request(device, self.requested, sys::V4L2_MEMORY_USERPTR, IoMethod::Userptr)?;
        if granted == 0 {
            return Err(Error::InsufficientBuffers(0));
        }
        let count = granted.min(self.requested);
        if count < self.requested {
            debug!("driver accepts {} of {} user buffers", count, self.requested);
        }

        let layout = Layout::from_size_align(page_aligned(buffer_size), page_size::get())
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        for _ in 0..count {
            // SAFETY: layout has a non-zero size.
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            match NonNull::new(ptr) {
                Some(ptr) => self.buffers.push(UserBuffer { ptr, layout }),
                None => {
                    self.free_all();
                    free_driver_buffers(device, sys::V4L2_MEMORY_USERPTR);
                    return Err(Error::Io(io::Error::from(io::ErrorKind::OutOfMemory)));
                }
            }
        }
        debug!(
            "allocated {} user buffers of {} bytes",
            self.buffers.len(),
            layout.size()
        );
        Ok(())
    }

    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn enqueue_all(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error> {
        for (index, buffer) in self.buffers.iter().enumerate() {
            let mut buf = capture_buffer(sys::V4L2_MEMORY_USERPTR);
            buf.index = u32::try_from(index)?;
            buf.m.userptr = buffer.ptr.as_ptr() as libc::c_ulong;
            buf.length = u32::try_from(buffer.layout.size())?;
            device.queue_buffer(&mut buf)?;
        }
        Ok(())
    }

    fn dequeue(
        &mut self,
        device: &mut dyn V4l2Device,
        tolerate_eio: bool,
    ) -> Result<Dequeued, Error> {
        let raw = dequeue_raw(device, sys::V4L2_MEMORY_USERPTR, tolerate_eio)?;
        let index = self
            .slot_of(&raw)
            .ok_or_else(|| Error::InvalidArgument("driver returned an unknown user pointer".into()))?;
        Ok(Dequeued::from_raw(index, raw))
    }

    fn frame(&self, frame: &Dequeued) -> &[u8] {
        let buffer = &self.buffers[frame.index];
        // SAFETY: the allocation lives until release and the driver is done
        // writing once the buffer is dequeued.
        unsafe { slice::from_raw_parts(buffer.ptr.as_ptr(), buffer.layout.size()) }
    }

    fn requeue(&mut self, device: &mut dyn V4l2Device, frame: &Dequeued) -> Result<(), Error> {
        let mut raw = frame.raw;
        device.queue_buffer(&mut raw)
    }

    fn release(&mut self, device: &mut dyn V4l2Device) -> Result<(), Error> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        self.free_all();
        free_driver_buffers(device, sys::V4L2_MEMORY_USERPTR);
        Ok(())
    }
}

impl Drop for UserptrIo {
    fn drop(&mut self) {
        self.free_all();
    }
}
