// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    fs::{File, OpenOptions},
    io::Read,
    num::NonZeroUsize,
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
    ptr::NonNull,
};

use log::{debug, trace};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
};
use vidcap_sys as sys;

use crate::Error;

/// Default bound on the readiness wait, in milliseconds.
pub const READY_TIMEOUT_MS: u16 = 2000;

/// Outcome of waiting for the device to have a frame available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// A signal arrived before the device became readable.
    Interrupted,
}

/// The device-control operations the capture engine and buffer pools need.
///
/// [`DeviceHandle`] implements this on a real V4L2 node. Every method maps
/// to one kernel request (`reset_crop` to two) and reports failures as
/// [`Error::Ioctl`] carrying the errno, so callers can classify `EAGAIN`,
/// `EIO` and friends the way the kernel documents them.
pub trait V4l2Device: Send {
    /// Path the device was opened from.
    fn path(&self) -> &Path;

    fn query_capability(&mut self) -> Result<sys::v4l2_capability, Error>;

    /// Reset the crop rectangle to the driver default.
    fn reset_crop(&mut self) -> Result<(), Error>;

    fn set_format(&mut self, format: &mut sys::v4l2_format) -> Result<(), Error>;

    fn get_stream_parameters(&mut self, parm: &mut sys::v4l2_streamparm) -> Result<(), Error>;

    fn set_stream_parameters(&mut self, parm: &mut sys::v4l2_streamparm) -> Result<(), Error>;

    fn request_buffers(&mut self, req: &mut sys::v4l2_requestbuffers) -> Result<(), Error>;

    fn query_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error>;

    fn queue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error>;

    /// Dequeue a filled buffer. On failure the kernel may still have written
    /// `buf`; callers that tolerate `EIO` read it anyway.
    fn dequeue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error>;

    fn stream_on(&mut self) -> Result<(), Error>;

    fn stream_off(&mut self) -> Result<(), Error>;

    /// Map `length` bytes of driver buffer memory at `offset`.
    fn map(&mut self, offset: u32, length: usize) -> Result<NonNull<u8>, Error>;

    /// Undo a previous [`map`](V4l2Device::map).
    ///
    /// # Safety
    ///
    /// `ptr` and `length` must come from a successful `map` on this device
    /// and no reference into the region may outlive this call.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, length: usize) -> Result<(), Error>;

    /// `read(2)` one frame for the read I/O method.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn query_control(&mut self, ctrl: &mut sys::v4l2_queryctrl) -> Result<(), Error>;

    fn set_control(&mut self, ctrl: &mut sys::v4l2_control) -> Result<(), Error>;

    fn set_ext_controls(&mut self, ctrls: &mut sys::v4l2_ext_controls) -> Result<(), Error>;

    /// Block until the device is readable or `timeout_ms` elapses.
    fn wait_readable(&mut self, timeout_ms: u16) -> Result<Readiness, Error>;
}

/// Capabilities of the opened node, preferring the per-node `device_caps`
/// over the whole-device `capabilities` when the driver reports them.
pub fn node_capabilities(cap: &sys::v4l2_capability) -> u32 {
    if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
        cap.device_caps
    } else {
        cap.capabilities
    }
}

/// Opens devices by path. The engine reopens through this on every
/// reconnect.
pub trait Connector: Send {
    fn connect(&mut self, path: &Path) -> Result<Box<dyn V4l2Device>, Error>;
}

/// Opens real V4L2 character devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn connect(&mut self, path: &Path) -> Result<Box<dyn V4l2Device>, Error> {
        Ok(Box::new(DeviceHandle::open(path)?))
    }
}

/// Run an ioctl, retrying while it is interrupted by a signal.
fn xioctl<F>(request: &'static str, mut call: F) -> Result<(), Error>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match call() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                trace!("{} failed: {}", request, errno);
                return Err(Error::ioctl(request, errno));
            }
        }
    }
}

/// An open V4L2 character device.
///
/// The descriptor is opened read-write and non-blocking and is closed when
/// the handle is dropped.
#[derive(Debug)]
pub struct DeviceHandle {
    path: PathBuf,
    file: File,
}

impl DeviceHandle {
    /// Open `path` after checking that it is a character device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|source| Error::DeviceNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        if !meta.file_type().is_char_device() {
            return Err(Error::NotACharacterDevice(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("opened {}", path.display());

        Ok(DeviceHandle {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Enumerate a capture format by index; `Ok(None)` past the last one.
    pub fn enum_format(&self, index: u32) -> Result<Option<sys::v4l2_fmtdesc>, Error> {
        let mut desc = sys::v4l2_fmtdesc {
            index,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        match xioctl("VIDIOC_ENUM_FMT", || unsafe {
            sys::vidioc_enum_fmt(self.fd(), &mut desc)
        }) {
            Ok(()) => Ok(Some(desc)),
            Err(Error::Ioctl {
                errno: Errno::EINVAL,
                ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Enumerate a frame size for `pixel_format` by index; `Ok(None)` past
    /// the last one.
    pub fn enum_frame_size(
        &self,
        pixel_format: u32,
        index: u32,
    ) -> Result<Option<sys::v4l2_frmsizeenum>, Error> {
        let mut size = sys::v4l2_frmsizeenum {
            index,
            pixel_format,
            ..Default::default()
        };
        match xioctl("VIDIOC_ENUM_FRAMESIZES", || unsafe {
            sys::vidioc_enum_framesizes(self.fd(), &mut size)
        }) {
            Ok(()) => Ok(Some(size)),
            Err(Error::Ioctl {
                errno: Errno::EINVAL,
                ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn buf_type() -> libc::c_int {
        sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int
    }
}

impl V4l2Device for DeviceHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capability(&mut self) -> Result<sys::v4l2_capability, Error> {
        let mut cap = sys::v4l2_capability::default();
        xioctl("VIDIOC_QUERYCAP", || unsafe {
            sys::vidioc_querycap(self.fd(), &mut cap)
        })?;
        Ok(cap)
    }

    fn reset_crop(&mut self) -> Result<(), Error> {
        let mut cropcap = sys::v4l2_cropcap {
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        xioctl("VIDIOC_CROPCAP", || unsafe {
            sys::vidioc_cropcap(self.fd(), &mut cropcap)
        })?;
        let crop = sys::v4l2_crop {
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            c: cropcap.defrect,
        };
        xioctl("VIDIOC_S_CROP", || unsafe { sys::vidioc_s_crop(self.fd(), &crop) })
    }

    fn set_format(&mut self, format: &mut sys::v4l2_format) -> Result<(), Error> {
        xioctl("VIDIOC_S_FMT", || unsafe { sys::vidioc_s_fmt(self.fd(), &mut *format) })
    }

    fn get_stream_parameters(&mut self, parm: &mut sys::v4l2_streamparm) -> Result<(), Error> {
        xioctl("VIDIOC_G_PARM", || unsafe { sys::vidioc_g_parm(self.fd(), &mut *parm) })
    }

    fn set_stream_parameters(&mut self, parm: &mut sys::v4l2_streamparm) -> Result<(), Error> {
        xioctl("VIDIOC_S_PARM", || unsafe { sys::vidioc_s_parm(self.fd(), &mut *parm) })
    }

    fn request_buffers(&mut self, req: &mut sys::v4l2_requestbuffers) -> Result<(), Error> {
        xioctl("VIDIOC_REQBUFS", || unsafe { sys::vidioc_reqbufs(self.fd(), &mut *req) })
    }

    fn query_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        xioctl("VIDIOC_QUERYBUF", || unsafe { sys::vidioc_querybuf(self.fd(), &mut *buf) })
    }

    fn queue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        xioctl("VIDIOC_QBUF", || unsafe { sys::vidioc_qbuf(self.fd(), &mut *buf) })
    }

    fn dequeue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        xioctl("VIDIOC_DQBUF", || unsafe { sys::vidioc_dqbuf(self.fd(), &mut *buf) })
    }

    fn stream_on(&mut self) -> Result<(), Error> {
        let buf_type = Self::buf_type();
        xioctl("VIDIOC_STREAMON", || unsafe {
            sys::vidioc_streamon(self.fd(), &buf_type)
        })
    }

    fn stream_off(&mut self) -> Result<(), Error> {
        let buf_type = Self::buf_type();
        xioctl("VIDIOC_STREAMOFF", || unsafe {
            sys::vidioc_streamoff(self.fd(), &buf_type)
        })
    }

    fn map(&mut self, offset: u32, length: usize) -> Result<NonNull<u8>, Error> {
        let len = NonZeroUsize::new(length)
            .ok_or_else(|| Error::InvalidArgument("cannot map a zero-length buffer".into()))?;
        // SAFETY: mapping a fresh shared region; the pool owns it until unmap.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.file.as_fd(),
                offset as libc::off_t,
            )
        }
        .map_err(|errno| Error::ioctl("mmap", errno))?;
        Ok(ptr.cast())
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, length: usize) -> Result<(), Error> {
        // SAFETY: upheld by the caller.
        unsafe { munmap(ptr.cast(), length) }.map_err(|errno| Error::ioctl("munmap", errno))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            match (&self.file).read(buf) {
                Ok(len) => return Ok(len),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn query_control(&mut self, ctrl: &mut sys::v4l2_queryctrl) -> Result<(), Error> {
        xioctl("VIDIOC_QUERYCTRL", || unsafe {
            sys::vidioc_queryctrl(self.fd(), &mut *ctrl)
        })
    }

    fn set_control(&mut self, ctrl: &mut sys::v4l2_control) -> Result<(), Error> {
        xioctl("VIDIOC_S_CTRL", || unsafe { sys::vidioc_s_ctrl(self.fd(), &mut *ctrl) })
    }

    fn set_ext_controls(&mut self, ctrls: &mut sys::v4l2_ext_controls) -> Result<(), Error> {
        xioctl("VIDIOC_S_EXT_CTRLS", || unsafe {
            sys::vidioc_s_ext_ctrls(self.fd(), &mut *ctrls)
        })
    }

    fn wait_readable(&mut self, timeout_ms: u16) -> Result<Readiness, Error> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(Errno::EINTR) => Ok(Readiness::Interrupted),
            Err(errno) => Err(Error::ioctl("poll", errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path() {
        let err = DeviceHandle::open("/dev/vidcap-does-not-exist").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn test_open_regular_file() {
        let err = DeviceHandle::open("/proc/self/status").unwrap_err();
        assert!(matches!(err, Error::NotACharacterDevice(_)));
    }

    #[test]
    fn test_open_non_v4l2_char_device() {
        // /dev/null opens fine but rejects V4L2 requests
        let mut handle = DeviceHandle::open("/dev/null").unwrap();
        assert_eq!(handle.path(), Path::new("/dev/null"));
        let err = handle.query_capability().unwrap_err();
        assert!(matches!(err, Error::Ioctl { request: "VIDIOC_QUERYCAP", .. }));
    }

    #[test]
    fn test_xioctl_retries_eintr() {
        let mut calls = 0;
        let result = xioctl("TEST", || {
            calls += 1;
            if calls < 3 {
                Err(Errno::EINTR)
            } else {
                Ok(0)
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_xioctl_reports_errno() {
        let err = xioctl("VIDIOC_DQBUF", || Err(Errno::EAGAIN)).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
    }
}
