// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! vidcap: V4L2 capture engine for Rust
//!
//! Opens a Video4Linux2 capture device, negotiates resolution, frame rate and
//! pixel format, manages the kernel buffer queue (memory-mapped, user-pointer
//! or plain `read()` I/O) and converts each captured frame from the device's
//! native encoding into one of a few application formats (RGB, BGR, YUYV or
//! GRAY).
//!
//! The engine is built for unattended capture loops: a stalled or unplugged
//! device is torn down automatically and the caller simply keeps calling
//! [`CaptureEngine::wait_for_device`] until it comes back.
//!
//! # Quick Start
//!
//! ```no_run
//! use vidcap::{CameraImage, CaptureEngine, IoMethod, OutputFormat, PixelFormat, StreamOptions};
//!
//! let options = StreamOptions::new("/dev/video0")
//!     .with_resolution(640, 480)
//!     .with_frame_rate(30.0)
//!     .with_pixel_format(PixelFormat::Yuyv)
//!     .with_output_format(OutputFormat::Rgb)
//!     .with_io_method(IoMethod::Mmap);
//!
//! let mut engine = CaptureEngine::init(options)?;
//! let mut image = CameraImage::for_options(engine.options());
//!
//! loop {
//!     if engine.wait_for_device().is_err() {
//!         std::thread::sleep(std::time::Duration::from_millis(100));
//!         continue;
//!     }
//!     if engine.capture(&mut image)? {
//!         println!("frame at {}.{:06}", image.tv_sec(), image.tv_usec());
//!         break;
//!     }
//! }
//! # Ok::<(), vidcap::Error>(())
//! ```
//!
//! # Features
//!
//! - Explicit `Closed → Opened → Configured → Streaming` state machine with
//!   idempotent start and teardown
//! - Read, MMAP and USERPTR buffer strategies behind one [`buffer::BufferPool`]
//!   interface
//! - YUYV, UYVY, MJPEG, 10-bit mono, RGB24, BGR24, GREY and NV12 input
//! - Bit-exact SIMD YUV→RGB path on x86_64
//! - Camera controls through extended-control ioctls with a `v4l2-ctl`
//!   fallback
//! - V4L2 device discovery

use std::{error, fmt, io, num::TryFromIntError, path::PathBuf};

use nix::errno::Errno;

/// Memory strategies for the kernel buffer queue
pub mod buffer;
/// Camera control application (ioctl first, `v4l2-ctl` fallback)
pub mod control;
/// Pixel-format conversion routines
pub mod convert;
/// Character-device access and the device abstraction used by the engine
pub mod device;
/// Capture state machine
pub mod engine;
/// Four-character pixel format codes
pub mod fourcc;
/// Native and output pixel formats, I/O methods
pub mod format;
/// Frame buffer exchanged with the caller
pub mod image;
/// Motion-JPEG decoding
pub mod mjpeg;
/// Stream configuration
pub mod options;
/// V4L2 device discovery
pub mod v4l2;

pub use engine::{CaptureEngine, EngineState};
pub use format::{IoMethod, OutputFormat, PixelFormat};
pub use image::CameraImage;
pub use options::{CameraControls, StreamOptions};

/// Error type for vidcap operations
#[derive(Debug)]
pub enum Error {
    /// The device path could not be inspected (stat failed)
    DeviceNotFound { path: PathBuf, source: io::Error },

    /// The path exists but is not a character special device
    NotACharacterDevice(PathBuf),

    /// The open(2) call on the device failed
    Open { path: PathBuf, source: io::Error },

    /// The device is not a V4L2 device or cannot capture video
    UnsupportedDevice(String),

    /// The device does not support the requested I/O method
    UnsupportedIoMethod(format::IoMethod),

    /// The (native, output) pixel format combination cannot be converted
    UnsupportedPixelFormat {
        native: format::PixelFormat,
        output: format::OutputFormat,
    },

    /// An argument or buffer was malformed
    InvalidArgument(String),

    /// A V4L2 ioctl failed
    Ioctl { request: &'static str, errno: Errno },

    /// The driver granted fewer buffers than required
    InsufficientBuffers(u32),

    /// MJPEG frame could not be decoded
    Decode(String),

    /// A camera control could not be applied
    Control { name: String, message: String },

    /// The operation requires the engine to be streaming
    NotStreaming,

    /// Integer conversion error (try_from failed)
    TryFromInt(TryFromIntError),

    /// I/O error from underlying system calls
    Io(io::Error),
}

impl Error {
    /// OS error number carried by this error, if any.
    ///
    /// Used to classify failures such as `EAGAIN` (no frame yet) and `EIO`
    /// (ignorable per V4L2 convention).
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Ioctl { errno, .. } => Some(*errno),
            Error::Io(err)
            | Error::Open { source: err, .. }
            | Error::DeviceNotFound { source: err, .. } => {
                err.raw_os_error().map(Errno::from_raw)
            }
            _ => None,
        }
    }

    pub(crate) fn ioctl(request: &'static str, errno: Errno) -> Self {
        Error::Ioctl { request, errno }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::DeviceNotFound { path, source } => {
                write!(f, "cannot identify '{}': {}", path.display(), source)
            }
            Error::NotACharacterDevice(path) => write!(f, "{} is no device", path.display()),
            Error::Open { path, source } => {
                write!(f, "cannot open '{}': {}", path.display(), source)
            }
            Error::UnsupportedDevice(msg) => write!(f, "unsupported device: {}", msg),
            Error::UnsupportedIoMethod(method) => {
                write!(f, "device does not support {} i/o", method)
            }
            Error::UnsupportedPixelFormat { native, output } => write!(
                f,
                "unsupported pixel format conversion: {} -> {}",
                native, output
            ),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Ioctl { request, errno } => {
                write!(f, "{} failed: {} ({})", request, errno.desc(), *errno as i32)
            }
            Error::InsufficientBuffers(count) => {
                write!(f, "insufficient buffer memory: driver granted {}", count)
            }
            Error::Decode(msg) => write!(f, "MJPEG decode error: {}", msg),
            Error::Control { name, message } => write!(f, "control {}: {}", name, message),
            Error::NotStreaming => write!(f, "device is not streaming"),
            Error::TryFromInt(err) => write!(f, "integer conversion error: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::DeviceNotFound { source, .. } | Error::Open { source, .. } => Some(source),
            Error::Ioctl { errno, .. } => Some(errno),
            Error::TryFromInt(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::TryFromInt(err)
    }
}

/// Library version string
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
