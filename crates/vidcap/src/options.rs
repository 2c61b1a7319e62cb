// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::path::PathBuf;

use crate::format::{IoMethod, OutputFormat, PixelFormat};

/// Camera tuning knobs applied after the device is configured.
///
/// Every numeric control uses `-1` for "leave at the driver default". The
/// auto flags switch the corresponding automatic mode on; a manual mode is
/// only engaged when a manual value is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraControls {
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
    pub sharpness: i32,
    pub gain: i32,
    /// Kelvin, used when `auto_white_balance` is off
    pub white_balance: i32,
    /// Absolute exposure in 100 µs units, used when `auto_exposure` is off
    pub exposure: i32,
    /// Absolute focus position, used when `auto_focus` is off
    pub focus: i32,
    pub auto_white_balance: bool,
    pub auto_exposure: bool,
    pub auto_focus: bool,
}

impl Default for CameraControls {
    fn default() -> Self {
        CameraControls {
            brightness: -1,
            contrast: -1,
            saturation: -1,
            sharpness: -1,
            gain: -1,
            white_balance: -1,
            exposure: -1,
            focus: -1,
            auto_white_balance: false,
            auto_exposure: false,
            auto_focus: false,
        }
    }
}

impl CameraControls {
    /// True when nothing would be sent to the device.
    pub fn is_default(&self) -> bool {
        *self == CameraControls::default()
    }
}

/// Capture configuration, fixed once the engine is initialised.
///
/// ```
/// use vidcap::{IoMethod, OutputFormat, PixelFormat, StreamOptions};
///
/// let options = StreamOptions::new("/dev/video2")
///     .with_resolution(1280, 720)
///     .with_pixel_format(PixelFormat::Mjpeg)
///     .with_output_format(OutputFormat::Bgr)
///     .with_io_method(IoMethod::Userptr);
/// assert_eq!(options.num_buffers, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    /// video device node, e.g. `/dev/video0`
    pub device: PathBuf,

    /// requested width; the driver may adjust it during negotiation
    pub width: u32,

    /// requested height; the driver may adjust it during negotiation
    pub height: u32,

    /// requested frames per second
    pub frame_rate: f64,

    /// encoding requested from the driver
    pub pixel_format: PixelFormat,

    /// encoding delivered to the caller
    pub output_format: OutputFormat,

    pub io_method: IoMethod,

    /// buffers requested for MMAP and USERPTR queues
    pub num_buffers: u32,

    pub controls: CameraControls,

    /// Requeue frames whose timestamp follows the previous frame by less than
    /// `0.9 / frame_rate` seconds instead of delivering them.
    pub drop_early_frames: bool,

    /// Treat `EIO` from dequeue or read as a usable frame.
    pub eio_fallthrough: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            frame_rate: 30.0,
            pixel_format: PixelFormat::Yuyv,
            output_format: OutputFormat::Rgb,
            io_method: IoMethod::Mmap,
            num_buffers: 4,
            controls: CameraControls::default(),
            drop_early_frames: false,
            eio_fallthrough: true,
        }
    }
}

impl StreamOptions {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        StreamOptions {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn with_resolution(self, width: u32, height: u32) -> Self {
        StreamOptions {
            width,
            height,
            ..self
        }
    }

    pub fn with_frame_rate(self, frame_rate: f64) -> Self {
        StreamOptions { frame_rate, ..self }
    }

    pub fn with_pixel_format(self, pixel_format: PixelFormat) -> Self {
        StreamOptions {
            pixel_format,
            ..self
        }
    }

    pub fn with_output_format(self, output_format: OutputFormat) -> Self {
        StreamOptions {
            output_format,
            ..self
        }
    }

    pub fn with_io_method(self, io_method: IoMethod) -> Self {
        StreamOptions { io_method, ..self }
    }

    pub fn with_buffers(self, num_buffers: u32) -> Self {
        StreamOptions {
            num_buffers,
            ..self
        }
    }

    pub fn with_controls(self, controls: CameraControls) -> Self {
        StreamOptions { controls, ..self }
    }

    pub fn with_frame_drop(self, drop_early_frames: bool) -> Self {
        StreamOptions {
            drop_early_frames,
            ..self
        }
    }

    pub fn with_eio_fallthrough(self, eio_fallthrough: bool) -> Self {
        StreamOptions {
            eio_fallthrough,
            ..self
        }
    }

    /// Output frame size in bytes for the requested geometry.
    pub fn image_size(&self) -> usize {
        self.width as usize * self.height as usize * self.output_format.bytes_per_pixel()
    }
}
