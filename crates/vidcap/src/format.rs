// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{fmt, str::FromStr};

use crate::{fourcc::FourCC, Error};

/// Device-native pixel encoding requested from the driver.
///
/// `YuvMono10` is negotiated as YUYV on the wire; the driver fills each
/// 16-bit sample with a little-endian 10-bit luma value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Mjpeg,
    YuvMono10,
    Rgb24,
    Bgr24,
    Grey,
    Nv12,
}

impl PixelFormat {
    /// Code passed to `VIDIOC_S_FMT`.
    pub fn fourcc(self) -> FourCC {
        let code = match self {
            PixelFormat::Yuyv | PixelFormat::YuvMono10 => vidcap_sys::V4L2_PIX_FMT_YUYV,
            PixelFormat::Uyvy => vidcap_sys::V4L2_PIX_FMT_UYVY,
            PixelFormat::Mjpeg => vidcap_sys::V4L2_PIX_FMT_MJPEG,
            PixelFormat::Rgb24 => vidcap_sys::V4L2_PIX_FMT_RGB24,
            PixelFormat::Bgr24 => vidcap_sys::V4L2_PIX_FMT_BGR24,
            PixelFormat::Grey => vidcap_sys::V4L2_PIX_FMT_GREY,
            PixelFormat::Nv12 => vidcap_sys::V4L2_PIX_FMT_NV12,
        };
        FourCC::from_u32(code)
    }

    /// Native format delivered under a driver code. YUYV always maps to
    /// colour YUYV since the mono variant cannot be told apart on the wire.
    pub fn from_fourcc(fourcc: FourCC) -> Option<PixelFormat> {
        match fourcc.as_u32() {
            vidcap_sys::V4L2_PIX_FMT_YUYV => Some(PixelFormat::Yuyv),
            vidcap_sys::V4L2_PIX_FMT_UYVY => Some(PixelFormat::Uyvy),
            vidcap_sys::V4L2_PIX_FMT_MJPEG | vidcap_sys::V4L2_PIX_FMT_JPEG => {
                Some(PixelFormat::Mjpeg)
            }
            vidcap_sys::V4L2_PIX_FMT_RGB24 => Some(PixelFormat::Rgb24),
            vidcap_sys::V4L2_PIX_FMT_BGR24 => Some(PixelFormat::Bgr24),
            vidcap_sys::V4L2_PIX_FMT_GREY => Some(PixelFormat::Grey),
            vidcap_sys::V4L2_PIX_FMT_NV12 => Some(PixelFormat::Nv12),
            _ => None,
        }
    }

    /// True when the wire format carries packed 10-bit mono samples.
    pub fn is_monochrome(self) -> bool {
        self == PixelFormat::YuvMono10
    }

    /// Compressed formats have a variable payload size per frame.
    pub fn is_compressed(self) -> bool {
        self == PixelFormat::Mjpeg
    }

    /// Minimum payload for one uncompressed frame, `None` for MJPEG.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv | PixelFormat::Uyvy | PixelFormat::YuvMono10 => Some(pixels * 2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Grey => Some(pixels),
            PixelFormat::Nv12 => Some(pixels + pixels / 2),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::YuvMono10 => "YUVMONO10",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Grey => "GREY",
            PixelFormat::Nv12 => "NV12",
        };
        f.write_str(name)
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yuyv" | "yuy2" => Ok(PixelFormat::Yuyv),
            "uyvy" => Ok(PixelFormat::Uyvy),
            "mjpeg" | "mjpg" => Ok(PixelFormat::Mjpeg),
            "yuvmono10" | "mono10" | "y10" => Ok(PixelFormat::YuvMono10),
            "rgb24" | "rgb" | "rgb3" => Ok(PixelFormat::Rgb24),
            "bgr24" | "bgr" | "bgr3" => Ok(PixelFormat::Bgr24),
            "grey" | "gray" | "gray8" | "y8" => Ok(PixelFormat::Grey),
            "nv12" => Ok(PixelFormat::Nv12),
            _ => Err(Error::InvalidArgument(format!("unknown pixel format '{}'", s))),
        }
    }
}

/// Encoding delivered to the caller in [`CameraImage`](crate::CameraImage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Rgb,
    Bgr,
    Yuyv,
    Gray,
}

impl OutputFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            OutputFormat::Rgb | OutputFormat::Bgr => 3,
            OutputFormat::Yuyv => 2,
            OutputFormat::Gray => 1,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Rgb => "RGB",
            OutputFormat::Bgr => "BGR",
            OutputFormat::Yuyv => "YUYV",
            OutputFormat::Gray => "GRAY",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" | "rgb24" => Ok(OutputFormat::Rgb),
            "bgr" | "bgr24" => Ok(OutputFormat::Bgr),
            "yuyv" | "yuy2" => Ok(OutputFormat::Yuyv),
            "gray" | "grey" | "gray8" | "mono" => Ok(OutputFormat::Gray),
            _ => Err(Error::InvalidArgument(format!("unknown output format '{}'", s))),
        }
    }
}

/// How frames move between the driver and the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoMethod {
    /// Plain `read(2)` into a single heap buffer.
    Read,
    /// Driver-allocated buffers mapped into the process.
    Mmap,
    /// Page-aligned process buffers handed to the driver.
    Userptr,
}

impl IoMethod {
    /// Capability bit the device must advertise for this method.
    pub fn required_capability(self) -> u32 {
        match self {
            IoMethod::Read => vidcap_sys::V4L2_CAP_READWRITE,
            IoMethod::Mmap | IoMethod::Userptr => vidcap_sys::V4L2_CAP_STREAMING,
        }
    }
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoMethod::Read => "read",
            IoMethod::Mmap => "mmap",
            IoMethod::Userptr => "userptr",
        };
        f.write_str(name)
    }
}

impl FromStr for IoMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(IoMethod::Read),
            "mmap" => Ok(IoMethod::Mmap),
            "userptr" | "user" => Ok(IoMethod::Userptr),
            _ => Err(Error::InvalidArgument(format!("unknown io method '{}'", s))),
        }
    }
}
