// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Descriptors returned by device discovery:
//!
//! - [`Capabilities`] - decoded `VIDIOC_QUERYCAP` bitmask
//! - [`Format`] - capture pixel format with its discrete frame sizes
//! - [`Resolution`] - width × height
//! - [`DeviceInfo`] - one device node with identity, capabilities and formats

use std::fmt;
use std::path::{Path, PathBuf};

use vidcap_sys as sys;

use crate::{
    fourcc::FourCC,
    format::{IoMethod, PixelFormat},
};

const CAPABILITY_NAMES: &[(u32, &str)] = &[
    (sys::V4L2_CAP_VIDEO_CAPTURE, "Video Capture"),
    (sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE, "Video Capture Multiplanar"),
    (sys::V4L2_CAP_VIDEO_OUTPUT, "Video Output"),
    (sys::V4L2_CAP_VIDEO_OUTPUT_MPLANE, "Video Output Multiplanar"),
    (sys::V4L2_CAP_VIDEO_M2M, "Video Memory-to-Memory"),
    (sys::V4L2_CAP_VIDEO_M2M_MPLANE, "Video Memory-to-Memory Multiplanar"),
    (sys::V4L2_CAP_VIDEO_OVERLAY, "Video Overlay"),
    (sys::V4L2_CAP_VIDEO_OUTPUT_OVERLAY, "Video Output Overlay"),
    (sys::V4L2_CAP_VBI_CAPTURE, "VBI Capture"),
    (sys::V4L2_CAP_VBI_OUTPUT, "VBI Output"),
    (sys::V4L2_CAP_SLICED_VBI_CAPTURE, "Sliced VBI Capture"),
    (sys::V4L2_CAP_SLICED_VBI_OUTPUT, "Sliced VBI Output"),
    (sys::V4L2_CAP_RDS_CAPTURE, "RDS Capture"),
    (sys::V4L2_CAP_RDS_OUTPUT, "RDS Output"),
    (sys::V4L2_CAP_SDR_CAPTURE, "SDR Capture"),
    (sys::V4L2_CAP_SDR_OUTPUT, "SDR Output"),
    (sys::V4L2_CAP_META_CAPTURE, "Metadata Capture"),
    (sys::V4L2_CAP_META_OUTPUT, "Metadata Output"),
    (sys::V4L2_CAP_TUNER, "Tuner"),
    (sys::V4L2_CAP_HW_FREQ_SEEK, "HW Frequency Seek"),
    (sys::V4L2_CAP_MODULATOR, "Modulator"),
    (sys::V4L2_CAP_AUDIO, "Audio"),
    (sys::V4L2_CAP_RADIO, "Radio"),
    (sys::V4L2_CAP_TOUCH, "Touch Device"),
    (sys::V4L2_CAP_IO_MC, "I/O Media Controller"),
    (sys::V4L2_CAP_READWRITE, "Read/Write"),
    (sys::V4L2_CAP_STREAMING, "Streaming"),
    (sys::V4L2_CAP_EXT_PIX_FORMAT, "Extended Pix Format"),
    (sys::V4L2_CAP_DEVICE_CAPS, "Device Capabilities"),
];

/// V4L2 capability bitmask of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Single-planar video capture, the only kind the engine drives.
    pub fn is_capture(self) -> bool {
        self.contains(sys::V4L2_CAP_VIDEO_CAPTURE)
    }

    pub fn supports(self, method: IoMethod) -> bool {
        self.contains(method.required_capability())
    }

    /// Human-readable names of every flag set, in `v4l2-ctl` order.
    pub fn names(self) -> Vec<&'static str> {
        CAPABILITY_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)?;
        let names = self.names();
        if !names.is_empty() {
            write!(f, " ({})", names.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A capture format reported by `VIDIOC_ENUM_FMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub fourcc: FourCC,
    pub description: String,
    pub compressed: bool,
    /// Converted in software by the driver or libv4l.
    pub emulated: bool,
    /// Frame sizes from `VIDIOC_ENUM_FRAMESIZES`. Stepwise and continuous
    /// ranges contribute their minimum and maximum.
    pub resolutions: Vec<Resolution>,
}

impl Format {
    /// Matching native format for the engine, if it has one.
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.fourcc)
    }

    pub fn supports_resolution(&self, width: u32, height: u32) -> bool {
        self.resolutions
            .iter()
            .any(|res| res.width == width && res.height == height)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.fourcc, self.description)?;
        if self.compressed {
            write!(f, " compressed")?;
        }
        if self.emulated {
            write!(f, " emulated")?;
        }
        Ok(())
    }
}

/// One V4L2 device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub(crate) path: PathBuf,
    pub(crate) driver: String,
    pub(crate) card: String,
    pub(crate) bus_info: String,
    pub(crate) version: u32,
    pub(crate) capabilities: Capabilities,
    pub(crate) formats: Vec<Format>,
}

impl DeviceInfo {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn bus_info(&self) -> &str {
        &self.bus_info
    }

    /// Driver version as `major.minor.patch`.
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }

    /// Capabilities of this node (`device_caps` when reported).
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    pub fn is_capture(&self) -> bool {
        self.capabilities.is_capture()
    }

    /// True when the node offers `format` as a capture format.
    pub fn supports(&self, format: PixelFormat) -> bool {
        let fourcc = format.fourcc();
        self.formats.iter().any(|f| f.fourcc == fourcc)
    }

    /// Number in `/dev/videoN`, used for ordering.
    pub fn number(&self) -> Option<u32> {
        device_number(&self.path)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}) @ {}",
            self.path.display(),
            self.card,
            self.driver,
            self.bus_info
        )
    }
}

/// `N` for a `videoN` file name.
pub(crate) fn device_number(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("video")?
        .parse()
        .ok()
}

/// Text of a NUL-padded fixed-size kernel string.
pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}
