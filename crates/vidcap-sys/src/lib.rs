// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Raw Video4Linux2 kernel ABI.
//!
//! The structures in this crate mirror `<linux/videodev2.h>` field for field
//! and the ioctl wrappers are generated with the `nix` ioctl macros, so the
//! request numbers encode the same sizes the kernel expects. Nothing here is
//! safe to call without upholding the kernel contract; the `vidcap` crate
//! provides the safe layer.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use libc::{c_int, c_ulong, c_void, timeval};

pub use nix;

/// Build a V4L2 four-character code the same way the kernel's
/// `v4l2_fourcc()` macro does.
pub const fn v4l2_fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

// Device capabilities (v4l2_capability.capabilities)
pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_VIDEO_OUTPUT: u32 = 0x0000_0002;
pub const V4L2_CAP_VIDEO_OVERLAY: u32 = 0x0000_0004;
pub const V4L2_CAP_VBI_CAPTURE: u32 = 0x0000_0010;
pub const V4L2_CAP_VBI_OUTPUT: u32 = 0x0000_0020;
pub const V4L2_CAP_SLICED_VBI_CAPTURE: u32 = 0x0000_0040;
pub const V4L2_CAP_SLICED_VBI_OUTPUT: u32 = 0x0000_0080;
pub const V4L2_CAP_RDS_CAPTURE: u32 = 0x0000_0100;
pub const V4L2_CAP_VIDEO_OUTPUT_OVERLAY: u32 = 0x0000_0200;
pub const V4L2_CAP_HW_FREQ_SEEK: u32 = 0x0000_0400;
pub const V4L2_CAP_RDS_OUTPUT: u32 = 0x0000_0800;
pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const V4L2_CAP_VIDEO_OUTPUT_MPLANE: u32 = 0x0000_2000;
pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
pub const V4L2_CAP_TUNER: u32 = 0x0001_0000;
pub const V4L2_CAP_AUDIO: u32 = 0x0002_0000;
pub const V4L2_CAP_RADIO: u32 = 0x0004_0000;
pub const V4L2_CAP_MODULATOR: u32 = 0x0008_0000;
pub const V4L2_CAP_SDR_CAPTURE: u32 = 0x0010_0000;
pub const V4L2_CAP_EXT_PIX_FORMAT: u32 = 0x0020_0000;
pub const V4L2_CAP_SDR_OUTPUT: u32 = 0x0040_0000;
pub const V4L2_CAP_META_CAPTURE: u32 = 0x0080_0000;
pub const V4L2_CAP_READWRITE: u32 = 0x0100_0000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_META_OUTPUT: u32 = 0x0800_0000;
pub const V4L2_CAP_TOUCH: u32 = 0x1000_0000;
pub const V4L2_CAP_IO_MC: u32 = 0x2000_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// enum v4l2_buf_type
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;

// enum v4l2_memory
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_USERPTR: u32 = 2;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

// enum v4l2_field
pub const V4L2_FIELD_ANY: u32 = 0;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_FIELD_INTERLACED: u32 = 4;

// v4l2_buffer.flags
pub const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_TIMESTAMP_MASK: u32 = 0x0000_e000;
pub const V4L2_BUF_FLAG_TIMESTAMP_UNKNOWN: u32 = 0x0000_0000;
pub const V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC: u32 = 0x0000_2000;
pub const V4L2_BUF_FLAG_TIMESTAMP_COPY: u32 = 0x0000_4000;

// v4l2_fmtdesc.flags
pub const V4L2_FMT_FLAG_COMPRESSED: u32 = 0x0001;
pub const V4L2_FMT_FLAG_EMULATED: u32 = 0x0002;

// enum v4l2_frmsizetypes
pub const V4L2_FRMSIZE_TYPE_DISCRETE: u32 = 1;
pub const V4L2_FRMSIZE_TYPE_CONTINUOUS: u32 = 2;
pub const V4L2_FRMSIZE_TYPE_STEPWISE: u32 = 3;

// v4l2_captureparm.capability
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x1000;

// Pixel formats
pub const V4L2_PIX_FMT_YUYV: u32 = v4l2_fourcc(b'Y', b'U', b'Y', b'V');
pub const V4L2_PIX_FMT_UYVY: u32 = v4l2_fourcc(b'U', b'Y', b'V', b'Y');
pub const V4L2_PIX_FMT_MJPEG: u32 = v4l2_fourcc(b'M', b'J', b'P', b'G');
pub const V4L2_PIX_FMT_JPEG: u32 = v4l2_fourcc(b'J', b'P', b'E', b'G');
pub const V4L2_PIX_FMT_RGB24: u32 = v4l2_fourcc(b'R', b'G', b'B', b'3');
pub const V4L2_PIX_FMT_BGR24: u32 = v4l2_fourcc(b'B', b'G', b'R', b'3');
pub const V4L2_PIX_FMT_GREY: u32 = v4l2_fourcc(b'G', b'R', b'E', b'Y');
pub const V4L2_PIX_FMT_NV12: u32 = v4l2_fourcc(b'N', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_Y10: u32 = v4l2_fourcc(b'Y', b'1', b'0', b' ');

// Control classes and identifiers
pub const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
pub const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;
pub const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
pub const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;

pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;

// enum v4l2_exposure_auto_type
pub const V4L2_EXPOSURE_AUTO: i32 = 0;
pub const V4L2_EXPOSURE_MANUAL: i32 = 1;
pub const V4L2_EXPOSURE_SHUTTER_PRIORITY: i32 = 2;
pub const V4L2_EXPOSURE_APERTURE_PRIORITY: i32 = 3;

// v4l2_queryctrl.flags
pub const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

/// Equivalent of the kernel's `V4L2_CTRL_ID2CLASS()` macro.
pub const fn v4l2_ctrl_id2class(id: u32) -> u32 {
    id & 0x0fff_0000
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_cropcap {
    pub type_: u32,
    pub bounds: v4l2_rect,
    pub defrect: v4l2_rect,
    pub pixelaspect: v4l2_fract,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_crop {
    pub type_: u32,
    pub c: v4l2_rect,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// The `fmt` union of `struct v4l2_format`. Only the single-planar pixel
/// format is used; `raw_data` pins the size and the zero-length array pins
/// the pointer alignment contributed by `struct v4l2_window`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
    pub pix: v4l2_pix_format,
    pub raw_data: [u8; 200],
    _align: [c_ulong; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_captureparm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_streamparm_parm {
    pub capture: v4l2_captureparm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_streamparm {
    pub type_: u32,
    pub parm: v4l2_streamparm_parm,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_request {
    pub request_fd: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request: v4l2_buffer_request,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_fmtdesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_frmsize_discrete {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_frmsize_stepwise {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_frmsize {
    pub discrete: v4l2_frmsize_discrete,
    pub stepwise: v4l2_frmsize_stepwise,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_frmsizeenum {
    pub index: u32,
    pub pixel_format: u32,
    pub type_: u32,
    pub size: v4l2_frmsize,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_ext_control_value {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

/// `struct v4l2_ext_control` is declared `__attribute__((packed))`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_ext_control {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub value: v4l2_ext_control_value,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_ext_controls {
    /// `ctrl_class` and `which` share storage in the kernel header.
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut v4l2_ext_control,
}

macro_rules! zeroed_default {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    // SAFETY: plain kernel ABI data; all-zero is the documented
                    // initial state for every field, pointers included.
                    unsafe { std::mem::zeroed() }
                }
            }
        )*
    };
}

zeroed_default!(
    v4l2_capability,
    v4l2_rect,
    v4l2_fract,
    v4l2_cropcap,
    v4l2_crop,
    v4l2_pix_format,
    v4l2_format,
    v4l2_captureparm,
    v4l2_streamparm,
    v4l2_requestbuffers,
    v4l2_buffer,
    v4l2_fmtdesc,
    v4l2_frmsizeenum,
    v4l2_queryctrl,
    v4l2_control,
    v4l2_ext_control,
    v4l2_ext_controls,
);

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(std::mem::size_of::<v4l2_capability>() == 104);
    assert!(std::mem::size_of::<v4l2_format>() == 208);
    assert!(std::mem::size_of::<v4l2_streamparm>() == 204);
    assert!(std::mem::size_of::<v4l2_requestbuffers>() == 20);
    assert!(std::mem::size_of::<v4l2_buffer>() == 88);
    assert!(std::mem::size_of::<v4l2_cropcap>() == 44);
    assert!(std::mem::size_of::<v4l2_crop>() == 20);
    assert!(std::mem::size_of::<v4l2_fmtdesc>() == 64);
    assert!(std::mem::size_of::<v4l2_frmsizeenum>() == 44);
    assert!(std::mem::size_of::<v4l2_queryctrl>() == 68);
    assert!(std::mem::size_of::<v4l2_ext_control>() == 20);
    assert!(std::mem::size_of::<v4l2_ext_controls>() == 32);
};

const VIDIOC_MAGIC: u8 = b'V';

nix::ioctl_read!(vidioc_querycap, VIDIOC_MAGIC, 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_enum_fmt, VIDIOC_MAGIC, 2, v4l2_fmtdesc);
nix::ioctl_readwrite!(vidioc_s_fmt, VIDIOC_MAGIC, 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, VIDIOC_MAGIC, 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, VIDIOC_MAGIC, 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, VIDIOC_MAGIC, 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, VIDIOC_MAGIC, 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, VIDIOC_MAGIC, 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, VIDIOC_MAGIC, 19, c_int);
nix::ioctl_readwrite!(vidioc_g_parm, VIDIOC_MAGIC, 21, v4l2_streamparm);
nix::ioctl_readwrite!(vidioc_s_parm, VIDIOC_MAGIC, 22, v4l2_streamparm);
nix::ioctl_readwrite!(vidioc_s_ctrl, VIDIOC_MAGIC, 28, v4l2_control);
nix::ioctl_readwrite!(vidioc_queryctrl, VIDIOC_MAGIC, 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_cropcap, VIDIOC_MAGIC, 58, v4l2_cropcap);
nix::ioctl_write_ptr!(vidioc_s_crop, VIDIOC_MAGIC, 60, v4l2_crop);
nix::ioctl_readwrite!(vidioc_s_ext_ctrls, VIDIOC_MAGIC, 72, v4l2_ext_controls);
nix::ioctl_readwrite!(vidioc_enum_framesizes, VIDIOC_MAGIC, 74, v4l2_frmsizeenum);
