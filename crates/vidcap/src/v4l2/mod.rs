// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 device discovery.
//!
//! Scans `/dev/video*`, queries each node with `VIDIOC_QUERYCAP` and lists
//! its capture formats (`VIDIOC_ENUM_FMT`) and frame sizes
//! (`VIDIOC_ENUM_FRAMESIZES`), so capture pipelines can pick a camera and a
//! mode without hardcoded paths.
//!
//! # Quick Start
//!
//! ```no_run
//! use vidcap::{v4l2, PixelFormat};
//!
//! for device in v4l2::enumerate()? {
//!     println!("{}: {}", device.path().display(), device.card());
//!     for format in device.formats() {
//!         println!("  {}", format);
//!     }
//! }
//!
//! // A camera that can deliver 720p MJPEG
//! if let Some(camera) = v4l2::find_camera(PixelFormat::Mjpeg, Some((1280, 720)))? {
//!     println!("using {}", camera.path().display());
//! }
//! # Ok::<(), vidcap::Error>(())
//! ```
//!
//! Only single-planar capture formats are enumerated since that is what
//! [`CaptureEngine`](crate::CaptureEngine) drives.

mod device;
mod enumerator;

pub use device::{Capabilities, DeviceInfo, Format, Resolution};
pub use enumerator::{enumerate, enumerate_in, find_camera, inspect};
