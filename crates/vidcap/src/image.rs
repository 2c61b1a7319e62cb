// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use unix_ts::Timestamp;

use crate::{format::OutputFormat, options::StreamOptions};

/// Frame buffer filled in place by [`CaptureEngine::capture`].
///
/// Allocate one per capture loop, sized for the output format, and pass it
/// to every capture call. The engine never reallocates it.
///
/// [`CaptureEngine::capture`]: crate::CaptureEngine::capture
#[derive(Debug, Clone)]
pub struct CameraImage {
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    is_new: bool,
    tv_sec: i64,
    tv_usec: i64,
    data: Vec<u8>,
}

impl CameraImage {
    /// Allocate a zeroed image of `width * height * bytes_per_pixel` bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use vidcap::{CameraImage, OutputFormat};
    ///
    /// let image = CameraImage::new(640, 480, OutputFormat::Rgb);
    /// assert_eq!(image.image_size(), 640 * 480 * 3);
    /// assert!(!image.is_new());
    /// ```
    pub fn new(width: u32, height: u32, format: OutputFormat) -> Self {
        let bytes_per_pixel = format.bytes_per_pixel();
        CameraImage {
            width,
            height,
            bytes_per_pixel,
            is_new: false,
            tv_sec: 0,
            tv_usec: 0,
            data: vec![0; width as usize * height as usize * bytes_per_pixel],
        }
    }

    /// Allocate an image matching the requested resolution and output format.
    ///
    /// The driver may adjust the resolution during negotiation. Use
    /// [`CaptureEngine::new_image`](crate::CaptureEngine::new_image) once the
    /// device is configured to pick up the adopted geometry.
    pub fn for_options(options: &StreamOptions) -> Self {
        CameraImage::new(options.width, options.height, options.output_format)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// Size of the pixel buffer in bytes; always `width * height * bytes_per_pixel`.
    pub fn image_size(&self) -> usize {
        self.data.len()
    }

    /// True when the last capture call delivered a frame.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Kernel capture timestamp, seconds part.
    pub fn tv_sec(&self) -> i64 {
        self.tv_sec
    }

    /// Kernel capture timestamp, microseconds part.
    pub fn tv_usec(&self) -> i64 {
        self.tv_usec
    }

    /// Kernel capture timestamp.
    ///
    /// The clock is whatever the driver stamps buffers with, usually
    /// `CLOCK_MONOTONIC`.
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.tv_sec, (self.tv_usec.clamp(0, 999_999) * 1000) as u32)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Clear the new-frame flag and zero the pixels.
    pub(crate) fn reset(&mut self) {
        self.is_new = false;
        self.data.fill(0);
    }

    pub(crate) fn set_timestamp(&mut self, tv_sec: i64, tv_usec: i64) {
        self.tv_sec = tv_sec;
        self.tv_usec = tv_usec;
    }

    pub(crate) fn mark_new(&mut self) {
        self.is_new = true;
    }

    /// True when the geometry matches the negotiated stream.
    pub(crate) fn matches(&self, width: u32, height: u32, format: OutputFormat) -> bool {
        self.width == width
            && self.height == height
            && self.bytes_per_pixel == format.bytes_per_pixel()
    }
}
