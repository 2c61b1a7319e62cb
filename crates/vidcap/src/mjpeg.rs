// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::io::Cursor;

use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use log::trace;

use crate::Error;

/// Full-frame Motion-JPEG decoder used by the MJPEG conversion path.
///
/// `init` fixes the negotiated geometry; `decode` must fill exactly
/// `width * height * 3` RGB bytes and fail when the picture size differs.
pub trait MjpegDecoder: Send {
    fn init(&mut self, width: u32, height: u32) -> Result<(), Error>;

    fn decode(&mut self, jpeg: &[u8], rgb: &mut [u8]) -> Result<(), Error>;
}

/// Software decoder backed by the `jpeg-decoder` crate.
#[derive(Debug, Default)]
pub struct JpegDecoder {
    width: u32,
    height: u32,
}

impl JpegDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MjpegDecoder for JpegDecoder {
    fn init(&mut self, width: u32, height: u32) -> Result<(), Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "MJPEG decoder geometry {}x{}",
                width, height
            )));
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn decode(&mut self, jpeg: &[u8], rgb: &mut [u8]) -> Result<(), Error> {
        let pixel_count = self.width as usize * self.height as usize;
        if pixel_count == 0 {
            return Err(Error::Decode("decoder not initialized".to_owned()));
        }
        if rgb.len() < pixel_count * 3 {
            return Err(Error::InvalidArgument(format!(
                "RGB buffer too small: {} < {}",
                rgb.len(),
                pixel_count * 3
            )));
        }

        let mut decoder = Decoder::new(Cursor::new(jpeg));
        let pixels = decoder
            .decode()
            .map_err(|err| Error::Decode(err.to_string()))?;
        let info = decoder
            .info()
            .ok_or_else(|| Error::Decode("missing picture header".to_owned()))?;

        if u32::from(info.width) != self.width || u32::from(info.height) != self.height {
            return Err(Error::Decode(format!(
                "picture is {}x{}, expected {}x{}",
                info.width, info.height, self.width, self.height
            )));
        }
        trace!("decoded {} byte MJPEG frame as {:?}", jpeg.len(), info.pixel_format);

        match info.pixel_format {
            JpegPixelFormat::RGB24 => {
                let expected = pixel_count * 3;
                if pixels.len() < expected {
                    return Err(Error::Decode("RGB size mismatch".to_owned()));
                }
                rgb[..expected].copy_from_slice(&pixels[..expected]);
            }
            JpegPixelFormat::L8 => {
                if pixels.len() < pixel_count {
                    return Err(Error::Decode("L8 size mismatch".to_owned()));
                }
                for (out, &luma) in rgb.chunks_exact_mut(3).zip(&pixels[..pixel_count]) {
                    out.fill(luma);
                }
            }
            other => {
                return Err(Error::Decode(format!(
                    "unsupported picture format {:?}",
                    other
                )))
            }
        }
        Ok(())
    }
}
