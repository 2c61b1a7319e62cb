// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Pixel-format conversion.
//!
//! Every routine takes the source frame, a destination slice and the frame
//! geometry. Nothing here allocates or performs I/O. The YUV transform is
//!
//! ```text
//! r = clip(y + 1.370705 * (v - 128))
//! g = clip(y - 0.698001 * (v - 128) - 0.337633 * (u - 128))
//! b = clip(y + 1.732446 * (u - 128))
//! ```
//!
//! evaluated in double precision and truncated toward zero before clipping.
//! The AVX path evaluates the same expressions lane by lane in the same
//! order, so its output is byte-identical to the scalar path.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use crate::{
    format::{OutputFormat, PixelFormat},
    mjpeg::MjpegDecoder,
    Error,
};

const CLIP_OFFSET: i32 = 256;
const CLIP_LEN: usize = 768;

/// Saturation table for values in `[-256, 511]`.
const CLIP: [u8; CLIP_LEN] = build_clip_table();

const fn build_clip_table() -> [u8; CLIP_LEN] {
    let mut table = [0u8; CLIP_LEN];
    let mut i = 0;
    while i < CLIP_LEN {
        let v = i as i32 - CLIP_OFFSET;
        table[i] = if v < 0 {
            0
        } else if v > 255 {
            255
        } else {
            v as u8
        };
        i += 1;
    }
    table
}

#[inline]
fn clip(v: i32) -> u8 {
    CLIP[(v + CLIP_OFFSET).clamp(0, CLIP_LEN as i32 - 1) as usize]
}

/// Scalar reference transform for one luma sample and its chroma pair.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f64::from(y);
    let u = f64::from(u) - 128.0;
    let v = f64::from(v) - 128.0;
    let r = y + 1.370705 * v;
    let g = y - 0.698001 * v - 0.337633 * u;
    let b = y + 1.732446 * u;
    [clip(r as i32), clip(g as i32), clip(b as i32)]
}

/// Byte order of a packed 4:2:2 macropixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Y0 U Y1 V
    Yuyv,
    /// U Y0 V Y1
    Uyvy,
}

impl Packing {
    /// Offsets of (Y0, U, Y1, V) within a macropixel.
    const fn offsets(self) -> [usize; 4] {
        match self {
            Packing::Yuyv => [0, 1, 2, 3],
            Packing::Uyvy => [1, 0, 3, 2],
        }
    }
}

/// Channel order of a 3-byte output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[inline]
fn store(px: [u8; 3], order: ChannelOrder, out: &mut [u8]) {
    match order {
        ChannelOrder::Rgb => out.copy_from_slice(&px),
        ChannelOrder::Bgr => {
            out[0] = px[2];
            out[1] = px[1];
            out[2] = px[0];
        }
    }
}

fn check_len(what: &str, have: usize, need: usize) -> Result<(), Error> {
    if have < need {
        return Err(Error::InvalidArgument(format!(
            "{} buffer too small: {} < {} bytes",
            what, have, need
        )));
    }
    Ok(())
}

fn pixels(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

fn packed_422_scalar(src: &[u8], dst: &mut [u8], packing: Packing, order: ChannelOrder) {
    let [y0, u, y1, v] = packing.offsets();
    for (mp, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        let (first, second) = out.split_at_mut(3);
        store(yuv_to_rgb(mp[y0], mp[u], mp[v]), order, first);
        store(yuv_to_rgb(mp[y1], mp[u], mp[v]), order, second);
    }
}

/// Packed 4:2:2 to 24-bit RGB/BGR using only the scalar transform.
pub fn packed_422_to_rgb_scalar(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    packing: Packing,
    order: ChannelOrder,
) -> Result<(), Error> {
    let n = pixels(width, height);
    check_len("source", src.len(), n * 2)?;
    check_len("destination", dst.len(), n * 3)?;
    packed_422_scalar(&src[..n * 2], &mut dst[..n * 3], packing, order);
    Ok(())
}

/// Packed 4:2:2 to 24-bit RGB/BGR, using AVX when the CPU supports it.
pub fn packed_422_to_rgb(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    packing: Packing,
    order: ChannelOrder,
) -> Result<(), Error> {
    let n = pixels(width, height);
    check_len("source", src.len(), n * 2)?;
    check_len("destination", dst.len(), n * 3)?;

    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx")
        && is_x86_feature_detected!("sse4.1")
        && is_x86_feature_detected!("ssse3")
    {
        // SAFETY: AVX support was checked at runtime and both slices hold
        // at least `n` pixels.
        unsafe { packed_422_avx(&src[..n * 2], &mut dst[..n * 3], packing, order) };
        return Ok(());
    }

    packed_422_scalar(&src[..n * 2], &mut dst[..n * 3], packing, order);
    Ok(())
}

/// Two macropixels (four output pixels) per iteration. Any trailing
/// macropixel goes through the scalar path.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "ssse3,sse4.1,avx")]
unsafe fn packed_422_avx(src: &[u8], dst: &mut [u8], packing: Packing, order: ChannelOrder) {
    let (ys, us, vs) = match packing {
        Packing::Yuyv => (
            [0i8, 2, 4, 6, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
            [1i8, 1, 5, 5, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
            [3i8, 3, 7, 7, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
        ),
        Packing::Uyvy => (
            [1i8, 3, 5, 7, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
            [0i8, 0, 4, 4, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
            [2i8, 2, 6, 6, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1],
        ),
    };
    // Packed lanes are r0..r3 g0..g3 b0..b3; interleave into 12 bytes.
    let interleave = match order {
        ChannelOrder::Rgb => [0i8, 4, 8, 1, 5, 9, 2, 6, 10, 3, 7, 11, -1, -1, -1, -1],
        ChannelOrder::Bgr => [8i8, 4, 0, 9, 5, 1, 10, 6, 2, 11, 7, 3, -1, -1, -1, -1],
    };

    let blocks = src.len() / 8;
    unsafe {
        let y_mask = _mm_loadu_si128(ys.as_ptr() as *const __m128i);
        let u_mask = _mm_loadu_si128(us.as_ptr() as *const __m128i);
        let v_mask = _mm_loadu_si128(vs.as_ptr() as *const __m128i);
        let out_mask = _mm_loadu_si128(interleave.as_ptr() as *const __m128i);
        let bias = _mm256_set1_pd(128.0);
        let kr = _mm256_set1_pd(1.370705);
        let kgv = _mm256_set1_pd(0.698001);
        let kgu = _mm256_set1_pd(0.337633);
        let kb = _mm256_set1_pd(1.732446);
        let mut lanes = [0u8; 16];

        for i in 0..blocks {
            let raw = _mm_loadl_epi64(src.as_ptr().add(i * 8) as *const __m128i);
            let y = _mm256_cvtepi32_pd(_mm_cvtepu8_epi32(_mm_shuffle_epi8(raw, y_mask)));
            let u = _mm256_sub_pd(
                _mm256_cvtepi32_pd(_mm_cvtepu8_epi32(_mm_shuffle_epi8(raw, u_mask))),
                bias,
            );
            let v = _mm256_sub_pd(
                _mm256_cvtepi32_pd(_mm_cvtepu8_epi32(_mm_shuffle_epi8(raw, v_mask))),
                bias,
            );

            let r = _mm256_add_pd(y, _mm256_mul_pd(kr, v));
            let g = _mm256_sub_pd(
                _mm256_sub_pd(y, _mm256_mul_pd(kgv, v)),
                _mm256_mul_pd(kgu, u),
            );
            let b = _mm256_add_pd(y, _mm256_mul_pd(kb, u));

            // Truncate toward zero, then saturate to [0, 255] in two packs.
            let r = _mm256_cvttpd_epi32(r);
            let g = _mm256_cvttpd_epi32(g);
            let b = _mm256_cvttpd_epi32(b);
            let rg = _mm_packs_epi32(r, g);
            let b0 = _mm_packs_epi32(b, _mm_setzero_si128());
            let packed = _mm_shuffle_epi8(_mm_packus_epi16(rg, b0), out_mask);

            _mm_storeu_si128(lanes.as_mut_ptr() as *mut __m128i, packed);
            dst[i * 12..i * 12 + 12].copy_from_slice(&lanes[..12]);
        }
    }

    let done = blocks * 8;
    packed_422_scalar(&src[done..], &mut dst[done / 2 * 3..], packing, order);
}

/// Reorder UYVY macropixels into YUYV.
pub fn uyvy_to_yuyv(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> Result<(), Error> {
    let len = pixels(width, height) * 2;
    check_len("source", src.len(), len)?;
    check_len("destination", dst.len(), len)?;
    for (pair, out) in src[..len].chunks_exact(2).zip(dst.chunks_exact_mut(2)) {
        out[0] = pair[1];
        out[1] = pair[0];
    }
    Ok(())
}

#[inline]
fn mono10_sample(lo: u8, hi: u8) -> u8 {
    ((lo >> 2) & 0x3F) | ((hi << 6) & 0xC0)
}

/// Unpack 16-bit little-endian 10-bit mono samples to 8-bit.
///
/// `channels` is 1 for GRAY output or 3 to replicate into RGB/BGR.
pub fn mono10_unpack(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    channels: usize,
) -> Result<(), Error> {
    let n = pixels(width, height);
    check_len("source", src.len(), n * 2)?;
    check_len("destination", dst.len(), n * channels)?;
    for (sample, out) in src[..n * 2].chunks_exact(2).zip(dst.chunks_exact_mut(channels)) {
        out.fill(mono10_sample(sample[0], sample[1]));
    }
    Ok(())
}

/// 8-bit grey to a replicated 3-channel image.
pub fn grey_to_rgb(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> Result<(), Error> {
    let n = pixels(width, height);
    check_len("source", src.len(), n)?;
    check_len("destination", dst.len(), n * 3)?;
    for (&luma, out) in src[..n].iter().zip(dst.chunks_exact_mut(3)) {
        out.fill(luma);
    }
    Ok(())
}

/// Swap the first and third byte of every 24-bit pixel.
pub fn swap_rb(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> Result<(), Error> {
    let len = pixels(width, height) * 3;
    check_len("source", src.len(), len)?;
    check_len("destination", dst.len(), len)?;
    for (px, out) in src[..len].chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
        out[0] = px[2];
        out[1] = px[1];
        out[2] = px[0];
    }
    Ok(())
}

fn swap_rb_in_place(buf: &mut [u8]) {
    for px in buf.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// NV12 (full-resolution Y plane, interleaved 2x2-subsampled UV plane) to
/// 24-bit RGB/BGR.
pub fn nv12_to_rgb(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    order: ChannelOrder,
) -> Result<(), Error> {
    let (w, h) = (width as usize, height as usize);
    let luma_len = w * h;
    let chroma_stride = (w + 1) / 2 * 2;
    let chroma_len = chroma_stride * ((h + 1) / 2);
    check_len("source", src.len(), luma_len + chroma_len)?;
    check_len("destination", dst.len(), luma_len * 3)?;

    let (luma, chroma) = src.split_at(luma_len);
    for row in 0..h {
        let uv_row = &chroma[(row / 2) * chroma_stride..];
        for col in 0..w {
            let uv = (col / 2) * 2;
            let px = yuv_to_rgb(luma[row * w + col], uv_row[uv], uv_row[uv + 1]);
            let at = (row * w + col) * 3;
            store(px, order, &mut dst[at..at + 3]);
        }
    }
    Ok(())
}

fn copy(src: &[u8], dst: &mut [u8], len: usize) -> Result<(), Error> {
    check_len("source", src.len(), len)?;
    check_len("destination", dst.len(), len)?;
    dst[..len].copy_from_slice(&src[..len]);
    Ok(())
}

/// True when `native` frames can be converted into `output`.
pub fn is_supported(native: PixelFormat, output: OutputFormat) -> bool {
    use OutputFormat as O;
    use PixelFormat as P;

    matches!(
        (native, output),
        (P::Yuyv | P::Uyvy, O::Rgb | O::Bgr | O::Yuyv)
            | (P::YuvMono10 | P::Grey, O::Rgb | O::Bgr | O::Gray)
            | (P::Mjpeg | P::Rgb24 | P::Bgr24 | P::Nv12, O::Rgb | O::Bgr)
    )
}

/// Convert one frame from the device-native encoding into `output`.
///
/// `decoder` is required for MJPEG input and ignored otherwise.
pub fn convert(
    native: PixelFormat,
    output: OutputFormat,
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    decoder: Option<&mut (dyn MjpegDecoder + '_)>,
) -> Result<(), Error> {
    use OutputFormat as O;
    use PixelFormat as P;

    let n = pixels(width, height);
    match (native, output) {
        (P::Yuyv, O::Rgb) => packed_422_to_rgb(src, dst, width, height, Packing::Yuyv, ChannelOrder::Rgb),
        (P::Yuyv, O::Bgr) => packed_422_to_rgb(src, dst, width, height, Packing::Yuyv, ChannelOrder::Bgr),
        (P::Yuyv, O::Yuyv) => copy(src, dst, n * 2),
        (P::Uyvy, O::Rgb) => packed_422_to_rgb(src, dst, width, height, Packing::Uyvy, ChannelOrder::Rgb),
        (P::Uyvy, O::Bgr) => packed_422_to_rgb(src, dst, width, height, Packing::Uyvy, ChannelOrder::Bgr),
        (P::Uyvy, O::Yuyv) => uyvy_to_yuyv(src, dst, width, height),
        (P::YuvMono10, O::Rgb | O::Bgr) => mono10_unpack(src, dst, width, height, 3),
        (P::YuvMono10, O::Gray) => mono10_unpack(src, dst, width, height, 1),
        (P::Grey, O::Rgb | O::Bgr) => grey_to_rgb(src, dst, width, height),
        (P::Grey, O::Gray) => copy(src, dst, n),
        (P::Rgb24, O::Rgb) | (P::Bgr24, O::Bgr) => copy(src, dst, n * 3),
        (P::Rgb24, O::Bgr) | (P::Bgr24, O::Rgb) => swap_rb(src, dst, width, height),
        (P::Nv12, O::Rgb) => nv12_to_rgb(src, dst, width, height, ChannelOrder::Rgb),
        (P::Nv12, O::Bgr) => nv12_to_rgb(src, dst, width, height, ChannelOrder::Bgr),
        (P::Mjpeg, O::Rgb | O::Bgr) => {
            let decoder = decoder
                .ok_or_else(|| Error::Decode("no MJPEG decoder configured".to_owned()))?;
            check_len("destination", dst.len(), n * 3)?;
            decoder.decode(src, &mut dst[..n * 3])?;
            if output == O::Bgr {
                swap_rb_in_place(&mut dst[..n * 3]);
            }
            Ok(())
        }
        _ => Err(Error::UnsupportedPixelFormat { native, output }),
    }
}
