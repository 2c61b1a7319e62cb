// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! The capture state machine.
//!
//! ```text
//! Closed --open_device--> Opened --init_device--> Configured --start_capturing--> Streaming
//!    ^                                                                                |
//!    +------------------------------- shutdown / reconnect --------------------------+
//! ```
//!
//! [`CaptureEngine::wait_for_device`] drives the engine from any state to
//! `Streaming` and is cheap once there, so it can be called on every loop
//! iteration. [`CaptureEngine::capture`] tears the session down by itself when
//! the device stalls or disappears; the next `wait_for_device` reconnects.

use std::fmt;

use log::{debug, error, info, trace, warn};
use nix::{errno::Errno, time::ClockId};
use vidcap_sys as sys;

use crate::{
    buffer::{self, BufferPool, Dequeued},
    control::{self, ControlChain, ControlSink},
    convert,
    device::{node_capabilities, Connector, Readiness, SystemConnector, V4l2Device, READY_TIMEOUT_MS},
    format::{IoMethod, OutputFormat, PixelFormat},
    fourcc::FourCC,
    image::CameraImage,
    mjpeg::{JpegDecoder, MjpegDecoder},
    options::StreamOptions,
    Error,
};

/// Largest tolerated difference between a buffer timestamp and the current
/// time of the clock it was stamped with, in seconds.
const MAX_CAPTURE_SKEW: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Closed => "closed",
            EngineState::Opened => "opened",
            EngineState::Configured => "configured",
            EngineState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// `timeperframe` for a requested rate. Integral rates map to `1/fps`,
/// fractional ones keep millihertz precision.
pub(crate) fn frame_interval(frame_rate: f64) -> (u32, u32) {
    if frame_rate.fract() == 0.0 && frame_rate <= u32::MAX as f64 {
        (1, frame_rate as u32)
    } else {
        (1000, (frame_rate * 1000.0).round() as u32)
    }
}

/// Native format the driver settled on for a `requested` one. Drivers may
/// substitute their own format in `VIDIOC_S_FMT`; the substitute is only
/// usable when it converts to `output`.
pub(crate) fn negotiated_format(
    requested: PixelFormat,
    driver: FourCC,
    output: OutputFormat,
) -> Result<PixelFormat, Error> {
    let native = match PixelFormat::from_fourcc(driver) {
        // mono10 travels as YUYV
        Some(PixelFormat::Yuyv) if requested.is_monochrome() => requested,
        Some(native) => native,
        None => {
            return Err(Error::UnsupportedDevice(format!(
                "driver replaced {} with unknown pixel format {}",
                requested, driver
            )))
        }
    };
    if native != requested && !convert::is_supported(native, output) {
        return Err(Error::UnsupportedPixelFormat { native, output });
    }
    Ok(native)
}

/// Inter-frame timing checks on kernel timestamps.
#[derive(Debug, Clone)]
struct FrameClock {
    warn_interval: f64,
    drop_interval: f64,
    drop_early: bool,
    last: Option<f64>,
}

impl FrameClock {
    fn new(frame_rate: f64, drop_early: bool) -> Self {
        FrameClock {
            warn_interval: 1.5 / frame_rate,
            drop_interval: 0.9 / frame_rate,
            drop_early,
            last: None,
        }
    }

    fn reset(&mut self) {
        self.last = None;
    }

    /// False when the frame came too soon after the previous one and
    /// should be handed back to the driver.
    fn admit(&mut self, frame: &Dequeued) -> bool {
        let now = frame.seconds();
        if let Some(last) = self.last {
            let gap = now - last;
            if self.drop_early && gap < self.drop_interval {
                debug!(
                    "dropping frame {} arriving {:.1} ms after the previous one",
                    frame.index,
                    gap * 1e3
                );
                return false;
            }
            if gap > self.warn_interval {
                warn!(
                    "timestamp jump of {:.1} ms, expected {:.1} ms",
                    gap * 1e3,
                    self.warn_interval / 1.5 * 1e3
                );
            }
        }
        self.last = Some(now);
        true
    }
}

/// Warn when the kernel timestamp is far from the current time of its clock.
fn check_skew(frame: &Dequeued) {
    if frame.tv_sec == 0 && frame.tv_usec == 0 {
        return;
    }
    let clock = if frame.is_monotonic() {
        ClockId::CLOCK_MONOTONIC
    } else {
        ClockId::CLOCK_REALTIME
    };
    let now = match nix::time::clock_gettime(clock) {
        Ok(now) => now.tv_sec() as f64 + now.tv_nsec() as f64 / 1e9,
        Err(err) => {
            trace!("clock_gettime: {}", err);
            return;
        }
    };
    let age = now - frame.seconds();
    if age < 0.0 {
        warn!("frame {} is stamped {:.3} s in the future", frame.index, -age);
    } else if age > MAX_CAPTURE_SKEW {
        warn!("frame {} was captured {:.3} s ago", frame.index, age);
    }
}

/// V4L2 capture session for one device.
///
/// The engine owns the device handle and the buffer pool. It is not
/// internally synchronised; run one engine per thread per device.
pub struct CaptureEngine {
    options: StreamOptions,
    connector: Box<dyn Connector>,
    device: Option<Box<dyn V4l2Device>>,
    pool: Box<dyn BufferPool>,
    decoder: Option<Box<dyn MjpegDecoder>>,
    controls: Box<dyn ControlSink>,
    clock: FrameClock,
    state: EngineState,
    /// negotiated native format and geometry, start as the requested ones
    native: PixelFormat,
    width: u32,
    height: u32,
}

impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("device", &self.options.device)
            .field("state", &self.state)
            .field("native", &self.native)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("io_method", &self.options.io_method)
            .finish()
    }
}

impl CaptureEngine {
    /// Validate `options` and build an engine for the system's V4L2 devices.
    ///
    /// Nothing is opened yet; unsupported format combinations fail here.
    pub fn init(options: StreamOptions) -> Result<Self, Error> {
        Self::with_connector(options, Box::new(SystemConnector))
    }

    /// Like [`CaptureEngine::init`] with a custom way of opening the device.
    pub fn with_connector(
        options: StreamOptions,
        connector: Box<dyn Connector>,
    ) -> Result<Self, Error> {
        if !convert::is_supported(options.pixel_format, options.output_format) {
            return Err(Error::UnsupportedPixelFormat {
                native: options.pixel_format,
                output: options.output_format,
            });
        }
        if options.width == 0 || options.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "resolution {}x{}",
                options.width, options.height
            )));
        }
        if !options.frame_rate.is_finite() || options.frame_rate <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "frame rate {}",
                options.frame_rate
            )));
        }
        if options.io_method != IoMethod::Read && options.num_buffers == 0 {
            return Err(Error::InvalidArgument("zero capture buffers".to_owned()));
        }

        let decoder: Option<Box<dyn MjpegDecoder>> = if options.pixel_format.is_compressed() {
            let mut decoder = JpegDecoder::new();
            decoder.init(options.width, options.height)?;
            Some(Box::new(decoder))
        } else {
            None
        };

        debug!(
            "{}: {}x{} {} -> {} @ {} fps, {} I/O",
            options.device.display(),
            options.width,
            options.height,
            options.pixel_format,
            options.output_format,
            options.frame_rate,
            options.io_method
        );

        Ok(CaptureEngine {
            pool: buffer::create(options.io_method, options.num_buffers),
            clock: FrameClock::new(options.frame_rate, options.drop_early_frames),
            width: options.width,
            height: options.height,
            connector,
            device: None,
            decoder,
            controls: Box::new(ControlChain::default()),
            state: EngineState::Closed,
            native: options.pixel_format,
            options,
        })
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == EngineState::Streaming
    }

    /// Native format the driver delivers. Equals the requested format until
    /// the driver has been configured.
    pub fn pixel_format(&self) -> PixelFormat {
        self.native
    }

    /// Negotiated frame width. Equals the requested width until the driver
    /// has been configured.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Negotiated frame height.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Replace the MJPEG decoder. The decoder is initialised with the
    /// current geometry.
    pub fn set_mjpeg_decoder(&mut self, mut decoder: Box<dyn MjpegDecoder>) -> Result<(), Error> {
        decoder.init(self.width, self.height)?;
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Replace where camera controls are written.
    pub fn set_control_sink(&mut self, sink: Box<dyn ControlSink>) {
        self.controls = sink;
    }

    /// An image sized for the negotiated geometry and output format.
    pub fn new_image(&self) -> CameraImage {
        CameraImage::new(self.width, self.height, self.options.output_format)
    }

    /// Open the device node. No-op when already open.
    pub fn open_device(&mut self) -> Result<(), Error> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = self.connector.connect(&self.options.device)?;
        info!("opened {}", self.options.device.display());
        self.device = Some(device);
        self.state = EngineState::Opened;
        Ok(())
    }

    /// Check capabilities, negotiate the format and frame interval, allocate
    /// buffers and apply camera controls.
    pub fn init_device(&mut self) -> Result<(), Error> {
        match self.state {
            EngineState::Closed => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not open",
                    self.options.device.display()
                )))
            }
            EngineState::Configured | EngineState::Streaming => return Ok(()),
            EngineState::Opened => {}
        }
        let path = self.options.device.clone();
        let device = self.device.as_deref_mut().ok_or(Error::NotStreaming)?;

        let cap = match device.query_capability() {
            Ok(cap) => cap,
            Err(err) if err.errno() == Some(Errno::EINVAL) || err.errno() == Some(Errno::ENOTTY) => {
                return Err(Error::UnsupportedDevice(format!(
                    "{} is no V4L2 device",
                    path.display()
                )))
            }
            Err(err) => return Err(err),
        };
        let caps = node_capabilities(&cap);
        if caps & sys::V4L2_CAP_VIDEO_CAPTURE == 0 {
            return Err(Error::UnsupportedDevice(format!(
                "{} is no video capture device",
                path.display()
            )));
        }
        let method = self.options.io_method;
        if caps & method.required_capability() == 0 {
            error!("{} does not support {} i/o", path.display(), method);
            return Err(Error::UnsupportedIoMethod(method));
        }

        if let Err(err) = device.reset_crop() {
            trace!("crop reset ignored: {}", err);
        }

        let mut format = sys::v4l2_format {
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        format.fmt.pix = sys::v4l2_pix_format {
            width: self.options.width,
            height: self.options.height,
            pixelformat: u32::from(self.options.pixel_format.fourcc()),
            field: sys::V4L2_FIELD_INTERLACED,
            ..Default::default()
        };
        device.set_format(&mut format)?;

        // SAFETY: the pix member is the one used for VIDEO_CAPTURE formats.
        let mut pix = unsafe { format.fmt.pix };
        let native = negotiated_format(
            self.options.pixel_format,
            FourCC::from(pix.pixelformat),
            self.options.output_format,
        )?;
        if native != self.options.pixel_format {
            warn!(
                "{}: driver delivers {} instead of {}",
                path.display(),
                native,
                self.options.pixel_format
            );
        }
        // Buggy drivers under-report the stride and image size.
        pix.bytesperline = pix.bytesperline.max(pix.width * 2);
        pix.sizeimage = pix.sizeimage.max(pix.bytesperline * pix.height);

        if pix.width != self.options.width || pix.height != self.options.height {
            warn!(
                "{}: driver adjusted {}x{} to {}x{}",
                path.display(),
                self.options.width,
                self.options.height,
                pix.width,
                pix.height
            );
        }
        match self.decoder.as_mut() {
            Some(decoder) if (pix.width, pix.height) != (self.width, self.height) => {
                decoder.init(pix.width, pix.height)?;
            }
            Some(_) => {}
            None if native.is_compressed() => {
                let mut decoder = JpegDecoder::new();
                decoder.init(pix.width, pix.height)?;
                self.decoder = Some(Box::new(decoder));
            }
            None => {}
        }
        self.native = native;
        self.width = pix.width;
        self.height = pix.height;

        let mut parm = sys::v4l2_streamparm {
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        match device.get_stream_parameters(&mut parm) {
            Err(err) => warn!("{}, frame interval left unchanged", err),
            Ok(()) => {
                let (numerator, denominator) = frame_interval(self.options.frame_rate);
                // SAFETY: capture is the member used for VIDEO_CAPTURE.
                let mut capture = unsafe { parm.parm.capture };
                capture.timeperframe = sys::v4l2_fract {
                    numerator,
                    denominator,
                };
                parm.parm.capture = capture;
                if let Err(err) = device.set_stream_parameters(&mut parm) {
                    warn!(
                        "{}, unable to set {} fps on {}",
                        err,
                        self.options.frame_rate,
                        path.display()
                    );
                }
            }
        }

        self.pool.allocate(device, pix.sizeimage as usize)?;
        info!(
            "{}: {}x{} {} stride {} size {}, {} {} buffers",
            path.display(),
            pix.width,
            pix.height,
            native,
            pix.bytesperline,
            pix.sizeimage,
            self.pool.len(),
            method
        );
        self.state = EngineState::Configured;

        if !self.options.controls.is_default() {
            self.set_device_config()?;
        }
        Ok(())
    }

    /// Apply the configured camera controls to the open device and return
    /// how many of them could not be set.
    pub fn set_device_config(&mut self) -> Result<usize, Error> {
        let device = self.device.as_deref_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not open", self.options.device.display()))
        })?;
        let failed = control::apply_controls(device, self.controls.as_mut(), &self.options.controls);
        if failed > 0 {
            warn!("{} camera controls could not be applied", failed);
        }
        Ok(failed)
    }

    /// Queue every buffer and turn the stream on. No-op when streaming.
    pub fn start_capturing(&mut self) -> Result<(), Error> {
        match self.state {
            EngineState::Streaming => return Ok(()),
            EngineState::Configured => {}
            state => {
                return Err(Error::InvalidArgument(format!(
                    "cannot start capturing while {}",
                    state
                )))
            }
        }
        let device = self.device.as_deref_mut().ok_or(Error::NotStreaming)?;
        if self.pool.io_method() != IoMethod::Read {
            self.pool.enqueue_all(device)?;
            device.stream_on()?;
        }
        self.clock.reset();
        self.state = EngineState::Streaming;
        info!("{}: streaming", self.options.device.display());
        Ok(())
    }

    /// Turn the stream off. Buffers stay allocated.
    pub fn stop_capturing(&mut self) {
        if self.state != EngineState::Streaming {
            return;
        }
        if let Some(device) = self.device.as_deref_mut() {
            if self.pool.io_method() != IoMethod::Read {
                if let Err(err) = device.stream_off() {
                    warn!("{}", err);
                }
            }
        }
        self.state = EngineState::Configured;
    }

    /// Release the buffer pool.
    pub fn uninit_device(&mut self) {
        if self.state == EngineState::Streaming {
            self.stop_capturing();
        }
        if let Some(device) = self.device.as_deref_mut() {
            if let Err(err) = self.pool.release(device) {
                warn!("releasing buffers: {}", err);
            }
            self.state = EngineState::Opened;
        }
    }

    /// Close the device node.
    pub fn close_device(&mut self) {
        if self.state >= EngineState::Configured {
            self.uninit_device();
        }
        if self.device.take().is_some() {
            debug!("closed {}", self.options.device.display());
        }
        self.state = EngineState::Closed;
    }

    /// Stop, release and close from any state. Safe to repeat.
    pub fn shutdown(&mut self) {
        self.stop_capturing();
        self.uninit_device();
        self.close_device();
    }

    fn reconnect(&mut self) {
        warn!("{}: reconnecting", self.options.device.display());
        self.shutdown();
    }

    /// Bring the engine to `Streaming`. Returns immediately when already
    /// streaming; on failure everything opened so far is torn down and the
    /// caller decides when to retry.
    pub fn wait_for_device(&mut self) -> Result<(), Error> {
        if self.state == EngineState::Streaming {
            return Ok(());
        }
        let result = self
            .open_device()
            .and_then(|()| self.init_device())
            .and_then(|()| self.start_capturing());
        if let Err(err) = result {
            error!("{}: {}", self.options.device.display(), err);
            self.shutdown();
            return Err(err);
        }
        Ok(())
    }

    fn requeue(&mut self, frame: &Dequeued) -> Result<(), Error> {
        let device = self.device.as_deref_mut().ok_or(Error::NotStreaming)?;
        self.pool.requeue(device, frame)
    }

    /// Wait for one frame and convert it into `image`.
    ///
    /// `Ok(true)` delivers a new frame. `Ok(false)` means no frame this call:
    /// nothing was ready, the frame was dropped or could not be converted, or
    /// the device stalled and the session was torn down (call
    /// [`wait_for_device`](Self::wait_for_device) before capturing again).
    /// Errors are reserved for misuse.
    pub fn capture(&mut self, image: &mut CameraImage) -> Result<bool, Error> {
        image.reset();
        if self.state != EngineState::Streaming {
            return Err(Error::NotStreaming);
        }
        if !image.matches(self.width, self.height, self.options.output_format) {
            return Err(Error::InvalidArgument(format!(
                "image is {}x{}x{}, stream is {}x{} {}",
                image.width(),
                image.height(),
                image.bytes_per_pixel(),
                self.width,
                self.height,
                self.options.output_format
            )));
        }

        let device = self.device.as_deref_mut().ok_or(Error::NotStreaming)?;
        match device.wait_readable(READY_TIMEOUT_MS) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Interrupted) => return Ok(false),
            Ok(Readiness::TimedOut) => {
                error!(
                    "{}: no frame within {} ms",
                    self.options.device.display(),
                    READY_TIMEOUT_MS
                );
                self.reconnect();
                return Ok(false);
            }
            Err(err) => {
                error!("{}", err);
                self.reconnect();
                return Ok(false);
            }
        }

        let frame = match self.pool.dequeue(device, self.options.eio_fallthrough) {
            Ok(frame) => frame,
            Err(err) if err.errno() == Some(Errno::EAGAIN) => {
                trace!("{}", err);
                return Ok(false);
            }
            Err(err) => {
                error!("{}", err);
                self.reconnect();
                return Ok(false);
            }
        };
        trace!("{:?}", frame);
        image.set_timestamp(frame.tv_sec, frame.tv_usec);

        if !self.clock.admit(&frame) {
            if let Err(err) = self.requeue(&frame) {
                error!("{}", err);
            }
            return Ok(false);
        }
        check_skew(&frame);

        let native = self.native;
        if let Some(expected) = native.frame_size(self.width, self.height) {
            if frame.bytesused < expected {
                warn!(
                    "frame {} carries {} bytes, expected {}",
                    frame.index, frame.bytesused, expected
                );
            }
        }

        let converted = {
            let data = self.pool.frame(&frame);
            let data = if native.is_compressed() {
                &data[..frame.bytesused.min(data.len())]
            } else {
                data
            };
            convert::convert(
                native,
                self.options.output_format,
                data,
                image.data_mut(),
                self.width,
                self.height,
                self.decoder.as_deref_mut(),
            )
        };

        if let Err(err) = self.requeue(&frame) {
            error!("{}", err);
            return Ok(false);
        }
        if let Err(err) = converted {
            warn!("frame {}: {}", frame.index, err);
            return Ok(false);
        }

        image.mark_new();
        Ok(true)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
