// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Capture engine tests against a scripted in-memory V4L2 device.
//
// The fake device implements the same ioctl surface as a real driver: it
// hands out MMAP memory, accepts USERPTR buffers, keeps a queue of buffers
// owned by the "driver" and fills them from a script of frames, errors and
// readiness timeouts. Everything it sees is recorded so the tests can check
// what the engine did to the device.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    ptr::{self, NonNull},
    sync::{Arc, Mutex},
};

use nix::errno::Errno;
use vidcap::{
    control::{ControlChain, ControlId, ControlSink, ExtControlSink},
    device::{Connector, Readiness, V4l2Device},
    mjpeg::MjpegDecoder,
    CameraControls, CameraImage, CaptureEngine, EngineState, Error, IoMethod, OutputFormat,
    PixelFormat, StreamOptions,
};
use vidcap_sys as sys;

const OFFSET_STRIDE: u32 = 4096;
const STREAMING_CAPTURE: u32 = sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_STREAMING;

enum Step {
    /// Fill the next queued buffer.
    Frame(Vec<u8>),
    /// Fill the next queued buffer with a timestamp in microseconds.
    FrameAt(Vec<u8>, i64),
    /// Fill the next queued buffer and report EIO.
    Corrupt(Vec<u8>),
    /// Fail the dequeue, leaving the queue untouched.
    Fail(Errno),
    /// The readiness wait times out.
    Timeout,
    /// The readiness wait is interrupted by a signal.
    Interrupted,
}

struct Region {
    ptr: *mut u8,
    len: usize,
}

impl Region {
    fn new(len: usize) -> Self {
        let ptr = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        Region { ptr, len }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len))) };
    }
}

struct Shared {
    caps: u32,
    driver_size: Option<(u32, u32)>,
    driver_format: Option<u32>,
    max_buffers: u32,
    granted: u32,
    steps: VecDeque<Step>,
    memory: u32,
    regions: Vec<Region>,
    queued: VecDeque<sys::v4l2_buffer>,
    frame_len: usize,
    mapped: usize,
    streaming: bool,
    connects: usize,
    closes: usize,
    calls: Vec<&'static str>,
    controls: Vec<(u32, i32)>,
    reject_controls: Vec<u32>,
    hidden_controls: Vec<u32>,
    next_timestamp: i64,
    timeperframe: Option<(u32, u32)>,
    parm_failure: Option<(&'static str, Errno)>,
}

unsafe impl Send for Shared {}

impl Shared {
    fn new(caps: u32) -> Arc<Mutex<Shared>> {
        Arc::new(Mutex::new(Shared {
            caps,
            driver_size: None,
            driver_format: None,
            max_buffers: 8,
            granted: 0,
            steps: VecDeque::new(),
            memory: 0,
            regions: Vec::new(),
            queued: VecDeque::new(),
            frame_len: 0,
            mapped: 0,
            streaming: false,
            connects: 0,
            closes: 0,
            calls: Vec::new(),
            controls: Vec::new(),
            reject_controls: Vec::new(),
            hidden_controls: Vec::new(),
            next_timestamp: 100_000_000,
            timeperframe: None,
            parm_failure: None,
        }))
    }

    fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }

    fn fill(&mut self, buf: &mut sys::v4l2_buffer, data: &[u8], timestamp: Option<i64>) -> bool {
        let Some(mut next) = self.queued.pop_front() else {
            return false;
        };
        let (dst, len) = if self.memory == sys::V4L2_MEMORY_MMAP {
            let region = &self.regions[next.index as usize];
            (region.ptr, region.len)
        } else {
            (unsafe { next.m.userptr } as *mut u8, next.length as usize)
        };
        let n = data.len().min(len);
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, n) };

        let micros = timestamp.unwrap_or(self.next_timestamp);
        self.next_timestamp = micros + 33_333;
        next.bytesused = n as u32;
        next.flags = sys::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC | sys::V4L2_BUF_FLAG_DONE;
        next.timestamp.tv_sec = (micros / 1_000_000) as _;
        next.timestamp.tv_usec = (micros % 1_000_000) as _;
        *buf = next;
        true
    }
}

fn fail(request: &'static str, errno: Errno) -> Error {
    Error::Ioctl { request, errno }
}

struct FakeDevice {
    path: PathBuf,
    shared: Arc<Mutex<Shared>>,
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.shared.lock().unwrap().closes += 1;
    }
}

impl V4l2Device for FakeDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capability(&mut self) -> Result<sys::v4l2_capability, Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("QUERYCAP");
        let mut cap = sys::v4l2_capability::default();
        cap.capabilities = s.caps;
        Ok(cap)
    }

    fn reset_crop(&mut self) -> Result<(), Error> {
        Err(fail("VIDIOC_CROPCAP", Errno::EINVAL))
    }

    fn set_format(&mut self, format: &mut sys::v4l2_format) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("S_FMT");
        let mut pix = unsafe { format.fmt.pix };
        if let Some((width, height)) = s.driver_size {
            pix.width = width;
            pix.height = height;
        }
        if let Some(fourcc) = s.driver_format {
            pix.pixelformat = fourcc;
        }
        pix.bytesperline = pix.width * 2;
        pix.sizeimage = pix.width * pix.height * 2;
        s.frame_len = pix.sizeimage as usize;
        format.fmt.pix = pix;
        Ok(())
    }

    fn get_stream_parameters(&mut self, _parm: &mut sys::v4l2_streamparm) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("G_PARM");
        match s.parm_failure {
            Some(("VIDIOC_G_PARM", errno)) => Err(fail("VIDIOC_G_PARM", errno)),
            _ => Ok(()),
        }
    }

    fn set_stream_parameters(&mut self, parm: &mut sys::v4l2_streamparm) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("S_PARM");
        if let Some(("VIDIOC_S_PARM", errno)) = s.parm_failure {
            return Err(fail("VIDIOC_S_PARM", errno));
        }
        let tpf = unsafe { parm.parm.capture.timeperframe };
        s.timeperframe = Some((tpf.numerator, tpf.denominator));
        Ok(())
    }

    fn request_buffers(&mut self, req: &mut sys::v4l2_requestbuffers) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("REQBUFS");
        if s.caps & sys::V4L2_CAP_STREAMING == 0 {
            return Err(fail("VIDIOC_REQBUFS", Errno::EINVAL));
        }
        if req.count == 0 {
            s.regions.clear();
            s.queued.clear();
            s.granted = 0;
            return Ok(());
        }
        s.memory = req.memory;
        req.count = req.count.min(s.max_buffers);
        s.granted = req.count;
        if req.memory == sys::V4L2_MEMORY_MMAP {
            let len = s.frame_len;
            s.regions = (0..req.count).map(|_| Region::new(len)).collect();
        }
        Ok(())
    }

    fn query_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        let s = self.shared.lock().unwrap();
        if buf.index as usize >= s.regions.len() {
            return Err(fail("VIDIOC_QUERYBUF", Errno::EINVAL));
        }
        buf.length = s.frame_len as u32;
        buf.m.offset = buf.index * OFFSET_STRIDE;
        Ok(())
    }

    fn queue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("QBUF");
        if buf.index >= s.granted || s.queued.iter().any(|b| b.index == buf.index) {
            return Err(fail("VIDIOC_QBUF", Errno::EINVAL));
        }
        s.queued.push_back(*buf);
        Ok(())
    }

    fn dequeue_buffer(&mut self, buf: &mut sys::v4l2_buffer) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("DQBUF");
        match s.steps.pop_front() {
            Some(Step::Frame(data)) => {
                if s.fill(buf, &data, None) {
                    Ok(())
                } else {
                    s.steps.push_front(Step::Frame(data));
                    Err(fail("VIDIOC_DQBUF", Errno::EAGAIN))
                }
            }
            Some(Step::FrameAt(data, micros)) => {
                assert!(s.fill(buf, &data, Some(micros)), "nothing queued");
                Ok(())
            }
            Some(Step::Corrupt(data)) => {
                assert!(s.fill(buf, &data, None), "nothing queued");
                Err(fail("VIDIOC_DQBUF", Errno::EIO))
            }
            Some(Step::Fail(errno)) => Err(fail("VIDIOC_DQBUF", errno)),
            Some(step) => {
                s.steps.push_front(step);
                Err(fail("VIDIOC_DQBUF", Errno::EAGAIN))
            }
            None => Err(fail("VIDIOC_DQBUF", Errno::EAGAIN)),
        }
    }

    fn stream_on(&mut self) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("STREAMON");
        s.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("STREAMOFF");
        s.streaming = false;
        s.queued.clear();
        Ok(())
    }

    fn map(&mut self, offset: u32, length: usize) -> Result<NonNull<u8>, Error> {
        let mut s = self.shared.lock().unwrap();
        let region = &s.regions[(offset / OFFSET_STRIDE) as usize];
        assert_eq!(region.len, length);
        let ptr = NonNull::new(region.ptr).unwrap();
        s.mapped += 1;
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, _ptr: NonNull<u8>, _length: usize) -> Result<(), Error> {
        self.shared.lock().unwrap().mapped -= 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("read");
        match s.steps.pop_front() {
            Some(Step::Frame(data)) | Some(Step::FrameAt(data, _)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Step::Corrupt(_)) => Err(fail("read", Errno::EIO)),
            Some(Step::Fail(errno)) => Err(fail("read", errno)),
            _ => Err(fail("read", Errno::EAGAIN)),
        }
    }

    fn query_control(&mut self, ctrl: &mut sys::v4l2_queryctrl) -> Result<(), Error> {
        if self.shared.lock().unwrap().hidden_controls.contains(&ctrl.id) {
            return Err(fail("VIDIOC_QUERYCTRL", Errno::EINVAL));
        }
        ctrl.flags = 0;
        Ok(())
    }

    fn set_control(&mut self, ctrl: &mut sys::v4l2_control) -> Result<(), Error> {
        let mut s = self.shared.lock().unwrap();
        s.calls.push("S_CTRL");
        s.controls.push((ctrl.id, ctrl.value));
        Ok(())
    }

    fn set_ext_controls(&mut self, ctrls: &mut sys::v4l2_ext_controls) -> Result<(), Error> {
        assert_eq!(ctrls.count, 1);
        let ctrl = unsafe { *ctrls.controls };
        let id = ctrl.id;
        let value = unsafe { ctrl.value.value };
        assert_eq!(ctrls.which, sys::v4l2_ctrl_id2class(id));

        let mut s = self.shared.lock().unwrap();
        if s.reject_controls.contains(&id) {
            return Err(fail("VIDIOC_S_EXT_CTRLS", Errno::EINVAL));
        }
        s.controls.push((id, value));
        Ok(())
    }

    fn wait_readable(&mut self, _timeout_ms: u16) -> Result<Readiness, Error> {
        let mut s = self.shared.lock().unwrap();
        match s.steps.front() {
            None | Some(Step::Timeout) => {
                s.steps.pop_front();
                Ok(Readiness::TimedOut)
            }
            Some(Step::Interrupted) => {
                s.steps.pop_front();
                Ok(Readiness::Interrupted)
            }
            Some(_) => Ok(Readiness::Ready),
        }
    }
}

struct FakeConnector(Arc<Mutex<Shared>>);

impl Connector for FakeConnector {
    fn connect(&mut self, path: &Path) -> Result<Box<dyn V4l2Device>, Error> {
        self.0.lock().unwrap().connects += 1;
        Ok(Box::new(FakeDevice {
            path: path.to_path_buf(),
            shared: self.0.clone(),
        }))
    }
}

fn options() -> StreamOptions {
    StreamOptions::new("/dev/video-fake")
}

fn engine(options: StreamOptions, shared: &Arc<Mutex<Shared>>) -> CaptureEngine {
    CaptureEngine::with_connector(options, Box::new(FakeConnector(shared.clone()))).unwrap()
}

fn push(shared: &Arc<Mutex<Shared>>, step: Step) {
    shared.lock().unwrap().steps.push_back(step);
}

fn solid_yuyv(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
    [y, u, y, v].repeat((width * height / 2) as usize)
}

fn assert_image_invariant(image: &CameraImage) {
    assert!(image.is_new());
    assert_eq!(
        image.image_size(),
        image.width() as usize * image.height() as usize * image.bytes_per_pixel()
    );
    assert_eq!(image.data().len(), image.image_size());
}

#[test]
fn test_yuyv_grey_frame_over_mmap() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options().with_resolution(640, 360).with_frame_rate(30.0);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();
    assert_eq!(engine.state(), EngineState::Streaming);

    push(&shared, Step::Frame(solid_yuyv(640, 360, 128, 128, 128)));
    let mut image = CameraImage::for_options(engine.options());
    assert!(engine.capture(&mut image).unwrap());

    assert_image_invariant(&image);
    assert!(image.data().iter().all(|&b| (126..=130).contains(&b)));
    assert_eq!(image.tv_sec(), 100);
    assert_eq!(image.tv_usec(), 0);

    let s = shared.lock().unwrap();
    assert_eq!(s.timeperframe, Some((1, 30)));
    assert_eq!(s.mapped, 4);
    // every buffer is back with the driver
    assert_eq!(s.queued.len(), 4);
}

#[test]
fn test_unsupported_pair_fails_before_opening() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options()
        .with_pixel_format(PixelFormat::Rgb24)
        .with_output_format(OutputFormat::Yuyv);
    let result = CaptureEngine::with_connector(options, Box::new(FakeConnector(shared.clone())));

    assert!(matches!(
        result,
        Err(Error::UnsupportedPixelFormat {
            native: PixelFormat::Rgb24,
            output: OutputFormat::Yuyv
        })
    ));
    assert_eq!(shared.lock().unwrap().connects, 0);
}

#[test]
fn test_eagain_leaves_buffer_queued() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Fail(Errno::EAGAIN));
    push(&shared, Step::Frame(solid_yuyv(640, 480, 16, 128, 128)));

    assert!(!engine.capture(&mut image).unwrap());
    assert!(!image.is_new());
    assert_eq!(shared.lock().unwrap().queued.len(), 4);
    assert_eq!(engine.state(), EngineState::Streaming);

    assert!(engine.capture(&mut image).unwrap());
    assert_image_invariant(&image);
    assert_eq!(shared.lock().unwrap().connects, 1);
}

#[test]
fn test_timeout_reconnects() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Timeout);
    assert!(!engine.capture(&mut image).unwrap());
    assert!(!image.is_new());
    assert_eq!(engine.state(), EngineState::Closed);
    {
        let s = shared.lock().unwrap();
        assert_eq!(s.closes, 1);
        assert_eq!(s.mapped, 0);
        assert!(s.regions.is_empty());
        assert_eq!(s.count("STREAMOFF"), 1);
    }

    // the caller has to bring the device back first
    assert!(matches!(engine.capture(&mut image), Err(Error::NotStreaming)));

    push(&shared, Step::Frame(solid_yuyv(640, 480, 200, 128, 128)));
    engine.wait_for_device().unwrap();
    assert_eq!(shared.lock().unwrap().connects, 2);
    assert!(engine.capture(&mut image).unwrap());
    assert_image_invariant(&image);
}

#[test]
fn test_interrupted_wait_keeps_session() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Interrupted);
    assert!(!engine.capture(&mut image).unwrap());
    assert_eq!(engine.state(), EngineState::Streaming);
    assert_eq!(shared.lock().unwrap().closes, 0);
}

#[test]
fn test_dequeue_error_reconnects() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Fail(Errno::ENODEV));
    assert!(!engine.capture(&mut image).unwrap());
    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(shared.lock().unwrap().mapped, 0);
}

#[test]
fn test_eio_falls_through_by_default() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Corrupt(solid_yuyv(640, 480, 128, 128, 128)));
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(engine.state(), EngineState::Streaming);
    assert_eq!(shared.lock().unwrap().queued.len(), 4);
}

#[test]
fn test_eio_reconnects_when_not_tolerated() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options().with_eio_fallthrough(false), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Corrupt(solid_yuyv(640, 480, 128, 128, 128)));
    assert!(!engine.capture(&mut image).unwrap());
    assert_eq!(engine.state(), EngineState::Closed);
}

#[test]
fn test_teardown_is_idempotent() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Closed);

    engine.wait_for_device().unwrap();
    engine.shutdown();
    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Closed);

    let s = shared.lock().unwrap();
    assert_eq!(s.closes, 1);
    assert_eq!(s.mapped, 0);
    assert_eq!(s.count("STREAMOFF"), 1);
}

#[test]
fn test_partial_teardown() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);

    engine.open_device().unwrap();
    engine.init_device().unwrap();
    assert_eq!(engine.state(), EngineState::Configured);
    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Closed);

    let s = shared.lock().unwrap();
    assert_eq!(s.count("STREAMOFF"), 0);
    assert_eq!(s.mapped, 0);
    assert_eq!(s.closes, 1);
}

#[test]
fn test_wait_for_device_is_idempotent_while_streaming() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);

    engine.wait_for_device().unwrap();
    engine.wait_for_device().unwrap();
    engine.wait_for_device().unwrap();
    engine.start_capturing().unwrap();

    let s = shared.lock().unwrap();
    assert_eq!(s.connects, 1);
    assert_eq!(s.count("QUERYCAP"), 1);
    assert_eq!(s.count("STREAMON"), 1);
    assert_eq!(s.count("QBUF"), 4);
}

#[test]
fn test_userptr_capture() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options()
        .with_resolution(320, 240)
        .with_io_method(IoMethod::Userptr)
        .with_output_format(OutputFormat::Yuyv);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();
    {
        let s = shared.lock().unwrap();
        assert_eq!(s.queued.len(), 4);
        for buf in &s.queued {
            assert_eq!(buf.memory, sys::V4L2_MEMORY_USERPTR);
            assert_eq!(buf.length as usize % page_size::get(), 0);
            assert_eq!(unsafe { buf.m.userptr } as usize % page_size::get(), 0);
        }
    }

    let frame = solid_yuyv(320, 240, 90, 100, 110);
    push(&shared, Step::Frame(frame.clone()));
    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(image.data(), &frame[..]);
}

#[test]
fn test_read_capture() {
    let shared = Shared::new(sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_READWRITE);
    let options = options()
        .with_resolution(64, 48)
        .with_io_method(IoMethod::Read)
        .with_output_format(OutputFormat::Yuyv);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();

    let frame = solid_yuyv(64, 48, 1, 2, 3);
    push(&shared, Step::Frame(frame.clone()));
    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(image.data(), &frame[..]);
    assert!(image.tv_sec() > 0 || image.tv_usec() > 0);

    let s = shared.lock().unwrap();
    assert_eq!(s.count("STREAMON"), 0);
    assert_eq!(s.count("REQBUFS"), 0);
}

#[test]
fn test_io_method_must_match_capabilities() {
    let shared = Shared::new(sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_READWRITE);
    let mut engine = engine(options(), &shared);

    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::UnsupportedIoMethod(IoMethod::Mmap))
    ));
    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(shared.lock().unwrap().closes, 1);
}

#[test]
fn test_non_capture_device_rejected() {
    let shared = Shared::new(sys::V4L2_CAP_VIDEO_OUTPUT | sys::V4L2_CAP_STREAMING);
    let mut engine = engine(options(), &shared);
    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::UnsupportedDevice(_))
    ));
    assert_eq!(engine.state(), EngineState::Closed);
}

#[test]
fn test_mmap_needs_two_buffers() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().max_buffers = 1;
    let mut engine = engine(options(), &shared);

    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::InsufficientBuffers(1))
    ));
    let s = shared.lock().unwrap();
    assert_eq!(s.mapped, 0);
    assert!(s.regions.is_empty());
}

#[test]
fn test_driver_adjusted_resolution_is_adopted() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().driver_size = Some((320, 240));
    let mut engine = engine(options().with_resolution(640, 480), &shared);
    engine.wait_for_device().unwrap();
    assert_eq!((engine.width(), engine.height()), (320, 240));

    push(&shared, Step::Frame(solid_yuyv(320, 240, 128, 128, 128)));
    let mut stale = CameraImage::for_options(engine.options());
    assert!(matches!(
        engine.capture(&mut stale),
        Err(Error::InvalidArgument(_))
    ));

    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!((image.width(), image.height()), (320, 240));
    assert_image_invariant(&image);
}

#[test]
fn test_early_frames_are_dropped_when_enabled() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options()
        .with_resolution(32, 8)
        .with_frame_rate(30.0)
        .with_frame_drop(true);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    let frame = solid_yuyv(32, 8, 128, 128, 128);
    push(&shared, Step::FrameAt(frame.clone(), 1_000_000));
    push(&shared, Step::FrameAt(frame.clone(), 1_010_000));
    push(&shared, Step::FrameAt(frame, 1_040_000));

    assert!(engine.capture(&mut image).unwrap());
    assert!(!engine.capture(&mut image).unwrap());
    assert!(!image.is_new());
    assert_eq!(shared.lock().unwrap().queued.len(), 4);
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(image.tv_usec(), 40_000);
}

#[test]
fn test_early_frames_are_kept_by_default() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options().with_resolution(32, 8), &shared);
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    let frame = solid_yuyv(32, 8, 128, 128, 128);
    push(&shared, Step::FrameAt(frame.clone(), 1_000_000));
    push(&shared, Step::FrameAt(frame, 1_001_000));
    assert!(engine.capture(&mut image).unwrap());
    assert!(engine.capture(&mut image).unwrap());
}

struct SolidDecoder([u8; 3]);

impl MjpegDecoder for SolidDecoder {
    fn init(&mut self, _width: u32, _height: u32) -> Result<(), Error> {
        Ok(())
    }

    fn decode(&mut self, jpeg: &[u8], rgb: &mut [u8]) -> Result<(), Error> {
        if jpeg.get(..2) != Some(&[0xff, 0xd8][..]) {
            return Err(Error::Decode("missing SOI marker".to_owned()));
        }
        for pixel in rgb.chunks_exact_mut(3) {
            pixel.copy_from_slice(&self.0);
        }
        Ok(())
    }
}

#[test]
fn test_mjpeg_to_bgr_with_custom_decoder() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options()
        .with_resolution(16, 16)
        .with_pixel_format(PixelFormat::Mjpeg)
        .with_output_format(OutputFormat::Bgr);
    let mut engine = engine(options, &shared);
    engine
        .set_mjpeg_decoder(Box::new(SolidDecoder([10, 20, 30])))
        .unwrap();
    engine.wait_for_device().unwrap();
    let mut image = engine.new_image();

    push(&shared, Step::Frame(vec![0xff, 0xd8, 0xff, 0xd9]));
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(&image.data()[..3], &[30, 20, 10]);

    // a frame that does not decode costs one call, not the session
    push(&shared, Step::Frame(vec![0x00; 64]));
    assert!(!engine.capture(&mut image).unwrap());
    assert!(!image.is_new());
    assert!(image.data().iter().all(|&b| b == 0));
    assert_eq!(engine.state(), EngineState::Streaming);
    assert_eq!(shared.lock().unwrap().queued.len(), 4);
}

struct RecordingSink(Arc<Mutex<Vec<(&'static str, i32)>>>);

impl ControlSink for RecordingSink {
    fn set(
        &mut self,
        _device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error> {
        self.0.lock().unwrap().push((control.name, value));
        Ok(())
    }
}

#[test]
fn test_controls_applied_with_fallback() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().reject_controls = vec![sys::V4L2_CID_GAIN];
    let controls = CameraControls {
        brightness: 50,
        gain: 10,
        focus: 30,
        auto_exposure: true,
        ..Default::default()
    };
    let mut engine = engine(options().with_controls(controls), &shared);
    let fallback = Arc::new(Mutex::new(Vec::new()));
    engine.set_control_sink(Box::new(ControlChain::new(vec![
        Box::new(ExtControlSink),
        Box::new(RecordingSink(fallback.clone())),
    ])));
    engine.wait_for_device().unwrap();

    assert_eq!(
        shared.lock().unwrap().controls,
        vec![
            (sys::V4L2_CID_BRIGHTNESS, 50),
            (sys::V4L2_CID_EXPOSURE_AUTO, sys::V4L2_EXPOSURE_APERTURE_PRIORITY),
            (sys::V4L2_CID_FOCUS_AUTO, 0),
            (sys::V4L2_CID_FOCUS_ABSOLUTE, 30),
        ]
    );
    assert_eq!(*fallback.lock().unwrap(), vec![("gain", 10)]);
}

#[test]
fn test_default_controls_touch_nothing() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let mut engine = engine(options(), &shared);
    engine.wait_for_device().unwrap();
    assert!(shared.lock().unwrap().controls.is_empty());
    assert_eq!(engine.set_device_config().unwrap(), 0);
}

#[test]
fn test_auto_focus_is_written_once() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let controls = CameraControls {
        auto_focus: true,
        ..Default::default()
    };
    let mut engine = engine(options().with_controls(controls), &shared);
    engine.wait_for_device().unwrap();

    let s = shared.lock().unwrap();
    assert_eq!(s.controls, vec![(sys::V4L2_CID_FOCUS_AUTO, 1)]);
    assert_eq!(s.count("S_CTRL"), 0);
}

#[test]
fn test_missing_auto_focus_counts_as_failure() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().hidden_controls = vec![sys::V4L2_CID_FOCUS_AUTO];
    let controls = CameraControls {
        brightness: 20,
        auto_focus: true,
        ..Default::default()
    };
    let mut engine = engine(options().with_controls(controls), &shared);
    engine.wait_for_device().unwrap();
    assert_eq!(engine.state(), EngineState::Streaming);
    assert_eq!(
        shared.lock().unwrap().controls,
        vec![(sys::V4L2_CID_BRIGHTNESS, 20)]
    );

    assert_eq!(engine.set_device_config().unwrap(), 1);
}

#[test]
fn test_single_control_ioctl_catches_extended_rejection() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().reject_controls = vec![sys::V4L2_CID_BRIGHTNESS];
    let controls = CameraControls {
        brightness: 40,
        ..Default::default()
    };
    let mut engine = engine(options().with_controls(controls), &shared);
    engine.wait_for_device().unwrap();

    let s = shared.lock().unwrap();
    assert_eq!(s.controls, vec![(sys::V4L2_CID_BRIGHTNESS, 40)]);
    assert_eq!(s.count("S_CTRL"), 1);
}

#[test]
fn test_driver_substituted_format_is_adopted() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().driver_format = Some(sys::V4L2_PIX_FMT_MJPEG);
    let options = options()
        .with_resolution(16, 16)
        .with_pixel_format(PixelFormat::Yuyv)
        .with_output_format(OutputFormat::Rgb);
    let mut engine = engine(options, &shared);
    engine
        .set_mjpeg_decoder(Box::new(SolidDecoder([10, 20, 30])))
        .unwrap();
    engine.wait_for_device().unwrap();
    assert_eq!(engine.pixel_format(), PixelFormat::Mjpeg);
    let mut image = engine.new_image();

    push(&shared, Step::Frame(vec![0xff, 0xd8, 0xff, 0xd9]));
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(&image.data()[..3], &[10, 20, 30]);

    // YUYV bytes are not taken for a picture any more
    push(&shared, Step::Frame(solid_yuyv(16, 16, 128, 128, 128)));
    assert!(!engine.capture(&mut image).unwrap());
    assert!(!image.is_new());
}

#[test]
fn test_driver_substituted_format_without_conversion_fails() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().driver_format = Some(sys::V4L2_PIX_FMT_MJPEG);
    let options = options().with_output_format(OutputFormat::Yuyv);
    let mut engine = engine(options, &shared);

    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::UnsupportedPixelFormat {
            native: PixelFormat::Mjpeg,
            output: OutputFormat::Yuyv
        })
    ));
    assert_eq!(engine.state(), EngineState::Closed);
    let s = shared.lock().unwrap();
    assert_eq!(s.count("REQBUFS"), 0);
    assert_eq!(s.closes, 1);
}

#[test]
fn test_unknown_driver_format_fails() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().driver_format = Some(u32::from_le_bytes(*b"H264"));
    let mut engine = engine(options(), &shared);

    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::UnsupportedDevice(_))
    ));
    assert_eq!(engine.state(), EngineState::Closed);
}

#[test]
fn test_mono10_survives_yuyv_negotiation() {
    let shared = Shared::new(STREAMING_CAPTURE);
    let options = options()
        .with_resolution(4, 2)
        .with_pixel_format(PixelFormat::YuvMono10)
        .with_output_format(OutputFormat::Gray);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();
    assert_eq!(engine.pixel_format(), PixelFormat::YuvMono10);

    // 10-bit 512 in little endian
    push(&shared, Step::Frame([0x00, 0x02].repeat(8)));
    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(image.data(), &[128u8; 8][..]);
}

#[test]
fn test_userptr_uses_granted_buffers() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().max_buffers = 2;
    let options = options()
        .with_resolution(64, 48)
        .with_io_method(IoMethod::Userptr)
        .with_output_format(OutputFormat::Yuyv);
    let mut engine = engine(options, &shared);
    engine.wait_for_device().unwrap();
    assert_eq!(shared.lock().unwrap().queued.len(), 2);

    let frame = solid_yuyv(64, 48, 50, 60, 70);
    push(&shared, Step::Frame(frame.clone()));
    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
    assert_eq!(image.data(), &frame[..]);
}

#[test]
fn test_userptr_without_buffers_fails() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().max_buffers = 0;
    let mut engine = engine(options().with_io_method(IoMethod::Userptr), &shared);

    assert!(matches!(
        engine.wait_for_device(),
        Err(Error::InsufficientBuffers(0))
    ));
    assert_eq!(engine.state(), EngineState::Closed);
    assert_eq!(shared.lock().unwrap().count("QBUF"), 0);
}

#[test]
fn test_frame_interval_query_failure_is_not_fatal() {
    let shared = Shared::new(STREAMING_CAPTURE);
    shared.lock().unwrap().parm_failure = Some(("VIDIOC_G_PARM", Errno::ENOTTY));
    let mut engine = engine(options().with_resolution(32, 8), &shared);
    engine.wait_for_device().unwrap();
    assert_eq!(engine.state(), EngineState::Streaming);
    {
        let s = shared.lock().unwrap();
        assert_eq!(s.count("G_PARM"), 1);
        assert_eq!(s.count("S_PARM"), 0);
        assert_eq!(s.timeperframe, None);
    }

    push(&shared, Step::Frame(solid_yuyv(32, 8, 128, 128, 128)));
    let mut image = engine.new_image();
    assert!(engine.capture(&mut image).unwrap());
}

#[test]
fn test_rejected_frame_rate_is_not_fatal() {
    for errno in [Errno::EINVAL, Errno::EBUSY] {
        let shared = Shared::new(STREAMING_CAPTURE);
        shared.lock().unwrap().parm_failure = Some(("VIDIOC_S_PARM", errno));
        let mut engine = engine(options().with_resolution(32, 8), &shared);
        engine.wait_for_device().unwrap();
        assert_eq!(engine.state(), EngineState::Streaming, "{}", errno);
        {
            let s = shared.lock().unwrap();
            assert_eq!(s.count("S_PARM"), 1);
            assert_eq!(s.timeperframe, None);
        }

        push(&shared, Step::Frame(solid_yuyv(32, 8, 128, 128, 128)));
        let mut image = engine.new_image();
        assert!(engine.capture(&mut image).unwrap(), "{}", errno);
    }
}
