// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::{self, FrameMetrics, MetricsCollector};
use crate::utils;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use vidcap::{
    CameraControls, CameraImage, CaptureEngine, EngineState, IoMethod, OutputFormat, PixelFormat,
    StreamOptions,
};

/// Back-off between attempts to bring the device back.
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Camera device
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Resolution in WxH format
    #[arg(short, long, default_value = "640x480")]
    resolution: String,

    /// Target frame rate
    #[arg(short = 'F', long, default_value = "30")]
    fps: f64,

    /// Native pixel format: yuyv|uyvy|mjpeg|mono10|rgb24|bgr24|grey|nv12
    #[arg(long, default_value = "yuyv")]
    format: PixelFormat,

    /// Output format: rgb|bgr|yuyv|gray
    #[arg(long, default_value = "rgb")]
    output_format: OutputFormat,

    /// Buffer I/O method: mmap|userptr|read
    #[arg(long, default_value = "mmap")]
    io: IoMethod,

    /// Number of driver buffers (mmap and userptr)
    #[arg(short, long, default_value = "4")]
    buffers: u32,

    /// Number of frames (0=unlimited)
    #[arg(short = 'n', long, default_value = "100")]
    frames: u64,

    /// Capture duration in seconds
    #[arg(short = 't', long)]
    duration: Option<u64>,

    /// Give up after this many seconds without a frame
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Save the first frame (PPM/PGM for rgb, bgr and gray, raw bytes otherwise)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Requeue frames that arrive early instead of delivering them
    #[arg(long)]
    drop_frames: bool,

    /// Treat EIO from the driver as a lost session instead of a usable frame
    #[arg(long)]
    no_eio_fallthrough: bool,

    #[command(flatten)]
    controls: ControlArgs,
}

/// Camera controls; -1 leaves the driver default in place
#[derive(ClapArgs, Debug)]
struct ControlArgs {
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    brightness: i32,

    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    contrast: i32,

    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    saturation: i32,

    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    sharpness: i32,

    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    gain: i32,

    /// White balance temperature in Kelvin
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    white_balance: i32,

    /// Absolute exposure in 100 µs units
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    exposure: i32,

    /// Absolute focus position
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    focus: i32,

    #[arg(long)]
    auto_white_balance: bool,

    #[arg(long)]
    auto_exposure: bool,

    #[arg(long)]
    auto_focus: bool,
}

impl From<&ControlArgs> for CameraControls {
    fn from(args: &ControlArgs) -> Self {
        CameraControls {
            brightness: args.brightness,
            contrast: args.contrast,
            saturation: args.saturation,
            sharpness: args.sharpness,
            gain: args.gain,
            white_balance: args.white_balance,
            exposure: args.exposure,
            focus: args.focus,
            auto_white_balance: args.auto_white_balance,
            auto_exposure: args.auto_exposure,
            auto_focus: args.auto_focus,
        }
    }
}

#[derive(Debug, Serialize)]
struct CaptureReport {
    device: String,
    width: u32,
    height: u32,
    pixel_format: String,
    output_format: String,
    io_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<String>,
    metrics: FrameMetrics,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Capture parameters: {:?}", args);

    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let options = StreamOptions::new(&args.device)
        .with_resolution(width, height)
        .with_frame_rate(args.fps)
        .with_pixel_format(args.format)
        .with_output_format(args.output_format)
        .with_io_method(args.io)
        .with_buffers(args.buffers)
        .with_controls(CameraControls::from(&args.controls))
        .with_frame_drop(args.drop_frames)
        .with_eio_fallthrough(!args.no_eio_fallthrough);

    let mut engine = CaptureEngine::init(options)?;
    let term = utils::install_signal_handler()?;

    log::info!(
        "Capturing from {} ({} -> {}, {} i/o)",
        args.device.display(),
        args.format,
        args.output_format,
        args.io
    );

    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };
    let max_duration = args.duration.map(Duration::from_secs);
    let timeout = Duration::from_secs(args.timeout);

    let mut metrics = MetricsCollector::new(args.fps);
    let mut image = engine.new_image();
    let mut saved: Option<PathBuf> = None;
    let mut streamed = false;
    let start_time = Instant::now();
    let mut last_frame = Instant::now();

    while metrics.frames() < max_frames && !term.load(Ordering::Relaxed) {
        if let Some(max_dur) = max_duration {
            if start_time.elapsed() >= max_dur {
                log::info!("Duration limit reached");
                break;
            }
        }
        if last_frame.elapsed() >= timeout {
            return Err(CliError::Timeout(format!(
                "no frame from {} in {} s",
                args.device.display(),
                args.timeout
            )));
        }

        if engine.state() != EngineState::Streaming {
            if let Err(err) = engine.wait_for_device() {
                // nothing to wait for if the very first attempt is misconfigured
                if !streamed {
                    return Err(err.into());
                }
                log::debug!("Device not ready: {}", err);
                thread::sleep(RETRY_DELAY);
                continue;
            }
            if streamed {
                metrics.record_reconnect();
            }
            streamed = true;
            if (image.width(), image.height()) != (engine.width(), engine.height()) {
                image = engine.new_image();
            }
        }

        let started = Instant::now();
        if !engine.capture(&mut image)? {
            metrics.record_empty();
            continue;
        }
        let latency = started.elapsed();
        last_frame = Instant::now();

        let timestamp = image.tv_sec() as f64 + image.tv_usec() as f64 / 1_000_000.0;
        metrics.record_frame(latency, image.image_size(), timestamp);

        if saved.is_none() {
            if let Some(path) = &args.output {
                write_frame(path, &image, args.output_format)?;
                log::info!("Saved first frame to {}", path.display());
                saved = Some(path.clone());
            }
        }
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Received Ctrl+C, stopping...");
    }
    engine.shutdown();

    let report = CaptureReport {
        device: args.device.display().to_string(),
        width: engine.width(),
        height: engine.height(),
        pixel_format: args.format.to_string(),
        output_format: args.output_format.to_string(),
        io_method: args.io.to_string(),
        saved: saved.map(|p| p.display().to_string()),
        metrics: metrics.finalize(),
    };

    if json {
        let json_str = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        println!(
            "{}: {}x{} {} -> {} ({})",
            report.device,
            report.width,
            report.height,
            report.pixel_format,
            report.output_format,
            report.io_method
        );
        if let Some(path) = &report.saved {
            println!("First frame: {}", path);
        }
        metrics::print_text(&report.metrics);
    }

    Ok(())
}

/// Write one frame as binary PPM (RGB, BGR), PGM (GRAY) or raw bytes (YUYV).
fn write_frame(path: &Path, image: &CameraImage, format: OutputFormat) -> Result<(), CliError> {
    let file = File::create(path)
        .map_err(|e| CliError::General(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut out = BufWriter::new(file);
    encode_frame(&mut out, image, format)
        .and_then(|()| out.flush())
        .map_err(|e| CliError::General(format!("Failed to write {}: {}", path.display(), e)))
}

fn encode_frame<W: Write>(
    out: &mut W,
    image: &CameraImage,
    format: OutputFormat,
) -> std::io::Result<()> {
    let (width, height) = (image.width(), image.height());
    match format {
        OutputFormat::Rgb => {
            write!(out, "P6\n{} {}\n255\n", width, height)?;
            out.write_all(image.data())
        }
        OutputFormat::Bgr => {
            write!(out, "P6\n{} {}\n255\n", width, height)?;
            for pixel in image.data().chunks_exact(3) {
                out.write_all(&[pixel[2], pixel[1], pixel[0]])?;
            }
            Ok(())
        }
        OutputFormat::Gray => {
            write!(out, "P5\n{} {}\n255\n", width, height)?;
            out.write_all(image.data())
        }
        OutputFormat::Yuyv => out.write_all(image.data()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(format: OutputFormat, fill: &[u8]) -> CameraImage {
        let mut image = CameraImage::new(2, 1, format);
        for chunk in image.data_mut().chunks_exact_mut(fill.len()) {
            chunk.copy_from_slice(fill);
        }
        image
    }

    #[test]
    fn test_encode_rgb_ppm() {
        let mut out = Vec::new();
        encode_frame(&mut out, &image(OutputFormat::Rgb, &[1, 2, 3]), OutputFormat::Rgb).unwrap();
        assert_eq!(out, b"P6\n2 1\n255\n\x01\x02\x03\x01\x02\x03");
    }

    #[test]
    fn test_encode_bgr_swaps_to_rgb() {
        let mut out = Vec::new();
        encode_frame(&mut out, &image(OutputFormat::Bgr, &[1, 2, 3]), OutputFormat::Bgr).unwrap();
        assert_eq!(out, b"P6\n2 1\n255\n\x03\x02\x01\x03\x02\x01");
    }

    #[test]
    fn test_encode_gray_pgm_and_raw_yuyv() {
        let mut out = Vec::new();
        encode_frame(&mut out, &image(OutputFormat::Gray, &[7]), OutputFormat::Gray).unwrap();
        assert_eq!(out, b"P5\n2 1\n255\n\x07\x07");

        let mut out = Vec::new();
        let yuyv = image(OutputFormat::Yuyv, &[16, 128, 16, 128]);
        encode_frame(&mut out, &yuyv, OutputFormat::Yuyv).unwrap();
        assert_eq!(out, vec![16, 128, 16, 128]);
    }

    #[test]
    fn test_controls_from_args() {
        let args = ControlArgs {
            brightness: 40,
            contrast: -1,
            saturation: -1,
            sharpness: -1,
            gain: -1,
            white_balance: 4500,
            exposure: -1,
            focus: -1,
            auto_white_balance: false,
            auto_exposure: true,
            auto_focus: false,
        };
        let controls = CameraControls::from(&args);
        assert_eq!(controls.brightness, 40);
        assert_eq!(controls.white_balance, 4500);
        assert!(controls.auto_exposure);
        assert!(!controls.is_default());
    }
}
