// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::path::PathBuf;
use vidcap::v4l2::{self, DeviceInfo};
use vidcap::{IoMethod, OutputFormat};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Camera device path
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,
}

#[derive(Debug, Serialize)]
struct CameraInfo {
    version: String,
    device: String,
    card: String,
    driver: String,
    driver_version: String,
    bus: String,
    capabilities: String,
    capability_flags: Vec<String>,
    capture: bool,
    io_methods: Vec<String>,
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Serialize)]
struct FormatInfo {
    fourcc: String,
    description: String,
    compressed: bool,
    emulated: bool,
    sizes: Vec<String>,
    /// Output formats vidcap can convert this format to, empty if unsupported
    outputs: Vec<String>,
}

const OUTPUTS: [OutputFormat; 4] = [
    OutputFormat::Rgb,
    OutputFormat::Bgr,
    OutputFormat::Yuyv,
    OutputFormat::Gray,
];

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing info command: {:?}", args);

    let device = v4l2::inspect(&args.device)?;
    let info = camera_info(&device);

    if json {
        let json_str = serde_json::to_string_pretty(&info)
            .map_err(|e| CliError::General(format!("Failed to serialize JSON: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_info(&info);
    }

    Ok(())
}

fn camera_info(device: &DeviceInfo) -> CameraInfo {
    let caps = device.capabilities();

    let formats = device
        .formats()
        .iter()
        .map(|f| FormatInfo {
            fourcc: f.fourcc.to_string(),
            description: f.description.clone(),
            compressed: f.compressed,
            emulated: f.emulated,
            sizes: f.resolutions.iter().map(|r| r.to_string()).collect(),
            outputs: f
                .pixel_format()
                .map(|native| {
                    OUTPUTS
                        .iter()
                        .filter(|out| vidcap::convert::is_supported(native, **out))
                        .map(|out| out.to_string())
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect();

    CameraInfo {
        version: vidcap::version().to_string(),
        device: device.path().display().to_string(),
        card: device.card().to_string(),
        driver: device.driver().to_string(),
        driver_version: device.version(),
        bus: device.bus_info().to_string(),
        capabilities: format!("{:#010x}", caps.bits()),
        capability_flags: caps.names().iter().map(|n| n.to_string()).collect(),
        capture: device.is_capture(),
        io_methods: [IoMethod::Mmap, IoMethod::Userptr, IoMethod::Read]
            .into_iter()
            .filter(|m| caps.supports(*m))
            .map(|m| m.to_string())
            .collect(),
        formats,
    }
}

fn print_text_info(info: &CameraInfo) {
    println!("vidcap {}", info.version);
    println!("==============");
    println!("Device:       {}", info.device);
    println!("Card:         {}", info.card);
    println!("Driver:       {} {}", info.driver, info.driver_version);
    println!("Bus:          {}", info.bus);
    println!("Capabilities: {}", info.capabilities);
    for flag in &info.capability_flags {
        println!("    - {}", flag);
    }

    if !info.capture {
        println!("\n{} is not a video capture device", info.device);
        return;
    }

    println!("I/O methods:  {}", info.io_methods.join(", "));
    println!("\nCapture formats:");
    if info.formats.is_empty() {
        println!("  none reported");
    }
    for format in &info.formats {
        let mut flags = Vec::new();
        if format.compressed {
            flags.push("compressed");
        }
        if format.emulated {
            flags.push("emulated");
        }
        if flags.is_empty() {
            println!("  {} {}", format.fourcc, format.description);
        } else {
            println!(
                "  {} {} ({})",
                format.fourcc,
                format.description,
                flags.join(", ")
            );
        }
        if !format.sizes.is_empty() {
            println!("    Sizes:   {}", format.sizes.join(" "));
        }
        if format.outputs.is_empty() {
            println!("    Outputs: not supported by vidcap");
        } else {
            println!("    Outputs: {}", format.outputs.join(", "));
        }
    }
}
