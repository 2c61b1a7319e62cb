// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 capture device listing, grouped by the hardware behind the nodes.

use crate::error::CliError;
use crate::utils::summarize_paths;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::collections::BTreeMap;
use vidcap::v4l2::{self, DeviceInfo};
use vidcap::IoMethod;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Include nodes without video capture (metadata, output, codecs)
    #[arg(long)]
    all: bool,

    /// Show one entry per node instead of grouping by bus
    #[arg(long)]
    ungrouped: bool,

    /// Show frame sizes and capability flags
    #[arg(short, long)]
    long: bool,
}

#[derive(Debug, Serialize)]
struct DevicesOutput {
    devices: Vec<DeviceGroup>,
    summary: Summary,
}

#[derive(Debug, Serialize)]
struct DeviceGroup {
    name: String,
    driver: String,
    bus: String,
    paths: Vec<String>,
    capture: bool,
    formats: Vec<FormatEntry>,
    io_methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capabilities: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct FormatEntry {
    fourcc: String,
    description: String,
    compressed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sizes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Summary {
    total_nodes: usize,
    listed: usize,
    capture_devices: usize,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing devices command: {:?}", args);

    let nodes = v4l2::enumerate()
        .map_err(|e| CliError::General(format!("Failed to enumerate V4L2 devices: {}", e)))?;
    let total_nodes = nodes.len();

    let listed: Vec<&DeviceInfo> = nodes.iter().filter(|d| args.all || d.is_capture()).collect();
    let groups: Vec<DeviceGroup> = if args.ungrouped {
        listed.iter().map(|d| group(&[*d], args.long)).collect()
    } else {
        group_by_bus(&listed, args.long)
    };

    let output = DevicesOutput {
        summary: Summary {
            total_nodes,
            listed: listed.len(),
            capture_devices: groups.iter().filter(|g| g.capture).count(),
        },
        devices: groups,
    };

    if json {
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_output(&output, args.long);
    }

    Ok(())
}

/// Nodes sharing a bus belong to one camera (e.g. UVC video + metadata)
fn group_by_bus(devices: &[&DeviceInfo], long: bool) -> Vec<DeviceGroup> {
    let mut buses: BTreeMap<&str, Vec<&DeviceInfo>> = BTreeMap::new();
    for device in devices {
        buses.entry(device.bus_info()).or_default().push(*device);
    }

    let mut groups: Vec<DeviceGroup> = buses.values().map(|devs| group(devs, long)).collect();
    groups.sort_by(|a, b| a.paths.first().cmp(&b.paths.first()));
    groups
}

/// Describe a set of nodes using the first capture node for formats
fn group(devices: &[&DeviceInfo], long: bool) -> DeviceGroup {
    let primary = devices
        .iter()
        .find(|d| d.is_capture())
        .unwrap_or(&devices[0]);

    let formats = primary
        .formats()
        .iter()
        .map(|f| FormatEntry {
            fourcc: f.fourcc.to_string(),
            description: f.description.clone(),
            compressed: f.compressed,
            sizes: if long {
                f.resolutions.iter().map(|r| r.to_string()).collect()
            } else {
                Vec::new()
            },
        })
        .collect();

    let caps = primary.capabilities();
    let io_methods = [IoMethod::Mmap, IoMethod::Userptr, IoMethod::Read]
        .into_iter()
        .filter(|m| caps.supports(*m))
        .map(|m| m.to_string())
        .collect();

    DeviceGroup {
        name: primary.card().to_string(),
        driver: primary.driver().to_string(),
        bus: primary.bus_info().to_string(),
        paths: devices
            .iter()
            .map(|d| d.path().display().to_string())
            .collect(),
        capture: primary.is_capture(),
        formats,
        io_methods,
        capabilities: long.then(|| caps.names().iter().map(|n| n.to_string()).collect()),
    }
}

fn print_text_output(output: &DevicesOutput, long: bool) {
    println!(
        "V4L2 Devices ({} nodes, {} capture devices)\n",
        output.summary.total_nodes, output.summary.capture_devices
    );

    if output.devices.is_empty() {
        println!("No capture devices found");
        return;
    }

    for group in &output.devices {
        if group.paths.len() == 1 {
            println!("{}: {}", group.paths[0], group.name);
        } else {
            println!(
                "{}: {} ({} nodes)",
                summarize_paths(&group.paths),
                group.name,
                group.paths.len()
            );
        }
        println!("  Driver: {}", group.driver);
        if long {
            println!("  Bus: {}", group.bus);
            if let Some(caps) = &group.capabilities {
                println!("  Capabilities: {}", caps.join(", "));
            }
        }
        if !group.io_methods.is_empty() {
            println!("  I/O: {}", group.io_methods.join(", "));
        }
        for format in &group.formats {
            let suffix = if format.compressed { " (compressed)" } else { "" };
            println!("  {} {}{}", format.fourcc, format.description, suffix);
            if !format.sizes.is_empty() {
                println!("    {}", format.sizes.join(" "));
            }
        }
        println!();
    }
}
