// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use signal_hook::consts::SIGINT;
use signal_hook::flag;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parse resolution string in format "WxH" or "W*H"
pub fn parse_resolution(s: &str) -> Result<(u32, u32), CliError> {
    let (width_str, height_str) = s
        .split_once(['x', 'X', '*'])
        .ok_or_else(|| {
            CliError::InvalidArgs(format!("Invalid resolution format (expected WxH): {}", s))
        })?;

    let width = width_str
        .trim()
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = height_str
        .trim()
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width == 0 || height == 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Install signal handler for graceful shutdown on Ctrl+C
///
/// Returns an Arc<AtomicBool> that will be set to true when SIGINT is received.
/// The capture loop checks it between frames.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));

    flag::register(SIGINT, Arc::clone(&term))
        .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;

    log::debug!("Installed SIGINT handler");
    Ok(term)
}

/// Summarize device paths like "/dev/video0-4" or "/dev/video{0,2}"
pub fn summarize_paths(paths: &[String]) -> String {
    match paths {
        [] => return String::new(),
        [only] => return only.clone(),
        _ => {}
    }

    let mut nums: Vec<u32> = paths
        .iter()
        .filter_map(|p| p.strip_prefix("/dev/video")?.parse().ok())
        .collect();
    if nums.len() != paths.len() {
        return paths.join(", ");
    }
    nums.sort_unstable();

    let consecutive = nums.windows(2).all(|w| w[1] == w[0] + 1);
    let first = nums[0];
    let last = nums[nums.len() - 1];
    if consecutive && nums.len() > 2 {
        format!("/dev/video{}-{}", first, last)
    } else {
        let list: Vec<String> = nums.iter().map(u32::to_string).collect();
        format!("/dev/video{{{}}}", list.join(","))
    }
}
