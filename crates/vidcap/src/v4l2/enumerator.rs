// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::path::{Path, PathBuf};

use log::{debug, trace};
use vidcap_sys as sys;

use super::device::{c_string, device_number, Capabilities, DeviceInfo, Format, Resolution};
use crate::{
    device::{node_capabilities, DeviceHandle, V4l2Device},
    fourcc::FourCC,
    format::PixelFormat,
    Error,
};

/// Enumerate every V4L2 node under `/dev`, sorted by device number.
///
/// Nodes that cannot be opened (busy, permissions) or that are not V4L2
/// devices are skipped.
///
/// ```no_run
/// let devices = vidcap::v4l2::enumerate()?;
/// for device in devices.iter().filter(|d| d.is_capture()) {
///     println!("{}", device);
/// }
/// # Ok::<(), vidcap::Error>(())
/// ```
pub fn enumerate() -> Result<Vec<DeviceInfo>, Error> {
    enumerate_in(Path::new("/dev"))
}

/// Like [`enumerate`] for an arbitrary directory.
pub fn enumerate_in(dir: &Path) -> Result<Vec<DeviceInfo>, Error> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| device_number(path).is_some())
        .collect();
    paths.sort_by_key(|path| device_number(path));

    let mut devices = Vec::with_capacity(paths.len());
    for path in paths {
        match inspect(&path) {
            Ok(device) => devices.push(device),
            Err(err) => debug!("skipping {}: {}", path.display(), err),
        }
    }
    Ok(devices)
}

/// Query identity, capabilities, capture formats and frame sizes of one node.
pub fn inspect(path: impl AsRef<Path>) -> Result<DeviceInfo, Error> {
    let mut handle = DeviceHandle::open(path.as_ref())?;
    let cap = handle.query_capability()?;
    let capabilities = Capabilities(node_capabilities(&cap));

    let formats = if capabilities.is_capture() {
        capture_formats(&handle)?
    } else {
        Vec::new()
    };

    Ok(DeviceInfo {
        path: path.as_ref().to_path_buf(),
        driver: c_string(&cap.driver),
        card: c_string(&cap.card),
        bus_info: c_string(&cap.bus_info),
        version: cap.version,
        capabilities,
        formats,
    })
}

/// First capture device offering `format`, optionally at a given size.
pub fn find_camera(
    format: PixelFormat,
    resolution: Option<(u32, u32)>,
) -> Result<Option<DeviceInfo>, Error> {
    let fourcc = format.fourcc();
    Ok(enumerate()?.into_iter().find(|device| {
        device.is_capture()
            && device.formats().iter().any(|f| {
                f.fourcc == fourcc
                    && resolution.map_or(true, |(w, h)| f.supports_resolution(w, h))
            })
    }))
}

fn capture_formats(handle: &DeviceHandle) -> Result<Vec<Format>, Error> {
    let mut formats = Vec::new();
    let mut index = 0;
    while let Some(desc) = handle.enum_format(index)? {
        let fourcc = FourCC::from_u32(desc.pixelformat);
        trace!("{}: format {} {}", handle.path().display(), index, fourcc);
        formats.push(Format {
            fourcc,
            description: c_string(&desc.description),
            compressed: desc.flags & sys::V4L2_FMT_FLAG_COMPRESSED != 0,
            emulated: desc.flags & sys::V4L2_FMT_FLAG_EMULATED != 0,
            resolutions: frame_sizes(handle, desc.pixelformat)?,
        });
        index += 1;
    }
    Ok(formats)
}

fn frame_sizes(handle: &DeviceHandle, pixel_format: u32) -> Result<Vec<Resolution>, Error> {
    let mut sizes = Vec::new();
    let mut index = 0;
    while let Some(size) = handle.enum_frame_size(pixel_format, index)? {
        if size.type_ == sys::V4L2_FRMSIZE_TYPE_DISCRETE {
            // SAFETY: discrete is the active member for DISCRETE entries.
            let discrete = unsafe { size.size.discrete };
            sizes.push(Resolution::new(discrete.width, discrete.height));
        } else {
            // SAFETY: stepwise is the active member for STEPWISE and
            // CONTINUOUS entries, which are reported once at index 0.
            let stepwise = unsafe { size.size.stepwise };
            sizes.push(Resolution::new(stepwise.min_width, stepwise.min_height));
            sizes.push(Resolution::new(stepwise.max_width, stepwise.max_height));
            break;
        }
        index += 1;
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_skips_non_devices() {
        let dir = std::env::temp_dir().join(format!("vidcap-enum-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("video0"), b"not a device").unwrap();
        std::fs::write(dir.join("media0"), b"").unwrap();

        let devices = enumerate_in(&dir).unwrap();
        assert!(devices.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_inspect_missing() {
        assert!(matches!(
            inspect("/dev/video-vidcap-missing"),
            Err(Error::DeviceNotFound { .. })
        ));
    }
}
