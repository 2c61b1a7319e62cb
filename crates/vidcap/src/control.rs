// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camera controls.
//!
//! Controls go through a [`ControlSink`]. The default [`ControlChain`] tries
//! the extended-control ioctl first, then the single-control ioctl for
//! drivers without extended controls, and finally runs `v4l2-ctl`, which
//! covers vendor controls some drivers only expose through the utility.

use std::process::Command;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use vidcap_sys as sys;

use crate::{device::V4l2Device, options::CameraControls, Error};

/// A control known both by its `v4l2-ctl` name and its V4L2 id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlId {
    pub name: &'static str,
    pub id: u32,
}

pub const BRIGHTNESS: ControlId = ControlId {
    name: "brightness",
    id: sys::V4L2_CID_BRIGHTNESS,
};
pub const CONTRAST: ControlId = ControlId {
    name: "contrast",
    id: sys::V4L2_CID_CONTRAST,
};
pub const SATURATION: ControlId = ControlId {
    name: "saturation",
    id: sys::V4L2_CID_SATURATION,
};
pub const SHARPNESS: ControlId = ControlId {
    name: "sharpness",
    id: sys::V4L2_CID_SHARPNESS,
};
pub const GAIN: ControlId = ControlId {
    name: "gain",
    id: sys::V4L2_CID_GAIN,
};
pub const WHITE_BALANCE_AUTO: ControlId = ControlId {
    name: "white_balance_temperature_auto",
    id: sys::V4L2_CID_AUTO_WHITE_BALANCE,
};
pub const WHITE_BALANCE_TEMPERATURE: ControlId = ControlId {
    name: "white_balance_temperature",
    id: sys::V4L2_CID_WHITE_BALANCE_TEMPERATURE,
};
pub const EXPOSURE_AUTO: ControlId = ControlId {
    name: "auto_exposure",
    id: sys::V4L2_CID_EXPOSURE_AUTO,
};
pub const EXPOSURE_ABSOLUTE: ControlId = ControlId {
    name: "exposure_absolute",
    id: sys::V4L2_CID_EXPOSURE_ABSOLUTE,
};
pub const FOCUS_AUTO: ControlId = ControlId {
    name: "focus_auto",
    id: sys::V4L2_CID_FOCUS_AUTO,
};
pub const FOCUS_ABSOLUTE: ControlId = ControlId {
    name: "focus_absolute",
    id: sys::V4L2_CID_FOCUS_ABSOLUTE,
};

/// Somewhere a control value can be written.
pub trait ControlSink: Send {
    fn set(
        &mut self,
        device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error>;
}

/// `VIDIOC_S_EXT_CTRLS` with a single control.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtControlSink;

impl ControlSink for ExtControlSink {
    fn set(
        &mut self,
        device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error> {
        let mut ctrl = sys::v4l2_ext_control {
            id: control.id,
            value: sys::v4l2_ext_control_value { value },
            ..Default::default()
        };
        let mut ctrls = sys::v4l2_ext_controls {
            which: sys::v4l2_ctrl_id2class(control.id),
            count: 1,
            controls: &mut ctrl,
            ..Default::default()
        };
        device.set_ext_controls(&mut ctrls)
    }
}

/// `VIDIOC_S_CTRL`, for drivers predating extended controls.
#[derive(Debug, Default, Clone, Copy)]
pub struct CtrlSink;

impl ControlSink for CtrlSink {
    fn set(
        &mut self,
        device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error> {
        let mut ctrl = sys::v4l2_control {
            id: control.id,
            value,
        };
        device.set_control(&mut ctrl)
    }
}

/// Runs `v4l2-ctl --device=<path> -c <name>=<value>`.
///
/// The utility is silent on success, so any output is treated as failure.
#[derive(Debug, Clone)]
pub struct V4l2CtlSink {
    program: String,
}

impl Default for V4l2CtlSink {
    fn default() -> Self {
        V4l2CtlSink {
            program: "v4l2-ctl".to_owned(),
        }
    }
}

impl V4l2CtlSink {
    /// Use a different executable, e.g. an absolute path to `v4l2-ctl`.
    pub fn with_program(program: impl Into<String>) -> Self {
        V4l2CtlSink {
            program: program.into(),
        }
    }
}

impl ControlSink for V4l2CtlSink {
    fn set(
        &mut self,
        device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error> {
        let output = Command::new(&self.program)
            .arg(format!("--device={}", device.path().display()))
            .arg("-c")
            .arg(format!("{}={}", control.name, value))
            .output()
            .map_err(|err| Error::Control {
                name: control.name.to_owned(),
                message: format!("{}: {}", self.program, err),
            })?;

        let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
        message.push_str(&String::from_utf8_lossy(&output.stderr));
        let message = message.trim();
        if !message.is_empty() {
            return Err(Error::Control {
                name: control.name.to_owned(),
                message: message.to_owned(),
            });
        }
        if !output.status.success() {
            return Err(Error::Control {
                name: control.name.to_owned(),
                message: format!("{} exited with {}", self.program, output.status),
            });
        }
        Ok(())
    }
}

/// True when the driver refused the request itself rather than failing.
fn is_rejection(err: &Error) -> bool {
    matches!(
        err.errno(),
        Some(Errno::ENOTTY | Errno::EINVAL | Errno::ERANGE | Errno::EACCES | Errno::EPERM)
    )
}

/// Tries each sink in order, moving on only when the previous one was
/// rejected by the driver.
pub struct ControlChain {
    sinks: Vec<Box<dyn ControlSink>>,
}

impl ControlChain {
    pub fn new(sinks: Vec<Box<dyn ControlSink>>) -> Self {
        ControlChain { sinks }
    }
}

impl Default for ControlChain {
    fn default() -> Self {
        ControlChain::new(vec![
            Box::new(ExtControlSink),
            Box::new(CtrlSink),
            Box::new(V4l2CtlSink::default()),
        ])
    }
}

impl ControlSink for ControlChain {
    fn set(
        &mut self,
        device: &mut dyn V4l2Device,
        control: ControlId,
        value: i32,
    ) -> Result<(), Error> {
        let mut last = Error::Control {
            name: control.name.to_owned(),
            message: "no control sink configured".to_owned(),
        };
        for sink in self.sinks.iter_mut() {
            match sink.set(device, control, value) {
                Ok(()) => return Ok(()),
                Err(err) if is_rejection(&err) => {
                    debug!("{}={} rejected: {}", control.name, value, err);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }
}

fn apply(
    device: &mut dyn V4l2Device,
    sink: &mut dyn ControlSink,
    control: ControlId,
    value: i32,
) -> bool {
    match sink.set(device, control, value) {
        Ok(()) => {
            debug!("{} = {}", control.name, value);
            true
        }
        Err(err) => {
            error!("setting {}={} on {}: {}", control.name, value, device.path().display(), err);
            false
        }
    }
}

/// Whether the device exposes an enabled `focus_auto` control.
fn focus_auto_available(device: &mut dyn V4l2Device) -> bool {
    let mut query = sys::v4l2_queryctrl {
        id: sys::V4L2_CID_FOCUS_AUTO,
        ..Default::default()
    };
    match device.query_control(&mut query) {
        Err(err) if err.errno() == Some(Errno::EINVAL) => {
            info!("focus_auto is not supported by {}", device.path().display());
            false
        }
        Err(err) => {
            warn!("{}", err);
            false
        }
        Ok(()) if query.flags & sys::V4L2_CTRL_FLAG_DISABLED != 0 => {
            info!("focus_auto is disabled on {}", device.path().display());
            false
        }
        Ok(()) => true,
    }
}

/// Apply every requested control. Failures are logged and skipped; the
/// number of failed writes is returned.
pub fn apply_controls(
    device: &mut dyn V4l2Device,
    sink: &mut dyn ControlSink,
    controls: &CameraControls,
) -> usize {
    let mut failed = 0;
    let mut writes = Vec::new();

    for (control, value) in [
        (BRIGHTNESS, controls.brightness),
        (CONTRAST, controls.contrast),
        (SATURATION, controls.saturation),
        (SHARPNESS, controls.sharpness),
        (GAIN, controls.gain),
    ] {
        if value >= 0 {
            writes.push((control, value));
        }
    }

    if controls.auto_white_balance {
        writes.push((WHITE_BALANCE_AUTO, 1));
    } else if controls.white_balance >= 0 {
        writes.push((WHITE_BALANCE_AUTO, 0));
        writes.push((WHITE_BALANCE_TEMPERATURE, controls.white_balance));
    }

    if controls.auto_exposure {
        writes.push((EXPOSURE_AUTO, sys::V4L2_EXPOSURE_APERTURE_PRIORITY));
    } else if controls.exposure >= 0 {
        writes.push((EXPOSURE_AUTO, sys::V4L2_EXPOSURE_MANUAL));
        writes.push((EXPOSURE_ABSOLUTE, controls.exposure));
    }

    if controls.auto_focus {
        if focus_auto_available(device) {
            writes.push((FOCUS_AUTO, 1));
        } else {
            failed += 1;
        }
    } else if controls.focus >= 0 {
        writes.push((FOCUS_AUTO, 0));
        writes.push((FOCUS_ABSOLUTE, controls.focus));
    }

    for (control, value) in writes {
        if !apply(device, sink, control, value) {
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_names_match_v4l2_ctl() {
        assert_eq!(EXPOSURE_AUTO.name, "auto_exposure");
        assert_eq!(WHITE_BALANCE_AUTO.id, sys::V4L2_CID_AUTO_WHITE_BALANCE);
        assert_eq!(
            sys::v4l2_ctrl_id2class(FOCUS_ABSOLUTE.id),
            sys::V4L2_CTRL_CLASS_CAMERA
        );
    }

    #[test]
    fn test_rejection_classification() {
        assert!(is_rejection(&Error::ioctl("VIDIOC_S_EXT_CTRLS", Errno::ENOTTY)));
        assert!(is_rejection(&Error::ioctl("VIDIOC_S_EXT_CTRLS", Errno::ERANGE)));
        assert!(!is_rejection(&Error::ioctl("VIDIOC_S_EXT_CTRLS", Errno::EBUSY)));
        assert!(!is_rejection(&Error::NotStreaming));
    }
}
