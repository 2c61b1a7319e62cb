// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Camera device not found or inaccessible
    CameraNotFound(String),
    /// Device, I/O method or format conversion not supported
    Unsupported(String),
    /// No frame arrived in time
    Timeout(String),
    /// General error from the vidcap library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::CameraNotFound(msg) => write!(f, "Camera not found: {}", msg),
            CliError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    fn code(&self) -> u8 {
        match self {
            CliError::InvalidArgs(_) => 2,
            CliError::CameraNotFound(_) => 3,
            CliError::Unsupported(_) => 4,
            CliError::Timeout(_) => 6,
            CliError::General(_) => 1,
        }
    }
}

/// Map vidcap::Error to CliError with appropriate exit codes
impl From<vidcap::Error> for CliError {
    fn from(err: vidcap::Error) -> Self {
        use vidcap::Error;

        match err {
            Error::DeviceNotFound { .. } | Error::NotACharacterDevice(_) => {
                CliError::CameraNotFound(err.to_string())
            }
            Error::Open { ref source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    CliError::CameraNotFound(err.to_string())
                }
                _ => CliError::General(err.to_string()),
            },

            Error::UnsupportedDevice(_)
            | Error::UnsupportedIoMethod(_)
            | Error::UnsupportedPixelFormat { .. } => CliError::Unsupported(err.to_string()),

            Error::InvalidArgument(msg) => CliError::InvalidArgs(msg),

            Error::Ioctl { errno, .. } if errno == nix::errno::Errno::ETIMEDOUT => {
                CliError::Timeout(err.to_string())
            }
            Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
                CliError::Timeout(err.to_string())
            }

            _ => CliError::General(err.to_string()),
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
