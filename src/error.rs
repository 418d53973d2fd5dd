use std::fmt::Display;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Resource busy: {0}")]
    ResourceBusy(String),
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("Wait interrupted")]
    Interrupted,
    #[error("Wait timed out")]
    Timeout,
    #[error("Edge detection cancelled")]
    Cancelled,
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    /// Classifies an OS error by kind, keeping `context` in the message.
    pub fn from_io(context: impl Display, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => GpioError::NotFound(format!("{context}: {err}")),
            io::ErrorKind::PermissionDenied => {
                GpioError::PermissionDenied(format!("{context}: {err}"))
            }
            io::ErrorKind::ResourceBusy => GpioError::ResourceBusy(format!("{context}: {err}")),
            io::ErrorKind::Interrupted => GpioError::Interrupted,
            _ => GpioError::Io(format!("{context}: {err}")),
        }
    }
}
