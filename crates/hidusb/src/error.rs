//! Error types for HID devices and USB backends

use protocol::ProtocolError;
use thiserror::Error;

/// Status codes reported by a USB backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Input/output error")]
    Io,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Access denied (insufficient permissions)")]
    Access,
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    #[error("Entity not found")]
    NotFound,
    #[error("Resource busy")]
    Busy,
    #[error("Operation timed out")]
    Timeout,
    #[error("Overflow")]
    Overflow,
    #[error("Pipe error")]
    Pipe,
    #[error("System call interrupted")]
    Interrupted,
    #[error("Insufficient memory")]
    NoMem,
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Errors the read loop logs and keeps going after
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Busy
                | BackendError::Timeout
                | BackendError::Overflow
                | BackendError::Interrupted
        )
    }
}

/// Errors returned by HID device operations
#[derive(Debug, Error)]
pub enum HidError {
    /// The backend object does not describe a usable USB device
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Any failure while opening; wraps the underlying cause
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Device is not open")]
    DeviceNotOpen,

    #[error("Data must not be blank")]
    EmptyData,

    #[error("Failed to locate input endpoint on interface {0}")]
    MissingInputEndpoint(u8),

    /// The background read loop failed to start or stopped while starting
    #[error("Read loop failed: {0}")]
    ReadLoop(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid device path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("USB error: {0}")]
    Usb(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HidError>;
