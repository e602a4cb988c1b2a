//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Device path is not in BUS:ADDRESS:INTERFACE form
    #[error(
        "Path should be in BUS:ADDRESS:INTERFACE format with each value being in hexadecimal (ie - 0001:001a:00), not {0}"
    )]
    InvalidPath(String),

    /// A path field does not fit in its fixed width
    #[error("Path field {field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: String },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
