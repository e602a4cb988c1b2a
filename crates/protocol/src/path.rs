//! Stable device paths
//!
//! A path identifies one interface on one physical device without having to
//! re-enumerate the bus: `BBBB:AAAA:II`, where every field is lowercase,
//! zero-padded hexadecimal (bus and address are 16 bits wide, the interface
//! number 8 bits).

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bus, device address and interface number of a HID interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevicePath {
    pub bus: u16,
    pub address: u16,
    pub interface: u8,
}

impl DevicePath {
    pub const fn new(bus: u16, address: u16, interface: u8) -> Self {
        Self {
            bus,
            address,
            interface,
        }
    }

    /// Parse a `BUS:ADDRESS:INTERFACE` string.
    ///
    /// Each field is read as hexadecimal regardless of width or case, so
    /// `1:1a:0` and `0001:001A:00` both parse to the same path.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidPath(path.to_string());

        let mut fields = path.split(':');
        let (Some(bus), Some(address), Some(interface), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid());
        };

        if [bus, address, interface]
            .iter()
            .any(|f| f.is_empty() || !f.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(invalid());
        }

        Ok(Self {
            bus: parse_field(bus, "bus")?,
            address: parse_field(address, "address")?,
            interface: parse_field(interface, "interface")?,
        })
    }
}

fn parse_field<T: TryFrom<u64>>(digits: &str, field: &'static str) -> Result<T> {
    let out_of_range = || ProtocolError::FieldOutOfRange {
        field,
        value: digits.to_string(),
    };

    let value = u64::from_str_radix(digits, 16).map_err(|_| out_of_range())?;
    T::try_from(value).map_err(|_| out_of_range())
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}:{:02x}",
            self.bus, self.address, self.interface
        )
    }
}

impl FromStr for DevicePath {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DevicePath {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DevicePath> for String {
    fn from(path: DevicePath) -> Self {
        path.to_string()
    }
}

/// Build the path string for a bus, device address and interface number.
pub fn make_path(bus: u16, address: u16, interface: u8) -> String {
    DevicePath::new(bus, address, interface).to_string()
}

/// Validate a path string and return it in normalized form.
pub fn validate_path(path: &str) -> Result<String> {
    DevicePath::parse(path).map(|p| p.to_string())
}
