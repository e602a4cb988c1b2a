//! USB descriptor and transfer type definitions
//!
//! Backend-neutral copies of the descriptor fields the HID layer needs. USB
//! backends convert their own descriptor types into these.

use crate::path::DevicePath;
use serde::{Deserialize, Serialize};

/// Endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (direction in bit 7)
    pub address: u8,
    pub direction: Direction,
    pub transfer_kind: TransferKind,
    /// wMaxPacketSize
    pub max_packet_size: u16,
}

/// Interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber
    pub number: u8,
    /// bAlternateSetting
    pub alternate_setting: u8,
    /// bInterfaceClass
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Device descriptor fields plus bus position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bDeviceClass
    pub class_code: u8,
    pub manufacturer_string_index: Option<u8>,
    pub product_string_index: Option<u8>,
    pub serial_number_string_index: Option<u8>,
}

impl DeviceDescriptor {
    /// Path of one interface on this device
    pub fn path(&self, interface: u8) -> DevicePath {
        DevicePath::new(self.bus_number.into(), self.address.into(), interface)
    }
}

/// Completion status of an asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// Interrupt endpoints of a HID interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HidEndpoints {
    /// Interrupt IN endpoint address
    pub input: u8,
    /// wMaxPacketSize of the IN endpoint
    pub input_max_packet_size: u16,
    /// Interrupt OUT endpoint address, if the interface has one
    pub output: Option<u8>,
}

impl HidEndpoints {
    /// Find the first interrupt IN and first interrupt OUT endpoint of
    /// `interface` across all of its alternate settings.
    ///
    /// Returns `None` when there is no interrupt IN endpoint.
    pub fn discover(interfaces: &[InterfaceDescriptor], interface: u8) -> Option<Self> {
        let mut input: Option<(u8, u16)> = None;
        let mut output: Option<u8> = None;

        let endpoints = interfaces
            .iter()
            .filter(|desc| desc.number == interface)
            .flat_map(|desc| desc.endpoints.iter())
            .filter(|ep| ep.transfer_kind == TransferKind::Interrupt);

        for ep in endpoints {
            match ep.direction {
                Direction::In if input.is_none() => {
                    input = Some((ep.address, ep.max_packet_size));
                }
                Direction::Out if output.is_none() => output = Some(ep.address),
                _ => {}
            }
            if input.is_some() && output.is_some() {
                break;
            }
        }

        input.map(|(address, max_packet_size)| Self {
            input: address,
            input_max_packet_size: max_packet_size,
            output,
        })
    }
}

/// Summary of one HID interface, as shown by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: DevicePath,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}
