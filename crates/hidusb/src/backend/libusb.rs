//! libusb backend built on `rusb`

use super::transfer::LibusbTransfer;
use super::{BackendResult, CompletionCallback, UsbBackend, UsbDevice, UsbHandle};
use crate::error::BackendError;
use protocol::{
    DeviceDescriptor, Direction, EndpointDescriptor, InterfaceDescriptor, TransferKind,
};
use rusb::{Context, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// USB backend owning one libusb context
#[derive(Clone)]
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> BackendResult<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for RusbBackend {
    type Device = RusbDevice;
    type Handle = RusbHandle;

    fn devices(&self) -> BackendResult<Vec<RusbDevice>> {
        let list = self.context.devices()?;
        Ok(list.iter().map(|device| RusbDevice { device }).collect())
    }

    fn handle_events(&self, timeout: Duration) -> BackendResult<()> {
        self.context.handle_events(Some(timeout))?;
        Ok(())
    }
}

/// A device seen through libusb
#[derive(Clone)]
pub struct RusbDevice {
    device: rusb::Device<Context>,
}

impl RusbDevice {
    pub fn inner(&self) -> &rusb::Device<Context> {
        &self.device
    }
}

impl UsbDevice for RusbDevice {
    type Handle = RusbHandle;

    fn descriptor(&self) -> BackendResult<DeviceDescriptor> {
        let desc = self.device.device_descriptor()?;

        Ok(DeviceDescriptor {
            bus_number: self.device.bus_number(),
            address: self.device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            class_code: desc.class_code(),
            manufacturer_string_index: desc.manufacturer_string_index(),
            product_string_index: desc.product_string_index(),
            serial_number_string_index: desc.serial_number_string_index(),
        })
    }

    fn interfaces(&self) -> BackendResult<Vec<InterfaceDescriptor>> {
        let config = match self.device.active_config_descriptor() {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "No active configuration on bus {} address {} ({}), using the first one",
                    self.device.bus_number(),
                    self.device.address(),
                    e
                );
                self.device.config_descriptor(0)?
            }
        };

        let mut out = Vec::new();
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                out.push(InterfaceDescriptor {
                    number: desc.interface_number(),
                    alternate_setting: desc.setting_number(),
                    class_code: desc.class_code(),
                    sub_class_code: desc.sub_class_code(),
                    protocol_code: desc.protocol_code(),
                    endpoints: desc.endpoint_descriptors().map(map_endpoint).collect(),
                });
            }
        }
        Ok(out)
    }

    fn open(&self) -> BackendResult<RusbHandle> {
        Ok(RusbHandle {
            handle: Arc::new(self.device.open()?),
        })
    }
}

/// An open libusb device handle
///
/// Shared with the transfers allocated from it so the handle outlives them.
pub struct RusbHandle {
    handle: Arc<DeviceHandle<Context>>,
}

impl UsbHandle for RusbHandle {
    type Transfer = LibusbTransfer;

    fn kernel_driver_active(&self, interface: u8) -> BackendResult<bool> {
        Ok(self.handle.kernel_driver_active(interface)?)
    }

    fn detach_kernel_driver(&self, interface: u8) -> BackendResult<()> {
        Ok(self.handle.detach_kernel_driver(interface)?)
    }

    fn claim_interface(&self, interface: u8) -> BackendResult<()> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&self, interface: u8) -> BackendResult<()> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> BackendResult<usize> {
        debug!(
            "Control OUT: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            request_type,
            request,
            value,
            index,
            data.len()
        );
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> BackendResult<usize> {
        debug!(
            "Control IN: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, buf_len={}",
            request_type,
            request,
            value,
            index,
            buf.len()
        );
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> BackendResult<usize> {
        debug!(
            "Interrupt OUT: endpoint={:#x}, data_len={}",
            endpoint,
            data.len()
        );
        Ok(self.handle.write_interrupt(endpoint, data, timeout)?)
    }

    fn read_string_descriptor_ascii(&self, index: u8) -> BackendResult<String> {
        Ok(self.handle.read_string_descriptor_ascii(index)?)
    }

    fn alloc_interrupt_transfer(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        callback: CompletionCallback,
    ) -> BackendResult<LibusbTransfer> {
        LibusbTransfer::interrupt(self.handle.clone(), endpoint, length, timeout, callback)
    }
}

fn map_endpoint(ep: rusb::EndpointDescriptor<'_>) -> EndpointDescriptor {
    EndpointDescriptor {
        address: ep.address(),
        direction: match ep.direction() {
            rusb::Direction::In => Direction::In,
            rusb::Direction::Out => Direction::Out,
        },
        transfer_kind: match ep.transfer_type() {
            rusb::TransferType::Control => TransferKind::Control,
            rusb::TransferType::Isochronous => TransferKind::Isochronous,
            rusb::TransferType::Bulk => TransferKind::Bulk,
            rusb::TransferType::Interrupt => TransferKind::Interrupt,
        },
        max_packet_size: ep.max_packet_size(),
    }
}

impl From<rusb::Error> for BackendError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => BackendError::Io,
            rusb::Error::InvalidParam => BackendError::InvalidParam,
            rusb::Error::Access => BackendError::Access,
            rusb::Error::NoDevice => BackendError::NoDevice,
            rusb::Error::NotFound => BackendError::NotFound,
            rusb::Error::Busy => BackendError::Busy,
            rusb::Error::Timeout => BackendError::Timeout,
            rusb::Error::Overflow => BackendError::Overflow,
            rusb::Error::Pipe => BackendError::Pipe,
            rusb::Error::Interrupted => BackendError::Interrupted,
            rusb::Error::NoMem => BackendError::NoMem,
            rusb::Error::NotSupported => BackendError::NotSupported,
            _ => BackendError::Other(err.to_string()),
        }
    }
}
