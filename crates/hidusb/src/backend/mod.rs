//! USB backend abstraction
//!
//! The HID layer never talks to libusb directly. It needs a small set of
//! primitives from a USB stack:
//! - enumerate devices and read their descriptors
//! - open a device, detach kernel drivers, claim and release interfaces
//! - synchronous control and interrupt OUT transfers
//! - one asynchronous interrupt IN transfer that can be submitted, resubmitted
//!   from its own completion callback and cancelled from another thread
//! - run one iteration of event processing, which is where completion
//!   callbacks are invoked
//!
//! [`libusb::RusbBackend`] implements these on top of `rusb`.

pub mod libusb;
mod transfer;

use crate::error::BackendError;
use protocol::{DeviceDescriptor, InterfaceDescriptor, TransferStatus};
use std::time::Duration;

pub use libusb::{RusbBackend, RusbDevice, RusbHandle};
pub use transfer::LibusbTransfer;

/// Result type used by backend primitives
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Callback run by the backend whenever the asynchronous transfer finishes
pub type CompletionCallback = Box<dyn FnMut(Completion<'_>) + Send>;

/// A finished asynchronous transfer, handed to its [`CompletionCallback`]
pub struct Completion<'a> {
    pub status: TransferStatus,
    /// Bytes received (only meaningful for [`TransferStatus::Completed`])
    pub data: &'a [u8],
    resubmit: &'a mut dyn FnMut() -> BackendResult<()>,
}

impl<'a> Completion<'a> {
    pub fn new(
        status: TransferStatus,
        data: &'a [u8],
        resubmit: &'a mut dyn FnMut() -> BackendResult<()>,
    ) -> Self {
        Self {
            status,
            data,
            resubmit,
        }
    }

    /// Submit the same transfer again
    pub fn resubmit(&mut self) -> BackendResult<()> {
        (self.resubmit)()
    }
}

/// USB context: device enumeration and event processing
pub trait UsbBackend: Clone + Send + Sync + 'static {
    type Device: UsbDevice<Handle = Self::Handle>;
    type Handle: UsbHandle;

    /// All devices currently attached
    fn devices(&self) -> BackendResult<Vec<Self::Device>>;

    /// Process pending transfer events, waiting at most `timeout`.
    ///
    /// A zero timeout polls without blocking.
    fn handle_events(&self, timeout: Duration) -> BackendResult<()>;
}

/// A physical device, not necessarily open
pub trait UsbDevice: Clone + Send + Sync + 'static {
    type Handle: UsbHandle;

    fn descriptor(&self) -> BackendResult<DeviceDescriptor>;

    /// Interface descriptors (every alternate setting) of the active
    /// configuration
    fn interfaces(&self) -> BackendResult<Vec<InterfaceDescriptor>>;

    fn open(&self) -> BackendResult<Self::Handle>;
}

/// An open device. Dropping the handle closes it.
pub trait UsbHandle: Send + Sync + 'static {
    type Transfer: AsyncTransfer;

    fn kernel_driver_active(&self, interface: u8) -> BackendResult<bool>;
    fn detach_kernel_driver(&self, interface: u8) -> BackendResult<()>;
    fn claim_interface(&self, interface: u8) -> BackendResult<()>;
    fn release_interface(&self, interface: u8) -> BackendResult<()>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> BackendResult<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> BackendResult<usize>;

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> BackendResult<usize>;

    fn read_string_descriptor_ascii(&self, index: u8) -> BackendResult<String>;

    /// Allocate (but do not submit) an interrupt IN transfer reading up to
    /// `length` bytes from `endpoint`.
    fn alloc_interrupt_transfer(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        callback: CompletionCallback,
    ) -> BackendResult<Self::Transfer>;
}

/// An allocated asynchronous transfer
///
/// The owner must not drop it while it is submitted; cancel it and keep
/// processing events until the completion callback has seen the
/// cancellation.
pub trait AsyncTransfer: Send + Sync + 'static {
    fn submit(&self) -> BackendResult<()>;

    /// Request cancellation. Completion is reported later through the
    /// callback with [`TransferStatus::Cancelled`].
    fn cancel(&self) -> BackendResult<()>;
}

/// Transfer type of a backend handle
pub type TransferOf<B> = <<B as UsbBackend>::Handle as UsbHandle>::Transfer;
