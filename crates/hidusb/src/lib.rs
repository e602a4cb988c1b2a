//! HID devices over libusb
//!
//! `hidusb` talks to USB HID peripherals without the operating system's HID
//! driver: it claims the interface through libusb and implements the HID
//! report protocol itself.
//!
//! - [`HidApi`] enumerates HID interfaces and finds them by ID, serial number
//!   or path.
//! - [`HidDevice`] is one open interface. A background thread keeps an
//!   interrupt IN transfer in flight and buffers input reports (32 by
//!   default, oldest dropped first); `read`/`read_timeout` take them from any
//!   thread. `write`, `send_feature_report` and `get_feature_report` run
//!   synchronously.
//! - The USB stack sits behind the [`backend`] traits. [`RusbBackend`] is the
//!   libusb implementation; [`test_utils::MockBackend`] is an in-memory one.
//!
//! # Example
//!
//! ```no_run
//! use hidusb::{HidApi, ReadOutcome};
//!
//! # fn main() -> hidusb::Result<()> {
//! let api = HidApi::new()?;
//! if let Some(device) = api.open(0x046d, 0xc52b, None)? {
//!     device.write([0x00, 0x10, 0xff])?;
//!     if let ReadOutcome::Report(report) = device.read_timeout(500)? {
//!         println!("{}: {:02x?}", device.path(), report);
//!     }
//!     device.close();
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod backend;
pub mod device;
pub mod error;
pub mod hooks;
pub mod queue;
mod read_loop;
pub mod test_utils;

pub use api::{HidApi, usb_bus_node};
pub use backend::{
    AsyncTransfer, BackendResult, Completion, CompletionCallback, RusbBackend, UsbBackend,
    UsbDevice, UsbHandle,
};
pub use common::DeviceSettings;
pub use device::{HidDevice, ReadOutcome};
pub use error::{BackendError, HidError, Result};
pub use hooks::{DeviceHooks, InitHook, ReadHook};
pub use protocol::{DeviceInfo, DevicePath, make_path, validate_path};
pub use queue::{DEFAULT_REPORT_BUFFER_SIZE, QueueStats, ReportQueue};
