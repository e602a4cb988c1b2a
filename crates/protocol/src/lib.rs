//! HID protocol primitives for hid-usb
//!
//! This crate holds the parts of the HID-over-USB protocol that do not need a
//! USB stack: stable device paths, the report-ID framing rule for outgoing
//! reports, the HID class request codes and backend-neutral descriptor types.
//!
//! # Example
//!
//! ```
//! use protocol::{frame_report, make_path, validate_path, ReportType};
//!
//! let path = make_path(1, 0x1a, 0);
//! assert_eq!(path, "0001:001a:00");
//! assert_eq!(validate_path("1:1A:0").unwrap(), path);
//!
//! let framed = frame_report(&[0x00, 0x01, 0x02]).unwrap();
//! assert_eq!(framed.payload, &[0x01, 0x02]);
//! assert_eq!(ReportType::Output.w_value(framed.report_number), 0x0200);
//! ```

pub mod error;
pub mod path;
pub mod report;
pub mod types;

pub use error::{ProtocolError, Result};
pub use path::{DevicePath, make_path, validate_path};
pub use report::{
    FramedReport, GET_REPORT, HID_CLASS, REQUEST_TYPE_CLASS_INTERFACE_IN,
    REQUEST_TYPE_CLASS_INTERFACE_OUT, ReportType, SET_REPORT, flatten_parts, frame_report,
};
pub use types::{
    DeviceDescriptor, DeviceInfo, Direction, EndpointDescriptor, HidEndpoints,
    InterfaceDescriptor, TransferKind, TransferStatus,
};
