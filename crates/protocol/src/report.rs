//! HID report framing and class request codes
//!
//! HID devices that multiplex several report formats prefix every report with
//! a report ID. Devices that don't use report IDs still expect callers to pass
//! a leading `0x00`, which must be stripped before the report goes on the
//! wire. [`frame_report`] applies that rule and tells the caller which report
//! number to put in the `wValue` of a control transfer.

use serde::{Deserialize, Serialize};

/// USB interface class code for HID
pub const HID_CLASS: u8 = 0x03;

/// HID class request: GET_REPORT
pub const GET_REPORT: u8 = 0x01;

/// HID class request: SET_REPORT
pub const SET_REPORT: u8 = 0x09;

const ENDPOINT_IN: u8 = 0x80;
const REQUEST_TYPE_CLASS: u8 = 0x01 << 5;
const RECIPIENT_INTERFACE: u8 = 0x01;

/// bmRequestType for host-to-device class requests addressed to an interface
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = REQUEST_TYPE_CLASS | RECIPIENT_INTERFACE;

/// bmRequestType for device-to-host class requests addressed to an interface
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 =
    ENDPOINT_IN | REQUEST_TYPE_CLASS | RECIPIENT_INTERFACE;

/// HID report type, carried in the high byte of `wValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReportType {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportType {
    /// `wValue` for GET_REPORT / SET_REPORT
    pub fn w_value(self, report_number: u8) -> u16 {
        ((self as u16) << 8) | report_number as u16
    }
}

/// An outgoing report after the report-ID convention was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedReport<'a> {
    /// Bytes to put on the wire
    pub payload: &'a [u8],
    /// Report number for the control transfer `wValue`
    pub report_number: u8,
    /// A leading `0x00` was removed from the caller's data
    pub skipped_report_id: bool,
}

impl FramedReport<'_> {
    /// Byte count reported back to the caller for `sent` bytes on the wire.
    ///
    /// The stripped report-ID byte counts as written.
    pub fn reported_len(&self, sent: usize) -> usize {
        sent + usize::from(self.skipped_report_id)
    }
}

/// Apply the HID report-ID convention to an outgoing report.
///
/// Returns `None` for empty input.
pub fn frame_report(data: &[u8]) -> Option<FramedReport<'_>> {
    let (&first, rest) = data.split_first()?;

    Some(if first == 0x00 {
        FramedReport {
            payload: rest,
            report_number: 0,
            skipped_report_id: true,
        }
    } else {
        FramedReport {
            payload: data,
            report_number: first,
            skipped_report_id: false,
        }
    })
}

/// Flatten several byte slices into one report buffer.
pub fn flatten_parts<I, T>(parts: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part.as_ref());
    }
    out
}
