//! Locating HID devices
//!
//! [`HidApi`] wraps a USB backend and finds HID interfaces by vendor/product
//! ID, serial number or path.

use crate::backend::{RusbBackend, UsbBackend, UsbDevice};
use crate::device::HidDevice;
use crate::error::{HidError, Result};
use crate::hooks::DeviceHooks;
use common::DeviceSettings;
use protocol::{DeviceInfo, DevicePath, HID_CLASS, InterfaceDescriptor};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory of convenience symlinks pointing at `/dev/bus/usb` nodes
const HIDAPI_LINK_DIR: &str = "/dev/hidapi/";

/// Entry point for enumerating and opening HID devices
pub struct HidApi<B: UsbBackend = RusbBackend> {
    backend: B,
    settings: DeviceSettings,
    hooks: DeviceHooks<B>,
}

impl HidApi<RusbBackend> {
    /// Create an API over a fresh libusb context with default settings
    pub fn new() -> Result<Self> {
        Self::with_settings(DeviceSettings::default())
    }

    pub fn with_settings(settings: DeviceSettings) -> Result<Self> {
        Ok(Self::with_backend(RusbBackend::new()?, settings))
    }
}

impl<B: UsbBackend> HidApi<B> {
    pub fn with_backend(backend: B, settings: DeviceSettings) -> Self {
        Self {
            backend,
            settings,
            hooks: DeviceHooks::default(),
        }
    }

    /// Hooks copied into every device this API creates
    pub fn with_hooks(mut self, hooks: DeviceHooks<B>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// USB devices with a HID interface (or HID device class), filtered by
    /// vendor and product ID. `0` matches any ID.
    pub fn enumerate_raw(&self, vendor_id: u16, product_id: u16) -> Result<Vec<B::Device>> {
        let mut matches = Vec::new();

        for device in self.backend.devices()? {
            let descriptor = match device.descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!("Skipping device with unreadable descriptor: {}", e);
                    continue;
                }
            };

            if vendor_id != 0 && descriptor.vendor_id != vendor_id {
                continue;
            }
            if product_id != 0 && descriptor.product_id != product_id {
                continue;
            }

            let is_hid = descriptor.class_code == HID_CLASS
                || device
                    .interfaces()
                    .map(|interfaces| !hid_interfaces(&interfaces).is_empty())
                    .unwrap_or(false);
            if is_hid {
                matches.push(device);
            }
        }

        Ok(matches)
    }

    /// One [`HidDevice`] per HID interface of every matching device
    pub fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<HidDevice<B>>> {
        let mut devices = Vec::new();

        for device in self.enumerate_raw(vendor_id, product_id)? {
            let interfaces = match device.interfaces() {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    debug!("Skipping device with unreadable configuration: {}", e);
                    continue;
                }
            };

            for number in hid_interfaces(&interfaces) {
                devices.push(self.build(device.clone(), number)?);
            }
        }

        debug!("Enumerated {} HID interface(s)", devices.len());
        Ok(devices)
    }

    /// Identity of every matching HID interface
    pub fn device_list(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .enumerate(vendor_id, product_id)?
            .iter()
            .map(HidDevice::info)
            .collect())
    }

    /// First HID interface matching both IDs and, when given, the serial
    /// number. An empty serial matches anything.
    pub fn get_device(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<&str>,
    ) -> Result<Option<HidDevice<B>>> {
        if vendor_id == 0 {
            return Err(HidError::InvalidArgument(
                "vendor_id must be provided".to_string(),
            ));
        }
        if product_id == 0 {
            return Err(HidError::InvalidArgument(
                "product_id must be provided".to_string(),
            ));
        }

        let serial_number = serial_number.filter(|s| !s.is_empty());
        let found = self
            .enumerate(vendor_id, product_id)?
            .into_iter()
            .find(|device| serial_number.is_none_or(|serial| device.serial_number() == serial));

        Ok(found)
    }

    /// [`get_device`](Self::get_device), then open it
    pub fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<&str>,
    ) -> Result<Option<HidDevice<B>>> {
        match self.get_device(vendor_id, product_id, serial_number)? {
            Some(device) => {
                device.open()?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// Find a HID interface by path.
    ///
    /// Accepts `BUS:ADDRESS:INTERFACE` (hexadecimal), an existing
    /// `/dev/bus/usb/BBB/AAA` node, or a `/dev/hidapi/*` symlink to one. For
    /// filesystem paths the interface comes from `interface` (default 0).
    pub fn get_device_by_path(
        &self,
        path: &str,
        interface: Option<u8>,
    ) -> Result<Option<HidDevice<B>>> {
        let wanted = resolve_path(path, interface)?;

        for device in self.enumerate_raw(0, 0)? {
            let (descriptor, interfaces) = match (device.descriptor(), device.interfaces()) {
                (Ok(descriptor), Ok(interfaces)) => (descriptor, interfaces),
                _ => continue,
            };

            for number in hid_interfaces(&interfaces) {
                if descriptor.path(number) == wanted {
                    return self.build(device, number).map(Some);
                }
            }
        }

        debug!("No HID interface at {}", wanted);
        Ok(None)
    }

    /// [`get_device_by_path`](Self::get_device_by_path), then open it
    pub fn open_path(&self, path: &str, interface: Option<u8>) -> Result<Option<HidDevice<B>>> {
        match self.get_device_by_path(path, interface)? {
            Some(device) => {
                device.open()?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    fn build(&self, device: B::Device, interface: u8) -> Result<HidDevice<B>> {
        HidDevice::with_hooks(
            self.backend.clone(),
            device,
            interface,
            self.settings.clone(),
            self.hooks.clone(),
        )
    }
}

/// Distinct HID-class interface numbers, in ascending order
fn hid_interfaces(interfaces: &[InterfaceDescriptor]) -> Vec<u8> {
    let mut numbers: Vec<u8> = interfaces
        .iter()
        .filter(|desc| desc.class_code == HID_CLASS)
        .map(|desc| desc.number)
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
}

fn resolve_path(path: &str, interface: Option<u8>) -> Result<DevicePath> {
    let fs_path = Path::new(path);
    if !fs_path.exists() {
        return Ok(DevicePath::parse(path)?);
    }

    let target = if path.starts_with(HIDAPI_LINK_DIR) {
        let link = fs::read_link(fs_path)?;
        let base = fs_path.parent().unwrap_or(Path::new("/"));
        normalize(&base.join(link))
    } else {
        fs_path.to_path_buf()
    };

    match usb_bus_node(&target) {
        Some((bus, address)) => Ok(DevicePath::new(bus, address, interface.unwrap_or(0))),
        None if path.starts_with(HIDAPI_LINK_DIR) => Err(HidError::InvalidPath(format!(
            "Link target does not appear valid ({})",
            target.display()
        ))),
        None => Err(HidError::InvalidPath(
            "Cannot open file paths other than /dev/hidapi/XXX or /dev/bus/usb/XXX/XXX paths"
                .to_string(),
        )),
    }
}

/// Bus and address of a `/dev/bus/usb/BBB/AAA` node (decimal, as usbfs
/// names them)
pub fn usb_bus_node(path: &Path) -> Option<(u16, u16)> {
    let rest = path.to_str()?.strip_prefix("/dev/bus/usb/")?;
    let (bus, address) = rest.split_once('/')?;

    let parse = |field: &str| -> Option<u16> {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        field.parse().ok()
    };

    Some((parse(bus)?, parse(address)?))
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
