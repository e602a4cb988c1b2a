//! HID device connection
//!
//! [`HidDevice`] represents one HID interface of one USB device. Opening it
//! claims the interface and starts a background read loop (see
//! [`read_loop`](crate::read_loop)) that buffers input reports; `read*`
//! methods hand those reports to callers on any thread. Output and feature
//! reports go out synchronously on the calling thread.
//!
//! Open/close calls nest: a device opened twice needs two closes before the
//! interface is released.

use crate::backend::{
    AsyncTransfer, BackendResult, RusbBackend, TransferOf, UsbBackend, UsbDevice, UsbHandle,
};
use crate::error::{BackendError, HidError, Result};
use crate::hooks::{DeviceHooks, ReadHooks};
use crate::queue::QueueStats;
use crate::read_loop::{ReadLoop, Shared};
use common::DeviceSettings;
use protocol::{
    DeviceDescriptor, DeviceInfo, DevicePath, GET_REPORT, HidEndpoints,
    REQUEST_TYPE_CLASS_INTERFACE_IN, REQUEST_TYPE_CLASS_INTERFACE_OUT, ReportType, SET_REPORT,
    flatten_parts, frame_report,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Result of [`HidDevice::read_timeout`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The oldest buffered input report
    Report(Vec<u8>),
    /// Nothing arrived in time
    Empty,
    /// The read loop is not running and nothing is buffered
    LoopStopped,
}

impl ReadOutcome {
    pub fn into_report(self) -> Option<Vec<u8>> {
        match self {
            ReadOutcome::Report(data) => Some(data),
            _ => None,
        }
    }
}

struct Lifecycle<H> {
    handle: Option<Arc<H>>,
    endpoints: Option<HidEndpoints>,
    open_count: i64,
    thread: Option<JoinHandle<BackendResult<()>>>,
}

/// One HID interface of a USB device
pub struct HidDevice<B: UsbBackend = RusbBackend> {
    backend: B,
    device: B::Device,
    descriptor: DeviceDescriptor,
    interface: u8,
    path: DevicePath,
    settings: DeviceSettings,
    blocking: AtomicBool,
    lifecycle: Mutex<Lifecycle<B::Handle>>,
    shared: Arc<Shared<TransferOf<B>>>,
    read_hooks: ReadHooks,
    manufacturer: OnceLock<String>,
    product: OnceLock<String>,
    serial_number: OnceLock<String>,
}

impl<B: UsbBackend> HidDevice<B> {
    pub fn new(backend: B, device: B::Device, interface: u8, settings: DeviceSettings) -> Result<Self> {
        Self::with_hooks(backend, device, interface, settings, DeviceHooks::default())
    }

    /// Create a device and run its init hooks
    pub fn with_hooks(
        backend: B,
        device: B::Device,
        interface: u8,
        settings: DeviceSettings,
        hooks: DeviceHooks<B>,
    ) -> Result<Self> {
        let descriptor = device
            .descriptor()
            .map_err(|e| HidError::InvalidDevice(e.to_string()))?;
        let (init_hooks, read_hooks) = hooks.into_parts();

        let hid = Self {
            backend,
            device,
            path: descriptor.path(interface),
            descriptor,
            interface,
            blocking: AtomicBool::new(settings.blocking),
            shared: Arc::new(Shared::new(settings.report_buffer_size)),
            settings,
            lifecycle: Mutex::new(Lifecycle {
                handle: None,
                endpoints: None,
                open_count: 0,
                thread: None,
            }),
            read_hooks,
            manufacturer: OnceLock::new(),
            product: OnceLock::new(),
            serial_number: OnceLock::new(),
        };

        for hook in &init_hooks {
            hook(&hid);
        }

        Ok(hid)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle<B::Handle>> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the device, or add a reference if it is already open
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();

        if lifecycle.handle.is_some() {
            lifecycle.open_count += 1;
            if lifecycle.open_count < 1 {
                debug!(
                    "open_count for open device {} is {}",
                    self.path, lifecycle.open_count
                );
                lifecycle.open_count = 1;
            }
            return Ok(());
        }

        lifecycle.open_count = 0;
        if let Err(e) = self.start_session(&mut lifecycle) {
            debug!("Failed to open device {}: {}", self.path, e);
            return Err(HidError::DeviceOpenFailed(e.to_string()));
        }

        debug!("Opened device {}", self.path);
        lifecycle.open_count = 1;
        Ok(())
    }

    fn start_session(&self, lifecycle: &mut Lifecycle<B::Handle>) -> Result<()> {
        let handle = Arc::new(self.device.open()?);

        if self.settings.detach_kernel_driver {
            self.detach_kernel_driver(&handle)?;
        }
        handle.claim_interface(self.interface)?;

        let endpoints = match self
            .device
            .interfaces()
            .map_err(HidError::from)
            .and_then(|interfaces| {
                HidEndpoints::discover(&interfaces, self.interface)
                    .ok_or(HidError::MissingInputEndpoint(self.interface))
            }) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.release(&handle);
                return Err(e);
            }
        };

        {
            let mut state = self.shared.lock();
            state.reports.clear();
            state.shutdown = false;
            state.initialized = false;
            state.transfer_cancelled = true;
            state.transfer = None;
        }

        let read_loop = ReadLoop {
            backend: self.backend.clone(),
            handle: handle.clone(),
            path: self.path,
            endpoint: endpoints.input,
            length: usize::from(endpoints.input_max_packet_size),
            transfer_timeout: self.settings.read_transfer_timeout(),
            poll_timeout: self.settings.event_poll_timeout(),
            shared: self.shared.clone(),
            hooks: self.read_hooks.clone(),
        };

        let thread = match read_loop.spawn() {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.lock().shutdown = true;
                self.release(&handle);
                return Err(e.into());
            }
        };

        let mut state = self.shared.lock();
        while !state.initialized && !state.shutdown {
            state = self.shared.wait(state);
        }
        let started = !state.shutdown;
        drop(state);

        if !started {
            let cause = match thread.join() {
                Ok(Err(e)) => HidError::Usb(e),
                Ok(Ok(())) => HidError::ReadLoop("read loop stopped while starting".to_string()),
                Err(_) => HidError::ReadLoop("read loop panicked".to_string()),
            };
            self.release(&handle);
            return Err(cause);
        }

        lifecycle.handle = Some(handle);
        lifecycle.endpoints = Some(endpoints);
        lifecycle.thread = Some(thread);
        Ok(())
    }

    fn detach_kernel_driver(&self, handle: &B::Handle) -> Result<()> {
        match handle.kernel_driver_active(self.interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from {}", self.path);
                match handle.detach_kernel_driver(self.interface) {
                    Ok(()) => {}
                    Err(BackendError::NotSupported) => {
                        debug!(
                            "Kernel driver detach not supported on {}, continuing to open device",
                            self.path
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(false) => {}
            Err(BackendError::NotSupported) => {
                debug!(
                    "Cannot determine kernel driver status of {}, continuing to open device",
                    self.path
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn release(&self, handle: &B::Handle) {
        if let Err(e) = handle.release_interface(self.interface) {
            warn!("Failed to release interface on device {}: {}", self.path, e);
        }
    }

    /// Drop a reference; the last one stops the read loop and releases the
    /// interface. Never fails.
    pub fn close(&self) {
        let mut lifecycle = self.lock_lifecycle();

        lifecycle.open_count -= 1;
        if lifecycle.open_count > 0 {
            return;
        }
        if lifecycle.open_count < 0 {
            debug!(
                "open_count for device {} is {}",
                self.path, lifecycle.open_count
            );
        }

        self.stop_session(&mut lifecycle);
        lifecycle.open_count = 0;
    }

    fn stop_session(&self, lifecycle: &mut Lifecycle<B::Handle>) {
        let transfer = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.transfer.clone()
        };
        self.shared.notify();

        if let Some(transfer) = transfer {
            if let Err(e) = transfer.cancel() {
                debug!("Failed to cancel read transfer on {}: {}", self.path, e);
            }
        }

        if let Some(thread) = lifecycle.thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Read loop on device {} ended with: {}", self.path, e),
                Err(_) => error!("Read loop on device {} panicked", self.path),
            }
        }

        if let Some(handle) = lifecycle.handle.take() {
            self.release(&handle);
            debug!("Closed device {}", self.path);
        }
        lifecycle.endpoints = None;

        self.shared.lock().reports.clear();
    }

    /// Whether a backend handle is held
    pub fn is_open(&self) -> bool {
        self.lock_lifecycle().handle.is_some()
    }

    pub fn open_count(&self) -> i64 {
        self.lock_lifecycle().open_count
    }

    /// Whether the read loop is currently running
    pub fn is_reading(&self) -> bool {
        let state = self.shared.lock();
        state.initialized && !state.shutdown
    }

    fn session(&self) -> Result<(Arc<B::Handle>, HidEndpoints)> {
        let lifecycle = self.lock_lifecycle();
        match (&lifecycle.handle, lifecycle.endpoints) {
            (Some(handle), Some(endpoints)) => Ok((handle.clone(), endpoints)),
            _ => Err(HidError::DeviceNotOpen),
        }
    }

    /// Read the next input report.
    ///
    /// `milliseconds < 0` waits until a report arrives or the read loop
    /// stops, `0` returns immediately and a positive value waits at most
    /// that long.
    pub fn read_timeout(&self, milliseconds: i32) -> Result<ReadOutcome> {
        if !self.is_open() {
            return Err(HidError::DeviceNotOpen);
        }

        let mut state = self.shared.lock();
        if let Some(data) = state.reports.pop() {
            return Ok(ReadOutcome::Report(data));
        }
        if state.shutdown {
            debug!("Read loop for device {} is not running", self.path);
            return Ok(ReadOutcome::LoopStopped);
        }

        if milliseconds == 0 {
            return Ok(ReadOutcome::Empty);
        }

        if milliseconds < 0 {
            loop {
                state = self.shared.wait(state);
                if let Some(data) = state.reports.pop() {
                    return Ok(ReadOutcome::Report(data));
                }
                if state.shutdown {
                    debug!("Read loop ended while waiting on device {}", self.path);
                    return Ok(ReadOutcome::LoopStopped);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_millis(milliseconds.unsigned_abs().into());
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::Empty);
            }
            state = self.shared.wait_timeout(state, deadline - now);
            if let Some(data) = state.reports.pop() {
                return Ok(ReadOutcome::Report(data));
            }
        }
    }

    /// Read honouring the blocking mode
    pub fn read(&self) -> Result<ReadOutcome> {
        self.read_timeout(if self.is_blocking() { -1 } else { 0 })
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// Send an output report.
    ///
    /// A leading `0x00` means "no report ID" and is not sent. Devices without
    /// an interrupt OUT endpoint receive the report through SET_REPORT.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        let framed = frame_report(data.as_ref()).ok_or(HidError::EmptyData)?;
        let (handle, endpoints) = self.session()?;

        match endpoints.output {
            None => {
                let sent = handle.write_control(
                    REQUEST_TYPE_CLASS_INTERFACE_OUT,
                    SET_REPORT,
                    ReportType::Output.w_value(framed.report_number),
                    u16::from(self.interface),
                    framed.payload,
                    self.settings.control_timeout(),
                )?;
                Ok(framed.reported_len(sent))
            }
            Some(endpoint) => Ok(handle.write_interrupt(
                endpoint,
                framed.payload,
                self.settings.write_timeout(),
            )?),
        }
    }

    /// Concatenate `parts` and write them as one report
    pub fn write_parts<I, T>(&self, parts: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.write(flatten_parts(parts))
    }

    pub fn send_feature_report(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        let framed = frame_report(data.as_ref()).ok_or(HidError::EmptyData)?;
        let (handle, _) = self.session()?;

        let sent = handle.write_control(
            REQUEST_TYPE_CLASS_INTERFACE_OUT,
            SET_REPORT,
            ReportType::Feature.w_value(framed.report_number),
            u16::from(self.interface),
            framed.payload,
            self.settings.control_timeout(),
        )?;
        Ok(framed.reported_len(sent))
    }

    /// Fetch a feature report; `buffer_size` defaults to the input
    /// endpoint's max packet size
    pub fn get_feature_report(&self, report_number: u8, buffer_size: Option<usize>) -> Result<Vec<u8>> {
        let (handle, endpoints) = self.session()?;
        let size = buffer_size.unwrap_or(usize::from(endpoints.input_max_packet_size));

        let mut buf = vec![0u8; size];
        let received = handle.read_control(
            REQUEST_TYPE_CLASS_INTERFACE_IN,
            GET_REPORT,
            ReportType::Feature.w_value(report_number),
            u16::from(self.interface),
            &mut buf,
            self.settings.control_timeout(),
        )?;
        buf.truncate(received);
        Ok(buf)
    }

    /// Register another read hook on this device only
    pub fn add_read_hook<F>(&self, hook: F)
    where
        F: Fn(&DevicePath, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.read_hooks.add(Arc::new(hook));
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.lock().reports.stats()
    }

    pub fn manufacturer(&self) -> &str {
        self.manufacturer.get_or_init(|| {
            self.read_string(self.descriptor.manufacturer_string_index)
                .unwrap_or_else(|| format!("VENDOR(0x{:04x})", self.descriptor.vendor_id))
        })
    }

    pub fn product(&self) -> &str {
        self.product.get_or_init(|| {
            self.read_string(self.descriptor.product_string_index)
                .unwrap_or_else(|| format!("PRODUCT(0x{:04x})", self.descriptor.product_id))
        })
    }

    pub fn serial_number(&self) -> &str {
        self.serial_number.get_or_init(|| {
            self.read_string(self.descriptor.serial_number_string_index)
                .unwrap_or_else(|| "?".to_string())
        })
    }

    fn read_string(&self, index: Option<u8>) -> Option<String> {
        let index = index.filter(|&i| i != 0)?;

        let open_handle = self.lock_lifecycle().handle.clone();
        let result = match open_handle {
            Some(handle) => handle.read_string_descriptor_ascii(index),
            // Strings need no claimed interface, so a temporary handle will do
            None => self
                .device
                .open()
                .and_then(|handle| handle.read_string_descriptor_ascii(index)),
        };

        match result {
            Ok(value) => {
                debug!("Read string {} for device {}: {:?}", index, self.path, value);
                Some(value.trim().to_string())
            }
            Err(e) => {
                debug!("Failed to read string {} for device {}: {}", index, self.path, e);
                None
            }
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn path(&self) -> DevicePath {
        self.path
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn usb_device(&self) -> &B::Device {
        &self.device
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            path: self.path,
            vendor_id: self.vendor_id(),
            product_id: self.product_id(),
            interface: self.interface,
            manufacturer: self.manufacturer().to_string(),
            product: self.product().to_string(),
            serial_number: self.serial_number().to_string(),
        }
    }
}

impl<B: UsbBackend> fmt::Display for HidDevice<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.manufacturer(),
            self.product(),
            self.serial_number()
        )
    }
}

impl<B: UsbBackend> fmt::Debug for HidDevice<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HidDevice({} {:04x}:{:04x} {} {} {} ({}))",
            self.path,
            self.vendor_id(),
            self.product_id(),
            self.manufacturer(),
            self.product(),
            self.serial_number(),
            if self.is_open() { "OPEN" } else { "CLOSED" }
        )
    }
}

impl<B: UsbBackend> Drop for HidDevice<B> {
    fn drop(&mut self) {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.handle.is_some() {
            debug!("Closing device {} on drop", self.path);
            self.stop_session(&mut lifecycle);
        }
        lifecycle.open_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBackend, MockCall, create_mock_hid_device};

    fn open_device() -> (MockBackend, HidDevice<MockBackend>) {
        let (backend, device) = create_mock_hid_device(0x046d, 0xc52b, false);
        let hid = HidDevice::new(backend.clone(), device, 0, DeviceSettings::default()).unwrap();
        hid.open().unwrap();
        (backend, hid)
    }

    #[test]
    fn test_read_outcome_into_report() {
        assert_eq!(ReadOutcome::Report(vec![1]).into_report(), Some(vec![1]));
        assert_eq!(ReadOutcome::Empty.into_report(), None);
        assert_eq!(ReadOutcome::LoopStopped.into_report(), None);
    }

    #[test]
    fn test_closed_device_rejects_io() {
        let (backend, device) = create_mock_hid_device(0x046d, 0xc52b, false);
        let hid = HidDevice::new(backend, device, 0, DeviceSettings::default()).unwrap();

        assert!(!hid.is_open());
        assert!(matches!(hid.read_timeout(0), Err(HidError::DeviceNotOpen)));
        assert!(matches!(hid.write([1u8]), Err(HidError::DeviceNotOpen)));
        assert!(matches!(
            hid.get_feature_report(1, None),
            Err(HidError::DeviceNotOpen)
        ));
    }

    #[test]
    fn test_control_write_uses_set_report() {
        let (backend, hid) = open_device();

        assert_eq!(hid.write([0x00, 0xaa, 0xbb]).unwrap(), 3);
        assert_eq!(hid.write([0x05, 0xaa]).unwrap(), 2);

        let writes: Vec<MockCall> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::ControlOut { .. }))
            .collect();
        assert_eq!(
            writes,
            vec![
                MockCall::ControlOut {
                    request_type: 0x21,
                    request: 0x09,
                    value: 0x0200,
                    index: 0,
                    data: vec![0xaa, 0xbb],
                },
                MockCall::ControlOut {
                    request_type: 0x21,
                    request: 0x09,
                    value: 0x0205,
                    index: 0,
                    data: vec![0x05, 0xaa],
                },
            ]
        );
    }

    #[test]
    fn test_blocking_flag() {
        let (_backend, hid) = open_device();
        assert!(hid.is_blocking());

        hid.set_blocking(false);
        assert!(!hid.is_blocking());
        assert_eq!(hid.read().unwrap(), ReadOutcome::Empty);
    }

    #[test]
    fn test_drop_closes() {
        let (backend, hid) = open_device();
        drop(hid);

        let calls = backend.calls();
        assert!(calls.contains(&MockCall::Release { interface: 0 }));
        assert!(calls.contains(&MockCall::Close));
    }
}
