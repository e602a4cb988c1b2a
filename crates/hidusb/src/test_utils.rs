//! In-memory USB backend for tests
//!
//! [`MockBackend`] behaves like a tiny libusb: devices have descriptors and
//! string tables, handles record every call in a shared log, and interrupt IN
//! transfers complete only when a test injects data through
//! [`MockDevice::push_input`] and some thread runs
//! [`UsbBackend::handle_events`].
//!
//! # Example
//!
//! ```
//! use hidusb::test_utils::{MockCall, create_mock_hid_device};
//! use hidusb::{DeviceSettings, HidDevice, ReadOutcome};
//!
//! let (backend, device) = create_mock_hid_device(0x1234, 0x5678, true);
//! let hid = HidDevice::new(backend.clone(), device.clone(), 0, DeviceSettings::default()).unwrap();
//! hid.open().unwrap();
//!
//! device.push_input(vec![1, 2, 3]);
//! assert_eq!(hid.read_timeout(1000).unwrap(), ReadOutcome::Report(vec![1, 2, 3]));
//!
//! hid.write([0x00, 0xff]).unwrap();
//! assert!(backend.calls().contains(&MockCall::InterruptOut { endpoint: 0x01, data: vec![0xff] }));
//! ```

use crate::backend::{
    AsyncTransfer, BackendResult, Completion, CompletionCallback, UsbBackend, UsbDevice, UsbHandle,
};
use crate::error::BackendError;
use protocol::{
    DeviceDescriptor, Direction, EndpointDescriptor, HID_CLASS, InterfaceDescriptor,
    TransferKind, TransferStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Idle wait of one `handle_events` call that delivered nothing
const IDLE_POLL: Duration = Duration::from_micros(200);

/// A backend call recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open,
    Close,
    DetachKernelDriver {
        interface: u8,
    },
    Claim {
        interface: u8,
    },
    Release {
        interface: u8,
    },
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    ControlIn {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    },
    InterruptOut {
        endpoint: u8,
        data: Vec<u8>,
    },
    Cancel {
        endpoint: u8,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct MockBus {
    devices: Mutex<Vec<Arc<Mutex<DeviceState>>>>,
    calls: Mutex<Vec<MockCall>>,
    transfers: Mutex<Vec<Weak<TransferInner>>>,
    event_errors: Mutex<VecDeque<BackendError>>,
    event_lock: Mutex<()>,
    transfers_allocated: AtomicUsize,
}

impl MockBus {
    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }
}

/// In-memory USB context
#[derive(Clone, Default)]
pub struct MockBackend {
    bus: Arc<MockBus>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device to the mock bus
    pub fn add_device(
        &self,
        descriptor: DeviceDescriptor,
        interfaces: Vec<InterfaceDescriptor>,
    ) -> MockDevice {
        let state = Arc::new(Mutex::new(DeviceState::new(descriptor, interfaces)));
        lock(&self.bus.devices).push(state.clone());
        MockDevice {
            bus: self.bus.clone(),
            state,
        }
    }

    /// Every call recorded so far, oldest first
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.bus.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.bus.calls).clear();
    }

    /// Number of interrupt transfers allocated over the backend's lifetime
    pub fn transfers_allocated(&self) -> usize {
        self.bus.transfers_allocated.load(Ordering::SeqCst)
    }

    /// Number of transfers currently submitted
    pub fn transfers_in_flight(&self) -> usize {
        lock(&self.bus.transfers)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.submitted.load(Ordering::SeqCst))
            .count()
    }

    /// Make the next `handle_events` call fail with `error`
    pub fn push_event_error(&self, error: BackendError) {
        lock(&self.bus.event_errors).push_back(error);
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;
    type Handle = MockHandle;

    fn devices(&self) -> BackendResult<Vec<MockDevice>> {
        Ok(lock(&self.bus.devices)
            .iter()
            .map(|state| MockDevice {
                bus: self.bus.clone(),
                state: state.clone(),
            })
            .collect())
    }

    fn handle_events(&self, timeout: Duration) -> BackendResult<()> {
        let delivered = {
            let _events = lock(&self.bus.event_lock);

            if let Some(error) = lock(&self.bus.event_errors).pop_front() {
                return Err(error);
            }

            let transfers: Vec<Arc<TransferInner>> = {
                let mut list = lock(&self.bus.transfers);
                list.retain(|t| t.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };

            // Deliver at most one completion per transfer, with no bus lock
            // other than the event lock held during callbacks
            let mut delivered = false;
            for transfer in transfers {
                delivered |= transfer.deliver();
            }
            delivered
        };

        if !delivered {
            std::thread::sleep(if timeout.is_zero() {
                IDLE_POLL
            } else {
                timeout.min(IDLE_POLL * 10)
            });
        }
        Ok(())
    }
}

struct DeviceState {
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceDescriptor>,
    strings: HashMap<u8, String>,
    inbox: VecDeque<(TransferStatus, Vec<u8>)>,
    descriptor_error: Option<BackendError>,
    open_error: Option<BackendError>,
    claim_error: Option<BackendError>,
    release_error: Option<BackendError>,
    detach_error: Option<BackendError>,
    submit_error: Option<BackendError>,
    kernel_driver: BackendResult<bool>,
    feature_report: Vec<u8>,
}

impl DeviceState {
    fn new(descriptor: DeviceDescriptor, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            descriptor,
            interfaces,
            strings: HashMap::new(),
            inbox: VecDeque::new(),
            descriptor_error: None,
            open_error: None,
            claim_error: None,
            release_error: None,
            detach_error: None,
            submit_error: None,
            kernel_driver: Ok(false),
            feature_report: Vec::new(),
        }
    }
}

/// A device on the mock bus
#[derive(Clone)]
pub struct MockDevice {
    bus: Arc<MockBus>,
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    /// Complete the device's interrupt IN transfer with `data`
    pub fn push_input(&self, data: impl Into<Vec<u8>>) {
        self.state()
            .inbox
            .push_back((TransferStatus::Completed, data.into()));
    }

    /// Complete the device's interrupt IN transfer with `status` and no data
    pub fn inject_status(&self, status: TransferStatus) {
        self.state().inbox.push_back((status, Vec::new()));
    }

    pub fn set_string(&self, index: u8, value: impl Into<String>) {
        self.state().strings.insert(index, value.into());
    }

    pub fn fail_descriptor(&self, error: BackendError) {
        self.state().descriptor_error = Some(error);
    }

    pub fn fail_open(&self, error: BackendError) {
        self.state().open_error = Some(error);
    }

    pub fn fail_claim(&self, error: BackendError) {
        self.state().claim_error = Some(error);
    }

    pub fn fail_release(&self, error: BackendError) {
        self.state().release_error = Some(error);
    }

    pub fn fail_detach(&self, error: BackendError) {
        self.state().detach_error = Some(error);
    }

    /// Fail every submission (including resubmission) with `error`;
    /// `None` restores normal behaviour
    pub fn fail_submit(&self, error: Option<BackendError>) {
        self.state().submit_error = error;
    }

    /// What `kernel_driver_active` reports
    pub fn set_kernel_driver(&self, result: BackendResult<bool>) {
        self.state().kernel_driver = result;
    }

    /// Bytes returned by GET_REPORT control transfers
    pub fn set_feature_report(&self, data: impl Into<Vec<u8>>) {
        self.state().feature_report = data.into();
    }
}

impl UsbDevice for MockDevice {
    type Handle = MockHandle;

    fn descriptor(&self) -> BackendResult<DeviceDescriptor> {
        let state = self.state();
        match &state.descriptor_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.descriptor),
        }
    }

    fn interfaces(&self) -> BackendResult<Vec<InterfaceDescriptor>> {
        Ok(self.state().interfaces.clone())
    }

    fn open(&self) -> BackendResult<MockHandle> {
        if let Some(error) = self.state().open_error.clone() {
            return Err(error);
        }
        self.bus.record(MockCall::Open);
        Ok(MockHandle {
            device: self.clone(),
        })
    }
}

/// An open mock device; records [`MockCall::Close`] when dropped
pub struct MockHandle {
    device: MockDevice,
}

impl MockHandle {
    fn record(&self, call: MockCall) {
        self.device.bus.record(call);
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.record(MockCall::Close);
    }
}

impl UsbHandle for MockHandle {
    type Transfer = MockTransfer;

    fn kernel_driver_active(&self, _interface: u8) -> BackendResult<bool> {
        self.device.state().kernel_driver.clone()
    }

    fn detach_kernel_driver(&self, interface: u8) -> BackendResult<()> {
        if let Some(error) = self.device.state().detach_error.clone() {
            return Err(error);
        }
        self.record(MockCall::DetachKernelDriver { interface });
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> BackendResult<()> {
        if let Some(error) = self.device.state().claim_error.clone() {
            return Err(error);
        }
        self.record(MockCall::Claim { interface });
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> BackendResult<()> {
        if let Some(error) = self.device.state().release_error.clone() {
            return Err(error);
        }
        self.record(MockCall::Release { interface });
        Ok(())
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> BackendResult<usize> {
        self.record(MockCall::ControlOut {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> BackendResult<usize> {
        self.record(MockCall::ControlIn {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
        });

        let state = self.device.state();
        let len = state.feature_report.len().min(buf.len());
        buf[..len].copy_from_slice(&state.feature_report[..len]);
        Ok(len)
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> BackendResult<usize> {
        self.record(MockCall::InterruptOut {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn read_string_descriptor_ascii(&self, index: u8) -> BackendResult<String> {
        self.device
            .state()
            .strings
            .get(&index)
            .cloned()
            .ok_or(BackendError::Pipe)
    }

    fn alloc_interrupt_transfer(
        &self,
        endpoint: u8,
        length: usize,
        _timeout: Duration,
        callback: CompletionCallback,
    ) -> BackendResult<MockTransfer> {
        let inner = Arc::new(TransferInner {
            device: self.device.clone(),
            endpoint,
            length,
            callback: Mutex::new(callback),
            submitted: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        });

        let bus = &self.device.bus;
        lock(&bus.transfers).push(Arc::downgrade(&inner));
        bus.transfers_allocated.fetch_add(1, Ordering::SeqCst);

        Ok(MockTransfer { inner })
    }
}

struct TransferInner {
    device: MockDevice,
    endpoint: u8,
    length: usize,
    callback: Mutex<CompletionCallback>,
    submitted: AtomicBool,
    cancel_requested: AtomicBool,
}

impl TransferInner {
    fn submit(&self) -> BackendResult<()> {
        if let Some(error) = self.device.state().submit_error.clone() {
            return Err(error);
        }
        self.submitted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn deliver(&self) -> bool {
        if !self.submitted.load(Ordering::SeqCst) {
            return false;
        }

        let event = if self.cancel_requested.swap(false, Ordering::SeqCst) {
            Some((TransferStatus::Cancelled, Vec::new()))
        } else {
            self.device.state().inbox.pop_front()
        };
        let Some((status, mut data)) = event else {
            return false;
        };
        data.truncate(self.length);

        self.submitted.store(false, Ordering::SeqCst);
        let mut resubmit = || self.submit();
        let mut guard = lock(&self.callback);
        let callback: &mut CompletionCallback = &mut guard;
        callback(Completion::new(status, &data, &mut resubmit));
        true
    }
}

/// Interrupt IN transfer on the mock bus
pub struct MockTransfer {
    inner: Arc<TransferInner>,
}

impl AsyncTransfer for MockTransfer {
    fn submit(&self) -> BackendResult<()> {
        self.inner.submit()
    }

    fn cancel(&self) -> BackendResult<()> {
        if !self.inner.submitted.load(Ordering::SeqCst) {
            return Err(BackendError::NotFound);
        }
        self.inner.device.bus.record(MockCall::Cancel {
            endpoint: self.inner.endpoint,
        });
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Device descriptor with string indexes 1, 2 and 3
pub fn mock_descriptor(bus_number: u8, address: u8, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        bus_number,
        address,
        vendor_id,
        product_id,
        class_code: 0,
        manufacturer_string_index: Some(1),
        product_string_index: Some(2),
        serial_number_string_index: Some(3),
    }
}

/// HID interface with an interrupt IN endpoint (`0x81 + number`, 64 bytes)
/// and optionally an interrupt OUT endpoint (`0x01 + number`)
pub fn hid_interface(number: u8, with_output: bool) -> InterfaceDescriptor {
    let mut endpoints = vec![EndpointDescriptor {
        address: 0x81 + number,
        direction: Direction::In,
        transfer_kind: TransferKind::Interrupt,
        max_packet_size: 64,
    }];
    if with_output {
        endpoints.push(EndpointDescriptor {
            address: 0x01 + number,
            direction: Direction::Out,
            transfer_kind: TransferKind::Interrupt,
            max_packet_size: 64,
        });
    }

    InterfaceDescriptor {
        number,
        alternate_setting: 0,
        class_code: HID_CLASS,
        sub_class_code: 0,
        protocol_code: 0,
        endpoints,
    }
}

/// A fresh backend holding one single-interface HID device at bus 1,
/// address 2, with manufacturer, product and serial strings set
pub fn create_mock_hid_device(vendor_id: u16, product_id: u16, with_output: bool) -> (MockBackend, MockDevice) {
    let backend = MockBackend::new();
    let device = backend.add_device(
        mock_descriptor(1, 2, vendor_id, product_id),
        vec![hid_interface(0, with_output)],
    );
    device.set_string(1, "Mock Manufacturer");
    device.set_string(2, "Mock HID Device");
    device.set_string(3, "MOCK0001");
    (backend, device)
}
