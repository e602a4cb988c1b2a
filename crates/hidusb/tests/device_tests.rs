//! Device lifecycle and I/O tests against the in-memory backend

use hidusb::test_utils::{MockBackend, MockCall, MockDevice, create_mock_hid_device};
use hidusb::{BackendError, DeviceHooks, DeviceSettings, HidDevice, HidError, ReadOutcome};
use protocol::{DevicePath, TransferStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn device(with_output: bool) -> (MockBackend, MockDevice, HidDevice<MockBackend>) {
    let (backend, usb) = create_mock_hid_device(0x16c0, 0x05df, with_output);
    let hid = HidDevice::new(backend.clone(), usb.clone(), 0, DeviceSettings::default()).unwrap();
    (backend, usb, hid)
}

fn count(backend: &MockBackend, wanted: &MockCall) -> usize {
    backend.calls().iter().filter(|c| *c == wanted).count()
}

/// Wait until `cond` holds, failing the test after five seconds
fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_open_and_close() {
    let (backend, _usb, hid) = device(false);

    hid.open().unwrap();
    assert!(hid.is_open());
    assert!(hid.is_reading());
    assert_eq!(hid.open_count(), 1);
    assert_eq!(backend.transfers_in_flight(), 1);

    hid.close();
    assert!(!hid.is_open());
    assert!(!hid.is_reading());
    assert_eq!(hid.open_count(), 0);
    assert_eq!(backend.transfers_in_flight(), 0);

    let calls = backend.calls();
    assert_eq!(calls.first(), Some(&MockCall::Open));
    assert!(calls.contains(&MockCall::Claim { interface: 0 }));
    assert!(calls.contains(&MockCall::Cancel { endpoint: 0x81 }));
    assert!(calls.contains(&MockCall::Release { interface: 0 }));
    assert_eq!(calls.last(), Some(&MockCall::Close));
}

#[test]
fn test_nested_open_shares_read_loop() {
    let (backend, _usb, hid) = device(false);

    hid.open().unwrap();
    hid.open().unwrap();
    assert_eq!(hid.open_count(), 2);
    assert_eq!(backend.transfers_allocated(), 1);
    assert_eq!(count(&backend, &MockCall::Open), 1);

    hid.close();
    assert!(hid.is_open());
    assert_eq!(hid.open_count(), 1);
    assert_eq!(count(&backend, &MockCall::Release { interface: 0 }), 0);

    hid.close();
    assert!(!hid.is_open());
    assert_eq!(count(&backend, &MockCall::Release { interface: 0 }), 1);
}

#[test]
fn test_close_never_opened_is_noop() {
    let (backend, _usb, hid) = device(false);

    hid.close();
    hid.close();
    assert_eq!(hid.open_count(), 0);
    assert!(!hid.is_open());
    assert!(backend.calls().is_empty());

    // Still opens normally afterwards
    hid.open().unwrap();
    assert_eq!(hid.open_count(), 1);
}

#[test]
fn test_reopen_after_close() {
    let (backend, usb, hid) = device(false);

    hid.open().unwrap();
    hid.close();
    hid.open().unwrap();

    usb.push_input(vec![9, 9]);
    assert_eq!(hid.read_timeout(1000).unwrap(), ReadOutcome::Report(vec![9, 9]));
    assert_eq!(backend.transfers_allocated(), 2);
}

#[test]
fn test_kernel_driver_detached_when_active() {
    let (backend, usb, hid) = device(false);
    usb.set_kernel_driver(Ok(true));

    hid.open().unwrap();
    assert!(backend
        .calls()
        .contains(&MockCall::DetachKernelDriver { interface: 0 }));
}

#[test]
fn test_kernel_driver_query_not_supported_is_ignored() {
    let (_backend, usb, hid) = device(false);
    usb.set_kernel_driver(Err(BackendError::NotSupported));

    hid.open().unwrap();
    assert!(hid.is_open());
}

#[test]
fn test_kernel_driver_detach_can_be_disabled() {
    let (backend, usb) = create_mock_hid_device(1, 2, false);
    usb.set_kernel_driver(Ok(true));
    let settings = DeviceSettings {
        detach_kernel_driver: false,
        ..DeviceSettings::default()
    };
    let hid = HidDevice::new(backend.clone(), usb, 0, settings).unwrap();

    hid.open().unwrap();
    assert!(!backend
        .calls()
        .iter()
        .any(|c| matches!(c, MockCall::DetachKernelDriver { .. })));
}

#[test]
fn test_kernel_driver_detach_not_supported_is_ignored() {
    let (backend, usb, hid) = device(false);
    usb.set_kernel_driver(Ok(true));
    usb.fail_detach(BackendError::NotSupported);

    hid.open().unwrap();
    assert!(hid.is_open());
    assert!(backend.calls().contains(&MockCall::Claim { interface: 0 }));
}

#[test]
fn test_kernel_driver_detach_failure_fails_open() {
    let (backend, usb, hid) = device(false);
    usb.set_kernel_driver(Ok(true));
    usb.fail_detach(BackendError::Access);

    assert!(matches!(hid.open(), Err(HidError::DeviceOpenFailed(_))));
    assert!(!hid.is_open());
    assert_eq!(backend.calls(), vec![MockCall::Open, MockCall::Close]);
}

#[test]
fn test_open_failures_are_wrapped() {
    let (backend, usb, hid) = device(false);

    usb.fail_open(BackendError::Access);
    match hid.open() {
        Err(HidError::DeviceOpenFailed(msg)) => assert!(msg.contains("Access denied")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!hid.is_open());
    assert_eq!(hid.open_count(), 0);
    assert_eq!(backend.transfers_allocated(), 0);
}

#[test]
fn test_claim_failure_closes_handle() {
    let (backend, usb, hid) = device(false);
    usb.fail_claim(BackendError::Busy);

    assert!(matches!(hid.open(), Err(HidError::DeviceOpenFailed(_))));
    assert_eq!(backend.calls(), vec![MockCall::Open, MockCall::Close]);
}

#[test]
fn test_missing_input_endpoint() {
    let backend = MockBackend::new();
    let mut interface = hidusb::test_utils::hid_interface(0, true);
    interface.endpoints.retain(|ep| ep.address & 0x80 == 0);
    let usb = backend.add_device(
        hidusb::test_utils::mock_descriptor(1, 5, 0x1234, 0x0001),
        vec![interface],
    );
    let hid = HidDevice::new(backend.clone(), usb, 0, DeviceSettings::default()).unwrap();

    match hid.open() {
        Err(HidError::DeviceOpenFailed(msg)) => {
            assert!(msg.contains("input endpoint"), "{}", msg)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(backend.calls().contains(&MockCall::Release { interface: 0 }));
    assert!(!hid.is_open());
}

#[test]
fn test_submit_failure_fails_open() {
    let (_backend, usb, hid) = device(false);
    usb.fail_submit(Some(BackendError::NoDevice));

    match hid.open() {
        Err(HidError::DeviceOpenFailed(msg)) => assert!(msg.contains("No such device")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!hid.is_open());

    usb.fail_submit(None);
    hid.open().unwrap();
    assert!(hid.is_reading());
}

#[test]
fn test_invalid_device_descriptor() {
    let (backend, usb) = create_mock_hid_device(1, 2, false);
    usb.fail_descriptor(BackendError::Io);

    assert!(matches!(
        HidDevice::new(backend, usb, 0, DeviceSettings::default()),
        Err(HidError::InvalidDevice(_))
    ));
}

#[test]
fn test_read_timeout_zero_on_empty_queue() {
    let (_backend, _usb, hid) = device(false);
    hid.open().unwrap();

    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Empty);
}

#[test]
fn test_read_timeout_expires() {
    let (_backend, _usb, hid) = device(false);
    hid.open().unwrap();

    let start = Instant::now();
    assert_eq!(hid.read_timeout(50).unwrap(), ReadOutcome::Empty);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_reports_arrive_in_order() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.push_input(vec![1]);
    usb.push_input(vec![2]);
    usb.push_input(vec![3]);

    for expected in 1..=3u8 {
        assert_eq!(
            hid.read_timeout(1000).unwrap(),
            ReadOutcome::Report(vec![expected])
        );
    }
}

#[test]
fn test_read_is_truncated_to_packet_size() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.push_input(vec![0xaa; 100]);
    match hid.read_timeout(1000).unwrap() {
        ReadOutcome::Report(data) => assert_eq!(data.len(), 64),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_overflow_keeps_newest() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    for i in 1..=40u8 {
        usb.push_input(vec![i]);
    }
    wait_for(|| hid.queue_stats().total_received == 40);

    let mut seen = Vec::new();
    while let ReadOutcome::Report(data) = hid.read_timeout(0).unwrap() {
        seen.push(data[0]);
    }
    assert_eq!(seen, (9..=40).collect::<Vec<u8>>());
    assert_eq!(hid.queue_stats().total_dropped, 8);
}

#[test]
fn test_blocking_read_wakes_on_input() {
    let (_backend, usb, hid) = device(false);
    let hid = Arc::new(hid);
    hid.open().unwrap();

    let reader = {
        let hid = hid.clone();
        thread::spawn(move || hid.read_timeout(-1).unwrap())
    };

    thread::sleep(Duration::from_millis(20));
    usb.push_input(vec![0x42]);

    assert_eq!(reader.join().unwrap(), ReadOutcome::Report(vec![0x42]));
}

#[test]
fn test_blocking_read_returns_when_loop_stops() {
    let (_backend, usb, hid) = device(false);
    let hid = Arc::new(hid);
    hid.open().unwrap();

    let reader = {
        let hid = hid.clone();
        thread::spawn(move || hid.read_timeout(-1).unwrap())
    };

    thread::sleep(Duration::from_millis(20));
    usb.inject_status(TransferStatus::NoDevice);

    assert_eq!(reader.join().unwrap(), ReadOutcome::LoopStopped);
    assert!(!hid.is_reading());
    // Still open until closed explicitly
    assert!(hid.is_open());
    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::LoopStopped);
}

#[test]
fn test_buffered_reports_survive_loop_stop() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.push_input(vec![7]);
    usb.inject_status(TransferStatus::NoDevice);
    wait_for(|| !hid.is_reading());

    assert_eq!(hid.read_timeout(-1).unwrap(), ReadOutcome::Report(vec![7]));
    assert_eq!(hid.read_timeout(-1).unwrap(), ReadOutcome::LoopStopped);
}

#[test]
fn test_close_wakes_blocked_reader() {
    let (_backend, _usb, hid) = device(false);
    let hid = Arc::new(hid);
    hid.open().unwrap();

    let reader = {
        let hid = hid.clone();
        thread::spawn(move || hid.read_timeout(-1))
    };

    thread::sleep(Duration::from_millis(20));
    hid.close();

    assert!(matches!(
        reader.join().unwrap(),
        Ok(ReadOutcome::LoopStopped)
    ));
}

#[test]
fn test_transient_event_errors_are_ignored() {
    let (backend, usb, hid) = device(false);
    hid.open().unwrap();

    backend.push_event_error(BackendError::Interrupted);
    backend.push_event_error(BackendError::Timeout);
    usb.push_input(vec![1]);

    assert_eq!(hid.read_timeout(1000).unwrap(), ReadOutcome::Report(vec![1]));
    assert!(hid.is_reading());
}

#[test]
fn test_fatal_event_error_stops_loop() {
    let (backend, _usb, hid) = device(false);
    hid.open().unwrap();

    backend.push_event_error(BackendError::Io);
    wait_for(|| !hid.is_reading());

    assert_eq!(hid.read_timeout(-1).unwrap(), ReadOutcome::LoopStopped);
    hid.close();
    assert!(!hid.is_open());
}

#[test]
fn test_unexpected_status_keeps_reading() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.inject_status(TransferStatus::Stall);
    usb.inject_status(TransferStatus::TimedOut);
    usb.push_input(vec![5]);

    assert_eq!(hid.read_timeout(1000).unwrap(), ReadOutcome::Report(vec![5]));
    assert!(hid.is_reading());
}

#[test]
fn test_non_blocking_read() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();
    hid.set_blocking(false);

    assert_eq!(hid.read().unwrap(), ReadOutcome::Empty);

    usb.push_input(vec![3]);
    wait_for(|| hid.queue_stats().buffered == 1);
    assert_eq!(hid.read().unwrap(), ReadOutcome::Report(vec![3]));
}

#[test]
fn test_empty_write_makes_no_backend_call() {
    let (backend, _usb, hid) = device(true);
    hid.open().unwrap();
    backend.clear_calls();

    assert!(matches!(hid.write(Vec::<u8>::new()), Err(HidError::EmptyData)));
    assert!(matches!(hid.send_feature_report([0u8; 0]), Err(HidError::EmptyData)));
    assert!(matches!(
        hid.write_parts(Vec::<Vec<u8>>::new()),
        Err(HidError::EmptyData)
    ));
    assert!(backend.calls().is_empty());
}

#[test]
fn test_empty_write_checked_before_open_state() {
    let (_backend, _usb, hid) = device(false);
    assert!(matches!(hid.write([0u8; 0]), Err(HidError::EmptyData)));
    assert!(matches!(hid.write([1u8]), Err(HidError::DeviceNotOpen)));
}

#[test]
fn test_interrupt_write() {
    let (backend, _usb, hid) = device(true);
    hid.open().unwrap();

    assert_eq!(hid.write([0x00, 0x01, 0x02]).unwrap(), 2);
    assert_eq!(hid.write([0x03, 0x01]).unwrap(), 2);
    assert_eq!(hid.write_parts([&[0x00u8][..], &[0x0a, 0x0b][..]]).unwrap(), 2);

    let writes: Vec<MockCall> = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::InterruptOut { .. }))
        .collect();
    assert_eq!(
        writes,
        vec![
            MockCall::InterruptOut {
                endpoint: 0x01,
                data: vec![0x01, 0x02]
            },
            MockCall::InterruptOut {
                endpoint: 0x01,
                data: vec![0x03, 0x01]
            },
            MockCall::InterruptOut {
                endpoint: 0x01,
                data: vec![0x0a, 0x0b]
            },
        ]
    );
}

#[test]
fn test_feature_reports() {
    let (backend, usb, hid) = device(true);
    hid.open().unwrap();
    usb.set_feature_report(vec![0x02, 0x10, 0x20]);

    assert_eq!(hid.send_feature_report([0x00, 0x55]).unwrap(), 2);
    assert_eq!(hid.send_feature_report([0x02, 0x55]).unwrap(), 2);
    assert_eq!(hid.get_feature_report(2, None).unwrap(), vec![0x02, 0x10, 0x20]);
    assert_eq!(hid.get_feature_report(2, Some(2)).unwrap(), vec![0x02, 0x10]);

    let control: Vec<MockCall> = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockCall::ControlOut { .. } | MockCall::ControlIn { .. }))
        .collect();
    assert_eq!(
        control,
        vec![
            MockCall::ControlOut {
                request_type: 0x21,
                request: 0x09,
                value: 0x0300,
                index: 0,
                data: vec![0x55],
            },
            MockCall::ControlOut {
                request_type: 0x21,
                request: 0x09,
                value: 0x0302,
                index: 0,
                data: vec![0x02, 0x55],
            },
            MockCall::ControlIn {
                request_type: 0xa1,
                request: 0x01,
                value: 0x0302,
                index: 0,
                length: 64,
            },
            MockCall::ControlIn {
                request_type: 0xa1,
                request: 0x01,
                value: 0x0302,
                index: 0,
                length: 2,
            },
        ]
    );
}

#[test]
fn test_strings_and_fallbacks() {
    let (_backend, usb, hid) = device(false);
    usb.set_string(1, "  Acme  ");

    assert_eq!(hid.manufacturer(), "Acme");
    assert_eq!(hid.product(), "Mock HID Device");
    assert_eq!(hid.serial_number(), "MOCK0001");
    assert_eq!(hid.to_string(), "Acme Mock HID Device (MOCK0001)");

    // Cached after the first read
    usb.set_string(1, "Other");
    assert_eq!(hid.manufacturer(), "Acme");

    let (backend, usb) = create_mock_hid_device(0x16c0, 0x05df, false);
    usb.fail_open(BackendError::Access);
    let hid = HidDevice::new(backend, usb, 0, DeviceSettings::default()).unwrap();
    assert_eq!(hid.manufacturer(), "VENDOR(0x16c0)");
    assert_eq!(hid.product(), "PRODUCT(0x05df)");
    assert_eq!(hid.serial_number(), "?");
}

#[test]
fn test_identity() {
    let (_backend, _usb, hid) = device(false);

    assert_eq!(hid.vendor_id(), 0x16c0);
    assert_eq!(hid.product_id(), 0x05df);
    assert_eq!(hid.interface(), 0);
    assert_eq!(hid.path(), DevicePath::new(1, 2, 0));
    assert_eq!(hid.path().to_string(), "0001:0002:00");

    let debug = format!("{:?}", hid);
    assert!(debug.contains("16c0:05df"));
    assert!(debug.contains("CLOSED"));

    let info = hid.info();
    assert_eq!(info.serial_number, "MOCK0001");
    assert_eq!(info.path, hid.path());
}

#[test]
fn test_read_hooks_consume_reports() {
    let (backend, usb) = create_mock_hid_device(1, 2, false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let hooks = DeviceHooks::new().on_read(move |path: &DevicePath, data: &[u8]| {
        sink.lock().unwrap().push((*path, data.to_vec()));
        data.first() == Some(&0xff)
    });
    let hid = HidDevice::with_hooks(backend, usb.clone(), 0, DeviceSettings::default(), hooks).unwrap();
    hid.open().unwrap();

    usb.push_input(vec![0xff, 1]);
    usb.push_input(vec![0x01, 2]);

    assert_eq!(hid.read_timeout(1000).unwrap(), ReadOutcome::Report(vec![0x01, 2]));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (DevicePath::new(1, 2, 0), vec![0xff, 1]));
}

#[test]
fn test_runtime_read_hook() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    let consumed = Arc::new(AtomicUsize::new(0));
    let counter = consumed.clone();
    hid.add_read_hook(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    usb.push_input(vec![1]);
    wait_for(|| consumed.load(Ordering::SeqCst) == 1);
    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Empty);
}

#[test]
fn test_init_hooks_run_on_creation() {
    let (backend, usb) = create_mock_hid_device(1, 2, false);
    let created = Arc::new(Mutex::new(Vec::new()));
    let sink = created.clone();

    let hooks = DeviceHooks::new().on_init(move |device: &HidDevice<MockBackend>| {
        sink.lock().unwrap().push(device.path());
    });
    let _hid = HidDevice::with_hooks(backend, usb, 0, DeviceSettings::default(), hooks).unwrap();

    assert_eq!(*created.lock().unwrap(), vec![DevicePath::new(1, 2, 0)]);
}

#[test]
fn test_configured_buffer_size() {
    let (backend, usb) = create_mock_hid_device(1, 2, false);
    let settings = DeviceSettings {
        report_buffer_size: 2,
        ..DeviceSettings::default()
    };
    let hid = HidDevice::new(backend, usb.clone(), 0, settings).unwrap();
    hid.open().unwrap();

    for i in 0..5u8 {
        usb.push_input(vec![i]);
    }
    wait_for(|| hid.queue_stats().total_received == 5);

    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Report(vec![3]));
    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Report(vec![4]));
    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Empty);
}

#[test]
fn test_close_clears_queue() {
    let (_backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.push_input(vec![1]);
    wait_for(|| hid.queue_stats().buffered == 1);

    hid.close();
    assert_eq!(hid.queue_stats().buffered, 0);
    assert!(matches!(hid.read_timeout(0), Err(HidError::DeviceNotOpen)));
}

#[test]
fn test_release_failure_does_not_stop_close() {
    let (backend, usb, hid) = device(false);
    hid.open().unwrap();

    usb.push_input(vec![1]);
    wait_for(|| hid.queue_stats().buffered == 1);

    usb.fail_release(BackendError::Io);
    hid.close();

    assert_eq!(count(&backend, &MockCall::Close), 1);
    assert_eq!(count(&backend, &MockCall::Release { interface: 0 }), 0);
    assert!(!hid.is_open());
    assert_eq!(hid.open_count(), 0);
    assert_eq!(backend.transfers_in_flight(), 0);

    hid.open().unwrap();
    assert_eq!(hid.read_timeout(0).unwrap(), ReadOutcome::Empty);
}

#[test]
fn test_close_with_pending_event_errors() {
    for poll_ms in [0, 5] {
        let (backend, usb) = create_mock_hid_device(1, 2, false);
        let settings = DeviceSettings {
            event_poll_timeout_ms: poll_ms,
            ..DeviceSettings::default()
        };
        let hid = HidDevice::new(backend.clone(), usb, 0, settings).unwrap();
        hid.open().unwrap();

        for _ in 0..10 {
            backend.push_event_error(BackendError::Interrupted);
        }
        hid.close();

        assert!(!hid.is_open());
        assert_eq!(backend.transfers_in_flight(), 0);
        assert_eq!(backend.calls().last(), Some(&MockCall::Close));
    }
}
