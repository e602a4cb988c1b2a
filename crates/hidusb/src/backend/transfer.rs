//! Asynchronous libusb interrupt transfers
//!
//! `rusb` only exposes synchronous transfers, so the read loop's transfer is
//! built directly on libusb's asynchronous API through `rusb::ffi`. The
//! transfer, its buffer and its callback state are allocated once and reused
//! for every resubmission. libusb invokes the completion callback from inside
//! `libusb_handle_events*`, i.e. on whichever thread processes events.

use super::{AsyncTransfer, BackendResult, Completion, CompletionCallback};
use crate::error::BackendError;
use libc::{c_int, c_uint, c_void};
use protocol::TransferStatus;
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_fill_interrupt_transfer,
    libusb_free_transfer, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, DeviceHandle};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct CallbackState {
    callback: Mutex<CompletionCallback>,
}

/// A reusable interrupt transfer
pub struct LibusbTransfer {
    transfer: NonNull<libusb_transfer>,
    state: NonNull<CallbackState>,
    buffer: NonNull<[u8]>,
    _handle: Arc<DeviceHandle<Context>>,
}

// SAFETY: libusb_submit_transfer and libusb_cancel_transfer may be called from
// any thread. The callback state is only touched from the completion callback
// and is guarded by a mutex; the buffer is only read inside the callback.
unsafe impl Send for LibusbTransfer {}
unsafe impl Sync for LibusbTransfer {}

impl LibusbTransfer {
    pub(crate) fn interrupt(
        handle: Arc<DeviceHandle<Context>>,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        callback: CompletionCallback,
    ) -> BackendResult<Self> {
        let max_size = c_int::try_from(length).map_err(|_| BackendError::InvalidParam)?;
        let timeout = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);

        // SAFETY: plain allocation, checked for NULL below.
        let raw = unsafe { libusb_alloc_transfer(0) };
        let transfer = NonNull::new(raw).ok_or(BackendError::NoMem)?;

        let buffer = NonNull::from(Box::leak(vec![0u8; length].into_boxed_slice()));
        let state = NonNull::from(Box::leak(Box::new(CallbackState {
            callback: Mutex::new(callback),
        })));

        // SAFETY: transfer, device handle, buffer and state pointers are valid
        // and stay valid until `drop`, which frees them only after the owner
        // has observed the final completion.
        unsafe {
            libusb_fill_interrupt_transfer(
                transfer.as_ptr(),
                handle.as_raw(),
                endpoint,
                buffer.as_ptr() as *mut u8,
                max_size,
                transfer_finished,
                state.as_ptr() as *mut c_void,
                timeout,
            );
        }

        Ok(Self {
            transfer,
            state,
            buffer,
            _handle: handle,
        })
    }
}

impl AsyncTransfer for LibusbTransfer {
    fn submit(&self) -> BackendResult<()> {
        // SAFETY: the transfer was filled in `interrupt` and is still allocated.
        check(unsafe { libusb_submit_transfer(self.transfer.as_ptr()) })
    }

    fn cancel(&self) -> BackendResult<()> {
        // SAFETY: cancelling an idle transfer just returns NOT_FOUND.
        check(unsafe { libusb_cancel_transfer(self.transfer.as_ptr()) })
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        // SAFETY: the transfer is no longer owned by libusb (see
        // `AsyncTransfer`), and all three allocations came from this struct.
        unsafe {
            libusb_free_transfer(self.transfer.as_ptr());
            drop(Box::from_raw(self.state.as_ptr()));
            drop(Box::from_raw(self.buffer.as_ptr()));
        }
    }
}

extern "system" fn transfer_finished(transfer_ptr: *mut libusb_transfer) {
    if transfer_ptr.is_null() {
        return;
    }

    // SAFETY: libusb hands back the transfer it just completed; read the
    // fields by value so no reference outlives the resubmission below.
    let (status, actual_length, buffer, user_data) = unsafe {
        (
            (*transfer_ptr).status,
            (*transfer_ptr).actual_length,
            (*transfer_ptr).buffer,
            (*transfer_ptr).user_data,
        )
    };

    if user_data.is_null() {
        return;
    }

    // SAFETY: user_data is the CallbackState set in `interrupt`; it is freed
    // only after the final completion.
    let state = unsafe { &*(user_data as *const CallbackState) };

    let len = usize::try_from(actual_length).unwrap_or(0);
    let data: &[u8] = if buffer.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: libusb wrote `actual_length` bytes into our buffer.
        unsafe { std::slice::from_raw_parts(buffer, len) }
    };

    // SAFETY: resubmitting from the completion callback is allowed by libusb.
    let mut resubmit = || check(unsafe { libusb_submit_transfer(transfer_ptr) });

    let mut guard = state.callback.lock().unwrap_or_else(|e| e.into_inner());
    let callback: &mut CompletionCallback = &mut guard;
    let result = catch_unwind(AssertUnwindSafe(|| {
        callback(Completion::new(map_status(status), data, &mut resubmit))
    }));
    if result.is_err() {
        tracing::error!("Panic in USB transfer completion callback");
    }
}

fn map_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn check(code: c_int) -> BackendResult<()> {
    if code >= 0 {
        return Ok(());
    }

    Err(match code {
        LIBUSB_ERROR_IO => BackendError::Io,
        LIBUSB_ERROR_INVALID_PARAM => BackendError::InvalidParam,
        LIBUSB_ERROR_ACCESS => BackendError::Access,
        LIBUSB_ERROR_NO_DEVICE => BackendError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => BackendError::NotFound,
        LIBUSB_ERROR_BUSY => BackendError::Busy,
        LIBUSB_ERROR_TIMEOUT => BackendError::Timeout,
        LIBUSB_ERROR_OVERFLOW => BackendError::Overflow,
        LIBUSB_ERROR_PIPE => BackendError::Pipe,
        LIBUSB_ERROR_INTERRUPTED => BackendError::Interrupted,
        LIBUSB_ERROR_NO_MEM => BackendError::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => BackendError::NotSupported,
        other => BackendError::Other(format!("libusb error {}", other)),
    })
}
