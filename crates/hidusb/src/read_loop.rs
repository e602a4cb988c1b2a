//! Background read loop
//!
//! One OS thread per open device. It keeps a single asynchronous interrupt IN
//! transfer in flight and drives backend event processing, which is where the
//! transfer's completion callback runs. Completed reports go to the device's
//! [`ReportQueue`]; readers on other threads are woken through the condition
//! variable in [`Shared`].
//!
//! Shutdown is cooperative: whoever wants the loop gone sets `shutdown` and
//! cancels the transfer. The loop then cancels again itself and keeps
//! processing events until the callback has acknowledged the cancellation, so
//! the transfer is never freed while the backend still owns it.

use crate::backend::{AsyncTransfer, BackendResult, Completion, TransferOf, UsbBackend, UsbHandle};
use crate::hooks::ReadHooks;
use crate::queue::ReportQueue;
use protocol::{DevicePath, TransferStatus};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// State shared between a device, its read loop and the completion callback
pub(crate) struct ReadState<T> {
    pub reports: ReportQueue,
    pub shutdown: bool,
    pub initialized: bool,
    pub transfer_cancelled: bool,
    pub transfer: Option<Arc<T>>,
}

pub(crate) struct Shared<T> {
    state: Mutex<ReadState<T>>,
    changed: Condvar,
}

impl<T> Shared<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ReadState {
                reports: ReportQueue::new(capacity),
                shutdown: true,
                initialized: false,
                transfer_cancelled: true,
                transfer: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ReadState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify(&self) {
        self.changed.notify_all();
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, ReadState<T>>) -> MutexGuard<'a, ReadState<T>> {
        self.changed.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, ReadState<T>>,
        timeout: Duration,
    ) -> MutexGuard<'a, ReadState<T>> {
        match self.changed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }

    /// Stop the loop and mark the transfer as no longer owned by the backend
    fn stop(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        state.transfer_cancelled = true;
        drop(state);
        self.notify();
    }
}

/// Everything the read-loop thread needs, moved onto that thread
pub(crate) struct ReadLoop<B: UsbBackend> {
    pub backend: B,
    pub handle: Arc<B::Handle>,
    pub path: DevicePath,
    pub endpoint: u8,
    pub length: usize,
    pub transfer_timeout: Duration,
    pub poll_timeout: Duration,
    pub shared: Arc<Shared<TransferOf<B>>>,
    pub hooks: ReadHooks,
}

impl<B: UsbBackend> ReadLoop<B> {
    /// Start the loop on a new named thread
    pub fn spawn(self) -> io::Result<JoinHandle<BackendResult<()>>> {
        thread::Builder::new()
            .name(format!("hid-read-{}", self.path))
            .spawn(move || self.run())
    }

    fn run(self) -> BackendResult<()> {
        debug!("Read loop starting for {}", self.path);

        let transfer = match self.start() {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("Failed to start read loop for {}: {}", self.path, e);
                let mut state = self.shared.lock();
                state.shutdown = true;
                state.initialized = true;
                state.transfer = None;
                drop(state);
                self.shared.notify();
                return Err(e);
            }
        };

        self.shared.lock().initialized = true;
        self.shared.notify();

        let result = self.pump();
        self.teardown(transfer);

        debug!("Read loop for {} stopped", self.path);
        result
    }

    fn start(&self) -> BackendResult<Arc<TransferOf<B>>> {
        let shared = self.shared.clone();
        let hooks = self.hooks.clone();
        let path = self.path;

        let transfer = Arc::new(self.handle.alloc_interrupt_transfer(
            self.endpoint,
            self.length,
            self.transfer_timeout,
            Box::new(move |completion: Completion<'_>| {
                on_completion(&shared, &hooks, &path, completion)
            }),
        )?);

        {
            let mut state = self.shared.lock();
            state.transfer_cancelled = false;
            state.transfer = Some(transfer.clone());
        }

        if let Err(e) = transfer.submit() {
            self.shared.lock().transfer_cancelled = true;
            return Err(e);
        }

        debug!(
            "Submitted interrupt IN transfer on endpoint {:#x} ({} bytes) for {}",
            self.endpoint, self.length, self.path
        );
        Ok(transfer)
    }

    fn pump(&self) -> BackendResult<()> {
        loop {
            if self.shared.lock().shutdown {
                return Ok(());
            }

            match self.backend.handle_events(self.poll_timeout) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!("Ignoring event-processing error on {}: {}", self.path, e);
                }
                Err(e) => {
                    error!("Event processing failed on {}: {}", self.path, e);
                    self.shared.lock().shutdown = true;
                    self.shared.notify();
                    return Err(e);
                }
            }

            if self.poll_timeout.is_zero() {
                thread::yield_now();
            }
        }
    }

    fn teardown(&self, transfer: Arc<TransferOf<B>>) {
        self.shared.lock().initialized = false;

        // NOT_FOUND means the callback is running elsewhere or already ran;
        // with shutdown set it acknowledges instead of resubmitting.
        if let Err(e) = transfer.cancel() {
            debug!("Cancelling transfer on {} failed: {}", self.path, e);
        }

        let mut acknowledged = self.shared.lock().transfer_cancelled;
        while !acknowledged {
            if let Err(e) = self.backend.handle_events(self.poll_timeout) {
                if !e.is_transient() {
                    warn!(
                        "Event processing failed while waiting for cancellation on {}: {}",
                        self.path, e
                    );
                    break;
                }
            }
            acknowledged = self.shared.lock().transfer_cancelled;
            if !acknowledged && self.poll_timeout.is_zero() {
                thread::yield_now();
            }
        }

        self.shared.lock().transfer = None;
        self.shared.notify();

        if !acknowledged {
            warn!(
                "Transfer on {} was never released by the backend, leaking it",
                self.path
            );
            std::mem::forget(transfer);
        }
    }
}

fn on_completion<T>(
    shared: &Shared<T>,
    hooks: &ReadHooks,
    path: &DevicePath,
    mut completion: Completion<'_>,
) {
    match completion.status {
        TransferStatus::Completed => {
            trace!("Input report on {}: {} bytes", path, completion.data.len());
            if !hooks.dispatch(path, completion.data) {
                shared.lock().reports.push(completion.data.to_vec());
                shared.notify();
            }
        }
        TransferStatus::Cancelled | TransferStatus::NoDevice => {
            debug!("Transfer on {} ended: {:?}", path, completion.status);
            shared.stop();
            return;
        }
        TransferStatus::TimedOut => {}
        status => warn!("Unexpected transfer status on {}: {:?}", path, status),
    }

    // Resubmit under the lock so a concurrent shutdown either sees the
    // transfer in flight or finds it acknowledged here.
    let mut state = shared.lock();
    if state.shutdown {
        state.transfer_cancelled = true;
    } else if let Err(e) = completion.resubmit() {
        warn!("Failed to resubmit transfer on {}: {}", path, e);
        state.shutdown = true;
        state.transfer_cancelled = true;
    } else {
        return;
    }
    drop(state);
    shared.notify();
}
