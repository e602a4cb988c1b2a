//! Observer hooks attached to a device
//!
//! Hooks are held per device instance. An [`HidApi`](crate::HidApi) clones
//! its template into every device it builds, so registering a hook on one
//! device never affects another.

use crate::backend::UsbBackend;
use crate::device::HidDevice;
use protocol::DevicePath;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tracing::{error, trace};

/// Called on the read-loop thread for every completed input transfer.
///
/// Returning `true` consumes the report; it is then not queued for `read`.
pub type ReadHook = Arc<dyn Fn(&DevicePath, &[u8]) -> bool + Send + Sync>;

/// Called once when a device object is created
pub type InitHook<B> = Arc<dyn Fn(&HidDevice<B>) + Send + Sync>;

/// Init and read hooks for one device
pub struct DeviceHooks<B: UsbBackend> {
    init: Vec<InitHook<B>>,
    read: Vec<ReadHook>,
}

impl<B: UsbBackend> Default for DeviceHooks<B> {
    fn default() -> Self {
        Self {
            init: Vec::new(),
            read: Vec::new(),
        }
    }
}

impl<B: UsbBackend> Clone for DeviceHooks<B> {
    fn clone(&self) -> Self {
        Self {
            init: self.init.clone(),
            read: self.read.clone(),
        }
    }
}

impl<B: UsbBackend> DeviceHooks<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook run when the device object is created
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HidDevice<B>) + Send + Sync + 'static,
    {
        self.init.push(Arc::new(hook));
        self
    }

    /// Add a hook offered every input report before it is queued
    pub fn on_read<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DevicePath, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.read.push(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_empty() && self.read.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<InitHook<B>>, ReadHooks) {
        (self.init, ReadHooks::new(self.read))
    }
}

/// Read hooks shared between a device and its read loop
#[derive(Clone, Default)]
pub(crate) struct ReadHooks {
    hooks: Arc<RwLock<Vec<ReadHook>>>,
}

impl ReadHooks {
    fn new(hooks: Vec<ReadHook>) -> Self {
        Self {
            hooks: Arc::new(RwLock::new(hooks)),
        }
    }

    pub(crate) fn add(&self, hook: ReadHook) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Offer a report to each hook in registration order.
    ///
    /// Returns `true` as soon as one hook consumes it. A panicking hook is
    /// logged and counts as not consuming.
    pub(crate) fn dispatch(&self, path: &DevicePath, data: &[u8]) -> bool {
        // Snapshot so a hook may register another hook without deadlocking
        let hooks: Vec<ReadHook> = self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(path, data))) {
                Ok(true) => {
                    trace!("Input report on {} consumed by read hook", path);
                    return true;
                }
                Ok(false) => {}
                Err(_) => error!("Read hook panicked on {}", path),
            }
        }
        false
    }
}
