//! Kernel collaborator seams.
//!
//! The core leaves memory mapping, work queues, cache maintenance, and
//! enumeration proper to the surrounding kernel. Those collaborators are
//! reached through [`KernelServices`], supplied per controller at
//! registration time.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::device::UsbDevice;
use crate::error::{Result, UsbError};
use crate::memory::BufferRegion;
use crate::types::UsbSpeed;

/// A deferred unit of work executed at low run level.
///
/// Implementations of [`KernelServices::queue_work`] must never run the
/// same item concurrently with itself; queueing an item that is already
/// running schedules exactly one more run after the current one returns.
pub trait WorkItem: Send + Sync {
    fn run(&self);
}

/// Direction of a cache flush relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDirection {
    /// Clean: CPU writes must be visible to the device before DMA.
    ToDevice,
    /// Invalidate: device writes must be visible to the CPU after DMA.
    FromDevice,
    /// Both, for control transfers that write the setup packet and read
    /// the data stage.
    Bidirectional,
}

/// Services the surrounding kernel provides to the USB core.
pub trait KernelServices: Send + Sync {
    /// Queue a work item on the shared low-level work queue.
    fn queue_work(&self, item: Arc<dyn WorkItem>);

    /// Queue a work item on the private queue backing the paging device
    /// completion path. Defaults to the shared queue for hosts that have
    /// no page-cache deadlock to avoid.
    fn queue_paging_work(&self, item: Arc<dyn WorkItem>) {
        self.queue_work(item);
    }

    /// Perform cache maintenance on a transfer buffer before or after
    /// DMA. Cache-coherent hosts may leave this as the default no-op.
    fn flush_io(&self, region: &BufferRegion, len: usize, direction: FlushDirection) {
        let _ = (region, len, direction);
    }

    /// Busy-spin for the given number of milliseconds. Used for the
    /// USB-mandated debounce, reset, and recovery intervals.
    fn stall_ms(&self, ms: u32);

    /// Hint that the caller is busy-waiting on another context.
    fn yield_now(&self) {
        core::hint::spin_loop();
    }

    /// Tell the OS that a hub's set of children has changed.
    fn notify_children_changed(&self, device: &Arc<UsbDevice>) {
        let _ = device;
    }

    /// Raise a driver-level error against a device that can no longer
    /// make progress.
    fn report_device_error(&self, device: &Arc<UsbDevice>, error: UsbError) {
        log::error!(
            "usb: device {} raised driver error: {}",
            device.address(),
            error
        );
    }

    /// Enumerate a newly reset device behind `hub_device` on `port`.
    /// This is enumeration proper, outside the core.
    fn enumerate_child(
        &self,
        hub_device: &Arc<UsbDevice>,
        port: u8,
        speed: UsbSpeed,
    ) -> Result<Arc<UsbDevice>> {
        let _ = (hub_device, port, speed);
        Err(UsbError::NotSupported)
    }
}

/// Binary event used by synchronous submission. Waiters busy-spin; the
/// signaler runs at dispatch level and may not sleep.
pub struct Event {
    signaled: AtomicBool,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub fn wait(&self) {
        while !self.is_signaled() {
            core::hint::spin_loop();
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
