//! USB Transfer Lifecycle Management
//!
//! Transfers move through a four-valued state word driven exclusively by
//! atomic compare-exchange: `Invalid` before allocation completes,
//! `Inactive` while quiesced, `Active` while owned by the controller,
//! and `InCallback` while the completion callback runs. The
//! `InCallback -> Inactive` transition after the callback is the
//! synchronization point with resubmission from within the callback: if
//! the callback resubmitted, the state is already `Active` and the
//! transition silently loses.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::device::UsbDevice;
use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError, UsbError};
use crate::memory::{BufferRegion, IO_BUFFER_ALIGNMENT};
use crate::platform::{Event, FlushDirection};
use crate::types::{EndpointType, TransferDirection};

/// Public transfer flags.
pub mod transfer_flags {
    pub const NONE: u32 = 0;
    /// The transfer belongs to the paging device path; completion is
    /// dispatched through the dedicated paging queue.
    pub const PAGING_DEVICE: u32 = 1 << 0;
}

/// Private flags, set per submission.
mod private_flags {
    /// Completion signals the transfer event instead of queueing the
    /// callback.
    pub const SYNCHRONOUS: u32 = 1 << 0;
}

const TRANSFER_MAGIC: u32 = 0x5542_5354;

/// Transfer lifecycle state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Invalid = 0,
    Inactive = 1,
    Active = 2,
    InCallback = 3,
}

impl From<u32> for TransferState {
    fn from(value: u32) -> Self {
        match value {
            1 => TransferState::Inactive,
            2 => TransferState::Active,
            3 => TransferState::InCallback,
            _ => TransferState::Invalid,
        }
    }
}

/// The atomic state word. All lifecycle transitions go through
/// [`StateWord::try_transition`].
pub(crate) struct StateWord(AtomicU32);

impl StateWord {
    fn new(state: TransferState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub(crate) fn load(&self) -> TransferState {
        TransferState::from(self.0.load(Ordering::Acquire))
    }

    /// Compare-exchange `from` to `to`; false if the observed state was
    /// anything else.
    pub(crate) fn try_transition(&self, from: TransferState, to: TransferState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, state: TransferState) {
        self.0.store(state as u32, Ordering::Release);
    }
}

/// Completion callback, invoked at low run level with the transfer. The
/// callback may resubmit the transfer from within itself.
pub type TransferCallback = Arc<dyn Fn(&Arc<UsbTransfer>) + Send + Sync>;

/// Mutable fill section of a transfer. Written by the submitter between
/// submissions, read by the engine under the fill lock.
struct TransferFill {
    buffer: Option<BufferRegion>,
    length: usize,
    direction: TransferDirection,
    flags: u32,
    callback: Option<TransferCallback>,
}

/// An asynchronous or synchronous USB transfer bound to one device
/// endpoint.
///
/// Allocation and submission each hold a strong reference; destruction
/// runs when the last reference drops and the transfer is `Inactive`.
pub struct UsbTransfer {
    magic: u32,
    /// Self back-reference for handing strong references to the
    /// controller and completion paths.
    self_ref: Weak<UsbTransfer>,
    device: Arc<UsbDevice>,
    endpoint: Arc<Endpoint>,
    endpoint_address: u8,
    max_transfer_size: usize,
    fill: Mutex<TransferFill>,
    pub(crate) state: StateWord,
    error: AtomicU32,
    bytes_transferred: AtomicUsize,
    private: AtomicU32,
    event: Event,
    /// Opaque per-transfer scheduling state owned by the controller.
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl UsbTransfer {
    /// Allocate a transfer bound to `device` and the endpoint with the
    /// given address byte.
    ///
    /// Fails with `InvalidParameter` if the endpoint does not exist and
    /// `DeviceNotConnected` if the device has disconnected. On success
    /// the transfer is linked into the device's transfer list in state
    /// `Inactive`.
    pub fn allocate(
        device: &Arc<UsbDevice>,
        endpoint_address: u8,
        max_transfer_size: usize,
        flags: u32,
    ) -> Result<Arc<UsbTransfer>> {
        if max_transfer_size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let endpoint = device
            .lookup_endpoint(endpoint_address)
            .ok_or(UsbError::InvalidParameter)?;
        let controller = device.controller()?;

        let transfer = Arc::new_cyclic(|weak| UsbTransfer {
            magic: TRANSFER_MAGIC,
            self_ref: weak.clone(),
            device: Arc::clone(device),
            endpoint,
            endpoint_address,
            max_transfer_size,
            fill: Mutex::new(TransferFill {
                buffer: None,
                length: 0,
                direction: TransferDirection::Invalid,
                flags,
                callback: None,
            }),
            state: StateWord::new(TransferState::Invalid),
            error: AtomicU32::new(TransferError::NotStarted as u32),
            bytes_transferred: AtomicUsize::new(0),
            private: AtomicU32::new(0),
            event: Event::new(),
            context: Mutex::new(None),
        });

        {
            let mut inner = device.inner.lock();
            if !device.is_connected() {
                return Err(UsbError::DeviceNotConnected);
            }
            let context = controller.ops().create_transfer(&transfer)?;
            *transfer.context.lock() = Some(context);
            inner.transfers.push(Arc::downgrade(&transfer));
        }
        transfer.state.set(TransferState::Inactive);
        Ok(transfer)
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Cached endpoint address byte.
    pub fn endpoint_address(&self) -> u8 {
        self.endpoint_address
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    pub fn state(&self) -> TransferState {
        self.state.load()
    }

    /// Bind the transfer to a buffer region and set the requested
    /// length. The region must stay valid until the transfer is
    /// destroyed or rebound.
    pub fn set_buffer(&self, region: BufferRegion, length: usize) {
        let mut fill = self.fill.lock();
        fill.buffer = Some(region);
        fill.length = length;
    }

    pub fn set_direction(&self, direction: TransferDirection) {
        self.fill.lock().direction = direction;
    }

    pub fn set_flags(&self, flags: u32) {
        self.fill.lock().flags = flags;
    }

    pub fn set_callback(&self, callback: TransferCallback) {
        self.fill.lock().callback = Some(callback);
    }

    /// The buffer region the transfer is currently bound to.
    pub fn buffer_region(&self) -> Option<BufferRegion> {
        self.fill.lock().buffer
    }

    pub fn length(&self) -> usize {
        self.fill.lock().length
    }

    pub fn direction(&self) -> TransferDirection {
        self.fill.lock().direction
    }

    pub fn flags(&self) -> u32 {
        self.fill.lock().flags
    }

    /// Failure kind recorded by the most recent attempt.
    pub fn error(&self) -> TransferError {
        TransferError::from(self.error.load(Ordering::Acquire))
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred.load(Ordering::Acquire)
    }

    /// Fold the recorded kind into a result.
    pub fn result(&self) -> Result<()> {
        self.error().into_result()
    }

    /// Record the outcome of an attempt. Called by controller drivers
    /// before handing the transfer back for completion processing.
    pub fn set_status(&self, error: TransferError, bytes_transferred: usize) {
        self.bytes_transferred
            .store(bytes_transferred, Ordering::Release);
        self.error.store(error as u32, Ordering::Release);
    }

    pub(crate) fn record_error(&self, error: TransferError) {
        self.error.store(error as u32, Ordering::Release);
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        self.private.load(Ordering::Acquire) & private_flags::SYNCHRONOUS != 0
    }

    pub(crate) fn is_paging(&self) -> bool {
        self.fill.lock().flags & transfer_flags::PAGING_DEVICE != 0
    }

    pub(crate) fn signal_completion(&self) {
        self.event.signal();
    }

    pub(crate) fn callback(&self) -> Option<TransferCallback> {
        self.fill.lock().callback.clone()
    }

    /// The controller's opaque per-transfer context.
    pub fn controller_context(&self) -> &Mutex<Option<Box<dyn Any + Send + Sync>>> {
        &self.context
    }

    /// A fresh strong reference to this transfer.
    fn arc(&self) -> Result<Arc<UsbTransfer>> {
        self.self_ref.upgrade().ok_or(UsbError::InvalidParameter)
    }

    /// Submit the transfer asynchronously. The callback is invoked at
    /// low run level exactly once per submission that reaches `Active`.
    pub fn submit(&self) -> Result<()> {
        self.submit_internal(0, false)
    }

    /// Submit and block until completion, then return the bytes
    /// transferred.
    pub fn submit_sync(&self) -> Result<usize> {
        self.event.reset();
        self.submit_internal(private_flags::SYNCHRONOUS, false)?;
        self.event.wait();
        self.result()?;
        Ok(self.bytes_transferred())
    }

    /// Polled-mode submission: bypasses the device lock and the
    /// completion queue, for use with interrupts disabled. The transfer
    /// completes before this returns.
    pub fn submit_polled(&self) -> Result<usize> {
        self.event.reset();
        self.submit_internal(private_flags::SYNCHRONOUS, true)?;
        if self.state.load() != TransferState::Inactive {
            log::error!("usb: polled submission returned with transfer still active");
            return Err(UsbError::NotReady);
        }
        self.result()?;
        Ok(self.bytes_transferred())
    }

    fn submit_internal(&self, private: u32, polled: bool) -> Result<()> {
        if self.magic != TRANSFER_MAGIC {
            self.record_error(TransferError::AllocatedIncorrectly);
            return Err(TransferError::AllocatedIncorrectly.into());
        }
        if self.state.load() == TransferState::Active {
            self.record_error(TransferError::DoubleSubmitted);
            return Err(TransferError::DoubleSubmitted.into());
        }

        let synchronous = private & private_flags::SYNCHRONOUS != 0;
        let is_control = self.endpoint.endpoint_type() == EndpointType::Control;
        let (region, length, direction) = {
            let fill = self.fill.lock();
            let region = match fill.buffer {
                Some(region) => region,
                None => {
                    drop(fill);
                    self.record_error(TransferError::IncorrectlyFilledOut);
                    return Err(TransferError::IncorrectlyFilledOut.into());
                }
            };
            if fill.length == 0
                || fill.length > self.max_transfer_size
                || region.capacity() < fill.length
                || fill.direction == TransferDirection::Invalid
                || (!synchronous && fill.callback.is_none())
            {
                drop(fill);
                self.record_error(TransferError::IncorrectlyFilledOut);
                return Err(TransferError::IncorrectlyFilledOut.into());
            }
            if region.phys() % IO_BUFFER_ALIGNMENT as u64 != 0
                || region.as_ptr() as usize % IO_BUFFER_ALIGNMENT != 0
            {
                drop(fill);
                self.record_error(TransferError::MisalignedBuffer);
                return Err(TransferError::MisalignedBuffer.into());
            }
            (region, fill.length, fill.direction)
        };

        let this = self.arc()?;
        let controller = self.device.controller()?;
        self.private.store(private, Ordering::Release);
        self.set_status(TransferError::None, 0);

        // Flush the cache before handing the buffer to hardware. Control
        // transfers always write the setup packet, so they flush toward
        // the device regardless of the data direction. The buffer must
        // not be touched after this point.
        let to_device = direction == TransferDirection::Out || is_control;
        let from_device = direction == TransferDirection::In;
        let flush = match (to_device, from_device) {
            (true, true) => Some(FlushDirection::Bidirectional),
            (true, false) => Some(FlushDirection::ToDevice),
            (false, true) => Some(FlushDirection::FromDevice),
            (false, false) => None,
        };
        if let Some(flush) = flush {
            controller.services().flush_io(&region, length, flush);
        }

        if polled {
            if !self.device.is_connected() {
                self.record_error(TransferError::DeviceNotConnected);
                return Err(UsbError::DeviceNotConnected);
            }
            self.activate()?;
            if let Err(error) = controller.ops().submit_polled(&this) {
                self.state
                    .try_transition(TransferState::Active, TransferState::Inactive);
                self.record_error(TransferError::FailedToSubmit);
                return Err(error);
            }
        } else {
            {
                let _inner = self.device.inner.lock();
                if !self.device.is_connected() {
                    self.record_error(TransferError::DeviceNotConnected);
                    return Err(UsbError::DeviceNotConnected);
                }
                self.activate()?;
            }
            if let Err(error) = controller.ops().submit_transfer(&this) {
                self.state
                    .try_transition(TransferState::Active, TransferState::Inactive);
                self.record_error(TransferError::FailedToSubmit);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Move to `Active` from either `InCallback` (resubmission from
    /// within the callback) or `Inactive`. Any other origin is a fatal
    /// invariant violation.
    fn activate(&self) -> Result<()> {
        if self
            .state
            .try_transition(TransferState::InCallback, TransferState::Active)
        {
            return Ok(());
        }
        if self
            .state
            .try_transition(TransferState::Inactive, TransferState::Active)
        {
            return Ok(());
        }
        let observed = self.state.load();
        if observed == TransferState::Active {
            // Lost a race with a concurrent submission.
            self.record_error(TransferError::DoubleSubmitted);
            return Err(TransferError::DoubleSubmitted.into());
        }
        panic!(
            "usb: transfer {:p} submitted while {:?}",
            self as *const Self,
            observed
        );
    }

    /// Cancel the transfer.
    ///
    /// Returns `TooEarly` if there is nothing to cancel, `TooLate` if
    /// the transfer is already in completion flight. With `wait`, does
    /// not return until the state reaches `Inactive`, after which the
    /// transfer is quiesced.
    pub fn cancel(&self, wait: bool) -> Result<()> {
        if self.state.load() == TransferState::Inactive {
            return Err(UsbError::TooEarly);
        }
        let this = self.arc()?;
        let controller = self.device.controller()?;
        let result = controller.ops().cancel_transfer(&this);
        if wait {
            while self.state.load() != TransferState::Inactive {
                controller.services().yield_now();
            }
        }
        result
    }

    /// Invalidate the cache after the device wrote into the buffer.
    pub(crate) fn flush_for_completion(&self, services: &Arc<dyn crate::platform::KernelServices>) {
        let (region, length, direction) = {
            let fill = self.fill.lock();
            match fill.buffer {
                Some(region) => (region, fill.length, fill.direction),
                None => return,
            }
        };
        if direction == TransferDirection::In {
            services.flush_io(&region, length, FlushDirection::FromDevice);
        }
    }
}

impl Drop for UsbTransfer {
    fn drop(&mut self) {
        let state = self.state.load();
        debug_assert!(
            matches!(state, TransferState::Inactive | TransferState::Invalid),
            "usb: transfer destroyed while {:?}",
            state
        );
        self.device.unlink_transfer(self as *const _);
        if let Some(context) = self.context.get_mut().take() {
            if let Ok(controller) = self.device.controller() {
                controller.ops().destroy_transfer(self, context);
            }
        }
    }
}

impl fmt::Debug for UsbTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbTransfer")
            .field("device", &self.device.address())
            .field("endpoint", &format_args!("{:#04x}", self.endpoint_address))
            .field("state", &self.state.load())
            .field("error", &self.error())
            .field("bytes_transferred", &self.bytes_transferred())
            .finish()
    }
}
