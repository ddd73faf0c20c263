//! Host Controller Adaptation Layer
//!
//! Controller hardware drivers register a versioned operations table;
//! the core drives it and never touches hardware itself. Completion is
//! the inverse call: the driver hands finished transfers back through
//! [`HostController::process_completed_transfer`] at dispatch level.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::device::UsbDevice;
use crate::endpoint::Endpoint;
use crate::error::{Result, UsbError};
use crate::hub::UsbHub;
use crate::memory::DmaPool;
use crate::platform::{KernelServices, WorkItem};
use crate::queue::{self, CompletionQueue};
use crate::transfer::{TransferState, UsbTransfer};
use crate::types::{PortState, UsbSpeed, MAX_BUS_ADDRESS};

/// Version of [`HostControllerOps`] a registering driver must speak.
pub const HOST_CONTROLLER_INTERFACE_VERSION: u32 = 1;

/// Default size of the per-controller DMA pool when the registration
/// does not bring its own region.
const DEFAULT_POOL_SIZE: usize = 64 * 1024;

/// Operations a host controller driver provides. All of these may be
/// invoked at dispatch level unless noted.
pub trait HostControllerOps: Send + Sync {
    /// Bind one endpoint, returning opaque scheduling state.
    fn create_endpoint(&self, endpoint: &Endpoint) -> Result<Box<dyn Any + Send + Sync>>;

    /// Free the endpoint's scheduling state.
    fn destroy_endpoint(&self, endpoint: &Endpoint, context: Box<dyn Any + Send + Sync>);

    /// Reset the endpoint's data toggle to DATA0.
    fn reset_endpoint(&self, endpoint: &Endpoint) -> Result<()>;

    /// Busy-wait the endpoint's pending transfers. Polled-mode only;
    /// optional.
    fn flush_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let _ = endpoint;
        Err(UsbError::NotSupported)
    }

    /// Allocate per-transfer scheduling state.
    fn create_transfer(&self, transfer: &UsbTransfer) -> Result<Box<dyn Any + Send + Sync>>;

    /// Free per-transfer scheduling state.
    fn destroy_transfer(&self, transfer: &UsbTransfer, context: Box<dyn Any + Send + Sync>);

    /// Queue the transfer for the bus.
    fn submit_transfer(&self, transfer: &Arc<UsbTransfer>) -> Result<()>;

    /// Synchronous submission with interrupts disabled; the transfer
    /// completes before this returns. Optional.
    fn submit_polled(&self, transfer: &Arc<UsbTransfer>) -> Result<()> {
        let _ = transfer;
        Err(UsbError::NotSupported)
    }

    /// Pull the transfer off the hardware queue. Returns `TooLate` if it
    /// is already in completion flight; on success the driver completes
    /// the transfer with a `Cancelled` status through the normal path.
    fn cancel_transfer(&self, transfer: &Arc<UsbTransfer>) -> Result<()>;

    /// Fill the root hub's port-status array (latched change bits
    /// included) and cached speeds from hardware.
    fn get_root_hub_status(
        &self,
        ports: &mut [PortState],
        speeds: &mut [Option<UsbSpeed>],
    ) -> Result<()>;

    /// Push one root port's status bits into hardware; set change bits
    /// clear the corresponding hardware latches. `port` is 1-based.
    fn set_root_hub_status(&self, port: u8, state: PortState) -> Result<()>;
}

/// Firmware-published identity of a device a pre-OS debugger was using.
/// Its bus address must survive registration.
#[derive(Debug, Clone, Copy)]
pub struct DebugHandoff {
    pub identifier: u64,
    pub debug_subtype: u16,
    pub bus_address: u8,
}

static DEBUG_HANDOFF: Mutex<Option<DebugHandoff>> = Mutex::new(None);

/// Record (or clear) the debug handoff data consulted at controller
/// registration.
pub fn set_debug_handoff(handoff: Option<DebugHandoff>) {
    *DEBUG_HANDOFF.lock() = handoff;
}

/// Process-wide controller registry.
static CONTROLLERS: Mutex<Vec<Arc<HostController>>> = Mutex::new(Vec::new());

/// Parameters a controller driver registers with.
pub struct ControllerRegistration {
    pub interface_version: u32,
    /// Stable identity used to match debug-handoff data.
    pub identifier: u64,
    /// Debug-port subtype, for controllers that can host one.
    pub debug_subtype: Option<u16>,
    /// Number of root hub ports.
    pub port_count: u8,
    /// Backing DMA region; a pool over the global allocator is created
    /// when absent.
    pub io_pool: Option<DmaPool>,
}

enum AddressSlot {
    Reserved,
    Device(Weak<UsbDevice>),
}

/// A registered host controller.
pub struct HostController {
    self_ref: Weak<HostController>,
    ops: Box<dyn HostControllerOps>,
    services: Arc<dyn KernelServices>,
    root_port_count: u8,
    pool: DmaPool,
    /// Devices by bus address. A weak index: the parent hub's child list
    /// holds the strong reference.
    addresses: Mutex<HashMap<u8, AddressSlot>>,
    completion_queue: Arc<CompletionQueue>,
    root_hub: Mutex<Option<Arc<UsbHub>>>,
    /// Coalesces root-port change notifications into one outstanding
    /// work item.
    port_change_pending: AtomicBool,
}

/// Register a controller and bring up its root hub.
pub fn register_controller(
    registration: ControllerRegistration,
    ops: Box<dyn HostControllerOps>,
    services: Arc<dyn KernelServices>,
) -> Result<Arc<HostController>> {
    if registration.interface_version != HOST_CONTROLLER_INTERFACE_VERSION {
        return Err(UsbError::VersionMismatch);
    }
    if registration.port_count == 0 {
        return Err(UsbError::InvalidParameter);
    }
    let pool = match registration.io_pool {
        Some(pool) => pool,
        None => DmaPool::new(DEFAULT_POOL_SIZE)?,
    };

    let controller = Arc::new_cyclic(|weak| HostController {
        self_ref: weak.clone(),
        ops,
        services,
        root_port_count: registration.port_count,
        pool,
        addresses: Mutex::new(HashMap::new()),
        completion_queue: CompletionQueue::new(false),
        root_hub: Mutex::new(None),
        port_change_pending: AtomicBool::new(false),
    });

    // A debugger-owned device keeps its address across the handoff.
    if let Some(handoff) = *DEBUG_HANDOFF.lock() {
        let subtype_matches = registration.debug_subtype == Some(handoff.debug_subtype);
        if handoff.identifier == registration.identifier && subtype_matches {
            controller.reserve_specific_address(handoff.bus_address)?;
            log::debug!(
                "usb: reserved debug device address {} on controller {:#x}",
                handoff.bus_address,
                registration.identifier
            );
        }
    }

    CONTROLLERS.lock().push(Arc::clone(&controller));

    if let Err(error) = controller.create_root_hub() {
        unregister_controller(&controller);
        return Err(error);
    }
    Ok(controller)
}

impl HostController {
    fn create_root_hub(&self) -> Result<()> {
        let this = self.self_ref.upgrade().ok_or(UsbError::ControllerGone)?;
        let address = self.reserve_address()?;
        let device = UsbDevice::new(&this, address, UsbSpeed::High, 0)?;
        let hub = UsbHub::create_root(&this, &device)?;
        hub.start()?;
        *self.root_hub.lock() = Some(hub);
        Ok(())
    }

    pub(crate) fn ops(&self) -> &dyn HostControllerOps {
        &*self.ops
    }

    pub fn services(&self) -> &Arc<dyn KernelServices> {
        &self.services
    }

    /// The controller's DMA pool for transfer buffers.
    pub fn pool(&self) -> &DmaPool {
        &self.pool
    }

    pub fn root_port_count(&self) -> u8 {
        self.root_port_count
    }

    pub fn root_hub(&self) -> Option<Arc<UsbHub>> {
        self.root_hub.lock().clone()
    }

    /// Reserve the lowest free bus address.
    pub fn reserve_address(&self) -> Result<u8> {
        let mut addresses = self.addresses.lock();
        for address in 1..=MAX_BUS_ADDRESS {
            if !addresses.contains_key(&address) {
                addresses.insert(address, AddressSlot::Reserved);
                return Ok(address);
            }
        }
        Err(UsbError::NoFreeAddresses)
    }

    fn reserve_specific_address(&self, address: u8) -> Result<()> {
        if address == 0 || address > MAX_BUS_ADDRESS {
            return Err(UsbError::InvalidParameter);
        }
        let mut addresses = self.addresses.lock();
        if addresses.contains_key(&address) {
            return Err(UsbError::InvalidParameter);
        }
        addresses.insert(address, AddressSlot::Reserved);
        Ok(())
    }

    /// Release a reserved or assigned address.
    pub fn release_address(&self, address: u8) {
        self.addresses.lock().remove(&address);
    }

    pub(crate) fn register_device(&self, device: &Arc<UsbDevice>) {
        self.addresses
            .lock()
            .insert(device.address(), AddressSlot::Device(Arc::downgrade(device)));
    }

    pub(crate) fn unregister_device(&self, address: u8) {
        self.addresses.lock().remove(&address);
    }

    /// Look up a live device by bus address.
    pub fn device_by_address(&self, address: u8) -> Option<Arc<UsbDevice>> {
        match self.addresses.lock().get(&address) {
            Some(AddressSlot::Device(weak)) => weak.upgrade(),
            _ => None,
        }
    }

    /// Inverse call from the controller driver: a transfer finished.
    /// Runs at dispatch level; the synchronous path signals the waiter
    /// directly, the asynchronous path goes through a completion queue.
    pub fn process_completed_transfer(&self, transfer: Arc<UsbTransfer>) {
        transfer.flush_for_completion(&self.services);
        if transfer.is_synchronous() {
            if !transfer
                .state
                .try_transition(TransferState::Active, TransferState::Inactive)
            {
                panic!(
                    "usb: transfer {:p} completed while {:?}",
                    Arc::as_ptr(&transfer),
                    transfer.state()
                );
            }
            transfer.signal_completion();
            // Dropping the Arc releases the submission reference.
        } else if transfer.is_paging() {
            queue::paging_queue().insert(transfer, &self.services);
        } else {
            self.completion_queue.insert(transfer, &self.services);
        }
    }

    /// Dispatch-safe root-port change notification. The actual handling
    /// is posted as a single coalesced work item; notifications while
    /// the worker is still pending fold into it.
    pub fn notify_port_change(&self) {
        if self.port_change_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.services.queue_work(Arc::new(PortChangeWorker {
            controller: self.self_ref.clone(),
        }));
    }
}

impl fmt::Debug for HostController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostController")
            .field("root_port_count", &self.root_port_count)
            .field("devices", &self.addresses.lock().len())
            .finish()
    }
}

struct PortChangeWorker {
    controller: Weak<HostController>,
}

impl WorkItem for PortChangeWorker {
    fn run(&self) {
        let controller = match self.controller.upgrade() {
            Some(controller) => controller,
            None => return,
        };
        if let Some(hub) = controller.root_hub() {
            hub.handle_root_port_change();
        }
        controller.port_change_pending.store(false, Ordering::Release);
    }
}

/// Tear down one controller: disconnect its device tree and drop it from
/// the registry.
pub fn unregister_controller(controller: &Arc<HostController>) {
    let root = controller.root_hub.lock().take();
    if let Some(hub) = root {
        hub.device().disconnect();
    }
    CONTROLLERS
        .lock()
        .retain(|existing| !Arc::ptr_eq(existing, controller));
}

/// Explicit subsystem teardown: unregister every controller and drop the
/// paging queue.
pub(crate) fn shutdown_all() {
    let controllers: Vec<Arc<HostController>> = core::mem::take(&mut *CONTROLLERS.lock());
    for controller in &controllers {
        let root = controller.root_hub.lock().take();
        if let Some(hub) = root {
            hub.device().disconnect();
        }
    }
    queue::teardown_paging_queue();
}
