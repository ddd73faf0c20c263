//! USB host core: the transfer lifecycle engine and the hub enumeration
//! state machine.
//!
//! Host controller hardware lives behind [`HostControllerOps`]; kernel
//! primitives (work queues, cache maintenance, delays, enumeration
//! proper) live behind [`KernelServices`]. Everything in between — the
//! transfer state machine, completion dispatch, reference-counted
//! device/endpoint/transfer lifetimes, and hub port management — is
//! implemented here.

#![no_std]

extern crate alloc;

pub mod controller;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod memory;
pub mod platform;
pub mod queue;
pub mod transfer;
pub mod types;

pub use controller::{
    register_controller, set_debug_handoff, unregister_controller, ControllerRegistration,
    DebugHandoff, HostController, HostControllerOps, HOST_CONTROLLER_INTERFACE_VERSION,
};
pub use device::UsbDevice;
pub use endpoint::Endpoint;
pub use error::{Result, TransferError, UsbError};
pub use hub::{HubTiming, UsbHub};
pub use memory::{BufferRegion, DmaPool, IoBuffer, IO_BUFFER_ALIGNMENT};
pub use platform::{Event, FlushDirection, KernelServices, WorkItem};
pub use transfer::{transfer_flags, TransferCallback, TransferState, UsbTransfer};
pub use types::{PortState, SetupPacket, TransferDirection, UsbSpeed};

/// Bring the subsystem up. Controller registration may follow.
pub fn init() {
    log::debug!("usb: core initialized");
}

/// Explicit teardown: unregister every controller, disconnect their
/// device trees, and drop the paging completion queue.
pub fn shutdown() {
    controller::shutdown_all();
    log::debug!("usb: core shut down");
}
