//! USB Device Management

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::controller::HostController;
use crate::descriptor::{parse_configuration, ConfigurationInfo, EndpointInfo};
use crate::endpoint::Endpoint;
use crate::error::{Result, UsbError};
use crate::transfer::UsbTransfer;
use crate::types::{EndpointType, UsbSpeed};

/// State guarded by the device lock: the transfer back-index, and the
/// connected flag's transition (readers of the flag during submission
/// hold this lock).
pub(crate) struct DeviceInner {
    /// Weak back-index of outstanding transfers. Iteration upgrades
    /// under the lock, then drops the lock before acting.
    pub(crate) transfers: Vec<Weak<UsbTransfer>>,
}

/// A USB device, root hubs included.
///
/// Created by enumeration. The parent hub's child list holds the strong
/// reference; each outstanding transfer holds one of its own. Once
/// disconnected, new transfer submissions fail deterministically.
pub struct UsbDevice {
    address: u8,
    speed: UsbSpeed,
    /// Port number on the parent hub, 0 for root hubs.
    port: u8,
    connected: AtomicBool,
    pub(crate) inner: Mutex<DeviceInner>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    configurations: Mutex<Vec<ConfigurationInfo>>,
    active_configuration: Mutex<Option<u8>>,
    claimed_interfaces: Mutex<Vec<u8>>,
    /// Child list; the lock doubles as the hub's per-port software
    /// state lock.
    pub(crate) children: Mutex<Vec<Arc<UsbDevice>>>,
    controller: Weak<HostController>,
}

impl UsbDevice {
    /// Create a device on `controller` with an already reserved bus
    /// address. The default control endpoint is created here.
    pub fn new(
        controller: &Arc<HostController>,
        address: u8,
        speed: UsbSpeed,
        port: u8,
    ) -> Result<Arc<UsbDevice>> {
        let device = Arc::new(UsbDevice {
            address,
            speed,
            port,
            connected: AtomicBool::new(true),
            inner: Mutex::new(DeviceInner {
                transfers: Vec::new(),
            }),
            endpoints: Mutex::new(Vec::new()),
            configurations: Mutex::new(Vec::new()),
            active_configuration: Mutex::new(None),
            claimed_interfaces: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            controller: Arc::downgrade(controller),
        });

        let ep0 = Endpoint::create(
            controller,
            &EndpointInfo {
                address: 0,
                endpoint_type: EndpointType::Control,
                max_packet_size: speed.max_control_packet(),
                interval: 0,
            },
        )?;
        device.endpoints.lock().push(ep0);

        controller.register_device(&device);
        Ok(device)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    /// Port number on the parent hub, 0 for root hubs.
    pub fn port_number(&self) -> u8 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn controller(&self) -> Result<Arc<HostController>> {
        self.controller.upgrade().ok_or(UsbError::ControllerGone)
    }

    /// Find an endpoint by its address byte.
    pub fn lookup_endpoint(&self, address: u8) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .iter()
            .find(|ep| ep.address() == address)
            .cloned()
    }

    /// The default control endpoint.
    pub fn control_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.lookup_endpoint(0)
    }

    /// Parse and cache a configuration descriptor blob. Configurations
    /// are parsed once per device.
    pub fn cache_configuration(&self, blob: &[u8]) -> Result<()> {
        let config = parse_configuration(blob)?;
        self.configurations.lock().push(config);
        Ok(())
    }

    /// `bConfigurationValue` of the configuration at `index`.
    pub fn configuration_value(&self, index: usize) -> Option<u8> {
        self.configurations.lock().get(index).map(|c| c.value)
    }

    pub fn active_configuration(&self) -> Option<u8> {
        *self.active_configuration.lock()
    }

    pub(crate) fn set_active_configuration(&self, value: u8) {
        *self.active_configuration.lock() = Some(value);
    }

    /// Look up an interface of the active (or first cached)
    /// configuration.
    pub fn interface(&self, number: u8) -> Option<crate::descriptor::InterfaceInfo> {
        let configs = self.configurations.lock();
        let config = match *self.active_configuration.lock() {
            Some(value) => configs.iter().find(|c| c.value == value),
            None => configs.first(),
        }?;
        config.interface(number).cloned()
    }

    /// Interface numbers of the active (or first cached) configuration.
    pub fn interface_numbers(&self) -> Vec<u8> {
        let configs = self.configurations.lock();
        let config = match *self.active_configuration.lock() {
            Some(value) => configs.iter().find(|c| c.value == value),
            None => configs.first(),
        };
        config
            .map(|c| c.interfaces.iter().map(|i| i.number).collect())
            .unwrap_or_default()
    }

    /// Claim an interface, creating its endpoints on first claim.
    /// Idempotent; returns the interface's endpoints.
    pub fn claim_interface(&self, number: u8) -> Result<Vec<Arc<Endpoint>>> {
        let controller = self.controller()?;
        let interface = self.interface(number).ok_or(UsbError::NotFound)?;

        let first_claim = {
            let mut claimed = self.claimed_interfaces.lock();
            if claimed.contains(&number) {
                false
            } else {
                claimed.push(number);
                true
            }
        };

        if first_claim {
            for info in &interface.endpoints {
                let endpoint = Endpoint::create(&controller, info)?;
                self.endpoints.lock().push(endpoint);
            }
        }

        let endpoints = self.endpoints.lock();
        Ok(interface
            .endpoints
            .iter()
            .filter_map(|info| {
                endpoints
                    .iter()
                    .find(|ep| ep.address() == info.address)
                    .cloned()
            })
            .collect())
    }

    /// Mark the device disconnected and quiesce it. The flag transitions
    /// true to false exactly once; later calls are no-ops. Outstanding
    /// transfers are cancelled and waited to `Inactive`; children are
    /// disconnected recursively.
    pub fn disconnect(&self) {
        {
            let _guard = self.inner.lock();
            if !self.connected.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        log::debug!("usb: device {} disconnected", self.address);

        self.cancel_all_transfers();

        let children: Vec<Arc<UsbDevice>> = core::mem::take(&mut *self.children.lock());
        for child in children {
            child.disconnect();
        }

        if let Some(controller) = self.controller.upgrade() {
            controller.unregister_device(self.address);
        }
    }

    /// Cancel every outstanding transfer and wait each to `Inactive`.
    ///
    /// References are taken under the device lock, then the lock is
    /// dropped before cancelling, so cancellation cannot race list
    /// mutation.
    pub fn cancel_all_transfers(&self) {
        let snapshot: Vec<Arc<UsbTransfer>> = {
            let inner = self.inner.lock();
            inner.transfers.iter().filter_map(Weak::upgrade).collect()
        };
        for transfer in &snapshot {
            match transfer.cancel(true) {
                Ok(()) | Err(UsbError::TooEarly) | Err(UsbError::TooLate) => {}
                Err(error) => {
                    log::warn!(
                        "usb: device {}: cancel during teardown failed: {}",
                        self.address,
                        error
                    );
                }
            }
        }
    }

    /// The child device on `port`, if any.
    pub fn child_on_port(&self, port: u8) -> Option<Arc<UsbDevice>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.port_number() == port)
            .cloned()
    }

    /// Snapshot of the current children.
    pub fn children_snapshot(&self) -> Vec<Arc<UsbDevice>> {
        self.children.lock().clone()
    }

    pub(crate) fn unlink_transfer(&self, transfer: *const UsbTransfer) {
        let mut inner = self.inner.lock();
        inner
            .transfers
            .retain(|weak| weak.as_ptr() != transfer && weak.strong_count() > 0);
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("address", &self.address)
            .field("speed", &self.speed)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}
