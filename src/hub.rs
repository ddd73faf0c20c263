//! USB Hub Support
//!
//! Hubs are driven by a persistent interrupt transfer whose completion
//! reports a changed-ports bitmap (bit 0 is hub-wide, bits 1..N are
//! per-port). Completion records the bitmap and queues the deferred
//! worker; the worker makes the control transfers that completion
//! context cannot, folds hardware port status into the software view,
//! recovers over-current conditions, and re-arms the interrupt pipeline.
//!
//! Root hubs are the degenerate case: their port status is read and
//! written through the controller operations instead of the wire.

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::controller::HostController;
use crate::descriptor::HubDescriptor;
use crate::device::UsbDevice;
use crate::error::{Result, TransferError, UsbError};
use crate::memory::IoBuffer;
use crate::platform::{KernelServices, WorkItem};
use crate::transfer::{UsbTransfer, TransferCallback};
use crate::types::{
    feature, hub_feature, hub_status, hw_port_change, port_indicator, port_status,
    reduce_hw_status, request_type, speed_from_hw_status, standard_request, descriptor_type,
    PortState, SetupPacket, TransferDirection, EndpointType, UsbSpeed, SETUP_PACKET_SIZE,
};

/// Data stage capacity of the hub's serialized control transfer.
const HUB_CONTROL_DATA_SIZE: usize = 64;
const HUB_CONTROL_TRANSFER_SIZE: usize = SETUP_PACKET_SIZE + HUB_CONTROL_DATA_SIZE;
/// Offset of the interrupt slice within the hub I/O buffer; keeps both
/// slices I/O-aligned.
const HUB_INTERRUPT_OFFSET: usize = 128;
/// Interrupt payload capacity: enough for a 127-port bitmap.
const HUB_INTERRUPT_MAX_SIZE: usize = 16;
const HUB_IO_BUFFER_SIZE: usize = HUB_INTERRUPT_OFFSET + HUB_INTERRUPT_MAX_SIZE;

/// Cap on over-current status polling; a wedged device must not wedge
/// the worker.
const STATUS_SPIN_LIMIT: u32 = 100;
const STATUS_SPIN_DELAY_MS: u32 = 2;

/// Hub timing intervals, all in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct HubTiming {
    /// Reset assertion (TDRST). USB 2.0 asks for 10 ms, but around
    /// 10 ms some devices begin to suspend themselves, so the default
    /// is shorter.
    pub reset_assert_ms: u32,
    /// Reset recovery (TRSTRCY).
    pub reset_recovery_ms: u32,
    /// Settle time after reset before the device is addressed.
    pub post_reset_ms: u32,
    /// Connection debounce (USB 2.0 §7.1.7.3).
    pub debounce_ms: u32,
}

impl Default for HubTiming {
    fn default() -> Self {
        Self {
            reset_assert_ms: 5,
            reset_recovery_ms: 25,
            post_reset_ms: 20,
            debounce_ms: 100,
        }
    }
}

/// Per-port software state: status + change words and the cached speed.
struct PortArray {
    states: Vec<PortState>,
    speeds: Vec<Option<UsbSpeed>>,
}

/// The hub's serialized control transfer and the I/O buffer backing both
/// it and the interrupt transfer. The enclosing lock is the hub's
/// control-transfer lock: the buffer backs exactly one in-flight request
/// at a time.
struct HubControl {
    transfer: Arc<UsbTransfer>,
    buffer: IoBuffer,
}

enum HubChange {
    Handled,
    /// The whole hub was reset; the interrupt pipeline is already
    /// re-armed.
    Reset,
}

/// A USB hub, root or downstream.
pub struct UsbHub {
    self_ref: Weak<UsbHub>,
    device: Arc<UsbDevice>,
    is_root: bool,
    port_count: u8,
    /// Power-on to power-good time in 2 ms units.
    power_up_delay: u8,
    has_indicators: bool,
    timing: Mutex<HubTiming>,
    ports: Mutex<PortArray>,
    control: Mutex<HubControl>,
    interrupt_transfer: Mutex<Option<Arc<UsbTransfer>>>,
    /// Snapshot of the most recent changed-ports bitmap, handed from
    /// interrupt completion to the deferred worker.
    changed_ports: AtomicU32,
    /// Set once the interrupt transfer exists; reset re-entry cancels
    /// instead of allocating.
    interrupt_started: AtomicBool,
}

impl UsbHub {
    /// Create a hub over an enumerated downstream hub device. The hub
    /// class descriptor supplies the port count, power-on delay, and
    /// indicator support.
    pub fn create(device: &Arc<UsbDevice>) -> Result<Arc<UsbHub>> {
        Self::create_internal(device, None)
    }

    pub(crate) fn create_root(
        controller: &Arc<HostController>,
        device: &Arc<UsbDevice>,
    ) -> Result<Arc<UsbHub>> {
        Self::create_internal(device, Some(controller.root_port_count()))
    }

    fn create_internal(device: &Arc<UsbDevice>, root_ports: Option<u8>) -> Result<Arc<UsbHub>> {
        let controller = device.controller()?;
        let buffer = controller.pool().alloc(HUB_IO_BUFFER_SIZE)?;
        let transfer = UsbTransfer::allocate(device, 0, HUB_CONTROL_TRANSFER_SIZE, 0)?;
        let mut control = HubControl { transfer, buffer };

        let (port_count, power_up_delay, has_indicators, is_root) = match root_ports {
            Some(ports) => (ports, 1, false, true),
            None => {
                let descriptor = read_hub_descriptor(&mut control)?;
                (
                    descriptor.num_ports,
                    descriptor.power_on_to_power_good,
                    descriptor.supports_indicators(),
                    false,
                )
            }
        };
        if port_count == 0 {
            return Err(UsbError::InvalidParameter);
        }

        let count = port_count as usize;
        Ok(Arc::new_cyclic(|weak| UsbHub {
            self_ref: weak.clone(),
            device: Arc::clone(device),
            is_root,
            port_count,
            power_up_delay,
            has_indicators,
            timing: Mutex::new(HubTiming::default()),
            ports: Mutex::new(PortArray {
                states: vec![PortState::default(); count],
                speeds: vec![None; count],
            }),
            control: Mutex::new(control),
            interrupt_transfer: Mutex::new(None),
            changed_ports: AtomicU32::new(0),
            interrupt_started: AtomicBool::new(false),
        }))
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    pub fn timing(&self) -> HubTiming {
        *self.timing.lock()
    }

    /// Override the reset/debounce intervals, for integrators that need
    /// the full USB 2.0 reset assertion time.
    pub fn set_timing(&self, timing: HubTiming) {
        *self.timing.lock() = timing;
    }

    /// Software status, change delta, and cached speed of one port.
    pub fn port_state(&self, port: u8) -> (PortState, Option<UsbSpeed>) {
        debug_assert!(port >= 1 && port <= self.port_count);
        let ports = self.ports.lock();
        let index = (port - 1) as usize;
        (ports.states[index], ports.speeds[index])
    }

    /// Start the hub. Root hubs force-refresh their port status from
    /// the controller; downstream hubs run the full reset sequence.
    pub fn start(&self) -> Result<()> {
        if self.is_root {
            let _children = self.device.children.lock();
            self.refresh_root_status()
        } else {
            self.reset_hub()
        }
    }

    /// Reset a downstream hub: configure it, bind the interrupt
    /// pipeline, power every port, and re-arm.
    pub fn reset_hub(&self) -> Result<()> {
        debug_assert!(!self.is_root);
        let services = self.services()?;

        let config_value = self
            .device
            .configuration_value(0)
            .ok_or(UsbError::NotFound)?;
        let setup = SetupPacket::new(
            request_type::HOST_TO_DEVICE
                | request_type::TYPE_STANDARD
                | request_type::RECIPIENT_DEVICE,
            standard_request::SET_CONFIGURATION,
            config_value as u16,
            0,
            0,
        );
        self.control_out(setup, &[])?;
        self.device.set_active_configuration(config_value);

        let interface = *self
            .device
            .interface_numbers()
            .first()
            .ok_or(UsbError::NotFound)?;
        let endpoints = self.device.claim_interface(interface)?;
        let interrupt_endpoint = endpoints
            .iter()
            .find(|ep| ep.endpoint_type() == EndpointType::Interrupt && ep.is_in())
            .cloned()
            .ok_or(UsbError::NotFound)?;

        if self.interrupt_started.swap(true, Ordering::AcqRel) {
            // Re-entry: quiesce the existing interrupt transfer before
            // the pipeline is rebuilt.
            let existing = self.interrupt_transfer.lock().clone();
            if let Some(transfer) = existing {
                loop {
                    match transfer.cancel(true) {
                        Ok(()) | Err(UsbError::TooEarly) => break,
                        Err(_) => services.yield_now(),
                    }
                }
            }
        } else {
            let length = (self.port_count as usize + 1 + 7) / 8;
            let transfer =
                UsbTransfer::allocate(&self.device, interrupt_endpoint.address(), HUB_INTERRUPT_MAX_SIZE, 0)?;
            let region = {
                let control = self.control.lock();
                control
                    .buffer
                    .region(HUB_INTERRUPT_OFFSET, HUB_INTERRUPT_MAX_SIZE)?
            };
            transfer.set_buffer(region, length.min(HUB_INTERRUPT_MAX_SIZE));
            transfer.set_direction(TransferDirection::In);
            let hub = self.self_ref.clone();
            let callback: TransferCallback = Arc::new(move |transfer| {
                if let Some(hub) = hub.upgrade() {
                    hub.interrupt_completion(transfer);
                }
            });
            transfer.set_callback(callback);
            *self.interrupt_transfer.lock() = Some(transfer);
        }

        {
            let mut ports = self.ports.lock();
            for state in &mut ports.states {
                *state = PortState::default();
            }
            for speed in &mut ports.speeds {
                *speed = None;
            }
        }
        for port in 1..=self.port_count {
            self.set_feature(port, hub_feature::PORT_POWER)?;
            if self.has_indicators {
                self.set_port_indicator(port, port_indicator::AUTOMATIC)?;
            }
        }

        services.stall_ms(self.power_up_delay as u32 * 2);

        for port in 1..=self.port_count {
            self.refresh_port(port)?;
        }

        self.submit_interrupt_transfer();
        Ok(())
    }

    /// Refresh software port status. Root hubs always delegate to the
    /// controller; for downstream hubs a non-forced refresh is a no-op,
    /// trusting the interrupt pipeline.
    pub fn refresh_status(&self, force: bool) -> Result<()> {
        if self.is_root {
            return self.refresh_root_status();
        }
        if !force {
            return Ok(());
        }
        for port in 1..=self.port_count {
            self.refresh_port(port)?;
        }
        Ok(())
    }

    /// Reset one port: assert, recover, and verify the enable per the
    /// USB 2.0 timing. The caller holds the child lock.
    ///
    /// Returns success if the device disappeared during the reset, and
    /// `NotReady` if the port failed to come up enabled.
    pub fn reset_hub_port(&self, port: u8) -> Result<()> {
        debug_assert!(port >= 1 && port <= self.port_count);
        let services = self.services()?;
        let timing = self.timing();
        let index = (port - 1) as usize;

        let pushed = {
            let mut ports = self.ports.lock();
            let state = &mut ports.states[index];
            state.status = (state.status | port_status::RESET) & !port_status::ENABLED;
            state.change |= port_status::RESET | port_status::ENABLED;
            *state
        };
        self.write_port_status(port, pushed)?;
        services.stall_ms(timing.reset_assert_ms);

        let pushed = {
            let mut ports = self.ports.lock();
            let state = &mut ports.states[index];
            state.status = (state.status & !port_status::RESET) | port_status::ENABLED;
            *state
        };
        self.write_port_status(port, pushed)?;
        services.stall_ms(timing.reset_recovery_ms);

        self.force_refresh_port(port)?;
        let state = {
            let mut ports = self.ports.lock();
            let state = &mut ports.states[index];
            if state.status & port_status::ENABLED == 0 {
                state.change &= !port_status::ENABLED;
            } else {
                // A successful enable observation retires the reset
                // change.
                state.change &= !port_status::RESET;
            }
            *state
        };
        if !state.connected() {
            // The device was removed mid-reset; nothing left to do.
            return Ok(());
        }
        if !state.enabled() {
            return Err(UsbError::NotReady);
        }

        services.stall_ms(timing.post_reset_ms);
        Ok(())
    }

    /// Handle connect changes under the child lock: drop departed
    /// children, debounce/reset/enumerate arrivals, and return the
    /// resulting child snapshot.
    pub fn query_children(&self) -> Result<Vec<Arc<UsbDevice>>> {
        let services = self.services()?;
        let mut children = self.device.children.lock();

        for port in 1..=self.port_count {
            let index = (port - 1) as usize;
            let connect_change = {
                self.ports.lock().states[index].change & port_status::CONNECTED != 0
            };
            if !connect_change {
                continue;
            }

            // Whatever was here before is gone or replaced.
            if let Some(position) = children.iter().position(|c| c.port_number() == port) {
                let old = children.remove(position);
                old.disconnect();
            }

            let connected = {
                self.ports.lock().states[index].status & port_status::CONNECTED != 0
            };
            if connected {
                // Enumeration failures are swallowed so other ports
                // still proceed.
                if let Err(error) = self.add_device(port, &mut children, &services) {
                    log::debug!(
                        "usb: hub {}: port {} enumeration failed: {}",
                        self.device.address(),
                        port,
                        error
                    );
                }
            }

            if self.is_root {
                let state = self.ports.lock().states[index];
                let _ = self.write_port_status(
                    port,
                    PortState {
                        status: state.status,
                        change: port_status::CONNECTED,
                    },
                );
            }
            self.ports.lock().states[index].change &= !port_status::CONNECTED;
        }

        Ok(children.clone())
    }

    fn add_device(
        &self,
        port: u8,
        children: &mut Vec<Arc<UsbDevice>>,
        services: &Arc<dyn KernelServices>,
    ) -> Result<()> {
        services.stall_ms(self.timing().debounce_ms);

        self.force_refresh_port(port)?;
        let (state, _) = self.port_state(port);
        if !state.connected() {
            // Left during debounce; not an error.
            return Ok(());
        }

        self.reset_hub_port(port)?;
        let (state, speed) = self.port_state(port);
        if !state.connected() {
            return Ok(());
        }

        let speed = speed.unwrap_or(UsbSpeed::Full);
        let child = services.enumerate_child(&self.device, port, speed)?;
        children.push(child);
        Ok(())
    }

    /// Root-port change handling, run from the controller's coalesced
    /// work item.
    pub(crate) fn handle_root_port_change(&self) {
        let _children = self.device.children.lock();
        if self.refresh_root_status().is_err() {
            return;
        }
        let services = match self.services() {
            Ok(services) => services,
            Err(_) => return,
        };

        let mut connect_changed = false;
        for port in 1..=self.port_count {
            let index = (port - 1) as usize;
            let state = self.ports.lock().states[index];
            if state.change & port_status::OVER_CURRENT != 0 {
                if self.wait_root_over_current_clear(port).is_err() {
                    continue;
                }
                {
                    let mut ports = self.ports.lock();
                    ports.states[index] = PortState::default();
                    ports.speeds[index] = None;
                }
                if let Err(error) = self.reset_hub_port(port) {
                    log::warn!(
                        "usb: root hub: port {} reset after over-current failed: {}",
                        port,
                        error
                    );
                }
            }
            let state = self.ports.lock().states[index];
            if state.change & port_status::CONNECTED != 0 {
                connect_changed = true;
            }
        }

        if connect_changed {
            services.notify_children_changed(&self.device);
        }
    }

    // ---- interrupt pipeline ------------------------------------------

    fn interrupt_completion(&self, transfer: &Arc<UsbTransfer>) {
        match transfer.error() {
            // Whichever path cancelled the transfer owns resubmission.
            TransferError::Cancelled => {}
            TransferError::None => {
                let changed = self.read_change_bitmap(transfer);
                if changed != 0 {
                    self.changed_ports.store(changed, Ordering::Release);
                    self.queue_worker();
                } else {
                    self.submit_interrupt_transfer();
                }
            }
            error if error.is_recoverable_halt() => match self.clear_interrupt_halt(transfer) {
                Ok(()) => self.submit_interrupt_transfer(),
                Err(error) => {
                    // The hub is left quiescent; the device owns the
                    // failure from here.
                    if let Ok(services) = self.services() {
                        services.report_device_error(&self.device, error);
                    }
                }
            },
            error => {
                log::warn!(
                    "usb: hub {}: unexpected interrupt error {}, resubmitting",
                    self.device.address(),
                    error
                );
                self.submit_interrupt_transfer();
            }
        }
    }

    /// Decode the changed-ports bitmap from the interrupt payload. A
    /// payload shorter than expected reads as no changes.
    fn read_change_bitmap(&self, transfer: &Arc<UsbTransfer>) -> u32 {
        let region = match transfer.buffer_region() {
            Some(region) => region,
            None => return 0,
        };
        let mut raw = [0u8; 4];
        let available = transfer
            .bytes_transferred()
            .min(raw.len())
            .min(region.capacity());
        if available == 0 {
            return 0;
        }
        region.copy_to(0, &mut raw[..available]);
        let mask = if self.port_count >= 31 {
            u32::MAX
        } else {
            (1u32 << (self.port_count as u32 + 1)) - 1
        };
        u32::from_le_bytes(raw) & mask
    }

    fn clear_interrupt_halt(&self, transfer: &Arc<UsbTransfer>) -> Result<()> {
        let setup = SetupPacket::new(
            request_type::HOST_TO_DEVICE
                | request_type::TYPE_STANDARD
                | request_type::RECIPIENT_ENDPOINT,
            standard_request::CLEAR_FEATURE,
            feature::ENDPOINT_HALT,
            transfer.endpoint_address() as u16,
            0,
        );
        self.control_out(setup, &[])?;
        transfer.endpoint().reset_toggle()
    }

    fn queue_worker(&self) {
        if let Ok(services) = self.services() {
            services.queue_work(Arc::new(HubWorkItem {
                hub: self.self_ref.clone(),
            }));
        }
    }

    fn submit_interrupt_transfer(&self) {
        let transfer = match self.interrupt_transfer.lock().clone() {
            Some(transfer) => transfer,
            None => return,
        };
        match transfer.submit() {
            Ok(()) => {}
            // Already armed.
            Err(UsbError::Transfer(TransferError::DoubleSubmitted)) => {}
            Err(error) => log::warn!(
                "usb: hub {}: failed to re-arm interrupt transfer: {}",
                self.device.address(),
                error
            ),
        }
    }

    /// The deferred worker: everything interrupt completion cannot do.
    fn run_worker(&self) {
        let changed = self.changed_ports.swap(0, Ordering::AcqRel);
        let services = match self.services() {
            Ok(services) => services,
            Err(_) => return,
        };
        let mut topology_changed = false;

        if changed & 1 != 0 {
            match self.handle_hub_change() {
                Ok(HubChange::Reset) => {
                    // reset_hub re-armed the interrupt pipeline.
                    services.notify_children_changed(&self.device);
                    return;
                }
                Ok(HubChange::Handled) => {}
                Err(error) => log::warn!(
                    "usb: hub {}: hub status handling failed: {}",
                    self.device.address(),
                    error
                ),
            }
        }

        for port in 1..=self.port_count.min(31) {
            if changed & (1u32 << port as u32) == 0 {
                continue;
            }
            let _children = self.device.children.lock();
            match self.handle_port_change(port) {
                Ok(connect_changed) => topology_changed |= connect_changed,
                Err(error) => log::warn!(
                    "usb: hub {}: port {} change handling failed: {}",
                    self.device.address(),
                    port,
                    error
                ),
            }
        }

        if topology_changed {
            services.notify_children_changed(&self.device);
        }
        self.submit_interrupt_transfer();
    }

    fn handle_hub_change(&self) -> Result<HubChange> {
        let (status, change) = self.read_hub_status()?;
        if change & hub_status::LOCAL_POWER != 0 {
            self.clear_feature(0, hub_feature::C_HUB_LOCAL_POWER)?;
        }
        if change & hub_status::OVER_CURRENT != 0 || status & hub_status::OVER_CURRENT != 0 {
            self.wait_hub_over_current_clear()?;
            self.clear_feature(0, hub_feature::C_HUB_OVER_CURRENT)?;
            self.reset_hub()?;
            return Ok(HubChange::Reset);
        }
        Ok(HubChange::Handled)
    }

    fn handle_port_change(&self, port: u8) -> Result<bool> {
        let (hw_status, mut hw_change) = self.read_port_status_hw(port)?;
        self.fold_port_status(port, hw_status);

        if hw_change & hw_port_change::C_OVER_CURRENT != 0 {
            self.wait_port_over_current_clear(port)?;
            {
                let mut ports = self.ports.lock();
                let index = (port - 1) as usize;
                ports.states[index] = PortState::default();
                ports.speeds[index] = None;
            }
            self.set_feature(port, hub_feature::PORT_POWER)?;
            if self.has_indicators {
                self.set_port_indicator(port, port_indicator::AUTOMATIC)?;
            }
            let (hw_status, more_change) = self.read_port_status_hw(port)?;
            self.fold_port_status(port, hw_status);
            hw_change |= more_change;
        }

        self.clear_hw_changes(port, hw_change)?;

        let connect_changed = {
            let ports = self.ports.lock();
            ports.states[(port - 1) as usize].change & port_status::CONNECTED != 0
        };
        Ok(connect_changed)
    }

    // ---- port status plumbing ----------------------------------------

    fn refresh_root_status(&self) -> Result<()> {
        let controller = self.device.controller()?;
        let mut ports = self.ports.lock();
        let PortArray { states, speeds } = &mut *ports;
        controller.ops().get_root_hub_status(states, speeds)
    }

    /// One forced `GET_PORT_STATUS`, folded into software state, with
    /// the observed hardware change bits cleared.
    fn refresh_port(&self, port: u8) -> Result<()> {
        let (hw_status, hw_change) = self.read_port_status_hw(port)?;
        self.fold_port_status(port, hw_status);
        self.clear_hw_changes(port, hw_change)
    }

    fn force_refresh_port(&self, port: u8) -> Result<()> {
        if self.is_root {
            self.refresh_root_status()
        } else {
            self.refresh_port(port)
        }
    }

    /// Fold a hardware status word into the software view: change bits
    /// accumulate the XOR against the previous software status, and the
    /// speed is cached while connected.
    fn fold_port_status(&self, port: u8, hw_status: u16) {
        let mut ports = self.ports.lock();
        let index = (port - 1) as usize;
        let new_status = reduce_hw_status(hw_status);
        let old_status = ports.states[index].status;
        ports.states[index].change |= old_status ^ new_status;
        ports.states[index].status = new_status;
        if new_status & port_status::CONNECTED != 0 {
            ports.speeds[index] = Some(speed_from_hw_status(hw_status));
        }
    }

    /// Clear the hardware `C_PORT_*` latches for every observed change
    /// bit.
    fn clear_hw_changes(&self, port: u8, hw_change: u16) -> Result<()> {
        const CLEARS: [(u16, u16); 5] = [
            (hw_port_change::C_CONNECTION, hub_feature::C_PORT_CONNECTION),
            (hw_port_change::C_ENABLE, hub_feature::C_PORT_ENABLE),
            (hw_port_change::C_SUSPEND, hub_feature::C_PORT_SUSPEND),
            (
                hw_port_change::C_OVER_CURRENT,
                hub_feature::C_PORT_OVER_CURRENT,
            ),
            (hw_port_change::C_RESET, hub_feature::C_PORT_RESET),
        ];
        for (bit, selector) in CLEARS {
            if hw_change & bit != 0 {
                self.clear_feature(port, selector)?;
            }
        }
        Ok(())
    }

    /// Push one port's software status toward hardware. Root hubs go
    /// through the controller; downstream ports map onto hub class
    /// features (reset asserts via `SET_FEATURE` and self-clears, an
    /// explicit disable goes through `CLEAR_FEATURE(PORT_ENABLE)`).
    fn write_port_status(&self, port: u8, state: PortState) -> Result<()> {
        if self.is_root {
            let controller = self.device.controller()?;
            return controller.ops().set_root_hub_status(port, state);
        }
        if state.status & port_status::RESET != 0 {
            self.set_feature(port, hub_feature::PORT_RESET)?;
        } else if state.change & port_status::ENABLED != 0
            && state.status & port_status::ENABLED == 0
        {
            self.clear_feature(port, hub_feature::PORT_ENABLE)?;
        }
        Ok(())
    }

    fn wait_hub_over_current_clear(&self) -> Result<()> {
        let services = self.services()?;
        for _ in 0..STATUS_SPIN_LIMIT {
            let (status, _) = self.read_hub_status()?;
            if status & hub_status::OVER_CURRENT == 0 {
                return Ok(());
            }
            services.stall_ms(STATUS_SPIN_DELAY_MS);
        }
        log::error!(
            "usb: hub {}: over-current condition did not clear",
            self.device.address()
        );
        Err(UsbError::NotReady)
    }

    fn wait_port_over_current_clear(&self, port: u8) -> Result<()> {
        let services = self.services()?;
        for _ in 0..STATUS_SPIN_LIMIT {
            let (hw_status, _) = self.read_port_status_hw(port)?;
            if hw_status & crate::types::hw_port_status::OVER_CURRENT == 0 {
                return Ok(());
            }
            services.stall_ms(STATUS_SPIN_DELAY_MS);
        }
        log::error!(
            "usb: hub {}: port {} over-current did not clear",
            self.device.address(),
            port
        );
        Err(UsbError::NotReady)
    }

    fn wait_root_over_current_clear(&self, port: u8) -> Result<()> {
        let services = self.services()?;
        let index = (port - 1) as usize;
        for _ in 0..STATUS_SPIN_LIMIT {
            self.refresh_root_status()?;
            let state = self.ports.lock().states[index];
            if state.status & port_status::OVER_CURRENT == 0 {
                // Retire the hardware latch before software forgets the
                // change.
                return self.write_port_status(
                    port,
                    PortState {
                        status: state.status,
                        change: port_status::OVER_CURRENT,
                    },
                );
            }
            services.stall_ms(STATUS_SPIN_DELAY_MS);
        }
        log::error!("usb: root hub: port {} over-current did not clear", port);
        Err(UsbError::NotReady)
    }

    // ---- control transfer helper -------------------------------------

    /// `GET_STATUS` targeting the hub itself.
    fn read_hub_status(&self) -> Result<(u16, u16)> {
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST
                | request_type::TYPE_CLASS
                | request_type::RECIPIENT_DEVICE,
            standard_request::GET_STATUS,
            0,
            0,
            4,
        );
        let mut data = [0u8; 4];
        let bytes = self.control_in(setup, &mut data)?;
        if bytes < 4 {
            return Err(UsbError::BufferTooSmall);
        }
        Ok((
            u16::from_le_bytes([data[0], data[1]]),
            u16::from_le_bytes([data[2], data[3]]),
        ))
    }

    /// `GET_PORT_STATUS`: raw hardware status and change words.
    fn read_port_status_hw(&self, port: u8) -> Result<(u16, u16)> {
        debug_assert!(port >= 1 && port <= self.port_count);
        let setup = SetupPacket::new(
            request_type::DEVICE_TO_HOST
                | request_type::TYPE_CLASS
                | request_type::RECIPIENT_OTHER,
            standard_request::GET_STATUS,
            0,
            port as u16,
            4,
        );
        let mut data = [0u8; 4];
        let bytes = self.control_in(setup, &mut data)?;
        if bytes < 4 {
            return Err(UsbError::BufferTooSmall);
        }
        Ok((
            u16::from_le_bytes([data[0], data[1]]),
            u16::from_le_bytes([data[2], data[3]]),
        ))
    }

    fn set_feature(&self, port: u8, selector: u16) -> Result<()> {
        self.feature_request(standard_request::SET_FEATURE, port, selector, 0)
    }

    fn clear_feature(&self, port: u8, selector: u16) -> Result<()> {
        self.feature_request(standard_request::CLEAR_FEATURE, port, selector, 0)
    }

    fn set_port_indicator(&self, port: u8, indicator: u8) -> Result<()> {
        self.feature_request(
            standard_request::SET_FEATURE,
            port,
            hub_feature::PORT_INDICATOR,
            indicator,
        )
    }

    /// `SET_FEATURE`/`CLEAR_FEATURE`: port 0 addresses the hub itself,
    /// 1..=port_count address ports. Anything else is a caller bug.
    fn feature_request(&self, request: u8, port: u8, selector: u16, indicator: u8) -> Result<()> {
        debug_assert!(
            port <= self.port_count,
            "hub feature request for port {} of {}",
            port,
            self.port_count
        );
        let recipient = if port == 0 {
            request_type::RECIPIENT_DEVICE
        } else {
            request_type::RECIPIENT_OTHER
        };
        let setup = SetupPacket::new(
            request_type::HOST_TO_DEVICE | request_type::TYPE_CLASS | recipient,
            request,
            selector,
            ((indicator as u16) << 8) | port as u16,
            0,
        );
        self.control_out(setup, &[])
    }

    /// Serialized synchronous control-in request; copies the data stage
    /// out and returns its length.
    fn control_in(&self, setup: SetupPacket, data: &mut [u8]) -> Result<usize> {
        let mut control = self.control.lock();
        let bytes = control_request(&mut control, setup, None)?;
        let n = bytes.min(data.len());
        data[..n].copy_from_slice(&control.buffer.as_slice()[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + n]);
        Ok(n)
    }

    /// Serialized synchronous control-out request.
    fn control_out(&self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        let mut control = self.control.lock();
        let out = if data.is_empty() { None } else { Some(data) };
        control_request(&mut control, setup, out)?;
        Ok(())
    }

    fn services(&self) -> Result<Arc<dyn KernelServices>> {
        Ok(Arc::clone(self.device.controller()?.services()))
    }
}

impl fmt::Debug for UsbHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbHub")
            .field("device", &self.device.address())
            .field("is_root", &self.is_root)
            .field("port_count", &self.port_count)
            .finish()
    }
}

struct HubWorkItem {
    hub: Weak<UsbHub>,
}

impl WorkItem for HubWorkItem {
    fn run(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.run_worker();
        }
    }
}

/// Lay down the setup packet (and any data stage) in the hub buffer,
/// run the control transfer synchronously, and return the bytes
/// transferred exclusive of the setup packet — zero for out transfers.
fn control_request(
    control: &mut HubControl,
    setup: SetupPacket,
    out_data: Option<&[u8]>,
) -> Result<usize> {
    let data_len = setup.length as usize;
    if SETUP_PACKET_SIZE + data_len > HUB_CONTROL_TRANSFER_SIZE {
        return Err(UsbError::BufferTooSmall);
    }
    {
        let bytes = control.buffer.as_mut_slice();
        setup.write_to(&mut bytes[..SETUP_PACKET_SIZE]);
        if let Some(data) = out_data {
            if data.len() > data_len {
                return Err(UsbError::InvalidParameter);
            }
            bytes[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + data.len()].copy_from_slice(data);
        }
    }
    let region = control.buffer.region(0, SETUP_PACKET_SIZE + data_len)?;
    control.transfer.set_buffer(region, SETUP_PACKET_SIZE + data_len);
    control.transfer.set_direction(if setup.is_device_to_host() {
        TransferDirection::In
    } else {
        TransferDirection::Out
    });
    let bytes = control.transfer.submit_sync()?;
    Ok(bytes.saturating_sub(SETUP_PACKET_SIZE))
}

/// `GET_DESCRIPTOR(Hub)` during hub creation, before the hub object
/// exists.
fn read_hub_descriptor(control: &mut HubControl) -> Result<HubDescriptor> {
    let setup = SetupPacket::new(
        request_type::DEVICE_TO_HOST | request_type::TYPE_CLASS | request_type::RECIPIENT_DEVICE,
        standard_request::GET_DESCRIPTOR,
        (descriptor_type::HUB as u16) << 8,
        0,
        HubDescriptor::MAX_LENGTH as u16,
    );
    let bytes = control_request(control, setup, None)?;
    let mut data = [0u8; HubDescriptor::MAX_LENGTH];
    let n = bytes.min(HubDescriptor::MAX_LENGTH);
    data[..n].copy_from_slice(&control.buffer.as_slice()[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + n]);
    HubDescriptor::parse(&data[..n])
}
