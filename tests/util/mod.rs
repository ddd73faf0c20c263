//! Shared test harness: a mock kernel with a small work-queue thread
//! pool and a scripted host controller that models root ports and one
//! downstream hub device.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use usb_core::controller::{
    register_controller, ControllerRegistration, HostController, HostControllerOps,
    HOST_CONTROLLER_INTERFACE_VERSION,
};
use usb_core::device::UsbDevice;
use usb_core::endpoint::Endpoint;
use usb_core::error::{Result, TransferError, UsbError};
use usb_core::platform::{KernelServices, WorkItem};
use usb_core::transfer::UsbTransfer;
use usb_core::types::{
    hub_feature, hub_status, hw_port_change, hw_port_status, port_status, standard_request,
    PortState, SetupPacket, UsbSpeed, SETUP_PACKET_SIZE,
};
use usb_core::UsbHub;

pub type EnumerateFn =
    Box<dyn Fn(&Arc<UsbDevice>, u8, UsbSpeed) -> Result<Arc<UsbDevice>> + Send + Sync>;

/// Mock kernel services. Work items run on a two-thread pool that never
/// runs the same item concurrently with itself, matching the work-queue
/// contract. Stalls are recorded, not slept.
pub struct MockKernel {
    queue: Mutex<VecDeque<Arc<dyn WorkItem>>>,
    running: Mutex<Vec<usize>>,
    pub stalls: Mutex<Vec<u32>>,
    pub topology_notifications: AtomicUsize,
    pub device_errors: Mutex<Vec<UsbError>>,
    pub enumerated: Mutex<Vec<(u8, UsbSpeed)>>,
    pub enumerate_handler: Mutex<Option<EnumerateFn>>,
    pub paging_items: AtomicUsize,
}

impl MockKernel {
    pub fn new() -> Arc<MockKernel> {
        let kernel = Arc::new(MockKernel {
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(Vec::new()),
            stalls: Mutex::new(Vec::new()),
            topology_notifications: AtomicUsize::new(0),
            device_errors: Mutex::new(Vec::new()),
            enumerated: Mutex::new(Vec::new()),
            enumerate_handler: Mutex::new(None),
            paging_items: AtomicUsize::new(0),
        });
        for _ in 0..2 {
            let weak = Arc::downgrade(&kernel);
            thread::spawn(move || worker_loop(weak));
        }
        kernel
    }

    fn take_item(&self) -> Option<Arc<dyn WorkItem>> {
        let mut queue = self.queue.lock().unwrap();
        let mut running = self.running.lock().unwrap();
        for index in 0..queue.len() {
            let key = Arc::as_ptr(&queue[index]) as *const () as usize;
            if !running.contains(&key) {
                running.push(key);
                return queue.remove(index);
            }
        }
        None
    }

    fn finish_item(&self, item: &Arc<dyn WorkItem>) {
        let key = Arc::as_ptr(item) as *const () as usize;
        let mut running = self.running.lock().unwrap();
        if let Some(position) = running.iter().position(|&k| k == key) {
            running.remove(position);
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.lock().unwrap().is_empty() && self.running.lock().unwrap().is_empty()
    }

    /// Block until every queued work item has run to completion.
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.is_idle() {
                // Settle: an item may queue a successor as it finishes.
                thread::sleep(Duration::from_millis(2));
                if self.is_idle() {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "work queue did not drain");
            thread::yield_now();
        }
    }

    pub fn stalls_snapshot(&self) -> Vec<u32> {
        self.stalls.lock().unwrap().clone()
    }
}

fn worker_loop(kernel: Weak<MockKernel>) {
    loop {
        let kernel = match kernel.upgrade() {
            Some(kernel) => kernel,
            None => return,
        };
        match kernel.take_item() {
            Some(item) => {
                item.run();
                kernel.finish_item(&item);
            }
            None => thread::sleep(Duration::from_micros(200)),
        }
    }
}

impl KernelServices for MockKernel {
    fn queue_work(&self, item: Arc<dyn WorkItem>) {
        self.queue.lock().unwrap().push_back(item);
    }

    fn queue_paging_work(&self, item: Arc<dyn WorkItem>) {
        self.paging_items.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(item);
    }

    fn stall_ms(&self, ms: u32) {
        self.stalls.lock().unwrap().push(ms);
    }

    fn notify_children_changed(&self, _device: &Arc<UsbDevice>) {
        self.topology_notifications.fetch_add(1, Ordering::SeqCst);
    }

    fn report_device_error(&self, _device: &Arc<UsbDevice>, error: UsbError) {
        self.device_errors.lock().unwrap().push(error);
    }

    fn enumerate_child(
        &self,
        hub_device: &Arc<UsbDevice>,
        port: u8,
        speed: UsbSpeed,
    ) -> Result<Arc<UsbDevice>> {
        self.enumerated.lock().unwrap().push((port, speed));
        if let Some(handler) = self.enumerate_handler.lock().unwrap().as_ref() {
            return handler(hub_device, port, speed);
        }
        let controller = hub_device.controller()?;
        let address = controller.reserve_address()?;
        UsbDevice::new(&controller, address, speed, port)
    }
}

/// Root port registers: visible status with latched change bits, plus
/// physical presence and speed.
pub struct RootModel {
    pub states: Vec<PortState>,
    pub speeds: Vec<Option<UsbSpeed>>,
    pub present: Vec<bool>,
    /// Status reads left before a latched over-current clears.
    pub oc_countdown: Vec<u32>,
}

/// A scripted downstream hub device answering on its control endpoint.
pub struct HubModel {
    pub address: u8,
    pub num_ports: u8,
    pub descriptor: Vec<u8>,
    pub port_status: Vec<u16>,
    pub port_change: Vec<u16>,
    pub hub_status: u16,
    pub hub_change: u16,
    pub hub_oc_countdown: u32,
    pub port_oc_countdown: Vec<u32>,
    pub set_features: Vec<(u8, u16)>,
    pub cleared_features: Vec<(u8, u16)>,
    pub configurations_set: Vec<u8>,
    pub halt_clears: usize,
    pub fail_clear_halt: bool,
}

impl HubModel {
    pub fn new(address: u8, num_ports: u8, power_delay_2ms: u8) -> HubModel {
        let count = num_ports as usize;
        HubModel {
            address,
            num_ports,
            descriptor: vec![9, 0x29, num_ports, 0x09, 0x00, power_delay_2ms, 0, 0x08, 0xFF],
            port_status: vec![0; count],
            port_change: vec![0; count],
            hub_status: 0,
            hub_change: 0,
            hub_oc_countdown: 0,
            port_oc_countdown: vec![0; count],
            set_features: Vec::new(),
            cleared_features: Vec::new(),
            configurations_set: Vec::new(),
            halt_clears: 0,
            fail_clear_halt: false,
        }
    }

    pub fn connect(&mut self, port: u8, speed: UsbSpeed) {
        let index = (port - 1) as usize;
        self.port_status[index] |= hw_port_status::CONNECTION;
        match speed {
            UsbSpeed::Low => self.port_status[index] |= hw_port_status::LOW_SPEED,
            UsbSpeed::High => self.port_status[index] |= hw_port_status::HIGH_SPEED,
            UsbSpeed::Full => {}
        }
        self.port_change[index] |= hw_port_change::C_CONNECTION;
    }
}

pub struct MockState {
    pub controller: Mutex<Option<Weak<HostController>>>,
    pub pending: Mutex<Vec<Arc<UsbTransfer>>>,
    pub auto_complete: AtomicBool,
    pub fail_submit_once: AtomicBool,
    pub root: Mutex<RootModel>,
    pub hub_model: Mutex<Option<HubModel>>,
    pub submits: AtomicUsize,
    pub created_transfers: AtomicUsize,
    pub destroyed_transfers: AtomicUsize,
    pub created_endpoints: AtomicUsize,
    pub destroyed_endpoints: AtomicUsize,
    pub endpoint_resets: AtomicUsize,
}

impl MockState {
    pub fn new(root_ports: u8) -> Arc<MockState> {
        let count = root_ports as usize;
        Arc::new(MockState {
            controller: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            auto_complete: AtomicBool::new(true),
            fail_submit_once: AtomicBool::new(false),
            root: Mutex::new(RootModel {
                states: vec![PortState::default(); count],
                speeds: vec![None; count],
                present: vec![false; count],
                oc_countdown: vec![0; count],
            }),
            hub_model: Mutex::new(None),
            submits: AtomicUsize::new(0),
            created_transfers: AtomicUsize::new(0),
            destroyed_transfers: AtomicUsize::new(0),
            created_endpoints: AtomicUsize::new(0),
            destroyed_endpoints: AtomicUsize::new(0),
            endpoint_resets: AtomicUsize::new(0),
        })
    }

    fn host(&self) -> Arc<HostController> {
        self.controller
            .lock()
            .unwrap()
            .as_ref()
            .expect("controller weak not attached")
            .upgrade()
            .expect("controller gone")
    }

    /// Complete a transfer back through the core, as the hardware would
    /// at dispatch level.
    pub fn complete(&self, transfer: Arc<UsbTransfer>, error: TransferError, bytes: usize) {
        transfer.set_status(error, bytes);
        self.host().process_completed_transfer(transfer);
    }

    /// Complete the oldest pending transfer.
    pub fn complete_next(&self, error: TransferError, bytes: usize) {
        let transfer = self.pending.lock().unwrap().remove(0);
        self.complete(transfer, error, bytes);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn take_hub_interrupt(&self) -> Arc<UsbTransfer> {
        let mut pending = self.pending.lock().unwrap();
        let position = pending
            .iter()
            .position(|t| t.endpoint_address() & 0x80 != 0)
            .expect("no interrupt transfer pending");
        pending.remove(position)
    }

    pub fn hub_interrupt_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.endpoint_address() & 0x80 != 0)
    }

    /// Fire the hub's interrupt transfer with a changed-ports payload.
    pub fn fire_hub_interrupt(&self, payload: &[u8]) {
        let transfer = self.take_hub_interrupt();
        if !payload.is_empty() {
            let region = transfer.buffer_region().unwrap();
            region.copy_from(0, payload);
        }
        self.complete(transfer, TransferError::None, payload.len());
    }

    /// Fail the hub's interrupt transfer with the given kind.
    pub fn fail_hub_interrupt(&self, error: TransferError) {
        let transfer = self.take_hub_interrupt();
        self.complete(transfer, error, 0);
    }

    fn dispatch(&self, transfer: Arc<UsbTransfer>) {
        let device_address = transfer.device().address();
        let is_model = self
            .hub_model
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.address == device_address)
            .unwrap_or(false);
        if is_model {
            if transfer.endpoint_address() == 0 {
                self.handle_hub_control(transfer);
            } else {
                self.pending.lock().unwrap().push(transfer);
            }
            return;
        }
        if self.auto_complete.load(Ordering::SeqCst) {
            let bytes = transfer.length();
            self.complete(transfer, TransferError::None, bytes);
        } else {
            self.pending.lock().unwrap().push(transfer);
        }
    }

    fn handle_hub_control(&self, transfer: Arc<UsbTransfer>) {
        let region = transfer.buffer_region().unwrap();
        let mut raw = [0u8; SETUP_PACKET_SIZE];
        region.copy_to(0, &mut raw);
        let setup = SetupPacket::read_from(&raw);
        let request_type = setup.request_type;
        let request = setup.request;
        let value = setup.value;
        let index = setup.index;
        let length = setup.length as usize;

        let mut response: Vec<u8> = Vec::new();
        let mut error = TransferError::None;
        {
            let mut guard = self.hub_model.lock().unwrap();
            let model = guard.as_mut().unwrap();
            match (request_type, request) {
                // Class, device-to-host, hub recipient.
                (0xA0, standard_request::GET_DESCRIPTOR) => {
                    response = model.descriptor.clone();
                }
                (0xA0, standard_request::GET_STATUS) => {
                    if model.hub_oc_countdown > 0 {
                        model.hub_oc_countdown -= 1;
                        if model.hub_oc_countdown == 0 {
                            model.hub_status &= !hub_status::OVER_CURRENT;
                        }
                    }
                    response.extend_from_slice(&model.hub_status.to_le_bytes());
                    response.extend_from_slice(&model.hub_change.to_le_bytes());
                }
                // Class, device-to-host, port recipient.
                (0xA3, standard_request::GET_STATUS) => {
                    let i = (index as usize & 0xFF) - 1;
                    if model.port_oc_countdown[i] > 0 {
                        model.port_oc_countdown[i] -= 1;
                        if model.port_oc_countdown[i] == 0 {
                            model.port_status[i] &= !hw_port_status::OVER_CURRENT;
                        }
                    }
                    response.extend_from_slice(&model.port_status[i].to_le_bytes());
                    response.extend_from_slice(&model.port_change[i].to_le_bytes());
                }
                // Class, host-to-device, hub recipient.
                (0x20, standard_request::CLEAR_FEATURE) => {
                    model.cleared_features.push((0, value));
                    match value {
                        hub_feature::C_HUB_LOCAL_POWER => {
                            model.hub_change &= !hub_status::LOCAL_POWER
                        }
                        hub_feature::C_HUB_OVER_CURRENT => {
                            model.hub_change &= !hub_status::OVER_CURRENT
                        }
                        _ => {}
                    }
                }
                // Class, host-to-device, port recipient.
                (0x23, standard_request::SET_FEATURE) => {
                    let port = (index & 0xFF) as u8;
                    let i = (port - 1) as usize;
                    model.set_features.push((port, value));
                    match value {
                        hub_feature::PORT_POWER => {
                            model.port_status[i] |= hw_port_status::POWER;
                        }
                        hub_feature::PORT_RESET => {
                            if model.port_status[i] & hw_port_status::CONNECTION != 0 {
                                model.port_status[i] |= hw_port_status::ENABLE;
                            }
                            model.port_change[i] |= hw_port_change::C_RESET;
                        }
                        hub_feature::PORT_INDICATOR => {}
                        _ => {}
                    }
                }
                (0x23, standard_request::CLEAR_FEATURE) => {
                    let port = (index & 0xFF) as u8;
                    let i = (port - 1) as usize;
                    model.cleared_features.push((port, value));
                    match value {
                        hub_feature::C_PORT_CONNECTION => {
                            model.port_change[i] &= !hw_port_change::C_CONNECTION
                        }
                        hub_feature::C_PORT_ENABLE => {
                            model.port_change[i] &= !hw_port_change::C_ENABLE
                        }
                        hub_feature::C_PORT_SUSPEND => {
                            model.port_change[i] &= !hw_port_change::C_SUSPEND
                        }
                        hub_feature::C_PORT_OVER_CURRENT => {
                            model.port_change[i] &= !hw_port_change::C_OVER_CURRENT
                        }
                        hub_feature::C_PORT_RESET => {
                            model.port_change[i] &= !hw_port_change::C_RESET
                        }
                        hub_feature::PORT_ENABLE => {
                            model.port_status[i] &= !hw_port_status::ENABLE
                        }
                        hub_feature::PORT_POWER => {
                            model.port_status[i] &= !hw_port_status::POWER
                        }
                        _ => {}
                    }
                }
                // Standard, host-to-device, device recipient.
                (0x00, standard_request::SET_CONFIGURATION) => {
                    model.configurations_set.push(value as u8);
                }
                // Standard, host-to-device, endpoint recipient.
                (0x02, standard_request::CLEAR_FEATURE) => {
                    model.halt_clears += 1;
                    if model.fail_clear_halt {
                        error = TransferError::Stalled;
                    }
                }
                _ => {}
            }
        }

        let bytes = if setup.is_device_to_host() {
            let n = response.len().min(length);
            if n > 0 {
                region.copy_from(SETUP_PACKET_SIZE, &response[..n]);
            }
            SETUP_PACKET_SIZE + n
        } else {
            SETUP_PACKET_SIZE
        };
        self.complete(transfer, error, bytes);
    }
}

pub struct MockHcd(pub Arc<MockState>);

impl HostControllerOps for MockHcd {
    fn create_endpoint(&self, _endpoint: &Endpoint) -> Result<Box<dyn std::any::Any + Send + Sync>> {
        self.0.created_endpoints.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(()))
    }

    fn destroy_endpoint(&self, _endpoint: &Endpoint, _context: Box<dyn std::any::Any + Send + Sync>) {
        self.0.destroyed_endpoints.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_endpoint(&self, _endpoint: &Endpoint) -> Result<()> {
        self.0.endpoint_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_transfer(&self, _transfer: &UsbTransfer) -> Result<Box<dyn std::any::Any + Send + Sync>> {
        self.0.created_transfers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(()))
    }

    fn destroy_transfer(&self, _transfer: &UsbTransfer, _context: Box<dyn std::any::Any + Send + Sync>) {
        self.0.destroyed_transfers.fetch_add(1, Ordering::SeqCst);
    }

    fn submit_transfer(&self, transfer: &Arc<UsbTransfer>) -> Result<()> {
        if self.0.fail_submit_once.swap(false, Ordering::SeqCst) {
            return Err(UsbError::NotReady);
        }
        self.0.submits.fetch_add(1, Ordering::SeqCst);
        self.0.dispatch(Arc::clone(transfer));
        Ok(())
    }

    fn submit_polled(&self, transfer: &Arc<UsbTransfer>) -> Result<()> {
        let bytes = transfer.length();
        self.0
            .complete(Arc::clone(transfer), TransferError::None, bytes);
        Ok(())
    }

    fn cancel_transfer(&self, transfer: &Arc<UsbTransfer>) -> Result<()> {
        let found = {
            let mut pending = self.0.pending.lock().unwrap();
            match pending.iter().position(|t| Arc::ptr_eq(t, transfer)) {
                Some(position) => Some(pending.remove(position)),
                None => None,
            }
        };
        match found {
            Some(transfer) => {
                self.0.complete(transfer, TransferError::Cancelled, 0);
                Ok(())
            }
            None => Err(UsbError::TooLate),
        }
    }

    fn get_root_hub_status(
        &self,
        ports: &mut [PortState],
        speeds: &mut [Option<UsbSpeed>],
    ) -> Result<()> {
        let mut root = self.0.root.lock().unwrap();
        for i in 0..root.states.len() {
            if root.oc_countdown[i] > 0 {
                root.oc_countdown[i] -= 1;
                if root.oc_countdown[i] == 0 {
                    root.states[i].status &= !port_status::OVER_CURRENT;
                }
            }
        }
        for (i, state) in root.states.iter().enumerate() {
            ports[i] = *state;
            speeds[i] = root.speeds[i];
        }
        Ok(())
    }

    fn set_root_hub_status(&self, port: u8, state: PortState) -> Result<()> {
        let mut root = self.0.root.lock().unwrap();
        let i = (port - 1) as usize;
        root.states[i].change &= !state.change;
        if state.status & port_status::RESET != 0 {
            root.states[i].status &= !port_status::ENABLED;
        } else if state.status & port_status::ENABLED != 0 && root.present[i] {
            root.states[i].status |= port_status::ENABLED;
        }
        Ok(())
    }
}

pub struct TestRig {
    pub kernel: Arc<MockKernel>,
    pub state: Arc<MockState>,
    pub controller: Arc<HostController>,
}

/// Register a mock controller with `root_ports` root ports.
pub fn rig(root_ports: u8) -> TestRig {
    let kernel = MockKernel::new();
    let state = MockState::new(root_ports);
    let services: Arc<dyn KernelServices> = kernel.clone();
    let controller = register_controller(
        ControllerRegistration {
            interface_version: HOST_CONTROLLER_INTERFACE_VERSION,
            identifier: 0x8086_24cd,
            debug_subtype: None,
            port_count: root_ports,
            io_pool: None,
        },
        Box::new(MockHcd(Arc::clone(&state))),
        services,
    )
    .expect("controller registration failed");
    *state.controller.lock().unwrap() = Some(Arc::downgrade(&controller));
    TestRig {
        kernel,
        state,
        controller,
    }
}

impl TestRig {
    /// Flag a root port as carrying a newly connected device.
    pub fn connect_root_device(&self, port: u8, speed: UsbSpeed) {
        let mut root = self.state.root.lock().unwrap();
        let i = (port - 1) as usize;
        root.states[i].status |= port_status::CONNECTED;
        root.states[i].change |= port_status::CONNECTED;
        root.present[i] = true;
        root.speeds[i] = Some(speed);
    }

    /// Create a device with a generic one-interface configuration
    /// (bulk IN 0x81, bulk OUT 0x02) and claim it.
    pub fn plain_device(&self) -> Arc<UsbDevice> {
        let address = self.controller.reserve_address().unwrap();
        let device = UsbDevice::new(&self.controller, address, UsbSpeed::High, 1).unwrap();
        device.cache_configuration(&generic_config_blob()).unwrap();
        device.claim_interface(0).unwrap();
        device
    }

    /// Create a downstream hub device backed by the scripted hub model.
    pub fn downstream_hub(&self, num_ports: u8, power_delay_2ms: u8) -> (Arc<UsbDevice>, Arc<UsbHub>) {
        self.downstream_hub_full(num_ports, power_delay_2ms, false)
    }

    pub fn downstream_hub_full(
        &self,
        num_ports: u8,
        power_delay_2ms: u8,
        indicators: bool,
    ) -> (Arc<UsbDevice>, Arc<UsbHub>) {
        let address = self.controller.reserve_address().unwrap();
        let device = UsbDevice::new(&self.controller, address, UsbSpeed::High, 1).unwrap();
        device.cache_configuration(&hub_config_blob()).unwrap();
        let mut model = HubModel::new(address, num_ports, power_delay_2ms);
        if indicators {
            // Hub characteristics bit 7: port indicators supported.
            model.descriptor[3] |= 0x80;
        }
        *self.state.hub_model.lock().unwrap() = Some(model);
        let hub = UsbHub::create(&device).expect("hub create failed");
        (device, hub)
    }
}

/// Configuration blob for a hub-class device: one interface with one
/// interrupt-IN endpoint (0x81).
pub fn hub_config_blob() -> Vec<u8> {
    vec![
        9, 0x02, 25, 0, 1, 1, 0, 0xE0, 0, // configuration 1
        9, 0x04, 0, 0, 1, 0x09, 0, 0, 0, // interface 0, hub class
        7, 0x05, 0x81, 0x03, 0x02, 0x00, 0x0C, // interrupt IN, 2 bytes
    ]
}

/// Configuration blob for a generic device: bulk IN 0x81 and bulk OUT
/// 0x02.
pub fn generic_config_blob() -> Vec<u8> {
    vec![
        9, 0x02, 32, 0, 1, 1, 0, 0xC0, 0, // configuration 1
        9, 0x04, 0, 0, 2, 0xFF, 0, 0, 0, // interface 0, vendor class
        7, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00, // bulk IN
        7, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00, // bulk OUT
    ]
}

/// Assert that `needle` occurs as a subsequence of `haystack`.
pub fn assert_subsequence(haystack: &[u32], needle: &[u32]) {
    let mut iter = haystack.iter();
    for want in needle {
        assert!(
            iter.any(|got| got == want),
            "expected {:?} as a subsequence of {:?}",
            needle,
            haystack
        );
    }
}
