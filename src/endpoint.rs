//! USB Endpoint Management

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;

use spin::Mutex;

use crate::controller::HostController;
use crate::descriptor::EndpointInfo;
use crate::error::Result;
use crate::types::{EndpointType, UsbSpeed, ENDPOINT_DIRECTION_IN};

/// A communication sink on a device.
///
/// Endpoints are reference counted: the device's endpoint registry and
/// every transfer targeting the endpoint share one `Arc`. When the last
/// reference drops, the controller's destroy operation runs.
pub struct Endpoint {
    /// Endpoint address byte, direction bit included.
    address: u8,
    endpoint_type: EndpointType,
    max_packet_size: u16,
    /// Raw `bInterval` wire value.
    poll_rate: u8,
    controller: Weak<HostController>,
    /// Opaque per-endpoint scheduling state owned by the controller.
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Endpoint {
    pub(crate) fn create(
        controller: &Arc<HostController>,
        info: &EndpointInfo,
    ) -> Result<Arc<Endpoint>> {
        let endpoint = Arc::new(Endpoint {
            address: info.address,
            endpoint_type: info.endpoint_type,
            max_packet_size: info.max_packet_size,
            poll_rate: info.interval,
            controller: Arc::downgrade(controller),
            context: Mutex::new(None),
        });
        let context = controller.ops().create_endpoint(&endpoint)?;
        *endpoint.context.lock() = Some(context);
        Ok(endpoint)
    }

    /// Endpoint address byte, direction bit included.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Endpoint number (0-15).
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIRECTION_IN != 0
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Raw `bInterval` wire value.
    pub fn poll_rate(&self) -> u8 {
        self.poll_rate
    }

    /// Scheduling period in (micro)frames. High-speed interrupt and
    /// isochronous endpoints encode period 2^(x-1); other combinations
    /// use the wire value directly.
    pub fn period_frames(&self, speed: UsbSpeed) -> u32 {
        match self.endpoint_type {
            EndpointType::Interrupt | EndpointType::Isochronous => {
                if speed == UsbSpeed::High {
                    if self.poll_rate == 0 {
                        1
                    } else {
                        1 << (self.poll_rate.min(16) - 1)
                    }
                } else {
                    self.poll_rate.max(1) as u32
                }
            }
            _ => 0,
        }
    }

    /// Reset the endpoint's data toggle to DATA0. Required after an
    /// endpoint halt clears.
    pub fn reset_toggle(&self) -> Result<()> {
        let controller = self.controller()?;
        controller.ops().reset_endpoint(self)
    }

    /// Busy-wait the controller's pending transfers on this endpoint.
    /// Polled-mode only; optional for controllers.
    pub fn flush(&self) -> Result<()> {
        let controller = self.controller()?;
        controller.ops().flush_endpoint(self)
    }

    /// The controller's opaque per-endpoint context.
    pub fn controller_context(&self) -> &Mutex<Option<Box<dyn Any + Send + Sync>>> {
        &self.context
    }

    fn controller(&self) -> Result<Arc<HostController>> {
        self.controller
            .upgrade()
            .ok_or(crate::error::UsbError::ControllerGone)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(context) = self.context.get_mut().take() {
            if let Some(controller) = self.controller.upgrade() {
                controller.ops().destroy_endpoint(self, context);
            }
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &format_args!("{:#04x}", self.address))
            .field("type", &self.endpoint_type)
            .field("max_packet_size", &self.max_packet_size)
            .field("poll_rate", &self.poll_rate)
            .finish()
    }
}
