//! USB 2.0 wire constants and shared protocol types.

use static_assertions::const_assert_eq;

/// Size of the setup packet that begins every control transfer buffer.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Highest assignable bus address. Address 0 is used only during
/// enumeration.
pub const MAX_BUS_ADDRESS: u8 = 127;

/// USB descriptor types.
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const HUB: u8 = 0x29;
}

/// USB standard request codes.
pub mod standard_request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// Fields of the `bmRequestType` byte.
pub mod request_type {
    pub const DEVICE_TO_HOST: u8 = 0x80;
    pub const HOST_TO_DEVICE: u8 = 0x00;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const TYPE_VENDOR: u8 = 0x40;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const RECIPIENT_OTHER: u8 = 0x03;
}

/// Standard feature selectors.
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// Hub class feature selectors (USB 2.0 table 11-17).
pub mod hub_feature {
    pub const C_HUB_LOCAL_POWER: u16 = 0;
    pub const C_HUB_OVER_CURRENT: u16 = 1;
    pub const PORT_CONNECTION: u16 = 0;
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_OVER_CURRENT: u16 = 3;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const PORT_LOW_SPEED: u16 = 9;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
    pub const PORT_TEST: u16 = 21;
    pub const PORT_INDICATOR: u16 = 22;
}

/// Port indicator selectors for `SET_FEATURE(PORT_INDICATOR)`.
pub mod port_indicator {
    pub const AUTOMATIC: u8 = 0;
    pub const AMBER: u8 = 1;
    pub const GREEN: u8 = 2;
    pub const OFF: u8 = 3;
}

/// Software port status bits. The change word uses the identical bit
/// positions: a change bit is set iff the corresponding status bit has
/// transitioned since the last observation.
pub mod port_status {
    pub const CONNECTED: u16 = 1 << 0;
    pub const ENABLED: u16 = 1 << 1;
    pub const SUSPENDED: u16 = 1 << 2;
    pub const OVER_CURRENT: u16 = 1 << 3;
    pub const RESET: u16 = 1 << 4;
    pub const ALL: u16 = CONNECTED | ENABLED | SUSPENDED | OVER_CURRENT | RESET;
}

/// Hardware `wPortStatus` bits returned by `GET_PORT_STATUS`. The low
/// five bits line up with the software reduction in [`port_status`].
pub mod hw_port_status {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const SUSPEND: u16 = 1 << 2;
    pub const OVER_CURRENT: u16 = 1 << 3;
    pub const RESET: u16 = 1 << 4;
    pub const POWER: u16 = 1 << 8;
    pub const LOW_SPEED: u16 = 1 << 9;
    pub const HIGH_SPEED: u16 = 1 << 10;
    pub const TEST_MODE: u16 = 1 << 11;
    pub const INDICATOR: u16 = 1 << 12;
}

/// Hardware `wPortChange` bits.
pub mod hw_port_change {
    pub const C_CONNECTION: u16 = 1 << 0;
    pub const C_ENABLE: u16 = 1 << 1;
    pub const C_SUSPEND: u16 = 1 << 2;
    pub const C_OVER_CURRENT: u16 = 1 << 3;
    pub const C_RESET: u16 = 1 << 4;
}

/// Hub-wide `wHubStatus`/`wHubChange` bits.
pub mod hub_status {
    pub const LOCAL_POWER: u16 = 1 << 0;
    pub const OVER_CURRENT: u16 = 1 << 1;
}

/// Software view of one port: status bits plus the change delta from the
/// last observed hardware state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortState {
    pub status: u16,
    pub change: u16,
}

impl PortState {
    pub fn connected(&self) -> bool {
        self.status & port_status::CONNECTED != 0
    }

    pub fn enabled(&self) -> bool {
        self.status & port_status::ENABLED != 0
    }

    pub fn over_current(&self) -> bool {
        self.status & port_status::OVER_CURRENT != 0
    }
}

/// Reduce a hardware `wPortStatus` word to the software status bits.
pub fn reduce_hw_status(hw: u16) -> u16 {
    hw & port_status::ALL
}

/// Derive the attached device speed from a hardware `wPortStatus` word.
pub fn speed_from_hw_status(hw: u16) -> UsbSpeed {
    if hw & hw_port_status::LOW_SPEED != 0 {
        UsbSpeed::Low
    } else if hw & hw_port_status::HIGH_SPEED != 0 {
        UsbSpeed::High
    } else {
        UsbSpeed::Full
    }
}

/// USB device speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low speed (1.5 Mbit/s)
    Low,
    /// Full speed (12 Mbit/s)
    Full,
    /// High speed (480 Mbit/s)
    High,
}

impl UsbSpeed {
    /// Default max packet size of the control endpoint at this speed.
    pub fn max_control_packet(self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 64,
            UsbSpeed::High => 64,
        }
    }
}

/// Transfer data direction. `Invalid` is the unfilled default and is
/// rejected at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Invalid,
    In,
    Out,
}

/// USB endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode the `bmAttributes` transfer-type field of an endpoint
    /// descriptor.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Direction bit of an endpoint address byte.
pub const ENDPOINT_DIRECTION_IN: u8 = 0x80;

/// Compose an endpoint address byte from a number and direction.
pub fn endpoint_address(number: u8, device_to_host: bool) -> u8 {
    let base = number & 0x0F;
    if device_to_host {
        base | ENDPOINT_DIRECTION_IN
    } else {
        base
    }
}

/// The eight bytes at offset 0 of every control transfer buffer.
/// [`SetupPacket::write_to`] and [`SetupPacket::read_from`] fix the
/// little-endian byte layout on the wire.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    /// `bmRequestType`: direction, type, and recipient bits, composed
    /// from the [`request_type`] constants.
    pub request_type: u8,
    /// `bRequest` code, standard or class-defined.
    pub request: u8,
    /// `wValue`: feature selector, descriptor type/index, or
    /// configuration value, depending on the request.
    pub value: u16,
    /// `wIndex`: port number, endpoint address, or indicator selector
    /// in this crate's requests.
    pub index: u16,
    /// `wLength`: how many data-stage bytes follow the setup packet.
    pub length: u16,
}

const_assert_eq!(core::mem::size_of::<SetupPacket>(), SETUP_PACKET_SIZE);

impl SetupPacket {
    /// Assemble a packet from raw request fields.
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Check if this is a device-to-host transfer
    pub fn is_device_to_host(&self) -> bool {
        (self.request_type & request_type::DEVICE_TO_HOST) != 0
    }

    /// Encode into the first eight bytes of a control transfer buffer.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
    }

    /// Decode from the first eight bytes of a control transfer buffer.
    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}
