//! USB descriptor parsing.
//!
//! Configuration descriptors are parsed once per device and cached; the
//! transfer engine only reads endpoint descriptors through the cached
//! form.

use alloc::vec::Vec;

use crate::error::{Result, UsbError};
use crate::types::{descriptor_type, EndpointType, ENDPOINT_DIRECTION_IN};

/// One endpoint of a parsed interface.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    /// Endpoint address byte, direction bit included.
    pub address: u8,
    pub endpoint_type: EndpointType,
    pub max_packet_size: u16,
    /// Raw `bInterval` wire value; decoding is speed-dependent.
    pub interval: u8,
}

impl EndpointInfo {
    pub const DESCRIPTOR_LENGTH: usize = 7;

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIRECTION_IN != 0
    }
}

/// One interface of a parsed configuration.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// A parsed configuration descriptor blob.
#[derive(Debug, Clone)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

impl ConfigurationInfo {
    pub const DESCRIPTOR_LENGTH: usize = 9;

    pub fn interface(&self, number: u8) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|i| i.number == number)
    }
}

/// Parse a full configuration descriptor blob (the configuration
/// descriptor followed by its interface and endpoint descriptors).
pub fn parse_configuration(data: &[u8]) -> Result<ConfigurationInfo> {
    if data.len() < ConfigurationInfo::DESCRIPTOR_LENGTH
        || data[1] != descriptor_type::CONFIGURATION
    {
        return Err(UsbError::InvalidParameter);
    }
    let total_length = u16::from_le_bytes([data[2], data[3]]) as usize;
    let data = &data[..total_length.min(data.len())];

    let mut config = ConfigurationInfo {
        value: data[5],
        attributes: data[7],
        max_power: data[8],
        interfaces: Vec::new(),
    };

    let mut offset = data[0] as usize;
    while offset + 2 <= data.len() {
        let length = data[offset] as usize;
        if length < 2 || offset + length > data.len() {
            return Err(UsbError::InvalidParameter);
        }
        let descriptor = &data[offset..offset + length];
        match descriptor[1] {
            descriptor_type::INTERFACE => {
                if length < 9 {
                    return Err(UsbError::InvalidParameter);
                }
                config.interfaces.push(InterfaceInfo {
                    number: descriptor[2],
                    alternate_setting: descriptor[3],
                    class: descriptor[5],
                    subclass: descriptor[6],
                    protocol: descriptor[7],
                    endpoints: Vec::new(),
                });
            }
            descriptor_type::ENDPOINT => {
                if length < EndpointInfo::DESCRIPTOR_LENGTH {
                    return Err(UsbError::InvalidParameter);
                }
                let interface = config
                    .interfaces
                    .last_mut()
                    .ok_or(UsbError::InvalidParameter)?;
                interface.endpoints.push(EndpointInfo {
                    address: descriptor[2],
                    endpoint_type: EndpointType::from_attributes(descriptor[3]),
                    max_packet_size: u16::from_le_bytes([descriptor[4], descriptor[5]]) & 0x07FF,
                    interval: descriptor[6],
                });
            }
            // Class and vendor descriptors interleave freely.
            _ => {}
        }
        offset += length;
    }

    Ok(config)
}

/// Hub class descriptor (USB 2.0 §11.23.2.1).
#[derive(Debug, Clone, Copy)]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub characteristics: u16,
    /// Time from port power-on to power-good, in 2 ms units.
    pub power_on_to_power_good: u8,
    pub hub_control_current: u8,
}

impl HubDescriptor {
    /// Fixed header length; the per-port bitmaps that follow vary.
    pub const MIN_LENGTH: usize = 7;

    /// Largest descriptor a 127-port hub can return.
    pub const MAX_LENGTH: usize = 7 + 2 * 16;

    /// Characteristics bit indicating port indicator support.
    pub const PORT_INDICATORS: u16 = 0x0080;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LENGTH
            || (data[0] as usize) < Self::MIN_LENGTH
            || data[1] != descriptor_type::HUB
        {
            return Err(UsbError::InvalidParameter);
        }
        Ok(Self {
            num_ports: data[2],
            characteristics: u16::from_le_bytes([data[3], data[4]]),
            power_on_to_power_good: data[5],
            hub_control_current: data[6],
        })
    }

    pub fn supports_indicators(&self) -> bool {
        self.characteristics & Self::PORT_INDICATORS != 0
    }
}
