//! Standard USB requests and descriptor parsing.
//!
//! Descriptors come straight off the wire, so every parser checks `bLength`
//! and `bDescriptorType` before trusting a field.

use alloc::{string::String, vec::Vec};
use core::fmt;

use super::device::{EndpointKind, UsbEndpoint, UsbFunction};

/// USB descriptor types
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const HUB: u8 = 0x29;
}

/// Standard request codes
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// USB class codes
pub mod class {
    pub const HID: u8 = 0x03;
    pub const HUB: u8 = 0x09;
}

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIGURATION_HEADER_LEN: usize = 9;
const INTERFACE_DESCRIPTOR_LEN: usize = 9;
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
const HUB_DESCRIPTOR_MIN_LEN: usize = 7;

/// Data stage direction, bit 7 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Request type, bits 6:5 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Recipient, bits 4:0 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The eight-byte setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const fn new(
        direction: Direction,
        kind: RequestKind,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir_bit = match direction {
            Direction::Out => 0x00,
            Direction::In => 0x80,
        };
        Self {
            request_type: dir_bit | ((kind as u8) << 5) | recipient as u8,
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn recipient(&self) -> u8 {
        self.request_type & 0x1F
    }

    /// GET_DESCRIPTOR addressed to the device
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language: u16, length: u16) -> Self {
        Self::new(
            Direction::In,
            RequestKind::Standard,
            Recipient::Device,
            request::GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | desc_index as u16,
            language,
            length,
        )
    }

    pub const fn set_address(address: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestKind::Standard,
            Recipient::Device,
            request::SET_ADDRESS,
            address as u16,
            0,
            0,
        )
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self::new(
            Direction::Out,
            RequestKind::Standard,
            Recipient::Device,
            request::SET_CONFIGURATION,
            value as u16,
            0,
            0,
        )
    }
}

/// A descriptor failed its length or type checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    TooShort { expected: usize, actual: usize },
    WrongType { expected: u8, actual: u8 },
    BadLength(u8),
    BadMaxPacketSize(u8),
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::TooShort { expected, actual } => {
                write!(f, "descriptor too short ({} < {})", actual, expected)
            }
            DescriptorError::WrongType { expected, actual } => {
                write!(f, "descriptor type {:#04x}, expected {:#04x}", actual, expected)
            }
            DescriptorError::BadLength(len) => write!(f, "bad descriptor length {}", len),
            DescriptorError::BadMaxPacketSize(size) => write!(f, "bad max packet size {}", size),
        }
    }
}

fn check_header(buf: &[u8], desc_type: u8, min_len: usize) -> Result<(), DescriptorError> {
    if buf.len() < min_len {
        return Err(DescriptorError::TooShort {
            expected: min_len,
            actual: buf.len(),
        });
    }
    if (buf[0] as usize) < min_len {
        return Err(DescriptorError::BadLength(buf[0]));
    }
    if buf[1] != desc_type {
        return Err(DescriptorError::WrongType {
            expected: desc_type,
            actual: buf[1],
        });
    }
    Ok(())
}

fn le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Validates `bMaxPacketSize0` from the first eight bytes of a device
/// descriptor.
pub fn parse_max_packet_size0(buf: &[u8]) -> Result<u8, DescriptorError> {
    if buf.len() < 8 {
        return Err(DescriptorError::TooShort {
            expected: 8,
            actual: buf.len(),
        });
    }
    if buf[1] != descriptor_type::DEVICE {
        return Err(DescriptorError::WrongType {
            expected: descriptor_type::DEVICE,
            actual: buf[1],
        });
    }
    match buf[7] {
        8 | 16 | 32 | 64 => Ok(buf[7]),
        other => Err(DescriptorError::BadMaxPacketSize(other)),
    }
}

/// Standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self, DescriptorError> {
        check_header(buf, descriptor_type::DEVICE, DEVICE_DESCRIPTOR_LEN)?;
        let max_packet_size0 = parse_max_packet_size0(buf)?;

        Ok(Self {
            usb_version: le16(buf, 2),
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet_size0,
            vendor_id: le16(buf, 8),
            product_id: le16(buf, 10),
            device_version: le16(buf, 12),
            manufacturer_index: buf[14],
            product_index: buf[15],
            serial_index: buf[16],
            num_configurations: buf[17],
        })
    }
}

/// Configuration descriptor header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self, DescriptorError> {
        check_header(buf, descriptor_type::CONFIGURATION, CONFIGURATION_HEADER_LEN)?;
        let total_length = le16(buf, 2);
        if (total_length as usize) < CONFIGURATION_HEADER_LEN {
            return Err(DescriptorError::BadLength(buf[0]));
        }

        Ok(Self {
            total_length,
            num_interfaces: buf[4],
            configuration_value: buf[5],
            attributes: buf[7],
            max_power: buf[8],
        })
    }
}

/// Walks a full configuration (header, interfaces, endpoints and any
/// class-specific descriptors in between) and returns the functions of
/// alternate setting 0 with their endpoints.
pub fn parse_configuration(
    buf: &[u8],
) -> Result<(ConfigurationDescriptor, Vec<UsbFunction>), DescriptorError> {
    let header = ConfigurationDescriptor::parse(buf)?;
    let total = (header.total_length as usize).min(buf.len());

    let mut functions: Vec<UsbFunction> = Vec::new();
    let mut in_alternate = false;
    let mut offset = header_len(buf);

    while offset + 2 <= total {
        let len = buf[offset] as usize;
        if len < 2 || offset + len > total {
            return Err(DescriptorError::BadLength(buf[offset]));
        }
        let desc = &buf[offset..offset + len];

        match desc[1] {
            descriptor_type::INTERFACE => {
                if len < INTERFACE_DESCRIPTOR_LEN {
                    return Err(DescriptorError::BadLength(desc[0]));
                }
                in_alternate = desc[3] != 0;
                if !in_alternate {
                    functions.push(UsbFunction {
                        number: desc[2],
                        class: desc[5],
                        subclass: desc[6],
                        protocol: desc[7],
                        endpoints: Vec::new(),
                    });
                }
            }
            descriptor_type::ENDPOINT => {
                if len < ENDPOINT_DESCRIPTOR_LEN {
                    return Err(DescriptorError::BadLength(desc[0]));
                }
                if let (false, Some(function)) = (in_alternate, functions.last_mut()) {
                    function.endpoints.push(UsbEndpoint {
                        address: desc[2],
                        kind: EndpointKind::from_attributes(desc[3]),
                        max_packet_size: le16(desc, 4) & 0x7FF,
                        interval: desc[6],
                    });
                }
            }
            _ => {}
        }

        offset += len;
    }

    Ok((header, functions))
}

fn header_len(buf: &[u8]) -> usize {
    (buf[0] as usize).max(CONFIGURATION_HEADER_LEN)
}

/// Hub class descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub characteristics: u16,
    /// Time from port power-on to power good, in milliseconds
    pub power_on_delay_ms: u32,
}

impl HubDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self, DescriptorError> {
        check_header(buf, descriptor_type::HUB, HUB_DESCRIPTOR_MIN_LEN)?;
        Ok(Self {
            num_ports: buf[2],
            characteristics: le16(buf, 3),
            power_on_delay_ms: buf[5] as u32 * 2,
        })
    }
}

/// First language ID from string descriptor zero
pub fn parse_language(buf: &[u8]) -> Result<u16, DescriptorError> {
    check_header(buf, descriptor_type::STRING, 4)?;
    Ok(le16(buf, 2))
}

/// Decodes a UTF-16LE string descriptor.
pub fn parse_string(buf: &[u8]) -> Result<String, DescriptorError> {
    check_header(buf, descriptor_type::STRING, 2)?;
    let len = (buf[0] as usize).min(buf.len());
    let units = buf[2..len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
