//! USB device records and driver matching.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU16, Ordering},
};

use crate::downstream::DeviceOwner;

use super::{
    arena::DeviceHandle,
    descriptor::class,
    transfer::{DevicePipe, TransferChannel},
};

/// Bus speed negotiated on the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

impl UsbSpeed {
    /// Control endpoint packet size to use before the device descriptor has
    /// been read
    pub const fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
        }
    }
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UsbSpeed::Low => "low-speed",
            UsbSpeed::Full => "full-speed",
            UsbSpeed::High => "high-speed",
        };
        f.write_str(name)
    }
}

/// Identifies one [`UsbBus`](super::UsbBus); device handles are only
/// unique within their bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BusId(pub u16);

impl BusId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU16 = AtomicU16::new(0);
        BusId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usb{}", self.0)
    }
}

/// Index of a host controller attached to the USB bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ControllerId(pub u8);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hc{}", self.0)
    }
}

/// Endpoint transfer type, bits 1:0 of `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            _ => EndpointKind::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbEndpoint {
    /// Endpoint number with the direction in bit 7
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl UsbEndpoint {
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// One interface of the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbFunction {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

impl UsbFunction {
    pub fn find_endpoint(&self, kind: EndpointKind, is_in: bool) -> Option<&UsbEndpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.kind == kind && ep.is_in() == is_in)
    }
}

/// Enumeration progress of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Connected and reset, answering on address 0
    Detected,
    /// Moved to its own address
    Addressed,
    /// Device and configuration descriptors read
    Described,
    /// Configuration selected
    Configured,
    /// Claimed by the named driver
    Bound(&'static str),
    /// Configured but no driver took it
    Unclaimed,
    /// Gone; handles to it no longer resolve
    Disconnected,
}

impl DeviceState {
    pub fn is_configured(&self) -> bool {
        matches!(
            self,
            DeviceState::Configured | DeviceState::Bound(_) | DeviceState::Unclaimed
        )
    }
}

/// A device in the USB tree
#[derive(Debug, Clone)]
pub struct UsbDevice {
    pub handle: DeviceHandle,
    pub controller: ControllerId,
    /// Upstream hub, `None` for devices on a root port
    pub parent: Option<DeviceHandle>,
    /// Port number on the upstream hub, 1-based
    pub port: u8,
    /// Number of links from the root hub, 1 for devices on a root port
    pub depth: u8,
    pub speed: UsbSpeed,
    /// 0 until SET_ADDRESS succeeds
    pub address: u8,
    pub max_packet_size: u16,
    pub state: DeviceState,
    /// Last driver that matched but declined the device
    pub rejected_by: Option<&'static str>,

    pub usb_version: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub num_configurations: u8,

    pub configured: bool,
    pub configuration_value: u8,
    pub functions: Vec<UsbFunction>,

    pub vendor: String,
    pub product: String,
    pub serial: String,

    /// Downstream port count, hubs only
    pub ports: u8,
    /// Downstream devices in port order, hubs only
    pub children: Vec<DeviceHandle>,

    pub(crate) pipe: Arc<DevicePipe>,
}

impl UsbDevice {
    pub(crate) fn new(
        controller: ControllerId,
        parent: Option<DeviceHandle>,
        port: u8,
        depth: u8,
        pipe: Arc<DevicePipe>,
    ) -> Self {
        let speed = pipe.speed();
        Self {
            handle: DeviceHandle::default(),
            controller,
            parent,
            port,
            depth,
            speed,
            address: 0,
            max_packet_size: speed.default_max_packet_size(),
            state: DeviceState::Detected,
            rejected_by: None,
            usb_version: 0,
            vendor_id: 0,
            product_id: 0,
            device_version: 0,
            class: 0,
            subclass: 0,
            protocol: 0,
            num_configurations: 0,
            configured: false,
            configuration_value: 0,
            functions: Vec::new(),
            vendor: String::new(),
            product: String::new(),
            serial: String::new(),
            ports: 0,
            children: Vec::new(),
            pipe,
        }
    }

    pub fn is_hub(&self) -> bool {
        self.class == class::HUB
    }

    /// First function of the given class, with optional subclass and
    /// protocol filters
    pub fn find_function(
        &self,
        class: u8,
        subclass: Option<u8>,
        protocol: Option<u8>,
    ) -> Option<&UsbFunction> {
        self.functions.iter().find(|function| {
            function.class == class
                && subclass.is_none_or(|s| s == function.subclass)
                && protocol.is_none_or(|p| p == function.protocol)
        })
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "USB {} [{:04x}:{:04x}] {}",
            self.handle, self.vendor_id, self.product_id, self.product
        )
    }
}

/// Device identity a USB driver can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMatch {
    Product {
        vendor: u16,
        product: u16,
    },
    DeviceClass {
        class: u8,
        subclass: Option<u8>,
        protocol: Option<u8>,
    },
    InterfaceClass {
        class: u8,
        subclass: Option<u8>,
        protocol: Option<u8>,
    },
}

impl UsbMatch {
    pub const fn product(vendor: u16, product: u16) -> Self {
        UsbMatch::Product { vendor, product }
    }

    pub const fn device_class(class: u8) -> Self {
        UsbMatch::DeviceClass {
            class,
            subclass: None,
            protocol: None,
        }
    }

    pub const fn interface(class: u8, subclass: u8, protocol: u8) -> Self {
        UsbMatch::InterfaceClass {
            class,
            subclass: Some(subclass),
            protocol: Some(protocol),
        }
    }

    pub fn matches(&self, device: &UsbDevice) -> bool {
        match *self {
            UsbMatch::Product { vendor, product } => {
                device.vendor_id == vendor && device.product_id == product
            }
            UsbMatch::DeviceClass {
                class,
                subclass,
                protocol,
            } => {
                device.class == class
                    && subclass.is_none_or(|s| s == device.subclass)
                    && protocol.is_none_or(|p| p == device.protocol)
            }
            UsbMatch::InterfaceClass {
                class,
                subclass,
                protocol,
            } => device.find_function(class, subclass, protocol).is_some(),
        }
    }
}

pub fn match_table(table: &[UsbMatch], device: &UsbDevice) -> bool {
    table.iter().any(|entry| entry.matches(device))
}

/// What a USB driver is handed: a snapshot of the configured device and a
/// channel for talking to it. Neither keeps the device alive.
pub struct UsbProbe {
    pub device: UsbDevice,
    pub channel: TransferChannel,
}

impl UsbProbe {
    pub fn handle(&self) -> DeviceHandle {
        self.device.handle
    }

    /// Key under which a driver hands this device off downstream.
    pub fn owner(&self) -> DeviceOwner {
        DeviceOwner::Usb {
            bus: self.channel.bus(),
            device: self.device.handle,
        }
    }
}

impl fmt::Display for UsbProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.device, f)
    }
}
