//! PCI bus discovery and driver dispatch.
//!
//! This module provides:
//!
//! - Configuration space access through mechanism #1 I/O ports
//! - A recursive bus scan that follows PCI-to-PCI bridges
//! - BAR decoding and capability discovery
//! - The static PCI driver table and the record of which driver owns what
//!
//! PCI is scanned exactly once at boot. The resulting records live in
//! [`PCI_BUS`]; drivers only ever see a borrowed [`PciDevice`] during `init`.

pub mod access;
pub mod config;
pub mod device;
pub mod rtl8169;
pub mod scanner;

#[cfg(test)]
mod tests;

use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::{
    driver::{Driver, Registry},
    info,
};

pub use access::{ConfigAccess, PortConfigAccess, PortIo};
pub use device::{BarInfo, Binding, PciDevice, PciMatch};
pub use scanner::PciScanner;

/// Bus/device/function triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI-related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// Header layout field is not 0, 1 or 2
    InvalidHeader(PciAddress),
    /// Bridge chain nested deeper than there are buses
    BusDepthExceeded(u8),
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciError::InvalidHeader(address) => write!(f, "{}: invalid header type", address),
            PciError::BusDepthExceeded(bus) => {
                write!(f, "bus {:02x}: bridge nesting too deep", bus)
            }
        }
    }
}

/// Built-in PCI drivers, most specific first
pub static PCI_DRIVERS: [&dyn Driver<Device = PciDevice>; 2] =
    [&rtl8169::RTL8169, &crate::usb::host::USB_HOST];

pub fn default_registry() -> Registry<PciDevice> {
    Registry::new(&PCI_DRIVERS)
}

/// The functions found at boot
pub static PCI_BUS: Mutex<Option<PciBus>> = Mutex::new(None);

/// Result of the boot-time scan
pub struct PciBus {
    pub devices: Vec<PciDevice>,
}

impl PciBus {
    /// Scans through `access`, dispatching each function through `registry`.
    pub fn scan<A: ConfigAccess + ?Sized>(access: &A, registry: Registry<PciDevice>) -> Self {
        info!("PCI: scanning with {} drivers", registry.len());
        let devices = PciScanner::new(access, registry).scan();

        let bound = devices.iter().filter(|dev| dev.is_bound()).count();
        info!("PCI: {} functions, {} bound", devices.len(), bound);

        Self { devices }
    }

    pub fn get(&self, address: PciAddress) -> Option<&PciDevice> {
        self.devices.iter().find(|dev| dev.address == address)
    }

    /// Find a device by vendor and device ID
    pub fn find_device(&self, vendor_id: u16, device_id: u16) -> Option<&PciDevice> {
        self.devices
            .iter()
            .find(|dev| dev.vendor_id == vendor_id && dev.device_id == device_id)
    }

    /// Get all devices of a specific class
    pub fn devices_by_class(&self, class_code: u8) -> Vec<&PciDevice> {
        self.devices
            .iter()
            .filter(|dev| dev.class_code == class_code)
            .collect()
    }

    /// Functions no driver matched
    pub fn unclaimed(&self) -> impl Iterator<Item = &PciDevice> {
        self.devices
            .iter()
            .filter(|dev| dev.binding == Binding::Unclaimed)
    }
}

/// Scan the machine's PCI bus once and publish the result in [`PCI_BUS`].
///
/// Returns the number of functions found.
pub fn init_pci<A: ConfigAccess + ?Sized>(access: &A) -> usize {
    let bus = PciBus::scan(access, default_registry());
    let count = bus.devices.len();

    *PCI_BUS.lock() = Some(bus);
    count
}
