//! Depth-first walk of the PCI hierarchy.
//!
//! Each function is run through the driver registry as soon as its record is
//! built, before the walk moves on. A host controller driver found early on
//! bus 0 is therefore already up when later functions (or the USB bus it
//! brings up) need it.

use alloc::vec::Vec;

use crate::{
    debug,
    driver::{Outcome, Registry},
    warn,
};

use super::{
    PciAddress, PciError,
    access::ConfigAccess,
    config::{header_bits, offsets, vendor_ids},
    device::{self, Binding, PciDevice},
};

/// Devices per bus
const DEVICES_PER_BUS: u8 = 32;
/// Functions per device
const FUNCTIONS_PER_DEVICE: u8 = 8;
/// Bridge nesting limit; one level per possible bus number
pub const MAX_BRIDGE_DEPTH: usize = 255;

pub struct PciScanner<'a, A: ConfigAccess + ?Sized> {
    access: &'a A,
    registry: Registry<PciDevice>,
    visited: [bool; 256],
    devices: Vec<PciDevice>,
}

impl<'a, A: ConfigAccess + ?Sized> PciScanner<'a, A> {
    pub fn new(access: &'a A, registry: Registry<PciDevice>) -> Self {
        Self {
            access,
            registry,
            visited: [false; 256],
            devices: Vec::new(),
        }
    }

    /// Walks every reachable bus and returns the functions found, in
    /// discovery order, each already offered to the driver table.
    pub fn scan(mut self) -> Vec<PciDevice> {
        let root = PciAddress::new(0, 0, 0);
        // An empty slot reads all ones, multi-function bit included
        let multifunction_host = self.access.read_u16(root, offsets::VENDOR_ID) != vendor_ids::NONE
            && self.access.read_u8(root, offsets::HEADER_TYPE) & header_bits::MULTI_FUNCTION != 0;

        if !multifunction_host {
            self.scan_bus(0, 0);
        } else {
            // Each function of a multi-function host bridge owns its own root bus
            for function in 0..FUNCTIONS_PER_DEVICE {
                let host = PciAddress::new(0, 0, function);
                if self.access.read_u16(host, offsets::VENDOR_ID) == vendor_ids::NONE {
                    continue;
                }
                self.scan_bus(function, 0);
            }
        }

        self.devices
    }

    fn scan_bus(&mut self, bus: u8, depth: usize) {
        if depth > MAX_BRIDGE_DEPTH {
            warn!("PCI: {}", PciError::BusDepthExceeded(bus));
            return;
        }
        if core::mem::replace(&mut self.visited[bus as usize], true) {
            debug!("PCI: bus {:02x} already scanned", bus);
            return;
        }

        for device in 0..DEVICES_PER_BUS {
            self.scan_device(bus, device, depth);
        }
    }

    fn scan_device(&mut self, bus: u8, device: u8, depth: usize) {
        let first = PciAddress::new(bus, device, 0);

        // No function 0 means no device in this slot
        if !self.scan_function(first, depth) {
            return;
        }

        if device::is_multifunction(self.access, first) {
            for function in 1..FUNCTIONS_PER_DEVICE {
                self.scan_function(PciAddress::new(bus, device, function), depth);
            }
        }
    }

    /// Returns whether a function answered at `address`.
    fn scan_function(&mut self, address: PciAddress, depth: usize) -> bool {
        let mut pci_device = match device::probe_function(self.access, address) {
            Ok(Some(pci_device)) => pci_device,
            Ok(None) => return false,
            Err(e) => {
                warn!("PCI: {}", e);
                return true;
            }
        };

        debug!(
            "Found PCI device: {} class={:02x}:{:02x}",
            pci_device, pci_device.class_code, pci_device.subclass
        );

        pci_device.binding = match self.registry.match_and_init(&pci_device) {
            Outcome::Claimed(driver) => Binding::Bound(driver),
            Outcome::Failed(driver) => Binding::Rejected(driver),
            Outcome::Unclaimed => Binding::Unclaimed,
        };

        let secondary_bus = pci_device.secondary_bus;
        self.devices.push(pci_device);

        if let Some(secondary) = secondary_bus {
            self.scan_bus(secondary, depth + 1);
        }

        true
    }
}
