//! Realtek RTL8169 gigabit Ethernet controller.
//!
//! Bring-up is limited to a software reset and reading the station address;
//! the device is then handed to the network stack.

use crate::{
    downstream::{self, DeviceKind, DeviceOwner},
    driver::Driver,
    info, warn,
};

use super::{
    access::{PortIo, X86PortIo},
    config::{device_classes, subclasses, vendor_ids},
    device::{PciDevice, PciMatch, match_table},
};

/// Command register, I/O BAR relative
const REG_COMMAND: u16 = 0x37;
/// Software reset bit of the command register, self-clearing
const COMMAND_RESET: u8 = 0x10;
/// ID registers (station address), I/O BAR relative
const REG_IDR0: u16 = 0x00;
/// Polls of the reset bit before the chip is declared dead
const RESET_POLL_LIMIT: usize = 100_000;

const ID_TABLE: &[PciMatch] = &[
    PciMatch::id(vendor_ids::REALTEK, 0x8169),
    // Linksys EG1032 v3
    PciMatch::id(vendor_ids::LINKSYS, 0x1032),
];

pub struct Rtl8169Driver {
    ports: &'static dyn PortIo,
}

impl Rtl8169Driver {
    pub const fn new(ports: &'static dyn PortIo) -> Self {
        Self { ports }
    }

    fn reset(&self, io_base: u16) -> bool {
        self.ports.write_u8(io_base + REG_COMMAND, COMMAND_RESET);
        (0..RESET_POLL_LIMIT).any(|_| self.ports.read_u8(io_base + REG_COMMAND) & COMMAND_RESET == 0)
    }

    fn read_mac(&self, io_base: u16) -> [u8; 6] {
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = self.ports.read_u8(io_base + REG_IDR0 + i as u16);
        }
        mac
    }
}

impl Driver for Rtl8169Driver {
    type Device = PciDevice;

    fn name(&self) -> &'static str {
        "RTL8169"
    }

    fn matches(&self, device: &PciDevice) -> bool {
        match_table(ID_TABLE, device)
    }

    fn init(&self, device: &PciDevice) -> bool {
        if device.class_code != device_classes::NETWORK
            || device.subclass != subclasses::NETWORK_ETHERNET
        {
            return false;
        }

        let owner = DeviceOwner::Pci(device.address);
        if downstream::lookup(owner).is_some() {
            warn!("RTL8169: {} already handed off", device.address);
            return false;
        }

        let Some(io_base) = device.bars[0].io_base() else {
            warn!("RTL8169: BAR0 is not an I/O BAR");
            return false;
        };

        if !self.reset(io_base) {
            warn!("RTL8169: reset did not complete");
            return false;
        }
        info!("RTL8169: reset completed");

        let mac = self.read_mac(io_base);
        info!(
            "RTL8169: MAC address {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );

        let registered = downstream::register(
            owner,
            DeviceKind::Network {
                name: "RTL8169",
                mac,
            },
        );
        if let Err(e) = registered {
            warn!("RTL8169: {}", e);
            return false;
        }

        true
    }
}

pub static RTL8169: Rtl8169Driver = Rtl8169Driver::new(&X86PortIo);
