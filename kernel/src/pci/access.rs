//! Raw hardware access used by the scanner and by PCI drivers.
//!
//! Configuration space is reached through [`ConfigAccess`] and legacy I/O
//! ports through [`PortIo`], so the scanner and drivers never issue `in`/`out`
//! instructions directly.

use spin::Mutex;
use x86_64::instructions::port::Port;

use super::PciAddress;

/// Configuration address port for mechanism #1
const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
/// Configuration data port for mechanism #1
const CONFIG_DATA_PORT: u16 = 0xCFC;
/// Enable bit of the configuration address
const CONFIG_ENABLE: u32 = 1 << 31;

/// Access to the 256-byte configuration header of every function.
///
/// Only the dword accessors are required; narrower reads are carved out of
/// the containing dword and narrower writes are read-modify-write.
pub trait ConfigAccess: Sync {
    fn read_u32(&self, address: PciAddress, offset: u8) -> u32;

    fn write_u32(&self, address: PciAddress, offset: u8, value: u32);

    fn read_u16(&self, address: PciAddress, offset: u8) -> u16 {
        let dword = self.read_u32(address, offset & !0x3);
        (dword >> ((offset & 0x2) * 8)) as u16
    }

    fn read_u8(&self, address: PciAddress, offset: u8) -> u8 {
        let dword = self.read_u32(address, offset & !0x3);
        (dword >> ((offset & 0x3) * 8)) as u8
    }

    fn write_u16(&self, address: PciAddress, offset: u8, value: u16) {
        let aligned = offset & !0x3;
        let shift = (offset & 0x2) * 8;
        let dword = self.read_u32(address, aligned);
        let merged = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write_u32(address, aligned, merged);
    }
}

/// Configuration mechanism #1 (I/O ports 0xCF8/0xCFC).
///
/// The address/data pair is not atomic, so accesses are serialized.
pub struct PortConfigAccess {
    lock: Mutex<()>,
}

impl Default for PortConfigAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl PortConfigAccess {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    fn config_address(address: PciAddress, offset: u8) -> u32 {
        CONFIG_ENABLE
            | ((address.bus as u32) << 16)
            | ((address.device as u32) << 11)
            | ((address.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

impl ConfigAccess for PortConfigAccess {
    fn read_u32(&self, address: PciAddress, offset: u8) -> u32 {
        let _guard = self.lock.lock();
        let mut address_port = Port::<u32>::new(CONFIG_ADDRESS_PORT);
        let mut data_port = Port::<u32>::new(CONFIG_DATA_PORT);
        unsafe {
            address_port.write(Self::config_address(address, offset));
            data_port.read()
        }
    }

    fn write_u32(&self, address: PciAddress, offset: u8, value: u32) {
        let _guard = self.lock.lock();
        let mut address_port = Port::<u32>::new(CONFIG_ADDRESS_PORT);
        let mut data_port = Port::<u32>::new(CONFIG_DATA_PORT);
        unsafe {
            address_port.write(Self::config_address(address, offset));
            data_port.write(value);
        }
    }
}

/// Byte-wide legacy I/O port access for drivers with I/O BARs.
pub trait PortIo: Sync {
    fn read_u8(&self, port: u16) -> u8;

    fn write_u8(&self, port: u16, value: u8);
}

/// The CPU's I/O port space.
pub struct X86PortIo;

impl PortIo for X86PortIo {
    fn read_u8(&self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }

    fn write_u8(&self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }
}
