//! PCI function records.
//!
//! This module provides:
//! - The per-function [`PciDevice`] record built during a scan
//! - Base Address Register (BAR) decoding and sizing
//! - Capability list discovery
//! - Driver match predicates over a function's identity

use alloc::collections::BTreeMap;
use core::fmt;
use x86_64::PhysAddr;

use super::{
    PciAddress, PciError,
    access::ConfigAccess,
    config::{bar_types, command_bits, header_bits, offsets, status_bits},
};

/// Number of BARs in a type 0 header
pub const MAX_BARS: usize = 6;
/// Number of BARs in a type 1 (bridge) header
const BRIDGE_BARS: usize = 2;
/// Upper bound on capability list entries; the list lives in 192 bytes
const MAX_CAPABILITIES: usize = 48;

/// Configuration header layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Normal = 0x00,
    PciToPciBridge = 0x01,
    CardBusBridge = 0x02,
}

impl HeaderType {
    fn bar_count(self) -> usize {
        match self {
            HeaderType::Normal => MAX_BARS,
            HeaderType::PciToPciBridge => BRIDGE_BARS,
            HeaderType::CardBusBridge => 0,
        }
    }
}

/// Base Address Register (BAR) information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarInfo {
    /// Memory BAR (physical address)
    Memory(MemoryBar),
    /// I/O BAR (I/O port address)
    Io(IoBar),
    /// Unused BAR, or the upper half of a 64-bit memory BAR
    Unused,
}

impl BarInfo {
    pub fn size(&self) -> u64 {
        match self {
            BarInfo::Memory(bar) => bar.size,
            BarInfo::Io(bar) => bar.size as u64,
            BarInfo::Unused => 0,
        }
    }

    pub fn io_base(&self) -> Option<u16> {
        match self {
            BarInfo::Io(bar) => u16::try_from(bar.address).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBar {
    pub address: PhysAddr,
    pub size: u64,
    pub prefetchable: bool,
    pub is_64bit: bool,
}

impl MemoryBar {
    pub fn new(address: PhysAddr, size: u64, prefetchable: bool, is_64bit: bool) -> Self {
        Self {
            address,
            size,
            prefetchable,
            is_64bit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBar {
    pub address: u32,
    pub size: u32,
}

impl IoBar {
    pub fn new(address: u32, size: u32) -> Self {
        Self { address, size }
    }
}

/// Which driver, if any, owns a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// No driver predicate matched
    Unclaimed,
    /// Claimed by the named driver
    Bound(&'static str),
    /// Every matching driver rejected it; the last one is named
    Rejected(&'static str),
}

/// One PCI function as found by the scanner
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
    pub header_type: HeaderType,
    pub multifunction: bool,
    /// Base Address Registers, in register order
    pub bars: [BarInfo; MAX_BARS],
    /// Map of capability ID to capability offset
    pub capabilities: BTreeMap<u8, u8>,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    /// Bus behind a PCI-to-PCI bridge
    pub secondary_bus: Option<u8>,
    /// The only field written after the scan builds the record
    pub binding: Binding,
}

impl PciDevice {
    /// Get a human-readable device description
    pub fn description(&self) -> &'static str {
        match (self.class_code, self.subclass) {
            (0x00, 0x00) => "Legacy Device",
            (0x01, 0x00) => "SCSI Bus Controller",
            (0x01, 0x01) => "IDE Controller",
            (0x01, 0x02) => "Floppy Disk Controller",
            (0x01, 0x04) => "RAID Controller",
            (0x01, 0x05) => "ATA Controller",
            (0x01, 0x06) => "SATA Controller",
            (0x01, 0x08) => "NVM Controller",
            (0x02, 0x00) => "Ethernet Controller",
            (0x02, 0x80) => "Network Controller",
            (0x03, 0x00) => "VGA Compatible Controller",
            (0x03, 0x02) => "3D Controller",
            (0x04, 0x01) => "Multimedia Audio Controller",
            (0x04, 0x03) => "Audio Device",
            (0x06, 0x00) => "Host Bridge",
            (0x06, 0x01) => "ISA Bridge",
            (0x06, 0x04) => "PCI-to-PCI Bridge",
            (0x06, 0x07) => "CardBus Bridge",
            (0x06, 0x80) => "Bridge",
            (0x07, 0x00) => "Serial Controller",
            (0x08, 0x00) => "Interrupt Controller",
            (0x09, 0x00) => "Keyboard Controller",
            (0x0C, 0x00) => "FireWire Controller",
            (0x0C, 0x03) => "USB Controller",
            (0x0C, 0x05) => "SMBus Controller",
            _ => "Unknown Device",
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Bound(_))
    }

    /// Check if device supports MSI-X
    pub fn supports_msix(&self) -> bool {
        self.capabilities.contains_key(&super::config::capability_ids::MSI_X)
    }

    /// Find a capability by ID, returns the offset if found
    pub fn find_capability(&self, cap_id: u8) -> Option<u8> {
        self.capabilities.get(&cap_id).copied()
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] {} (rev {:02x})",
            self.address,
            self.vendor_id,
            self.device_id,
            self.description(),
            self.revision_id
        )
    }
}

/// Identity predicate a PCI driver matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciMatch {
    /// Exact vendor/device pair
    Id { vendor: u16, device: u16 },
    /// Class/subclass pair, optionally narrowed by programming interface
    Class {
        class: u8,
        subclass: u8,
        prog_if: Option<u8>,
    },
}

impl PciMatch {
    pub const fn id(vendor: u16, device: u16) -> Self {
        PciMatch::Id { vendor, device }
    }

    pub const fn class(class: u8, subclass: u8) -> Self {
        PciMatch::Class {
            class,
            subclass,
            prog_if: None,
        }
    }

    pub fn matches(&self, device: &PciDevice) -> bool {
        match *self {
            PciMatch::Id { vendor, device: id } => {
                device.vendor_id == vendor && device.device_id == id
            }
            PciMatch::Class {
                class,
                subclass,
                prog_if,
            } => {
                device.class_code == class
                    && device.subclass == subclass
                    && prog_if.is_none_or(|p| p == device.prog_if)
            }
        }
    }
}

/// True if any entry of `table` matches `device`
pub fn match_table(table: &[PciMatch], device: &PciDevice) -> bool {
    table.iter().any(|entry| entry.matches(device))
}

/// Probe a specific function.
///
/// Returns `Ok(None)` for an empty slot.
pub fn probe_function<A: ConfigAccess + ?Sized>(
    access: &A,
    address: PciAddress,
) -> Result<Option<PciDevice>, PciError> {
    // 0xFFFF indicates no device present
    let vendor_id = access.read_u16(address, offsets::VENDOR_ID);
    if vendor_id == super::config::vendor_ids::NONE {
        return Ok(None);
    }

    let device_id = access.read_u16(address, offsets::DEVICE_ID);
    let class_code = access.read_u8(address, offsets::CLASS_CODE);
    let subclass = access.read_u8(address, offsets::SUBCLASS);
    let prog_if = access.read_u8(address, offsets::PROG_IF);
    let revision_id = access.read_u8(address, offsets::REVISION_ID);
    let header_raw = access.read_u8(address, offsets::HEADER_TYPE);
    let interrupt_line = access.read_u8(address, offsets::INTERRUPT_LINE);
    let interrupt_pin = access.read_u8(address, offsets::INTERRUPT_PIN);

    let header_type = match header_raw & header_bits::LAYOUT_MASK {
        0x00 => HeaderType::Normal,
        0x01 => HeaderType::PciToPciBridge,
        0x02 => HeaderType::CardBusBridge,
        _ => return Err(PciError::InvalidHeader(address)),
    };

    let bars = parse_bars(access, address, header_type.bar_count());
    let capabilities = parse_capabilities(access, address);

    let secondary_bus = if header_type == HeaderType::PciToPciBridge {
        Some(access.read_u8(address, offsets::SECONDARY_BUS))
    } else {
        None
    };

    Ok(Some(PciDevice {
        address,
        vendor_id,
        device_id,
        class_code,
        subclass,
        prog_if,
        revision_id,
        header_type,
        multifunction: header_raw & header_bits::MULTI_FUNCTION != 0,
        bars,
        capabilities,
        interrupt_line,
        interrupt_pin,
        secondary_bus,
        binding: Binding::Unclaimed,
    }))
}

/// Check if the function's header advertises multiple functions
pub fn is_multifunction<A: ConfigAccess + ?Sized>(access: &A, address: PciAddress) -> bool {
    access.read_u8(address, offsets::HEADER_TYPE) & header_bits::MULTI_FUNCTION != 0
}

/// Parse Base Address Registers for a device
///
/// Address and memory decoding are switched off while the registers are
/// sized so a half-written BAR never claims a bus range.
fn parse_bars<A: ConfigAccess + ?Sized>(
    access: &A,
    address: PciAddress,
    count: usize,
) -> [BarInfo; MAX_BARS] {
    let mut bars = [BarInfo::Unused; MAX_BARS];
    if count == 0 {
        return bars;
    }

    let command = access.read_u16(address, offsets::COMMAND);
    access.write_u16(
        address,
        offsets::COMMAND,
        command & !(command_bits::IO_SPACE | command_bits::MEMORY_SPACE),
    );

    let mut i = 0;
    while i < count {
        let bar_offset = offsets::BAR0 + (i as u8 * 4);
        let bar_value = access.read_u32(address, bar_offset);

        if bar_value & bar_types::BAR_TYPE_IO != 0 {
            let size = size_io_bar(access, address, bar_offset);
            if size != 0 {
                bars[i] = BarInfo::Io(IoBar::new(bar_value & bar_types::IO_BAR_MASK, size));
            }
            i += 1;
            continue;
        }

        let is_64bit = bar_value & bar_types::MEMORY_TYPE_MASK == bar_types::MEMORY_TYPE_64BIT
            && i + 1 < count;
        let prefetchable = bar_value & bar_types::MEMORY_PREFETCHABLE != 0;

        let high = if is_64bit {
            access.read_u32(address, bar_offset + 4) as u64
        } else {
            0
        };
        let address_raw = (high << 32) | (bar_value & bar_types::MEMORY_BAR_MASK) as u64;

        let size = size_memory_bar(access, address, bar_offset, is_64bit);
        if size != 0 {
            bars[i] = BarInfo::Memory(MemoryBar::new(
                PhysAddr::new_truncate(address_raw),
                size,
                prefetchable,
                is_64bit,
            ));
        }

        // The upper half of a 64-bit BAR stays Unused
        i += if is_64bit { 2 } else { 1 };
    }

    access.write_u16(address, offsets::COMMAND, command);
    bars
}

/// Size a memory BAR using the standard write-all-1s method
fn size_memory_bar<A: ConfigAccess + ?Sized>(
    access: &A,
    address: PciAddress,
    bar_offset: u8,
    is_64bit: bool,
) -> u64 {
    let original_low = access.read_u32(address, bar_offset);
    access.write_u32(address, bar_offset, 0xFFFF_FFFF);
    let size_low = access.read_u32(address, bar_offset);
    access.write_u32(address, bar_offset, original_low);

    if is_64bit {
        let original_high = access.read_u32(address, bar_offset + 4);
        access.write_u32(address, bar_offset + 4, 0xFFFF_FFFF);
        let size_high = access.read_u32(address, bar_offset + 4);
        access.write_u32(address, bar_offset + 4, original_high);

        let mask = ((size_high as u64) << 32) | (size_low & bar_types::MEMORY_BAR_MASK) as u64;
        if mask == 0 { 0 } else { (!mask).wrapping_add(1) }
    } else {
        // NOT on the u32 before widening, or the size picks up 32 high bits
        let mask = size_low & bar_types::MEMORY_BAR_MASK;
        if mask == 0 { 0 } else { (!mask).wrapping_add(1) as u64 }
    }
}

/// Size an I/O BAR using the standard write-all-1s method
fn size_io_bar<A: ConfigAccess + ?Sized>(access: &A, address: PciAddress, bar_offset: u8) -> u32 {
    let original = access.read_u32(address, bar_offset);
    access.write_u32(address, bar_offset, 0xFFFF_FFFF);
    let size_mask = access.read_u32(address, bar_offset);
    access.write_u32(address, bar_offset, original);

    // Only the low 16 bits of an I/O BAR decode on x86
    let size_mask = (size_mask & bar_types::IO_BAR_MASK) | 0xFFFF_0000;
    if size_mask == 0xFFFF_0000 { 0 } else { (!size_mask).wrapping_add(1) }
}

/// Parse device capabilities
fn parse_capabilities<A: ConfigAccess + ?Sized>(
    access: &A,
    address: PciAddress,
) -> BTreeMap<u8, u8> {
    let mut capabilities = BTreeMap::new();

    let status = access.read_u16(address, offsets::STATUS);
    if status & status_bits::CAPABILITIES_LIST == 0 {
        return capabilities;
    }

    let mut cap_ptr = access.read_u8(address, offsets::CAPABILITIES_PTR) & 0xFC;
    for _ in 0..MAX_CAPABILITIES {
        if cap_ptr < 0x40 {
            break;
        }
        let cap_id = access.read_u8(address, cap_ptr);
        let next_ptr = access.read_u8(address, cap_ptr + 1) & 0xFC;

        capabilities.entry(cap_id).or_insert(cap_ptr);
        cap_ptr = next_ptr;
    }

    capabilities
}
