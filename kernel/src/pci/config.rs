//! PCI configuration space layout.
//!
//! This module provides:
//! - Type 0 / type 1 header register offsets
//! - Command and status register bit definitions
//! - Capability ID constants
//! - Class, subclass and vendor codes used by the driver table

/// Configuration space offsets shared by all header types
pub mod offsets {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const COMMAND: u8 = 0x04;
    pub const STATUS: u8 = 0x06;
    pub const REVISION_ID: u8 = 0x08;
    pub const PROG_IF: u8 = 0x09;
    pub const SUBCLASS: u8 = 0x0A;
    pub const CLASS_CODE: u8 = 0x0B;
    pub const HEADER_TYPE: u8 = 0x0E;
    pub const BAR0: u8 = 0x10;
    pub const CAPABILITIES_PTR: u8 = 0x34;
    pub const INTERRUPT_LINE: u8 = 0x3C;
    pub const INTERRUPT_PIN: u8 = 0x3D;

    /// Type 1 (PCI-to-PCI bridge) only
    pub const SECONDARY_BUS: u8 = 0x19;
}

/// Header type register layout
pub mod header_bits {
    pub const LAYOUT_MASK: u8 = 0x7F;
    pub const MULTI_FUNCTION: u8 = 0x80;
}

/// Command Register bits
pub mod command_bits {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
}

/// Status Register bits
pub mod status_bits {
    pub const CAPABILITIES_LIST: u16 = 1 << 4;
}

/// Capability IDs
pub mod capability_ids {
    pub const MSI: u8 = 0x05;
    pub const MSI_X: u8 = 0x11;
}

/// Device classes
pub mod device_classes {
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const MULTIMEDIA: u8 = 0x04;
    pub const BRIDGE: u8 = 0x06;
    pub const SERIAL_BUS: u8 = 0x0C;
}

/// Subclasses the driver table cares about
pub mod subclasses {
    pub const NETWORK_ETHERNET: u8 = 0x00;
    pub const SERIAL_BUS_USB: u8 = 0x03;
}

/// USB host controller programming interfaces (class 0x0C, subclass 0x03)
pub mod usb_prog_if {
    pub const UHCI: u8 = 0x00;
    pub const OHCI: u8 = 0x10;
    pub const EHCI: u8 = 0x20;
    pub const XHCI: u8 = 0x30;
}

/// Vendor IDs
pub mod vendor_ids {
    pub const REALTEK: u16 = 0x10EC;
    pub const LINKSYS: u16 = 0x1737;

    /// Vendor ID read back from an empty slot
    pub const NONE: u16 = 0xFFFF;
}

/// BAR encoding
pub mod bar_types {
    /// BAR type bit (bit 0)
    pub const BAR_TYPE_IO: u32 = 0x1;

    /// Memory BAR type bits (bits 1-2)
    pub const MEMORY_TYPE_MASK: u32 = 0x6;
    pub const MEMORY_TYPE_64BIT: u32 = 0x4;

    /// Memory BAR prefetchable bit (bit 3)
    pub const MEMORY_PREFETCHABLE: u32 = 0x8;

    /// Memory BAR address mask
    pub const MEMORY_BAR_MASK: u32 = 0xFFFF_FFF0;

    /// I/O BAR address mask
    pub const IO_BAR_MASK: u32 = 0xFFFF_FFFC;
}
