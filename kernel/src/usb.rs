//! USB device tree and driver dispatch.
//!
//! This module provides:
//!
//! - The device tree: address allocation, the enumeration state machine,
//!   recursive hub expansion and hot-plug
//! - The transfer channel every USB driver talks to its device through
//! - The static USB driver table
//! - The PCI driver that brings host controllers onto the bus
//!
//! Devices are referred to by [`DeviceHandle`], a generation-checked index
//! that stops resolving once the device is unplugged.

pub mod address;
pub mod arena;
pub mod descriptor;
pub mod device;
pub mod hid;
pub mod host;
pub mod hub;
pub mod transfer;
pub mod tree;

#[cfg(test)]
pub(crate) mod fake;

use conquer_once::spin::Lazy;

use crate::driver::{Driver, Registry};

pub use arena::DeviceHandle;
pub use device::{BusId, ControllerId, DeviceState, UsbDevice, UsbMatch, UsbProbe, UsbSpeed};
pub use transfer::{HostController, TransferChannel, TransferError};
pub use tree::{EnumerationError, HostError, PortEvent, Upstream, UsbBus};

/// Built-in USB drivers, most specific first
pub static USB_DRIVERS: [&dyn Driver<Device = UsbProbe>; 2] = [&hid::KEYBOARD, &hub::HUB];

pub fn default_registry() -> Registry<UsbProbe> {
    Registry::new(&USB_DRIVERS)
}

/// The machine's USB bus, fed by [`host::USB_HOST`]
pub static USB_BUS: Lazy<UsbBus> = Lazy::new(|| UsbBus::new(default_registry()));
