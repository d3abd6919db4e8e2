/*
Copyright © 2024–2025 Mako and JayAndJef

This file is part of locOS.

locOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

locOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with locOS. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Device discovery for locOS: the PCI scan, the USB device tree, and the
//! driver tables both buses dispatch through.
//!
//! The kernel calls [`probe_hardware`] once the heap is up. Everything else
//! (USB enumeration included) follows from the PCI scan.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod downstream;
pub mod driver;
pub mod output;
pub mod pci;
pub mod serial;
pub mod usb;

use pci::PortConfigAccess;

static CONFIG_ACCESS: PortConfigAccess = PortConfigAccess::new();

/// Routes logging to COM1 and scans the PCI bus, bringing up every driver
/// that claims a function. Returns the number of PCI functions found.
pub fn probe_hardware() -> usize {
    serial::init_serial_logging();
    info!("probing hardware");

    let functions = pci::init_pci(&CONFIG_ACCESS);
    info!(
        "{} PCI functions, {} USB devices, {} devices handed off",
        functions,
        usb::USB_BUS.len(),
        downstream::DOWNSTREAM.lock().len()
    );
    functions
}
