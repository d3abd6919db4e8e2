//! PCI driver for USB host controllers.
//!
//! The controller-specific register code (UHCI, OHCI, EHCI, xHCI) lives
//! outside this crate. It is plugged in with [`register_hcd_probe`]; this
//! driver then turns each matching PCI function into a [`HostController`]
//! and hands it to the USB bus, which enumerates the root ports right away.
//! A controller that faults during that first scan is taken back out of
//! service and the PCI function is left rejected.

use alloc::sync::Arc;
use core::fmt;

use conquer_once::spin::{Lazy, OnceCell};

use crate::{
    driver::Driver,
    error, info,
    pci::{
        PciDevice, PciMatch,
        config::{device_classes, subclasses, usb_prog_if},
        device::match_table,
    },
    warn,
};

use super::{USB_BUS, UsbBus, transfer::HostController, tree::HostError};

/// Builds a host controller for a PCI function, or declines it
pub type HcdProbe = fn(&PciDevice) -> Option<Arc<dyn HostController>>;

static HCD_PROBE: OnceCell<HcdProbe> = OnceCell::uninit();

/// Installs the host controller factory used by [`USB_HOST`]. Returns
/// `false` if one is already installed.
pub fn register_hcd_probe(probe: HcdProbe) -> bool {
    HCD_PROBE.try_init_once(|| probe).is_ok()
}

/// Host controller interface, from the PCI programming interface byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Uhci,
    Ohci,
    Ehci,
    Xhci,
    Other(u8),
}

impl HostKind {
    pub fn from_prog_if(prog_if: u8) -> Self {
        match prog_if {
            usb_prog_if::UHCI => HostKind::Uhci,
            usb_prog_if::OHCI => HostKind::Ohci,
            usb_prog_if::EHCI => HostKind::Ehci,
            usb_prog_if::XHCI => HostKind::Xhci,
            other => HostKind::Other(other),
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::Uhci => f.write_str("UHCI"),
            HostKind::Ohci => f.write_str("OHCI"),
            HostKind::Ehci => f.write_str("EHCI"),
            HostKind::Xhci => f.write_str("xHCI"),
            HostKind::Other(prog_if) => write!(f, "prog-if {:#04x}", prog_if),
        }
    }
}

const HOST_TABLE: &[PciMatch] = &[PciMatch::class(
    device_classes::SERIAL_BUS,
    subclasses::SERIAL_BUS_USB,
)];

pub struct UsbHostDriver {
    bus: &'static Lazy<UsbBus>,
    probe: &'static OnceCell<HcdProbe>,
}

impl UsbHostDriver {
    pub const fn new(bus: &'static Lazy<UsbBus>, probe: &'static OnceCell<HcdProbe>) -> Self {
        Self { bus, probe }
    }
}

impl Driver for UsbHostDriver {
    type Device = PciDevice;

    fn name(&self) -> &'static str {
        "usb-host"
    }

    fn matches(&self, device: &PciDevice) -> bool {
        match_table(HOST_TABLE, device)
    }

    fn init(&self, device: &PciDevice) -> bool {
        let kind = HostKind::from_prog_if(device.prog_if);

        let Some(probe) = self.probe.get() else {
            warn!("USB: no driver for {} controller at {}", kind, device.address);
            return false;
        };
        let Some(hcd) = probe(device) else {
            warn!("USB: {} controller at {} declined", kind, device.address);
            return false;
        };

        let controller = match self.bus.add_controller(hcd) {
            Ok(controller) => controller,
            Err(HostError::TableFull) => return false,
            Err(HostError::Fault(controller)) => {
                error!(
                    "USB {}: {} controller at {} faulted, disabling it",
                    controller, kind, device.address
                );
                self.bus.remove_controller(controller);
                return false;
            }
        };
        info!(
            "USB {}: {} controller at {}, {} devices on bus",
            controller,
            kind,
            device.address,
            self.bus.len()
        );
        true
    }
}

pub static USB_HOST: UsbHostDriver = UsbHostDriver::new(&USB_BUS, &HCD_PROBE);
