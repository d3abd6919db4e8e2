//! Handoff of claimed devices to the subsystems layered above the buses.
//!
//! A driver that successfully claims a NIC, keyboard or disk announces an
//! abstract device here; the networking, input and storage stacks pick them
//! up from this list. Each bus device may be handed off at most once.

use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::{
    info,
    pci::PciAddress,
    usb::{BusId, DeviceHandle},
};

/// The bus device a downstream registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOwner {
    Pci(PciAddress),
    Usb { bus: BusId, device: DeviceHandle },
}

impl fmt::Display for DeviceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOwner::Pci(address) => write!(f, "pci {}", address),
            DeviceOwner::Usb { bus, device } => write!(f, "{} {}", bus, device),
        }
    }
}

/// What kind of device the upper layer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Network { name: &'static str, mac: [u8; 6] },
    Input { name: &'static str, endpoint: u8 },
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Network { name, .. } | DeviceKind::Input { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDevice {
    pub id: usize,
    pub owner: DeviceOwner,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    /// The owner already handed off a device.
    AlreadyRegistered,
    /// No registration exists for the owner.
    NotRegistered,
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::AlreadyRegistered => write!(f, "device already handed off"),
            HandoffError::NotRegistered => write!(f, "no device registered"),
        }
    }
}

/// Registered downstream devices.
pub struct DeviceList {
    devices: Vec<RegisteredDevice>,
    next_id: usize,
}

impl Default for DeviceList {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceList {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, owner: DeviceOwner, kind: DeviceKind) -> Result<usize, HandoffError> {
        if self.devices.iter().any(|dev| dev.owner == owner) {
            return Err(HandoffError::AlreadyRegistered);
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("{}: registered {} as device {}", owner, kind.name(), id);
        self.devices.push(RegisteredDevice { id, owner, kind });
        Ok(id)
    }

    pub fn unregister(&mut self, owner: DeviceOwner) -> Result<RegisteredDevice, HandoffError> {
        let index = self
            .devices
            .iter()
            .position(|dev| dev.owner == owner)
            .ok_or(HandoffError::NotRegistered)?;
        let removed = self.devices.remove(index);
        info!("{}: unregistered device {}", owner, removed.id);
        Ok(removed)
    }

    pub fn find(&self, owner: DeviceOwner) -> Option<&RegisteredDevice> {
        self.devices.iter().find(|dev| dev.owner == owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Devices handed to the upper layers.
pub static DOWNSTREAM: Mutex<DeviceList> = Mutex::new(DeviceList::new());

pub fn register(owner: DeviceOwner, kind: DeviceKind) -> Result<usize, HandoffError> {
    DOWNSTREAM.lock().register(owner, kind)
}

pub fn unregister(owner: DeviceOwner) -> Result<RegisteredDevice, HandoffError> {
    DOWNSTREAM.lock().unregister(owner)
}

pub fn lookup(owner: DeviceOwner) -> Option<RegisteredDevice> {
    DOWNSTREAM.lock().find(owner).cloned()
}
