//! Driver matching shared by the PCI and USB buses.
//!
//! A bus owns an immutable, ordered table of drivers. For each discovered
//! device the table is walked front to back: the first driver whose predicate
//! matches gets its `init` called, and a driver that declines (returns
//! `false`) simply lets the walk continue. Declaration order is therefore the
//! tie-break, so specific drivers must be listed before the generic ones they
//! would otherwise be shadowed by.

use core::fmt;

use crate::{info, warn};

/// A driver for devices of type `Device`.
pub trait Driver: Sync {
    type Device: ?Sized;

    /// Name reported in logs and in the device's binding.
    fn name(&self) -> &'static str;

    /// Cheap identity check. Must not touch hardware.
    fn matches(&self, device: &Self::Device) -> bool;

    /// Claims the device. Returning `false` rejects it and lets later table
    /// entries have a go.
    fn init(&self, device: &Self::Device) -> bool;
}

/// Result of running a device through a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `driver` accepted the device.
    Claimed(&'static str),
    /// No predicate matched.
    Unclaimed,
    /// At least one predicate matched but every matching driver rejected the
    /// device; `driver` is the last one that did.
    Failed(&'static str),
}

impl Outcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Outcome::Claimed(_))
    }
}

/// Ordered, read-only driver table.
pub struct Registry<D: ?Sized + 'static> {
    drivers: &'static [&'static dyn Driver<Device = D>],
}

impl<D: ?Sized + 'static> Clone for Registry<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: ?Sized + 'static> Copy for Registry<D> {}

impl<D: ?Sized + fmt::Display + 'static> Registry<D> {
    pub const fn new(drivers: &'static [&'static dyn Driver<Device = D>]) -> Self {
        Self { drivers }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Driver names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.drivers.iter().map(|driver| driver.name())
    }

    /// First driver whose predicate matches, without initializing anything.
    pub fn lookup(&self, device: &D) -> Option<&'static str> {
        self.drivers
            .iter()
            .find(|driver| driver.matches(device))
            .map(|driver| driver.name())
    }

    /// Walks the table and initializes the first driver that accepts `device`.
    pub fn match_and_init(&self, device: &D) -> Outcome {
        let mut rejected_by = None;

        for driver in self.drivers {
            if !driver.matches(device) {
                continue;
            }

            if driver.init(device) {
                info!("{}: claimed by {}", device, driver.name());
                return Outcome::Claimed(driver.name());
            }

            warn!("{}: rejected by {}", device, driver.name());
            rejected_by = Some(driver.name());
        }

        match rejected_by {
            Some(driver) => Outcome::Failed(driver),
            None => {
                info!("{}: no driver", device);
                Outcome::Unclaimed
            }
        }
    }
}
