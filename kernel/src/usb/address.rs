//! Per-controller USB device address allocation.

/// Highest assignable device address
pub const MAX_ADDRESS: u8 = 127;

/// Addresses 1..=127 of one host controller. Address 0 is the default
/// address every device answers on before SET_ADDRESS and is never handed
/// out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    used: u128,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPool {
    pub const fn new() -> Self {
        Self { used: 1 }
    }

    /// Reserves the lowest free address.
    pub fn allocate(&mut self) -> Option<u8> {
        let free = !self.used;
        if free == 0 {
            return None;
        }
        let address = free.trailing_zeros() as u8;
        self.used |= 1u128 << address;
        Some(address)
    }

    /// Returns `address` to the pool. Returns `false` if it was not
    /// allocated.
    pub fn free(&mut self, address: u8) -> bool {
        if address == 0 || address > MAX_ADDRESS || !self.is_allocated(address) {
            return false;
        }
        self.used &= !(1u128 << address);
        true
    }

    pub fn is_allocated(&self, address: u8) -> bool {
        address != 0 && address <= MAX_ADDRESS && self.used & (1u128 << address) != 0
    }

    /// Number of addresses currently handed out
    pub fn in_use(&self) -> usize {
        (self.used | 1).count_ones() as usize - 1
    }
}
