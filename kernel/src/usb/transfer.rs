//! The transfer channel: the only path from USB code to a host controller.
//!
//! Every control, interrupt and bulk transfer goes through a
//! [`TransferChannel`]. The channel resolves the device handle, serializes
//! transfers to the same device, enforces the timeout ceiling, and reports
//! [`TransferError::Disconnected`] if the device goes away before or during
//! the transfer. Transfers to different devices run concurrently.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering},
};

use spin::{Mutex, RwLock};

use crate::{error, trace};

use super::{
    arena::DeviceHandle,
    descriptor::SetupPacket,
    device::{BusId, EndpointKind, UsbSpeed},
    hub::PortStatus,
    tree::TreeState,
};

/// Timeout for control transfers that do not ask for one
pub const DEFAULT_CONTROL_TIMEOUT_MS: u32 = 1000;
/// Ceiling for any caller-supplied timeout
pub const MAX_TRANSFER_TIMEOUT_MS: u32 = 5000;

/// Why a transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// No response within the timeout
    Timeout,
    /// The endpoint answered with STALL
    Stall,
    /// The host controller reported a fault
    ControllerError,
    /// The device is no longer in the tree
    Disconnected,
    /// The request was rejected before reaching the controller
    InvalidRequest,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransferError::Timeout => "transfer timed out",
            TransferError::Stall => "endpoint stalled",
            TransferError::ControllerError => "host controller error",
            TransferError::Disconnected => "device disconnected",
            TransferError::InvalidRequest => "invalid transfer request",
        };
        f.write_str(msg)
    }
}

/// Where a transfer goes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTarget {
    pub address: u8,
    /// Endpoint address, direction in bit 7
    pub endpoint: u8,
    pub speed: UsbSpeed,
    pub max_packet_size: u16,
}

/// Hardware side of a USB host controller (UHCI, OHCI, EHCI or xHCI).
///
/// Implementations run one transfer to completion per call and may be
/// called from several threads at once for different device addresses.
pub trait HostController: Send + Sync {
    fn name(&self) -> &'static str;

    fn root_port_count(&self) -> u8;

    /// Current state of a root port, 1-based. Reading clears the
    /// connect-change flag.
    fn root_port_status(&self, port: u8) -> Result<PortStatus, TransferError>;

    /// Drives reset on a root port and returns the status once the port is
    /// enabled.
    fn reset_root_port(&self, port: u8) -> Result<PortStatus, TransferError>;

    /// Runs the setup, optional data and status stages. Returns the number
    /// of bytes moved in the data stage.
    fn control(
        &self,
        target: &TransferTarget,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, TransferError>;

    /// Runs an interrupt or bulk transfer on `target.endpoint`.
    fn transfer(
        &self,
        target: &TransferTarget,
        kind: EndpointKind,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, TransferError>;

    fn delay_ms(&self, ms: u32);
}

/// Per-device transfer state shared between the tree and in-flight
/// transfers
pub struct DevicePipe {
    hcd: Arc<dyn HostController>,
    /// Shared by every pipe of the controller; set on the first hardware fault
    fault: Arc<AtomicBool>,
    speed: UsbSpeed,
    lock: Mutex<()>,
    connected: AtomicBool,
    address: AtomicU8,
    max_packet_size: AtomicU16,
}

impl DevicePipe {
    pub(crate) fn new(hcd: Arc<dyn HostController>, fault: Arc<AtomicBool>, speed: UsbSpeed) -> Self {
        Self {
            hcd,
            fault,
            speed,
            lock: Mutex::new(()),
            connected: AtomicBool::new(true),
            address: AtomicU8::new(0),
            max_packet_size: AtomicU16::new(speed.default_max_packet_size()),
        }
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::Release);
    }

    pub(crate) fn set_max_packet_size(&self, size: u16) {
        self.max_packet_size.store(size, Ordering::Release);
    }

    pub(crate) fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Waits for an in-flight transfer to finish.
    pub(crate) fn drain(&self) {
        drop(self.lock.lock());
    }

    pub(crate) fn controller(&self) -> &Arc<dyn HostController> {
        &self.hcd
    }

    fn target(&self, endpoint: u8) -> TransferTarget {
        TransferTarget {
            address: self.address(),
            endpoint,
            speed: self.speed,
            max_packet_size: self.max_packet_size.load(Ordering::Acquire),
        }
    }

    /// Runs `op` with the device's transfer lock held, failing with
    /// `Disconnected` if the device is gone when the lock is taken or when
    /// `op` returns. A controller fault marks the whole controller.
    fn exclusive<T>(
        &self,
        op: impl FnOnce(&dyn HostController) -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let _serial = self.lock.lock();
        if !self.is_connected() {
            return Err(TransferError::Disconnected);
        }

        let result = op(self.hcd.as_ref());
        if let Err(TransferError::ControllerError) = result {
            self.fault.store(true, Ordering::Release);
        }

        if !self.is_connected() {
            return Err(TransferError::Disconnected);
        }
        result
    }
}

impl fmt::Debug for DevicePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePipe")
            .field("controller", &self.hcd.name())
            .field("speed", &self.speed)
            .field("address", &self.address())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Clamps a caller's timeout to the ceiling, defaulting when absent.
pub fn effective_timeout(requested_ms: Option<u32>) -> u32 {
    requested_ms
        .unwrap_or(DEFAULT_CONTROL_TIMEOUT_MS)
        .clamp(1, MAX_TRANSFER_TIMEOUT_MS)
}

/// Cloneable handle for issuing transfers to devices on the USB bus
#[derive(Clone)]
pub struct TransferChannel {
    bus: BusId,
    tree: Arc<RwLock<TreeState>>,
}

impl TransferChannel {
    pub(crate) fn new(bus: BusId, tree: Arc<RwLock<TreeState>>) -> Self {
        Self { bus, tree }
    }

    /// The bus this channel reaches.
    pub fn bus(&self) -> BusId {
        self.bus
    }

    fn pipe(&self, handle: DeviceHandle) -> Result<Arc<DevicePipe>, TransferError> {
        self.tree
            .read()
            .device(handle)
            .map(|device| device.pipe.clone())
            .ok_or(TransferError::Disconnected)
    }

    /// Whether `handle` still names a connected device.
    pub fn is_connected(&self, handle: DeviceHandle) -> bool {
        self.pipe(handle).is_ok_and(|pipe| pipe.is_connected())
    }

    /// Control transfer on `endpoint` (normally 0). `data` must hold at
    /// least `setup.length` bytes; only that prefix is used.
    pub fn control_transfer(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout_ms: Option<u32>,
    ) -> Result<usize, TransferError> {
        let length = setup.length as usize;
        if endpoint > 0x0F || length > data.len() {
            return Err(TransferError::InvalidRequest);
        }

        let pipe = self.pipe(handle)?;
        let timeout = effective_timeout(timeout_ms);
        trace!(
            "USB {}: control {:02x}:{:02x} value={:04x} len={} at address {}",
            handle,
            setup.request_type,
            setup.request,
            setup.value,
            length,
            pipe.address()
        );

        let result = pipe.exclusive(|hcd| {
            hcd.control(&pipe.target(endpoint), setup, &mut data[..length], timeout)
        });
        log_failure(handle, &result);
        result
    }

    /// Control transfer on endpoint 0 with the default timeout.
    pub fn control(
        &self,
        handle: DeviceHandle,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, TransferError> {
        self.control_transfer(handle, 0, setup, data, None)
    }

    /// Interrupt transfer; `endpoint` carries the direction in bit 7.
    pub fn interrupt_transfer(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: Option<u32>,
    ) -> Result<usize, TransferError> {
        self.data_transfer(handle, EndpointKind::Interrupt, endpoint, data, timeout_ms)
    }

    /// Bulk transfer; `endpoint` carries the direction in bit 7.
    pub fn bulk_transfer(
        &self,
        handle: DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: Option<u32>,
    ) -> Result<usize, TransferError> {
        self.data_transfer(handle, EndpointKind::Bulk, endpoint, data, timeout_ms)
    }

    fn data_transfer(
        &self,
        handle: DeviceHandle,
        kind: EndpointKind,
        endpoint: u8,
        data: &mut [u8],
        timeout_ms: Option<u32>,
    ) -> Result<usize, TransferError> {
        if endpoint & 0x0F == 0 || endpoint & 0x70 != 0 {
            return Err(TransferError::InvalidRequest);
        }

        let pipe = self.pipe(handle)?;
        let timeout = effective_timeout(timeout_ms);
        let result = pipe.exclusive(|hcd| hcd.transfer(&pipe.target(endpoint), kind, data, timeout));
        log_failure(handle, &result);
        result
    }

    /// Waits `ms` milliseconds on the device's controller clock.
    pub fn delay_ms(&self, handle: DeviceHandle, ms: u32) -> Result<(), TransferError> {
        let pipe = self.pipe(handle)?;
        pipe.controller().delay_ms(ms);
        Ok(())
    }
}

fn log_failure(handle: DeviceHandle, result: &Result<usize, TransferError>) {
    if let Err(e) = result {
        if *e == TransferError::ControllerError {
            error!("USB {}: {}", handle, e);
        } else {
            trace!("USB {}: {}", handle, e);
        }
    }
}
