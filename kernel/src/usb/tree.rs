//! The USB device tree: enumeration, hub expansion and hot-plug.
//!
//! Devices live in a generational [`Arena`] behind a read/write lock that is
//! only ever held for short bookkeeping. Anything that changes topology
//! (attaching, enumerating, detaching) additionally holds the bus-wide
//! hot-plug lock for its whole duration: every new device answers on
//! address 0 until SET_ADDRESS, so only one may be enumerated at a time.
//!
//! Driver `init` runs with the hot-plug lock held. Drivers may issue
//! transfers through the channel they are handed but must not call back
//! into [`UsbBus`] topology operations.

use alloc::{
    collections::VecDeque,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::{Mutex, RwLock};

use crate::{
    debug,
    downstream::{self, DeviceOwner},
    driver::{Outcome, Registry},
    error, info, warn,
};

use super::{
    address::AddressPool,
    arena::{Arena, DeviceHandle},
    descriptor::{
        CONFIGURATION_HEADER_LEN, ConfigurationDescriptor, DEVICE_DESCRIPTOR_LEN,
        DescriptorError, DeviceDescriptor, SetupPacket, class, descriptor_type, parse_configuration,
        parse_language, parse_max_packet_size0, parse_string,
    },
    device::{BusId, ControllerId, DeviceState, UsbDevice, UsbProbe},
    hub::{self, PortStatus, port_feature},
    transfer::{DevicePipe, HostController, TransferChannel, TransferError},
};

/// Hub tiers below the root hub. A hub may sit at most this deep; the tier
/// below the last hub holds functions only.
pub const MAX_HUB_DEPTH: u8 = 5;
/// Enumeration failures kept for introspection
pub const MAX_FAILURES: usize = 16;
/// Time the device gets to switch to its new address
const SET_ADDRESS_RECOVERY_MS: u32 = 2;
const MAX_CONTROLLERS: usize = 16;

const PLACEHOLDER_VENDOR: &str = "Generic";
const PLACEHOLDER_PRODUCT: &str = "USB device";
const PLACEHOLDER_HUB: &str = "USB hub";

/// Why a device could not be brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationError {
    Transfer(TransferError),
    /// All 127 addresses of the controller are in use
    AddressExhausted,
    /// Too many hubs between the device and the root port
    DepthExceeded,
    MalformedDescriptor(DescriptorError),
    /// No such port on the upstream hub or controller
    InvalidPort,
    /// The port did not come back enabled after reset
    PortDisabled,
    /// The device arena is full
    TooManyDevices,
}

impl EnumerationError {
    /// The host controller itself failed, not just this device
    pub fn is_controller_fault(&self) -> bool {
        matches!(self, EnumerationError::Transfer(TransferError::ControllerError))
    }
}

impl From<TransferError> for EnumerationError {
    fn from(e: TransferError) -> Self {
        EnumerationError::Transfer(e)
    }
}

impl From<DescriptorError> for EnumerationError {
    fn from(e: DescriptorError) -> Self {
        EnumerationError::MalformedDescriptor(e)
    }
}

impl fmt::Display for EnumerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumerationError::Transfer(e) => write!(f, "{}", e),
            EnumerationError::AddressExhausted => write!(f, "no free device address"),
            EnumerationError::DepthExceeded => {
                write!(f, "more than {} hubs deep", MAX_HUB_DEPTH)
            }
            EnumerationError::MalformedDescriptor(e) => write!(f, "malformed descriptor: {}", e),
            EnumerationError::InvalidPort => write!(f, "no such port"),
            EnumerationError::PortDisabled => write!(f, "port not enabled after reset"),
            EnumerationError::TooManyDevices => write!(f, "device table full"),
        }
    }
}

/// Why a host controller could not be put into service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// Every controller slot is taken
    TableFull,
    /// The controller faulted while its ports were scanned. It stays
    /// registered, refusing port changes, until it is removed.
    Fault(ControllerId),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::TableFull => write!(f, "controller table full"),
            HostError::Fault(id) => write!(f, "{} hardware fault", id),
        }
    }
}

/// The hub or controller a port belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Root(ControllerId),
    Hub(DeviceHandle),
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::Root(controller) => write!(f, "{} root", controller),
            Upstream::Hub(hub) => write!(f, "hub {}", hub),
        }
    }
}

/// A device that was abandoned during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerationFailure {
    pub upstream: Upstream,
    pub port: u8,
    pub error: EnumerationError,
}

/// What handling a port change did to the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Unchanged,
    Attached(DeviceHandle),
    /// Devices removed, descendants before their hubs
    Detached(Vec<DeviceHandle>),
    Replaced {
        removed: Vec<DeviceHandle>,
        attached: DeviceHandle,
    },
}

struct ControllerEntry {
    hcd: Arc<dyn HostController>,
    /// Shared with every device pipe on the controller
    fault: Arc<AtomicBool>,
    /// Cleared once the controller is taken out of service
    enabled: bool,
    addresses: AddressPool,
    /// Devices on root ports, in port order
    root_devices: Vec<DeviceHandle>,
}

/// Lock-protected bookkeeping shared with the transfer channel
pub(crate) struct TreeState {
    devices: Arena<UsbDevice>,
    controllers: Vec<ControllerEntry>,
    /// Live devices in enumeration order
    order: Vec<DeviceHandle>,
    failures: VecDeque<EnumerationFailure>,
}

impl TreeState {
    fn new() -> Self {
        Self {
            devices: Arena::new(),
            controllers: Vec::new(),
            order: Vec::new(),
            failures: VecDeque::new(),
        }
    }

    pub(crate) fn device(&self, handle: DeviceHandle) -> Option<&UsbDevice> {
        self.devices.get(handle)
    }

    fn siblings(&self, parent: Option<DeviceHandle>, controller: ControllerId) -> &[DeviceHandle] {
        match parent {
            Some(hub) => self
                .devices
                .get(hub)
                .map(|dev| dev.children.as_slice())
                .unwrap_or(&[]),
            None => self
                .controllers
                .get(controller.0 as usize)
                .map(|entry| entry.root_devices.as_slice())
                .unwrap_or(&[]),
        }
    }

    fn siblings_mut(
        &mut self,
        parent: Option<DeviceHandle>,
        controller: ControllerId,
    ) -> Option<&mut Vec<DeviceHandle>> {
        match parent {
            Some(hub) => self.devices.get_mut(hub).map(|dev| &mut dev.children),
            None => self
                .controllers
                .get_mut(controller.0 as usize)
                .map(|entry| &mut entry.root_devices),
        }
    }

    fn controller(&self, id: ControllerId) -> Option<&ControllerEntry> {
        self.controllers.get(id.0 as usize).filter(|entry| entry.enabled)
    }

    fn device_at(&self, upstream: Upstream, port: u8) -> Option<DeviceHandle> {
        let (parent, controller) = match upstream {
            Upstream::Root(controller) => (None, controller),
            Upstream::Hub(hub) => (Some(hub), self.devices.get(hub)?.controller),
        };
        self.siblings(parent, controller)
            .iter()
            .copied()
            .find(|&child| self.devices.get(child).is_some_and(|dev| dev.port == port))
    }

    /// `root` and everything below it, children before parents
    fn subtree_post_order(&self, root: DeviceHandle, out: &mut Vec<DeviceHandle>) {
        let Some(device) = self.devices.get(root) else {
            return;
        };
        for &child in &device.children {
            self.subtree_post_order(child, out);
        }
        out.push(root);
    }

    fn record_failure(&mut self, failure: EnumerationFailure) {
        if self.failures.len() == MAX_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(failure);
    }
}

/// Where a new device on `upstream` would hang
struct Attachment {
    controller: ControllerId,
    hcd: Arc<dyn HostController>,
    fault: Arc<AtomicBool>,
    parent: Option<DeviceHandle>,
    depth: u8,
}

/// All USB devices reachable from the attached host controllers
pub struct UsbBus {
    id: BusId,
    tree: Arc<RwLock<TreeState>>,
    hotplug: Mutex<()>,
    registry: Registry<UsbProbe>,
}

impl UsbBus {
    pub fn new(registry: Registry<UsbProbe>) -> Self {
        Self {
            id: BusId::next(),
            tree: Arc::new(RwLock::new(TreeState::new())),
            hotplug: Mutex::new(()),
            registry,
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    /// A channel for transfers to devices on this bus.
    pub fn channel(&self) -> TransferChannel {
        TransferChannel::new(self.id, self.tree.clone())
    }

    /// Registers a host controller and enumerates whatever is plugged into
    /// its root ports, in port order.
    ///
    /// A hardware fault stops the scan and is returned as
    /// [`HostError::Fault`]; the caller decides whether to
    /// [`remove_controller`](Self::remove_controller).
    pub fn add_controller(&self, hcd: Arc<dyn HostController>) -> Result<ControllerId, HostError> {
        let _hotplug = self.hotplug.lock();

        let name = hcd.name();
        let ports = hcd.root_port_count();
        let fault = Arc::new(AtomicBool::new(false));
        let id = {
            let mut tree = self.tree.write();
            if tree.controllers.len() >= MAX_CONTROLLERS {
                warn!("USB: controller table full, ignoring {}", name);
                return Err(HostError::TableFull);
            }
            let id = ControllerId(tree.controllers.len() as u8);
            info!("USB {}: {} with {} root ports", id, name, ports);
            tree.controllers.push(ControllerEntry {
                hcd,
                fault: fault.clone(),
                enabled: true,
                addresses: AddressPool::new(),
                root_devices: Vec::new(),
            });
            id
        };

        for port in 1..=ports {
            match self.reconcile(Upstream::Root(id), port) {
                Err(e) if e.is_controller_fault() => break,
                Err(e) => debug!("USB {} port {}: {}", id, port, e),
                Ok(_) => {}
            }
        }

        if fault.load(Ordering::Acquire) {
            error!("USB {}: {} faulted, root port scan stopped", id, name);
            return Err(HostError::Fault(id));
        }
        Ok(id)
    }

    /// Takes a controller out of service. Everything behind its root ports
    /// is detached and later port changes on it fail with `InvalidPort`.
    /// Returns the removed devices, descendants before their hubs.
    pub fn remove_controller(&self, id: ControllerId) -> Vec<DeviceHandle> {
        let _hotplug = self.hotplug.lock();

        let roots = match self.tree.write().controllers.get_mut(id.0 as usize) {
            Some(entry) if entry.enabled => {
                entry.enabled = false;
                entry.root_devices.clone()
            }
            _ => return Vec::new(),
        };

        let removed: Vec<DeviceHandle> = roots.into_iter().flat_map(|root| self.detach(root)).collect();
        warn!("USB {}: disabled, {} devices removed", id, removed.len());
        removed
    }

    /// Handles a connect or disconnect reported on one port.
    pub fn port_changed(&self, upstream: Upstream, port: u8) -> Result<PortEvent, EnumerationError> {
        let _hotplug = self.hotplug.lock();
        self.reconcile(upstream, port)
    }

    /// Handles a hub's status-change interrupt. Bit `n` of `bitmap` flags
    /// port `n`; bit 0 (the hub itself) is ignored. Ports are handled in
    /// ascending order, stopping after a controller fault.
    pub fn hub_status_changed(
        &self,
        hub: DeviceHandle,
        bitmap: u32,
    ) -> Vec<(u8, Result<PortEvent, EnumerationError>)> {
        let _hotplug = self.hotplug.lock();

        let mut results = Vec::new();
        for port in (1..32u8).filter(|port| bitmap & (1 << port) != 0) {
            let result = self.reconcile(Upstream::Hub(hub), port);
            let fault = result.as_ref().is_err_and(EnumerationError::is_controller_fault);
            results.push((port, result));
            if fault {
                break;
            }
        }
        results
    }

    /// Brings the tree in line with the current state of one port.
    fn reconcile(&self, upstream: Upstream, port: u8) -> Result<PortEvent, EnumerationError> {
        // A faulted controller takes no further topology changes
        if self.fault_flag(upstream)?.load(Ordering::Acquire) {
            return Err(TransferError::ControllerError.into());
        }

        let status = self.read_port(upstream, port)?;

        if let (Upstream::Hub(hub), true) = (upstream, status.connect_changed) {
            let channel = self.channel();
            if let Err(e) = hub::clear_port_feature(&channel, hub, port, port_feature::C_PORT_CONNECTION) {
                debug!("USB hub {}: clearing port {} change: {}", hub, port, e);
            }
        }

        let existing = self.tree.read().device_at(upstream, port);
        match (existing, status.connected) {
            (Some(device), false) => Ok(PortEvent::Detached(self.detach(device))),
            (Some(device), true) if status.connect_changed => {
                let removed = self.detach(device);
                let attached = self.attach(upstream, port)?;
                Ok(PortEvent::Replaced { removed, attached })
            }
            (None, true) => Ok(PortEvent::Attached(self.attach(upstream, port)?)),
            _ => Ok(PortEvent::Unchanged),
        }
    }

    fn read_port(&self, upstream: Upstream, port: u8) -> Result<PortStatus, EnumerationError> {
        match upstream {
            Upstream::Root(controller) => {
                let (hcd, fault) = self.controller(controller)?;
                if port == 0 || port > hcd.root_port_count() {
                    return Err(EnumerationError::InvalidPort);
                }
                Ok(note_fault(&fault, hcd.root_port_status(port))?)
            }
            Upstream::Hub(hub) => {
                let ports = self
                    .tree
                    .read()
                    .device(hub)
                    .map(|dev| dev.ports)
                    .ok_or(TransferError::Disconnected)?;
                if port == 0 || port > ports {
                    return Err(EnumerationError::InvalidPort);
                }
                Ok(hub::port_status(&self.channel(), hub, port)?)
            }
        }
    }

    fn controller(
        &self,
        id: ControllerId,
    ) -> Result<(Arc<dyn HostController>, Arc<AtomicBool>), EnumerationError> {
        self.tree
            .read()
            .controller(id)
            .map(|entry| (entry.hcd.clone(), entry.fault.clone()))
            .ok_or(EnumerationError::InvalidPort)
    }

    /// Fault flag of the controller `upstream` hangs off.
    fn fault_flag(&self, upstream: Upstream) -> Result<Arc<AtomicBool>, EnumerationError> {
        let tree = self.tree.read();
        let controller = match upstream {
            Upstream::Root(controller) => controller,
            Upstream::Hub(hub) => tree.device(hub).ok_or(TransferError::Disconnected)?.controller,
        };
        tree.controller(controller)
            .map(|entry| entry.fault.clone())
            .ok_or(EnumerationError::InvalidPort)
    }

    /// Enumerates the device on `upstream`/`port`, abandoning it on failure.
    fn attach(&self, upstream: Upstream, port: u8) -> Result<DeviceHandle, EnumerationError> {
        let result = self.try_attach(upstream, port);

        if let Err(error) = result {
            if error.is_controller_fault() {
                error!("USB {} port {}: device abandoned: {}", upstream, port, error);
            } else {
                warn!("USB {} port {}: device abandoned: {}", upstream, port, error);
            }
            self.tree.write().record_failure(EnumerationFailure {
                upstream,
                port,
                error,
            });
        }
        result
    }

    fn try_attach(&self, upstream: Upstream, port: u8) -> Result<DeviceHandle, EnumerationError> {
        let attachment = self.locate(upstream)?;

        let status = match upstream {
            Upstream::Root(_) => note_fault(&attachment.fault, attachment.hcd.reset_root_port(port))?,
            Upstream::Hub(hub) => hub::reset_port(&self.channel(), hub, port)?,
        };
        if !status.connected {
            return Err(TransferError::Disconnected.into());
        }
        if !status.enabled {
            return Err(EnumerationError::PortDisabled);
        }

        let pipe = Arc::new(DevicePipe::new(attachment.hcd, attachment.fault, status.speed));
        let handle = self.insert(UsbDevice::new(
            attachment.controller,
            attachment.parent,
            port,
            attachment.depth,
            pipe.clone(),
        ))?;
        info!(
            "USB {}: {} device on {} port {}",
            handle, status.speed, upstream, port
        );

        if let Err(e) = self.enumerate(handle, &pipe) {
            self.detach(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn locate(&self, upstream: Upstream) -> Result<Attachment, EnumerationError> {
        match upstream {
            Upstream::Root(controller) => {
                let (hcd, fault) = self.controller(controller)?;
                Ok(Attachment {
                    controller,
                    hcd,
                    fault,
                    parent: None,
                    depth: 1,
                })
            }
            Upstream::Hub(hub) => {
                let tree = self.tree.read();
                let device = tree.device(hub).ok_or(TransferError::Disconnected)?;
                let entry = tree
                    .controller(device.controller)
                    .ok_or(EnumerationError::InvalidPort)?;
                Ok(Attachment {
                    controller: device.controller,
                    hcd: device.pipe.controller().clone(),
                    fault: entry.fault.clone(),
                    parent: Some(hub),
                    depth: device.depth + 1,
                })
            }
        }
    }

    fn insert(&self, device: UsbDevice) -> Result<DeviceHandle, EnumerationError> {
        let (controller, parent, port) = (device.controller, device.parent, device.port);

        let mut tree = self.tree.write();
        let handle = tree
            .devices
            .insert(device)
            .ok_or(EnumerationError::TooManyDevices)?;
        if let Some(device) = tree.devices.get_mut(handle) {
            device.handle = handle;
        }

        let siblings = tree.siblings(parent, controller);
        let position = siblings
            .iter()
            .position(|&s| tree.devices.get(s).is_some_and(|dev| dev.port > port))
            .unwrap_or(siblings.len());
        if let Some(siblings) = tree.siblings_mut(parent, controller) {
            siblings.insert(position, handle);
        }
        tree.order.push(handle);

        Ok(handle)
    }

    fn update(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&mut UsbDevice),
    ) -> Result<(), EnumerationError> {
        let mut tree = self.tree.write();
        let device = tree
            .devices
            .get_mut(handle)
            .ok_or(TransferError::Disconnected)?;
        f(device);
        Ok(())
    }

    /// Walks a freshly reset device from Detected to Bound or Unclaimed.
    fn enumerate(&self, handle: DeviceHandle, pipe: &DevicePipe) -> Result<(), EnumerationError> {
        let channel = self.channel();
        let (controller, depth) = self
            .tree
            .read()
            .device(handle)
            .map(|dev| (dev.controller, dev.depth))
            .ok_or(TransferError::Disconnected)?;

        // Detected -> Addressed
        let mut head = [0u8; 8];
        let len = channel.control(
            handle,
            &SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, 8),
            &mut head,
        )?;
        let max_packet_size = parse_max_packet_size0(&head[..len])? as u16;
        pipe.set_max_packet_size(max_packet_size);

        // Refused before it takes an address; the bottom tier holds functions only
        if head[4] == class::HUB && depth > MAX_HUB_DEPTH {
            return Err(EnumerationError::DepthExceeded);
        }

        let address = self.reserve_address(controller)?;
        if let Err(e) = channel.control(handle, &SetupPacket::set_address(address), &mut []) {
            self.release_address(controller, address);
            return Err(e.into());
        }
        pipe.set_address(address);
        self.update(handle, |dev| {
            dev.address = address;
            dev.max_packet_size = max_packet_size;
            dev.state = DeviceState::Addressed;
        })?;
        channel.delay_ms(handle, SET_ADDRESS_RECOVERY_MS)?;
        debug!("USB {}: address {}", handle, address);

        // Addressed -> Described
        let mut buf = [0u8; DEVICE_DESCRIPTOR_LEN];
        let len = channel.control(
            handle,
            &SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, DEVICE_DESCRIPTOR_LEN as u16),
            &mut buf,
        )?;
        let descriptor = DeviceDescriptor::parse(&buf[..len])?;

        let mut header = [0u8; CONFIGURATION_HEADER_LEN];
        let len = channel.control(
            handle,
            &SetupPacket::get_descriptor(
                descriptor_type::CONFIGURATION,
                0,
                0,
                CONFIGURATION_HEADER_LEN as u16,
            ),
            &mut header,
        )?;
        let total = ConfigurationDescriptor::parse(&header[..len])?.total_length as usize;

        let mut config = vec![0u8; total];
        let len = channel.control(
            handle,
            &SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 0, total as u16),
            &mut config,
        )?;
        let (configuration, functions) = parse_configuration(&config[..len])?;

        self.update(handle, |dev| {
            dev.usb_version = descriptor.usb_version;
            dev.vendor_id = descriptor.vendor_id;
            dev.product_id = descriptor.product_id;
            dev.device_version = descriptor.device_version;
            dev.class = descriptor.device_class;
            dev.subclass = descriptor.device_subclass;
            dev.protocol = descriptor.device_protocol;
            dev.num_configurations = descriptor.num_configurations;
            dev.state = DeviceState::Described;
        })?;

        // Described -> Configured
        channel.control(
            handle,
            &SetupPacket::set_configuration(configuration.configuration_value),
            &mut [],
        )?;
        self.update(handle, |dev| {
            dev.configured = true;
            dev.configuration_value = configuration.configuration_value;
            dev.functions = functions;
            dev.state = DeviceState::Configured;
        })?;

        let is_hub = descriptor.device_class == class::HUB;
        let strings = self.read_strings(&channel, handle, &descriptor, is_hub);
        self.update(handle, |dev| {
            [dev.vendor, dev.product, dev.serial] = strings;
        })?;

        self.bind(handle, channel)?;

        if is_hub {
            self.expand_hub(handle);
        }
        Ok(())
    }

    fn reserve_address(&self, controller: ControllerId) -> Result<u8, EnumerationError> {
        self.tree
            .write()
            .controllers
            .get_mut(controller.0 as usize)
            .and_then(|entry| entry.addresses.allocate())
            .ok_or(EnumerationError::AddressExhausted)
    }

    fn release_address(&self, controller: ControllerId, address: u8) {
        if let Some(entry) = self.tree.write().controllers.get_mut(controller.0 as usize) {
            entry.addresses.free(address);
        }
    }

    /// Vendor, product and serial strings, with placeholders for whatever
    /// the device does not provide.
    fn read_strings(
        &self,
        channel: &TransferChannel,
        handle: DeviceHandle,
        descriptor: &DeviceDescriptor,
        is_hub: bool,
    ) -> [String; 3] {
        let indexes = [
            descriptor.manufacturer_index,
            descriptor.product_index,
            descriptor.serial_index,
        ];
        let product = if is_hub {
            PLACEHOLDER_HUB
        } else {
            PLACEHOLDER_PRODUCT
        };
        let placeholders = [PLACEHOLDER_VENDOR, product, ""];

        let language = if indexes.iter().any(|&index| index != 0) {
            read_language(channel, handle)
        } else {
            None
        };

        let mut strings = placeholders.map(|s| s.to_string());
        if let Some(language) = language {
            for (string, &index) in strings.iter_mut().zip(&indexes) {
                if index == 0 {
                    continue;
                }
                match read_string(channel, handle, index, language) {
                    Some(value) => *string = value,
                    None => {
                        debug!("USB {}: string {} unavailable", handle, index);
                    }
                }
            }
        }
        strings
    }

    fn bind(&self, handle: DeviceHandle, channel: TransferChannel) -> Result<(), EnumerationError> {
        let device = self
            .tree
            .read()
            .device(handle)
            .cloned()
            .ok_or(TransferError::Disconnected)?;
        let outcome = self.registry.match_and_init(&UsbProbe { device, channel });

        self.update(handle, |dev| match outcome {
            Outcome::Claimed(driver) => dev.state = DeviceState::Bound(driver),
            Outcome::Unclaimed => dev.state = DeviceState::Unclaimed,
            Outcome::Failed(driver) => {
                dev.state = DeviceState::Unclaimed;
                dev.rejected_by = Some(driver);
            }
        })
    }

    /// Scans every port of a configured hub. Problems with individual ports
    /// stay local to them; a controller fault ends the scan.
    fn expand_hub(&self, hub: DeviceHandle) {
        let descriptor = match hub::hub_descriptor(&self.channel(), hub) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("USB hub {}: {}", hub, e);
                return;
            }
        };
        if self.update(hub, |dev| dev.ports = descriptor.num_ports).is_err() {
            return;
        }

        for port in 1..=descriptor.num_ports {
            match self.reconcile(Upstream::Hub(hub), port) {
                Err(e) if e.is_controller_fault() => break,
                Err(e) => debug!("USB hub {} port {}: {}", hub, port, e),
                Ok(_) => {}
            }
        }
    }

    /// Removes `root` and its subtree, deepest devices first. Returns the
    /// handles in removal order.
    fn detach(&self, root: DeviceHandle) -> Vec<DeviceHandle> {
        let mut removal = Vec::new();
        self.tree.read().subtree_post_order(root, &mut removal);

        for &handle in &removal {
            let pipe = self.tree.read().device(handle).map(|dev| dev.pipe.clone());
            if let Some(pipe) = pipe {
                pipe.disconnect();
                pipe.drain();
            }

            // Not every device was handed off
            let _ = downstream::unregister(DeviceOwner::Usb {
                bus: self.id,
                device: handle,
            });
            self.remove(handle);
        }
        removal
    }

    fn remove(&self, handle: DeviceHandle) {
        let mut tree = self.tree.write();
        let Some(mut device) = tree.devices.remove(handle) else {
            return;
        };
        device.state = DeviceState::Disconnected;

        if device.address != 0 {
            if let Some(entry) = tree.controllers.get_mut(device.controller.0 as usize) {
                entry.addresses.free(device.address);
            }
        }
        if let Some(siblings) = tree.siblings_mut(device.parent, device.controller) {
            siblings.retain(|&child| child != handle);
        }
        tree.order.retain(|&live| live != handle);

        info!("USB {}: disconnected (address {})", handle, device.address);
    }

    /// Snapshot of every device, in enumeration order.
    pub fn devices(&self) -> Vec<UsbDevice> {
        let tree = self.tree.read();
        tree.order
            .iter()
            .filter_map(|&handle| tree.device(handle).cloned())
            .collect()
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<UsbDevice> {
        self.tree.read().device(handle).cloned()
    }

    /// State of `handle`; stale handles report `Disconnected`.
    pub fn state(&self, handle: DeviceHandle) -> DeviceState {
        self.tree
            .read()
            .device(handle)
            .map_or(DeviceState::Disconnected, |dev| dev.state)
    }

    pub fn len(&self) -> usize {
        self.tree.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices on a hub's ports, in port order.
    pub fn children(&self, hub: DeviceHandle) -> Vec<DeviceHandle> {
        self.tree
            .read()
            .device(hub)
            .map(|dev| dev.children.clone())
            .unwrap_or_default()
    }

    /// Devices on a controller's root ports, in port order.
    pub fn root_devices(&self, controller: ControllerId) -> Vec<DeviceHandle> {
        self.tree
            .read()
            .controllers
            .get(controller.0 as usize)
            .map(|entry| entry.root_devices.clone())
            .unwrap_or_default()
    }

    pub fn device_at(&self, upstream: Upstream, port: u8) -> Option<DeviceHandle> {
        self.tree.read().device_at(upstream, port)
    }

    /// Most recent enumeration failures, oldest first.
    pub fn failures(&self) -> Vec<EnumerationFailure> {
        self.tree.read().failures.iter().copied().collect()
    }

    /// Controllers in service.
    pub fn controller_count(&self) -> usize {
        self.tree
            .read()
            .controllers
            .iter()
            .filter(|entry| entry.enabled)
            .count()
    }

    /// Whether the controller has reported a hardware fault.
    pub fn is_faulted(&self, controller: ControllerId) -> bool {
        self.tree
            .read()
            .controllers
            .get(controller.0 as usize)
            .is_some_and(|entry| entry.fault.load(Ordering::Acquire))
    }

    pub fn addresses_in_use(&self, controller: ControllerId) -> usize {
        self.tree
            .read()
            .controllers
            .get(controller.0 as usize)
            .map_or(0, |entry| entry.addresses.in_use())
    }
}

/// Marks the controller faulted when a root port operation reports a
/// hardware fault.
fn note_fault<T>(fault: &AtomicBool, result: Result<T, TransferError>) -> Result<T, TransferError> {
    if let Err(TransferError::ControllerError) = result {
        fault.store(true, Ordering::Release);
    }
    result
}

fn read_language(channel: &TransferChannel, handle: DeviceHandle) -> Option<u16> {
    let mut buf = [0u8; 4];
    let setup = SetupPacket::get_descriptor(descriptor_type::STRING, 0, 0, buf.len() as u16);
    let len = channel.control(handle, &setup, &mut buf).ok()?;
    parse_language(&buf[..len]).ok()
}

fn read_string(
    channel: &TransferChannel,
    handle: DeviceHandle,
    index: u8,
    language: u16,
) -> Option<String> {
    let mut buf = [0u8; 255];
    let setup =
        SetupPacket::get_descriptor(descriptor_type::STRING, index, language, buf.len() as u16);
    let len = channel.control(handle, &setup, &mut buf).ok()?;
    parse_string(&buf[..len])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
