//! Simulated host controller, hubs and devices for the USB tests.

use alloc::{string::String, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{
    descriptor::{SetupPacket, class, descriptor_type, request},
    device::{EndpointKind, UsbSpeed},
    hid::hid_request,
    hub::{PortStatus, port_change_bits, port_feature, port_status_bits},
    transfer::{HostController, TransferError, TransferTarget},
};

pub const VENDOR: u16 = 0x1234;

/// A downstream port, on the root hub or on a fake hub
#[derive(Default)]
struct FakePort {
    device: Option<usize>,
    enabled: bool,
    powered: bool,
    connect_changed: bool,
    reset_changed: bool,
}

impl FakePort {
    fn plug(&mut self, device: usize) {
        self.device = Some(device);
        self.enabled = false;
        self.connect_changed = true;
    }

    fn unplug(&mut self) -> Option<usize> {
        self.enabled = false;
        self.connect_changed = true;
        self.device.take()
    }
}

pub struct FakeDevice {
    speed: UsbSpeed,
    descriptor: [u8; 18],
    config: Vec<u8>,
    language: Option<u16>,
    strings: Vec<(u8, String)>,
    hub_ports: Option<Vec<FakePort>>,
    reports: Vec<Vec<u8>>,
    address: u8,
    configuration: u8,
    attached: bool,
}

impl FakeDevice {
    pub fn new(speed: UsbSpeed, product: u16, device_class: u8, config: Vec<u8>) -> Self {
        let max_packet = speed.default_max_packet_size() as u8;
        let [vid_lo, vid_hi] = VENDOR.to_le_bytes();
        let [pid_lo, pid_hi] = product.to_le_bytes();
        Self {
            speed,
            descriptor: [
                18, 1, 0x00, 0x02, device_class, 0, 0, max_packet, vid_lo, vid_hi, pid_lo, pid_hi,
                0x00, 0x01, 0, 0, 0, 1,
            ],
            config,
            language: None,
            strings: Vec::new(),
            hub_ports: None,
            reports: Vec::new(),
            address: 0,
            configuration: 0,
            attached: false,
        }
    }

    /// A device with one vendor-specific interface and no endpoints
    pub fn gadget(product: u16) -> Self {
        Self::new(
            UsbSpeed::Full,
            product,
            0,
            vec![9, 2, 18, 0, 1, 1, 0, 0x80, 50, 9, 4, 0, 0, 0, 0xFF, 0, 0, 0],
        )
    }

    pub fn keyboard() -> Self {
        Self::new(
            UsbSpeed::Low,
            0x0001,
            0,
            vec![
                9, 2, 34, 0, 1, 1, 0, 0xA0, 50, //
                9, 4, 0, 0, 1, class::HID, 1, 1, 0, //
                9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, //
                7, 5, 0x81, 3, 8, 0, 10,
            ],
        )
    }

    pub fn hub(ports: u8) -> Self {
        let mut hub = Self::new(
            UsbSpeed::High,
            0x0009,
            class::HUB,
            vec![
                9, 2, 25, 0, 1, 1, 0, 0xE0, 0, //
                9, 4, 0, 0, 1, class::HUB, 0, 0, 0, //
                7, 5, 0x81, 3, 1, 0, 12,
            ],
        );
        hub.hub_ports = Some((0..ports).map(|_| FakePort::default()).collect());
        hub
    }

    pub fn with_strings(mut self, vendor: &str, product: &str, serial: &str) -> Self {
        self.language = Some(0x0409);
        for (index, text) in [(1u8, vendor), (2, product), (3, serial)] {
            self.descriptor[13 + index as usize] = index;
            self.strings.push((index, String::from(text)));
        }
        self
    }

    /// Claims string descriptors exist without being able to return them
    pub fn with_broken_strings(mut self) -> Self {
        self.descriptor[14] = 1;
        self.descriptor[15] = 2;
        self
    }

    pub fn with_max_packet_size(mut self, size: u8) -> Self {
        self.descriptor[7] = size;
        self
    }

    pub fn with_report(mut self, report: &[u8]) -> Self {
        self.reports.push(report.to_vec());
        self
    }

    fn descriptor(&self, desc_type: u8, index: u8) -> Result<Vec<u8>, TransferError> {
        match desc_type {
            descriptor_type::DEVICE => Ok(self.descriptor.to_vec()),
            descriptor_type::CONFIGURATION => Ok(self.config.clone()),
            descriptor_type::STRING if index == 0 => {
                let [lo, hi] = self.language.ok_or(TransferError::Stall)?.to_le_bytes();
                Ok(vec![4, 3, lo, hi])
            }
            descriptor_type::STRING => {
                let (_, text) = self
                    .strings
                    .iter()
                    .find(|(i, _)| *i == index)
                    .ok_or(TransferError::Stall)?;
                let mut out = vec![0, 3];
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                out[0] = out.len() as u8;
                Ok(out)
            }
            _ => Err(TransferError::Stall),
        }
    }
}

/// Makes matching requests fail
#[derive(Clone, Copy)]
pub struct Fault {
    pub request: u8,
    /// High byte of wValue, i.e. the descriptor type for GET_DESCRIPTOR
    pub value_high: Option<u8>,
    pub error: TransferError,
    /// Matching requests let through before the fault fires
    pub skip: u32,
    pub remaining: u32,
}

impl Fault {
    pub fn once(request: u8, error: TransferError) -> Self {
        Self {
            request,
            value_high: None,
            error,
            skip: 0,
            remaining: 1,
        }
    }

    pub fn descriptor(desc_type: u8, error: TransferError, remaining: u32) -> Self {
        Self {
            request: request::GET_DESCRIPTOR,
            value_high: Some(desc_type),
            error,
            skip: 0,
            remaining,
        }
    }

    pub fn after(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    fn matches(&self, setup: &SetupPacket) -> bool {
        self.remaining > 0
            && self.request == setup.request
            && self.value_high.is_none_or(|high| high == (setup.value >> 8) as u8)
    }
}

#[derive(Default)]
struct FakeState {
    devices: Vec<FakeDevice>,
    root_ports: Vec<FakePort>,
    /// The device answering on address 0, i.e. the last one reset
    default_device: Option<usize>,
    faults: Vec<Fault>,
    log: Vec<(u8, SetupPacket)>,
}

impl FakeState {
    fn route(&self, address: u8) -> Option<usize> {
        if address == 0 {
            return self.default_device;
        }
        self.devices
            .iter()
            .position(|dev| dev.attached && dev.address == address)
    }

    fn take_fault(&mut self, setup: &SetupPacket) -> Option<TransferError> {
        let fault = self.faults.iter_mut().find(|fault| fault.matches(setup))?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        fault.remaining -= 1;
        Some(fault.error)
    }

    fn detach_subtree(&mut self, device: usize) {
        self.devices[device].attached = false;
        if self.default_device == Some(device) {
            self.default_device = None;
        }
        let children: Vec<usize> = self.devices[device]
            .hub_ports
            .iter()
            .flatten()
            .filter_map(|port| port.device)
            .collect();
        for child in children {
            self.detach_subtree(child);
        }
    }

    fn reset(&mut self, device: usize) {
        let dev = &mut self.devices[device];
        dev.address = 0;
        dev.configuration = 0;
        self.default_device = Some(device);
    }

    /// wPortStatus and wPortChange for `port`
    fn port_words(&self, port: &FakePort) -> (u16, u16) {
        let mut status = 0;
        if let Some(device) = port.device {
            status |= port_status_bits::CONNECTION;
            match self.devices[device].speed {
                UsbSpeed::Low => status |= port_status_bits::LOW_SPEED,
                UsbSpeed::High => status |= port_status_bits::HIGH_SPEED,
                UsbSpeed::Full => {}
            }
        }
        if port.enabled {
            status |= port_status_bits::ENABLE;
        }
        if port.powered {
            status |= port_status_bits::POWER;
        }
        let mut change = 0;
        if port.connect_changed {
            change |= port_change_bits::C_CONNECTION;
        }
        if port.reset_changed {
            change |= port_change_bits::C_RESET;
        }
        (status, change)
    }

    fn handle(
        &mut self,
        device: usize,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, TransferError> {
        let kind = (setup.request_type >> 5) & 0x03;
        match (kind, setup.request) {
            (0, request::GET_DESCRIPTOR) => {
                let dev = &self.devices[device];
                let bytes = dev.descriptor((setup.value >> 8) as u8, setup.value as u8)?;
                let len = bytes.len().min(data.len());
                data[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            (0, request::SET_ADDRESS) => {
                let address = setup.value as u8;
                // An abandoned device still squatting on the address loses it
                for other in self.devices.iter_mut().filter(|dev| dev.address == address) {
                    other.address = u8::MAX;
                }
                self.devices[device].address = address;
                if self.default_device == Some(device) {
                    self.default_device = None;
                }
                Ok(0)
            }
            (0, request::SET_CONFIGURATION) => {
                self.devices[device].configuration = setup.value as u8;
                Ok(0)
            }
            (1, hid_request::SET_PROTOCOL) | (1, hid_request::SET_IDLE) => Ok(0),
            (1, _) if self.devices[device].hub_ports.is_some() => self.hub_request(device, setup, data),
            _ => Err(TransferError::Stall),
        }
    }

    fn hub_request(
        &mut self,
        hub: usize,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, TransferError> {
        let port_count = self.devices[hub].hub_ports.as_ref().map_or(0, Vec::len);

        if setup.request == request::GET_DESCRIPTOR {
            let bytes = [9, descriptor_type::HUB, port_count as u8, 0, 0, 1, 0, 0, 0xFF];
            let len = bytes.len().min(data.len());
            data[..len].copy_from_slice(&bytes[..len]);
            return Ok(len);
        }

        let index = setup.index as usize;
        if index == 0 || index > port_count {
            return Err(TransferError::Stall);
        }
        let feature = setup.value;

        match setup.request {
            request::GET_STATUS => {
                let (status, change) = {
                    let ports = self.devices[hub].hub_ports.as_ref().ok_or(TransferError::Stall)?;
                    self.port_words(&ports[index - 1])
                };
                let bytes = [status.to_le_bytes(), change.to_le_bytes()].concat();
                let len = bytes.len().min(data.len());
                data[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            request::SET_FEATURE => {
                let child = {
                    let port = self.hub_port(hub, index)?;
                    match feature {
                        port_feature::PORT_POWER => {
                            port.powered = true;
                            None
                        }
                        port_feature::PORT_RESET => {
                            port.enabled = port.device.is_some();
                            port.reset_changed = true;
                            port.device
                        }
                        _ => None,
                    }
                };
                if let Some(child) = child {
                    self.reset(child);
                }
                Ok(0)
            }
            request::CLEAR_FEATURE => {
                let port = self.hub_port(hub, index)?;
                match feature {
                    port_feature::C_PORT_CONNECTION => port.connect_changed = false,
                    port_feature::C_PORT_RESET => port.reset_changed = false,
                    _ => {}
                }
                Ok(0)
            }
            _ => Err(TransferError::Stall),
        }
    }

    fn hub_port(&mut self, hub: usize, port: usize) -> Result<&mut FakePort, TransferError> {
        self.devices[hub]
            .hub_ports
            .as_mut()
            .and_then(|ports| ports.get_mut(port - 1))
            .ok_or(TransferError::Stall)
    }
}

pub struct FakeController {
    state: Mutex<FakeState>,
    /// While set, data transfers spin instead of completing
    pub hold_transfers: AtomicBool,
    pub transfer_started: AtomicBool,
}

impl FakeController {
    pub fn new(root_ports: u8) -> Arc<Self> {
        let state = FakeState {
            root_ports: (0..root_ports)
                .map(|_| FakePort {
                    powered: true,
                    ..FakePort::default()
                })
                .collect(),
            ..FakeState::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            hold_transfers: AtomicBool::new(false),
            transfer_started: AtomicBool::new(false),
        })
    }

    fn add(&self, state: &mut FakeState, mut device: FakeDevice) -> usize {
        device.attached = true;
        state.devices.push(device);
        state.devices.len() - 1
    }

    pub fn plug_root(&self, port: u8, device: FakeDevice) -> usize {
        let mut state = self.state.lock();
        let id = self.add(&mut state, device);
        state.root_ports[port as usize - 1].plug(id);
        id
    }

    pub fn plug_hub(&self, hub: usize, port: u8, device: FakeDevice) -> usize {
        let mut state = self.state.lock();
        let id = self.add(&mut state, device);
        if let Ok(hub_port) = state.hub_port(hub, port as usize) {
            hub_port.plug(id);
        }
        id
    }

    pub fn unplug_root(&self, port: u8) {
        let mut state = self.state.lock();
        if let Some(device) = state.root_ports[port as usize - 1].unplug() {
            state.detach_subtree(device);
        }
    }

    pub fn unplug_hub(&self, hub: usize, port: u8) {
        let mut state = self.state.lock();
        let device = state
            .hub_port(hub, port as usize)
            .ok()
            .and_then(FakePort::unplug);
        if let Some(device) = device {
            state.detach_subtree(device);
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Address the device currently answers on
    pub fn address_of(&self, device: usize) -> u8 {
        self.state.lock().devices[device].address
    }

    pub fn configuration_of(&self, device: usize) -> u8 {
        self.state.lock().devices[device].configuration
    }

    /// Every control request seen, with the address it was sent to
    pub fn requests(&self) -> Vec<(u8, SetupPacket)> {
        self.state.lock().log.clone()
    }
}

impl HostController for FakeController {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn root_port_count(&self) -> u8 {
        self.state.lock().root_ports.len() as u8
    }

    fn root_port_status(&self, port: u8) -> Result<PortStatus, TransferError> {
        let mut state = self.state.lock();
        let (status, change) = state.port_words(&state.root_ports[port as usize - 1]);
        state.root_ports[port as usize - 1].connect_changed = false;
        Ok(PortStatus::from_wire(status, change))
    }

    fn reset_root_port(&self, port: u8) -> Result<PortStatus, TransferError> {
        let mut state = self.state.lock();
        let root = &mut state.root_ports[port as usize - 1];
        root.enabled = root.device.is_some();
        if let Some(device) = root.device {
            state.reset(device);
        }
        let (status, change) = state.port_words(&state.root_ports[port as usize - 1]);
        Ok(PortStatus::from_wire(status, change))
    }

    fn control(
        &self,
        target: &TransferTarget,
        setup: &SetupPacket,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, TransferError> {
        let mut state = self.state.lock();
        state.log.push((target.address, *setup));

        if let Some(error) = state.take_fault(setup) {
            return Err(error);
        }
        let device = state.route(target.address).ok_or(TransferError::Timeout)?;
        state.handle(device, setup, data)
    }

    fn transfer(
        &self,
        target: &TransferTarget,
        kind: EndpointKind,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, TransferError> {
        self.transfer_started.store(true, Ordering::SeqCst);
        while self.hold_transfers.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }

        let mut state = self.state.lock();
        let device = state.route(target.address).ok_or(TransferError::Timeout)?;
        if kind != EndpointKind::Interrupt || target.endpoint & 0x80 == 0 {
            return Err(TransferError::Stall);
        }
        let dev = &mut state.devices[device];
        if dev.reports.is_empty() {
            return Err(TransferError::Timeout);
        }
        let report = dev.reports.remove(0);
        let len = report.len().min(data.len());
        data[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn delay_ms(&self, _ms: u32) {}
}
