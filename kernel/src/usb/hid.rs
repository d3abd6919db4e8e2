//! HID boot-protocol keyboards.

use crate::{
    downstream::{self, DeviceKind},
    driver::Driver,
    info, warn,
};

use super::{
    arena::DeviceHandle,
    descriptor::{Direction, Recipient, RequestKind, SetupPacket, class},
    device::{EndpointKind, UsbMatch, UsbProbe, match_table},
    transfer::{TransferChannel, TransferError},
};

pub const SUBCLASS_BOOT: u8 = 0x01;
pub const PROTOCOL_KEYBOARD: u8 = 0x01;

/// HID class request codes
pub mod hid_request {
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

const PROTOCOL_BOOT: u16 = 0;
const BOOT_REPORT_LEN: usize = 8;
/// Usage ID a keyboard reports in every slot when too many keys are down
const ERROR_ROLLOVER: u8 = 0x01;

/// An 8-byte boot keyboard report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootReport {
    pub modifiers: u8,
    pub keys: [u8; 6],
}

impl BootReport {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < BOOT_REPORT_LEN {
            return None;
        }
        let mut keys = [0u8; 6];
        keys.copy_from_slice(&buf[2..8]);
        Some(Self {
            modifiers: buf[0],
            keys,
        })
    }

    /// Too many keys held for the report to list them
    pub fn is_rollover(&self) -> bool {
        self.keys.iter().all(|&key| key == ERROR_ROLLOVER)
    }

    /// Usage IDs of the keys held down
    pub fn pressed(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys.iter().copied().filter(|&key| key > ERROR_ROLLOVER)
    }
}

fn interface_request(request: u8, value: u16, interface: u8) -> SetupPacket {
    SetupPacket::new(
        Direction::Out,
        RequestKind::Class,
        Recipient::Interface,
        request,
        value,
        interface as u16,
        0,
    )
}

/// Polls the keyboard's interrupt endpoint once.
pub fn read_boot_report(
    channel: &TransferChannel,
    keyboard: DeviceHandle,
    endpoint: u8,
    timeout_ms: Option<u32>,
) -> Result<Option<BootReport>, TransferError> {
    let mut buf = [0u8; BOOT_REPORT_LEN];
    let len = channel.interrupt_transfer(keyboard, endpoint, &mut buf, timeout_ms)?;
    Ok(BootReport::parse(&buf[..len]))
}

const KEYBOARD_TABLE: &[UsbMatch] = &[UsbMatch::interface(
    class::HID,
    SUBCLASS_BOOT,
    PROTOCOL_KEYBOARD,
)];

pub struct HidKeyboardDriver;

impl Driver for HidKeyboardDriver {
    type Device = UsbProbe;

    fn name(&self) -> &'static str {
        "usb-keyboard"
    }

    fn matches(&self, device: &UsbProbe) -> bool {
        match_table(KEYBOARD_TABLE, &device.device)
    }

    fn init(&self, device: &UsbProbe) -> bool {
        let handle = device.handle();
        let Some(function) =
            device
                .device
                .find_function(class::HID, Some(SUBCLASS_BOOT), Some(PROTOCOL_KEYBOARD))
        else {
            return false;
        };
        let Some(endpoint) = function.find_endpoint(EndpointKind::Interrupt, true) else {
            warn!("USB keyboard {}: no interrupt IN endpoint", handle);
            return false;
        };

        let set_protocol = interface_request(hid_request::SET_PROTOCOL, PROTOCOL_BOOT, function.number);
        if let Err(e) = device.channel.control(handle, &set_protocol, &mut []) {
            warn!("USB keyboard {}: SET_PROTOCOL failed: {}", handle, e);
            return false;
        }

        // Report only on change; many keyboards stall this request
        let set_idle = interface_request(hid_request::SET_IDLE, 0, function.number);
        match device.channel.control(handle, &set_idle, &mut []) {
            Ok(_) | Err(TransferError::Stall) => {}
            Err(e) => {
                warn!("USB keyboard {}: SET_IDLE failed: {}", handle, e);
                return false;
            }
        }

        let registered = downstream::register(
            device.owner(),
            DeviceKind::Input {
                name: "usb-keyboard",
                endpoint: endpoint.address,
            },
        );
        if let Err(e) = registered {
            warn!("USB keyboard {}: {}", handle, e);
            return false;
        }

        info!(
            "USB keyboard {}: {} {}, endpoint {:#04x}",
            handle, device.device.vendor, device.device.product, endpoint.address
        );
        true
    }
}

pub static KEYBOARD: HidKeyboardDriver = HidKeyboardDriver;
