//! Hub class requests and the generic hub driver.
//!
//! The tree walks hub ports itself; this module only knows how to talk to a
//! hub's control endpoint.

use crate::{debug, driver::Driver, info, warn};

use super::{
    arena::DeviceHandle,
    descriptor::{
        HubDescriptor, Direction, Recipient, RequestKind, SetupPacket, class, descriptor_type,
        request,
    },
    device::{UsbMatch, UsbProbe, UsbSpeed, match_table},
    transfer::{TransferChannel, TransferError},
    tree::EnumerationError,
};

/// Hub port feature selectors
pub mod port_feature {
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_RESET: u16 = 20;
}

/// wPortStatus bits
pub mod port_status_bits {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const RESET: u16 = 1 << 4;
    pub const POWER: u16 = 1 << 8;
    pub const LOW_SPEED: u16 = 1 << 9;
    pub const HIGH_SPEED: u16 = 1 << 10;
}

/// wPortChange bits
pub mod port_change_bits {
    pub const C_CONNECTION: u16 = 1 << 0;
    pub const C_RESET: u16 = 1 << 4;
}

/// Polls of a resetting port before giving up
const RESET_POLLS: usize = 10;
const RESET_POLL_INTERVAL_MS: u32 = 10;
/// Recovery time after reset before the device must answer
const RESET_RECOVERY_MS: u32 = 10;

/// State of a root or hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub resetting: bool,
    pub powered: bool,
    pub speed: UsbSpeed,
    pub connect_changed: bool,
    pub reset_changed: bool,
}

impl PortStatus {
    pub const fn disconnected() -> Self {
        Self {
            connected: false,
            enabled: false,
            resetting: false,
            powered: true,
            speed: UsbSpeed::Full,
            connect_changed: false,
            reset_changed: false,
        }
    }

    /// Decodes the two words returned by a hub's GET_STATUS.
    pub fn from_wire(status: u16, change: u16) -> Self {
        let speed = if status & port_status_bits::LOW_SPEED != 0 {
            UsbSpeed::Low
        } else if status & port_status_bits::HIGH_SPEED != 0 {
            UsbSpeed::High
        } else {
            UsbSpeed::Full
        };

        Self {
            connected: status & port_status_bits::CONNECTION != 0,
            enabled: status & port_status_bits::ENABLE != 0,
            resetting: status & port_status_bits::RESET != 0,
            powered: status & port_status_bits::POWER != 0,
            speed,
            connect_changed: change & port_change_bits::C_CONNECTION != 0,
            reset_changed: change & port_change_bits::C_RESET != 0,
        }
    }
}

fn port_request(request: u8, direction: Direction, feature: u16, port: u8, length: u16) -> SetupPacket {
    SetupPacket::new(
        direction,
        RequestKind::Class,
        Recipient::Other,
        request,
        feature,
        port as u16,
        length,
    )
}

/// Reads the hub descriptor.
pub fn hub_descriptor(
    channel: &TransferChannel,
    hub: DeviceHandle,
) -> Result<HubDescriptor, EnumerationError> {
    let mut buf = [0u8; 16];
    let setup = SetupPacket::new(
        Direction::In,
        RequestKind::Class,
        Recipient::Device,
        request::GET_DESCRIPTOR,
        (descriptor_type::HUB as u16) << 8,
        0,
        buf.len() as u16,
    );
    let len = channel.control(hub, &setup, &mut buf)?;
    Ok(HubDescriptor::parse(&buf[..len])?)
}

pub fn port_status(
    channel: &TransferChannel,
    hub: DeviceHandle,
    port: u8,
) -> Result<PortStatus, TransferError> {
    let mut buf = [0u8; 4];
    let setup = port_request(request::GET_STATUS, Direction::In, 0, port, 4);
    let len = channel.control(hub, &setup, &mut buf)?;
    if len < 4 {
        return Err(TransferError::ControllerError);
    }

    Ok(PortStatus::from_wire(
        u16::from_le_bytes([buf[0], buf[1]]),
        u16::from_le_bytes([buf[2], buf[3]]),
    ))
}

pub fn set_port_feature(
    channel: &TransferChannel,
    hub: DeviceHandle,
    port: u8,
    feature: u16,
) -> Result<(), TransferError> {
    let setup = port_request(request::SET_FEATURE, Direction::Out, feature, port, 0);
    channel.control(hub, &setup, &mut []).map(|_| ())
}

pub fn clear_port_feature(
    channel: &TransferChannel,
    hub: DeviceHandle,
    port: u8,
    feature: u16,
) -> Result<(), TransferError> {
    let setup = port_request(request::CLEAR_FEATURE, Direction::Out, feature, port, 0);
    channel.control(hub, &setup, &mut []).map(|_| ())
}

/// Resets a hub port and waits for it to come back enabled.
pub fn reset_port(
    channel: &TransferChannel,
    hub: DeviceHandle,
    port: u8,
) -> Result<PortStatus, TransferError> {
    set_port_feature(channel, hub, port, port_feature::PORT_RESET)?;

    for _ in 0..RESET_POLLS {
        channel.delay_ms(hub, RESET_POLL_INTERVAL_MS)?;
        let status = port_status(channel, hub, port)?;

        if !status.connected {
            return Ok(status);
        }
        if !status.resetting && status.enabled {
            if status.reset_changed {
                clear_port_feature(channel, hub, port, port_feature::C_PORT_RESET)?;
            }
            channel.delay_ms(hub, RESET_RECOVERY_MS)?;
            return Ok(status);
        }
    }

    warn!("USB hub {}: port {} stuck in reset", hub, port);
    Err(TransferError::Timeout)
}

const HUB_TABLE: &[UsbMatch] = &[UsbMatch::device_class(class::HUB)];

/// Generic USB 2.0 hub: powers every downstream port so the tree can scan
/// them.
pub struct HubDriver;

impl Driver for HubDriver {
    type Device = UsbProbe;

    fn name(&self) -> &'static str {
        "usb-hub"
    }

    fn matches(&self, device: &UsbProbe) -> bool {
        match_table(HUB_TABLE, &device.device)
    }

    fn init(&self, device: &UsbProbe) -> bool {
        let hub = device.handle();
        let descriptor = match hub_descriptor(&device.channel, hub) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("USB hub {}: {}", hub, e);
                return false;
            }
        };

        for port in 1..=descriptor.num_ports {
            if let Err(e) = set_port_feature(&device.channel, hub, port, port_feature::PORT_POWER) {
                warn!("USB hub {}: powering port {} failed: {}", hub, port, e);
                return false;
            }
        }
        debug!(
            "USB hub {}: waiting {} ms for port power",
            hub, descriptor.power_on_delay_ms
        );
        if device
            .channel
            .delay_ms(hub, descriptor.power_on_delay_ms)
            .is_err()
        {
            return false;
        }

        info!("USB hub {}: {} ports powered", hub, descriptor.num_ports);
        true
    }
}

pub static HUB: HubDriver = HubDriver;
