//! PCI scan tests against an emulated configuration space.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use conquer_once::spin::{Lazy, OnceCell};
use spin::Mutex;
use x86_64::PhysAddr;

use crate::{
    downstream::{self, DeviceKind, DeviceOwner},
    driver::{Driver, Registry},
    usb::{
        self, ControllerId, HostController, TransferError, UsbBus,
        descriptor::descriptor_type,
        fake::{FakeController, FakeDevice, Fault},
        host::{HcdProbe, UsbHostDriver},
    },
};

use super::{
    ConfigAccess, PciAddress, PciBus, PciDevice, PciScanner, PortIo,
    config::{capability_ids, device_classes, offsets},
    device::{self, BarInfo, Binding, IoBar, MemoryBar},
    rtl8169::Rtl8169Driver,
};

/// One function's 256-byte header
#[derive(Clone)]
struct Function {
    regs: [u32; 64],
    /// What each BAR reads back after all ones are written to it
    bar_masks: [u32; 6],
}

impl Function {
    fn new(vendor: u16, device: u16, class: u8, subclass: u8) -> Self {
        let mut regs = [0u32; 64];
        regs[0] = (device as u32) << 16 | vendor as u32;
        // I/O, memory and bus master enabled
        regs[1] = 0x0007;
        regs[2] = (class as u32) << 24 | (subclass as u32) << 16 | 0x01;
        Self {
            regs,
            bar_masks: [0; 6],
        }
    }

    fn prog_if(mut self, prog_if: u8) -> Self {
        self.regs[2] |= (prog_if as u32) << 8;
        self
    }

    fn header(mut self, header: u8) -> Self {
        self.regs[3] |= (header as u32) << 16;
        self
    }

    fn bridge_to(self, secondary: u8) -> Self {
        let mut bridge = self.header(0x01);
        bridge.regs[6] |= (secondary as u32) << 8;
        bridge
    }

    fn io_bar(mut self, index: usize, base: u32, size: u32) -> Self {
        self.regs[4 + index] = base | 0x1;
        self.bar_masks[index] = !(size - 1) | 0x1;
        self
    }

    fn memory_bar(mut self, index: usize, base: u32, size: u32) -> Self {
        self.regs[4 + index] = base;
        self.bar_masks[index] = !(size - 1) & 0xFFFF_FFF0;
        self
    }

    fn prefetchable_64bit_bar(mut self, index: usize, base: u64, size: u64) -> Self {
        let mask = !(size - 1);
        self.regs[4 + index] = base as u32 | 0xC;
        self.regs[5 + index] = (base >> 32) as u32;
        self.bar_masks[index] = (mask as u32 & 0xFFFF_FFF0) | 0xC;
        self.bar_masks[index + 1] = (mask >> 32) as u32;
        self
    }

    fn capabilities(mut self, list: &[(u8, u8)]) -> Self {
        // Status: capabilities list present
        self.regs[1] |= 1 << 20;
        self.regs[13] = list.first().map_or(0, |&(offset, _)| offset as u32);
        for (i, &(offset, id)) in list.iter().enumerate() {
            let next = list.get(i + 1).map_or(0, |&(next, _)| next);
            self.regs[offset as usize / 4] = (next as u32) << 8 | id as u32;
        }
        self
    }
}

#[derive(Default)]
struct FakeConfig {
    functions: Mutex<BTreeMap<PciAddress, Function>>,
}

impl FakeConfig {
    fn with(self, address: PciAddress, function: Function) -> Self {
        self.functions.lock().insert(address, function);
        self
    }
}

impl ConfigAccess for FakeConfig {
    fn read_u32(&self, address: PciAddress, offset: u8) -> u32 {
        self.functions
            .lock()
            .get(&address)
            .map_or(0xFFFF_FFFF, |function| function.regs[offset as usize / 4])
    }

    fn write_u32(&self, address: PciAddress, offset: u8, value: u32) {
        let mut functions = self.functions.lock();
        let Some(function) = functions.get_mut(&address) else {
            return;
        };
        let index = offset as usize / 4;
        function.regs[index] = match index {
            4..10 if value == 0xFFFF_FFFF => function.bar_masks[index - 4],
            _ => value,
        };
    }
}

const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// RTL8169 register file; every chip's I/O window is 256-byte aligned
struct FakePorts {
    resets: Mutex<Vec<u16>>,
}

impl PortIo for FakePorts {
    fn read_u8(&self, port: u16) -> u8 {
        match port & 0xFF {
            offset @ 0..6 => MAC[offset as usize],
            // The reset bit clears as soon as it is read back
            _ => 0,
        }
    }

    fn write_u8(&self, port: u16, value: u8) {
        if port & 0xFF == 0x37 && value & 0x10 != 0 {
            self.resets.lock().push(port & !0xFF);
        }
    }
}

static FAKE_PORTS: FakePorts = FakePorts {
    resets: Mutex::new(Vec::new()),
};

fn resets_at(io_base: u16) -> usize {
    FAKE_PORTS
        .resets
        .lock()
        .iter()
        .filter(|&&base| base == io_base)
        .count()
}

static NIC: Rtl8169Driver = Rtl8169Driver::new(&FAKE_PORTS);

static NO_PROBE: OnceCell<HcdProbe> = OnceCell::uninit();
static FAKE_PROBE: OnceCell<HcdProbe> = OnceCell::uninit();
static TEST_USB_BUS: Lazy<UsbBus> = Lazy::new(|| UsbBus::new(usb::default_registry()));
static HOST_WITHOUT_PROBE: UsbHostDriver = UsbHostDriver::new(&TEST_USB_BUS, &NO_PROBE);
static HOST_WITH_PROBE: UsbHostDriver = UsbHostDriver::new(&TEST_USB_BUS, &FAKE_PROBE);

static FAULTY_FACTORY: OnceCell<HcdProbe> = OnceCell::uninit();
static FAULTY_USB_BUS: Lazy<UsbBus> = Lazy::new(|| UsbBus::new(usb::default_registry()));
static FAULTY_HOST: UsbHostDriver = UsbHostDriver::new(&FAULTY_USB_BUS, &FAULTY_FACTORY);

static DRIVERS: [&dyn Driver<Device = PciDevice>; 2] = [&NIC, &HOST_WITHOUT_PROBE];
static DRIVERS_WITH_HCD: [&dyn Driver<Device = PciDevice>; 2] = [&NIC, &HOST_WITH_PROBE];
static DRIVERS_WITH_FAULTY_HCD: [&dyn Driver<Device = PciDevice>; 1] = [&FAULTY_HOST];

fn scan(
    config: &FakeConfig,
    drivers: &'static [&'static dyn Driver<Device = PciDevice>],
) -> Vec<PciDevice> {
    PciScanner::new(config, Registry::new(drivers)).scan()
}

fn addresses(devices: &[PciDevice]) -> Vec<PciAddress> {
    devices.iter().map(|dev| dev.address).collect()
}

fn host_bridge() -> Function {
    Function::new(0x8086, 0x1237, device_classes::BRIDGE, 0x00)
}

#[test]
fn nic_on_bus_zero_is_bound_once() {
    let address = PciAddress::new(0, 0, 0);
    let config = FakeConfig::default().with(
        address,
        Function::new(0x10EC, 0x8169, device_classes::NETWORK, 0x00).io_bar(0, 0xC000, 0x100),
    );

    let devices = scan(&config, &DRIVERS);
    assert_eq!(addresses(&devices), [address]);
    assert_eq!(devices[0].binding, Binding::Bound("RTL8169"));
    assert_eq!(resets_at(0xC000), 1);
    assert_eq!(
        downstream::lookup(DeviceOwner::Pci(address)).map(|dev| dev.kind),
        Some(DeviceKind::Network {
            name: "RTL8169",
            mac: MAC,
        })
    );

    // A function is handed off at most once, and the chip is left alone
    let rescan = scan(&config, &DRIVERS);
    assert_eq!(rescan[0].binding, Binding::Rejected("RTL8169"));
    assert_eq!(resets_at(0xC000), 1);
}

#[test]
fn bars_and_capabilities_are_decoded() {
    let address = PciAddress::new(0, 4, 0);
    let config = FakeConfig::default().with(
        address,
        Function::new(0x1AF4, 0x1000, device_classes::NETWORK, 0x00)
            .io_bar(0, 0xD000, 0x20)
            .memory_bar(1, 0xFEB0_0000, 0x1000)
            .prefetchable_64bit_bar(2, 0x8_0000_0000, 0x4000)
            .capabilities(&[(0x40, capability_ids::MSI_X), (0x50, capability_ids::MSI)]),
    );

    let dev = device::probe_function(&config, address).unwrap().unwrap();
    assert_eq!(dev.bars[0], BarInfo::Io(IoBar::new(0xD000, 0x20)));
    assert_eq!(dev.bars[0].io_base(), Some(0xD000));
    assert_eq!(
        dev.bars[1],
        BarInfo::Memory(MemoryBar::new(PhysAddr::new(0xFEB0_0000), 0x1000, false, false))
    );
    assert_eq!(
        dev.bars[2],
        BarInfo::Memory(MemoryBar::new(PhysAddr::new(0x8_0000_0000), 0x4000, true, true))
    );
    assert!(dev.bars[3..].iter().all(|bar| *bar == BarInfo::Unused));

    assert!(dev.supports_msix());
    assert_eq!(dev.find_capability(capability_ids::MSI), Some(0x50));

    // Decoding is switched back on and every BAR holds its address again
    assert_eq!(config.read_u16(address, offsets::COMMAND), 0x0007);
    assert_eq!(config.read_u32(address, offsets::BAR0), 0xD001);
    assert_eq!(config.read_u32(address, offsets::BAR0 + 4), 0xFEB0_0000);

    assert!(matches!(
        device::probe_function(&config, PciAddress::new(0, 5, 0)),
        Ok(None)
    ));
}

#[test]
fn bridges_are_followed_depth_first() {
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge())
        .with(
            PciAddress::new(0, 1, 0),
            Function::new(0x8086, 0x244E, device_classes::BRIDGE, 0x04).bridge_to(2),
        )
        .with(
            PciAddress::new(0, 2, 0),
            Function::new(0x1234, 0x1111, device_classes::DISPLAY, 0x00),
        )
        .with(
            PciAddress::new(2, 3, 0),
            Function::new(0x1AF4, 0x1000, device_classes::NETWORK, 0x00),
        );

    let bus = PciBus::scan(&config, Registry::new(&DRIVERS));
    assert_eq!(
        addresses(&bus.devices),
        [
            PciAddress::new(0, 0, 0),
            PciAddress::new(0, 1, 0),
            PciAddress::new(2, 3, 0),
            PciAddress::new(0, 2, 0),
        ]
    );
    assert_eq!(bus.devices[1].secondary_bus, Some(2));
    assert_eq!(bus.unclaimed().count(), 4);
    assert_eq!(bus.devices_by_class(device_classes::BRIDGE).len(), 2);
    assert_eq!(
        bus.find_device(0x1AF4, 0x1000).map(|dev| dev.address),
        Some(PciAddress::new(2, 3, 0))
    );
    assert!(bus.get(PciAddress::new(1, 0, 0)).is_none());
}

#[test]
fn each_host_bridge_function_owns_a_root_bus() {
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge().header(0x80))
        .with(PciAddress::new(0, 0, 1), host_bridge())
        .with(
            PciAddress::new(1, 5, 0),
            Function::new(0x8086, 0x2668, device_classes::MULTIMEDIA, 0x03),
        );

    let devices = scan(&config, &DRIVERS);
    assert_eq!(
        addresses(&devices),
        [
            PciAddress::new(0, 0, 0),
            PciAddress::new(0, 0, 1),
            PciAddress::new(1, 5, 0),
        ]
    );
    assert!(devices[0].multifunction);
}

#[test]
fn bridge_loops_terminate() {
    let bridge = || Function::new(0x8086, 0x244E, device_classes::BRIDGE, 0x04);
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge())
        .with(PciAddress::new(0, 1, 0), bridge().bridge_to(1))
        .with(PciAddress::new(1, 0, 0), bridge().bridge_to(0))
        .with(PciAddress::new(1, 1, 0), bridge().bridge_to(1));

    let devices = scan(&config, &DRIVERS);
    assert_eq!(devices.len(), 4);
}

#[test]
fn declined_functions_record_who_rejected_them() {
    let nic = PciAddress::new(0, 3, 0);
    let usb = PciAddress::new(0, 0x1D, 0);
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge())
        // Right ID, wrong class
        .with(
            nic,
            Function::new(0x10EC, 0x8169, device_classes::NETWORK, 0x80).io_bar(0, 0xC100, 0x100),
        )
        .with(
            usb,
            Function::new(0x8086, 0x24CD, device_classes::SERIAL_BUS, 0x03).prog_if(0x20),
        );

    let devices = scan(&config, &DRIVERS);
    let binding = |address| {
        devices
            .iter()
            .find(|dev| dev.address == address)
            .map(|dev| dev.binding)
    };
    assert_eq!(binding(PciAddress::new(0, 0, 0)), Some(Binding::Unclaimed));
    assert_eq!(binding(nic), Some(Binding::Rejected("RTL8169")));
    assert_eq!(binding(usb), Some(Binding::Rejected("usb-host")));
    assert_eq!(resets_at(0xC100), 0);
    assert_eq!(downstream::lookup(DeviceOwner::Pci(nic)), None);
}

fn fake_hcd(_device: &PciDevice) -> Option<Arc<dyn HostController>> {
    let fake = FakeController::new(2);
    fake.plug_root(2, FakeDevice::gadget(0x0300));
    Some(fake)
}

#[test]
fn usb_host_controller_brings_up_its_bus() {
    let _ = FAKE_PROBE.try_init_once(|| fake_hcd as HcdProbe);
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge())
        .with(
            PciAddress::new(0, 0x14, 0),
            Function::new(0x8086, 0x1E31, device_classes::SERIAL_BUS, 0x03).prog_if(0x30),
        );

    let devices = scan(&config, &DRIVERS_WITH_HCD);
    assert_eq!(devices[1].binding, Binding::Bound("usb-host"));
    assert_eq!(TEST_USB_BUS.controller_count(), 1);

    let gadgets = TEST_USB_BUS.devices();
    assert_eq!(gadgets.len(), 1);
    assert_eq!(gadgets[0].port, 2);
    assert_eq!(gadgets[0].product_id, 0x0300);
}

fn faulty_hcd(_device: &PciDevice) -> Option<Arc<dyn HostController>> {
    let fake = FakeController::new(1);
    fake.plug_root(1, FakeDevice::gadget(0x0301));
    fake.inject(Fault::descriptor(
        descriptor_type::DEVICE,
        TransferError::ControllerError,
        1,
    ));
    Some(fake)
}

#[test]
fn faulting_host_controller_is_rejected_and_removed() {
    let _ = FAULTY_FACTORY.try_init_once(|| faulty_hcd as HcdProbe);
    let usb = PciAddress::new(0, 0x1A, 0);
    let config = FakeConfig::default()
        .with(PciAddress::new(0, 0, 0), host_bridge())
        .with(
            usb,
            Function::new(0x8086, 0x1E2D, device_classes::SERIAL_BUS, 0x03).prog_if(0x20),
        );

    let devices = scan(&config, &DRIVERS_WITH_FAULTY_HCD);
    let host = devices.iter().find(|dev| dev.address == usb).unwrap();
    assert_eq!(host.binding, Binding::Rejected("usb-host"));
    assert_eq!(FAULTY_USB_BUS.controller_count(), 0);
    assert!(FAULTY_USB_BUS.is_faulted(ControllerId(0)));
    assert!(FAULTY_USB_BUS.is_empty());
}
