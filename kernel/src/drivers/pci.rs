//! PCIe configuration-space access and device discovery.
//!
//! The MCFG table names one ECAM window per segment group; each window is
//! mapped as MMIO and every bus/device/function combination is probed
//! brute-force. All config accesses are 32-bit reads and writes into the
//! mapped window.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::acpi::{self, SdtHeader, SDT_HEADER_SIZE};
use crate::interrupts;
use crate::memory::address_space;
use crate::memory::vm_object::VmObject;
use crate::spinlock::SpinLock;

const CONFIG_IDENTIFICATION: u16 = 0x00;
const CONFIG_STATUS_COMMAND: u16 = 0x04;
const CONFIG_CLASS_CODES: u16 = 0x08;
const CONFIG_MISCELLANEOUS: u16 = 0x0C;
const CONFIG_BAR_BASE: u16 = 0x10;
const CONFIG_CAPABILITY_POINTER: u16 = 0x34;

const CAPABILITY_ID_MSI: u8 = 0x05;

/// One ECAM segment group: a 256 MiB window covering buses
/// `bus_start..=bus_end`.
pub struct PcieSegment {
    virtual_address: u64,
    #[allow(dead_code)]
    physical_address: u64,
    group_number: u16,
    bus_start: u8,
    bus_end: u8,
    _window: Option<Arc<VmObject>>,
}

unsafe impl Send for PcieSegment {}
unsafe impl Sync for PcieSegment {}

impl PcieSegment {
    /// Read a config dword. Out-of-range coordinates read as zero.
    pub fn read(&self, bus: u8, device: u8, function: u8, offset: u16) -> u32 {
        let Some(address) = self.config_address(bus, device, function, offset) else {
            return 0;
        };
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    /// Write a config dword. Out-of-range coordinates are ignored.
    pub fn write(&self, bus: u8, device: u8, function: u8, offset: u16, value: u32) {
        let Some(address) = self.config_address(bus, device, function, offset) else {
            return;
        };
        unsafe { core::ptr::write_volatile(address as *mut u32, value) }
    }

    fn config_address(&self, bus: u8, device: u8, function: u8, offset: u16) -> Option<u64> {
        if bus < self.bus_start || bus > self.bus_end {
            return None;
        }
        if device > 31 || function > 7 || offset >= 4096 - 3 {
            return None;
        }
        let relative_bus = (bus - self.bus_start) as u64;
        Some(
            self.virtual_address
                + ((relative_bus << 20) | ((device as u64) << 15) | ((function as u64) << 12))
                + (offset & !0x3) as u64,
        )
    }
}

/// A discovered capability: config-space address and capability id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub address: u8,
    pub id: u8,
}

#[derive(Clone)]
pub struct PciDevice<'a> {
    segment: &'a PcieSegment,
    bus: u8,
    device: u8,
    function: u8,
    vendor_id: u16,
    device_id: u16,
    class_code: u8,
    subclass: u8,
    prog_if: u8,
    revision_id: u8,
    header_type: u8,
    capabilities: Vec<Capability>,
    msi_capability: Option<Capability>,
}

impl<'a> PciDevice<'a> {
    /// Read out identification, class codes and (for plain endpoints with a
    /// capability list) the capability chain, latching the first MSI entry.
    pub fn new(segment: &'a PcieSegment, bus: u8, device: u8, function: u8) -> Self {
        let identification = segment.read(bus, device, function, CONFIG_IDENTIFICATION);
        let class_codes = segment.read(bus, device, function, CONFIG_CLASS_CODES);
        let miscellaneous = segment.read(bus, device, function, CONFIG_MISCELLANEOUS);

        let mut created = Self {
            segment,
            bus,
            device,
            function,
            vendor_id: identification as u16,
            device_id: (identification >> 16) as u16,
            revision_id: class_codes as u8,
            prog_if: (class_codes >> 8) as u8,
            subclass: (class_codes >> 16) as u8,
            class_code: (class_codes >> 24) as u8,
            header_type: ((miscellaneous >> 16) & 0x0F) as u8,
            capabilities: Vec::new(),
            msi_capability: None,
        };

        let status_command = created.read(CONFIG_STATUS_COMMAND);
        if created.header_type == 0x00 && status_command & (1 << 20) != 0 {
            let mut pointer = (created.read(CONFIG_CAPABILITY_POINTER) & 0xFC) as u8;
            while pointer != 0 {
                let header = created.read(pointer as u16);
                let capability = Capability {
                    address: pointer,
                    id: header as u8,
                };
                if capability.id == CAPABILITY_ID_MSI && created.msi_capability.is_none() {
                    created.msi_capability = Some(capability);
                }
                created.capabilities.push(capability);
                pointer = ((header >> 8) & 0xFC) as u8;
            }
        }

        created
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn class_code(&self) -> u8 {
        self.class_code
    }

    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    pub fn prog_if(&self) -> u8 {
        self.prog_if
    }

    pub fn revision_id(&self) -> u8 {
        self.revision_id
    }

    pub fn header_type(&self) -> u8 {
        self.header_type
    }

    /// Raw BAR dword. Only meaningful on header type 0 and BARs 0..=5.
    pub fn bar_value(&self, bar: u8) -> u32 {
        if self.header_type != 0x00 || bar > 5 {
            return 0;
        }
        self.read(CONFIG_BAR_BASE + (bar as u16) * 4)
    }

    pub fn supports_msi(&self) -> bool {
        self.msi_capability.is_some()
    }

    /// Program and enable MSI delivery of `vector` to the BSP. Handles the
    /// 32- and 64-bit address capability layouts.
    pub fn enable_msi(&self, vector: u8) {
        let Some(capability) = self.msi_capability else {
            return;
        };
        let base = capability.address as u16;

        let message_control = (self.read(base) >> 16) as u16;
        let long_address = message_control & (1 << 7) != 0;

        let msi_address = interrupts::msi_address();
        let msi_data = interrupts::msi_data(vector);
        if long_address {
            self.write(base + 0x04, msi_address as u32);
            self.write(base + 0x08, (msi_address >> 32) as u32);
            self.write(base + 0x0C, msi_data as u32);
        } else {
            self.write(base + 0x04, msi_address as u32);
            self.write(base + 0x08, msi_data as u32);
        }

        // Single message, MSI enable.
        self.write(base, 1 << 16);
        log::info!(
            "[pcie] {:02x}:{:02x}.{}: MSI enabled on vector {:#x}",
            self.bus,
            self.device,
            self.function,
            vector
        );
    }

    /// Memory space, bus mastering and memory-write-and-invalidate on.
    pub fn enable_bus_mastering(&self) {
        let value = self.read(CONFIG_STATUS_COMMAND);
        self.write(CONFIG_STATUS_COMMAND, value | (1 << 1) | (1 << 2) | (1 << 4));
    }

    /// Mask legacy INTx delivery (command-register interrupt-disable bit).
    pub fn disable_intx(&self) {
        let value = self.read(CONFIG_STATUS_COMMAND);
        self.write(CONFIG_STATUS_COMMAND, value | (1 << 10));
    }

    pub fn dump_capabilities(&self) {
        if self.capabilities.is_empty() {
            return;
        }
        log::info!("[pcie]     capabilities:");
        for capability in &self.capabilities {
            log::info!(
                "[pcie]        * at {:#04x}: {} ({:#04x})",
                capability.address,
                capability_name(capability.id),
                capability.id
            );
        }
    }

    fn read(&self, offset: u16) -> u32 {
        self.segment.read(self.bus, self.device, self.function, offset)
    }

    fn write(&self, offset: u16, value: u32) {
        self.segment
            .write(self.bus, self.device, self.function, offset, value);
    }
}

fn capability_name(id: u8) -> &'static str {
    match id {
        0x00 => "null capability",
        0x01 => "power management",
        0x02 => "AGP",
        0x03 => "VPD",
        0x04 => "slot id",
        0x05 => "MSI",
        0x09 => "vendor specific",
        0x0A => "debug port",
        0x0D => "bridge subsystem vendor id",
        0x10 => "PCIe",
        0x11 => "MSI-X",
        0x12 => "SATA data/index configuration",
        0x13 => "advanced features",
        _ => "reserved/undefined",
    }
}

/// Brute-force probe of every bus/device/function in a segment.
fn enumerate_segment<'a>(segment: &'a PcieSegment) -> Vec<PciDevice<'a>> {
    let mut devices = Vec::new();
    for bus in segment.bus_start..=segment.bus_end {
        for device in 0..32 {
            for function in 0..8 {
                let identification = segment.read(bus, device, function, CONFIG_IDENTIFICATION);
                if identification & 0xFFFF == 0xFFFF {
                    continue;
                }
                let found = PciDevice::new(segment, bus, device, function);
                log::info!(
                    "[pcie]   - {}:{:02x}:{:02x}.{} [{:04x}:{:04x}] class {:02x}/{:02x}/{:02x} (header {:#x})",
                    segment.group_number,
                    bus,
                    device,
                    function,
                    found.vendor_id(),
                    found.device_id(),
                    found.class_code(),
                    found.subclass(),
                    found.prog_if(),
                    found.header_type()
                );
                found.dump_capabilities();
                devices.push(found);
            }
        }
    }
    devices
}

/// MCFG segment descriptor: base address + group + decoded bus range.
#[repr(C, packed)]
struct McfgDescriptor {
    address: u64,
    group_number: u16,
    bus_start: u8,
    bus_end: u8,
    reserved: u32,
}

static DEVICES: SpinLock<Vec<PciDevice<'static>>> = SpinLock::new(Vec::new());

/// Map every MCFG segment and enumerate its devices. Systems without an
/// MCFG simply have no PCIe devices to offer; that is not fatal.
pub fn init() {
    let Some(mcfg) = acpi::table_by_signature(b"MCFG") else {
        log::warn!("[pcie] MCFG table not found, skipping enumeration");
        return;
    };

    let descriptor_count =
        (mcfg.length as usize - SDT_HEADER_SIZE - 8) / core::mem::size_of::<McfgDescriptor>();
    log::info!("[pcie] MCFG found, {} segment(s)", descriptor_count);

    let descriptors =
        unsafe { (mcfg as *const SdtHeader as *const u8).add(SDT_HEADER_SIZE + 8) };

    let mut segments = Vec::new();
    for i in 0..descriptor_count {
        let descriptor = unsafe {
            (descriptors as *const McfgDescriptor)
                .add(i)
                .read_unaligned()
        };
        let address = descriptor.address;
        log::info!(
            "[pcie]   - segment {}: base {:#x}, buses {}..={}",
            { descriptor.group_number },
            address,
            descriptor.bus_start,
            descriptor.bus_end
        );

        let window = Arc::new(VmObject::mmio(address, 256 * 1024 * 1024));
        let mapped = address_space::kernel_map_object(window.clone())
            .unwrap_or_else(|| panic!("[pcie] could not map segment config space"));

        segments.push(PcieSegment {
            virtual_address: mapped,
            physical_address: address,
            group_number: descriptor.group_number,
            bus_start: descriptor.bus_start,
            bus_end: descriptor.bus_end,
            _window: Some(window),
        });
    }

    // Segments live for the kernel's lifetime; devices borrow them.
    let segments: &'static [PcieSegment] = Vec::leak(segments);

    let mut all_devices = Vec::new();
    log::info!("[pcie] enumerating all devices...");
    for segment in segments {
        all_devices.extend(enumerate_segment(segment));
    }
    log::info!("[pcie] enumeration complete, {} device(s)", all_devices.len());

    *DEVICES.lock() = all_devices;
}

/// Devices matching a `(class, subclass, prog-if)` triple.
pub fn devices_by_class(class_code: u8, subclass: u8, prog_if: u8) -> Vec<PciDevice<'static>> {
    DEVICES
        .lock()
        .iter()
        .filter(|device| {
            device.class_code() == class_code
                && device.subclass() == subclass
                && device.prog_if() == prog_if
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A one-bus fake ECAM window backed by plain memory.
    struct FakeEcam {
        backing: std::vec::Vec<u8>,
    }

    impl FakeEcam {
        fn new() -> Self {
            FakeEcam {
                backing: std::vec![0xFF; 1 << 20],
            }
        }

        fn segment(&self) -> PcieSegment {
            PcieSegment {
                virtual_address: self.backing.as_ptr() as u64,
                physical_address: 0xB000_0000,
                group_number: 0,
                bus_start: 0,
                bus_end: 0,
                _window: None,
            }
        }

        fn write_dword(&mut self, device: u8, function: u8, offset: u16, value: u32) {
            let base = ((device as usize) << 15) | ((function as usize) << 12);
            self.backing[base + offset as usize..base + offset as usize + 4]
                .copy_from_slice(&value.to_le_bytes());
        }

        fn read_dword(&self, device: u8, function: u8, offset: u16) -> u32 {
            let base = ((device as usize) << 15) | ((function as usize) << 12);
            u32::from_le_bytes(
                self.backing[base + offset as usize..base + offset as usize + 4]
                    .try_into()
                    .unwrap(),
            )
        }
    }

    /// An AHCI-shaped endpoint at 00:03.0 with a 64-bit MSI capability.
    fn install_ahci_device(ecam: &mut FakeEcam) {
        ecam.write_dword(3, 0, CONFIG_IDENTIFICATION, 0x2922_8086);
        ecam.write_dword(3, 0, CONFIG_STATUS_COMMAND, (1 << 20) | 0x0000);
        ecam.write_dword(3, 0, CONFIG_CLASS_CODES, 0x0106_0102);
        ecam.write_dword(3, 0, CONFIG_MISCELLANEOUS, 0x0000_0000);
        ecam.write_dword(3, 0, CONFIG_BAR_BASE + 20, 0xFEB0_0000);
        ecam.write_dword(3, 0, CONFIG_CAPABILITY_POINTER, 0x50);
        // MSI capability, 64-bit address, chain ends here.
        ecam.write_dword(3, 0, 0x50, (0x0080 << 16) | 0x0005);
        // The rest of the function reads as device memory, not 0xFF.
        for offset in (0x54..0x100).step_by(4) {
            ecam.write_dword(3, 0, offset, 0);
        }
    }

    #[test]
    fn probe_reads_identification_and_capabilities() {
        let mut ecam = FakeEcam::new();
        install_ahci_device(&mut ecam);
        let segment = ecam.segment();

        let device = PciDevice::new(&segment, 0, 3, 0);
        assert_eq!(device.vendor_id(), 0x8086);
        assert_eq!(device.device_id(), 0x2922);
        assert_eq!(device.class_code(), 0x01);
        assert_eq!(device.subclass(), 0x06);
        assert_eq!(device.prog_if(), 0x01);
        assert_eq!(device.revision_id(), 0x02);
        assert_eq!(device.header_type(), 0x00);
        assert!(device.supports_msi());
        assert_eq!(
            device.capabilities,
            std::vec![Capability {
                address: 0x50,
                id: 0x05
            }]
        );
        assert_eq!(device.bar_value(5), 0xFEB0_0000);
    }

    #[test]
    fn enumeration_finds_only_present_functions() {
        let mut ecam = FakeEcam::new();
        install_ahci_device(&mut ecam);
        let segment = ecam.segment();

        let devices = enumerate_segment(&segment);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device, 3);
    }

    #[test]
    fn scenario_msi_programming_targets_the_bsp() {
        let mut ecam = FakeEcam::new();
        install_ahci_device(&mut ecam);
        interrupts::init(0x02);

        {
            let segment = ecam.segment();
            let device = PciDevice::new(&segment, 0, 3, 0);
            device.enable_msi(0x20);
            device.enable_bus_mastering();
            device.disable_intx();
        }

        // 64-bit layout: address low/high, then data, then the enable bit.
        assert_eq!(ecam.read_dword(3, 0, 0x54), 0xFEE0_2000);
        assert_eq!(ecam.read_dword(3, 0, 0x58), 0);
        assert_eq!(ecam.read_dword(3, 0, 0x5C), 0x0020);
        assert_eq!(ecam.read_dword(3, 0, 0x50) & (1 << 16), 1 << 16);

        let command = ecam.read_dword(3, 0, CONFIG_STATUS_COMMAND);
        assert_ne!(command & (1 << 1), 0);
        assert_ne!(command & (1 << 2), 0);
        assert_ne!(command & (1 << 4), 0);
        assert_ne!(command & (1 << 10), 0);
    }
}
