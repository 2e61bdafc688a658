//! LAPIC and IOAPIC management.
//!
//! The MADT drives bring-up: it names the LAPIC register block (possibly
//! overridden to a 64-bit address) and the one supported IOAPIC. Both
//! register windows are mapped through MMIO VM objects. The legacy PIC pair
//! is fully masked before the APICs take over interrupt routing.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::acpi::{self, SdtHeader, SDT_HEADER_SIZE};
use crate::interrupts::{self, InterruptHandler};
use crate::memory::vm_object::VmObject;
use crate::memory::{address_space, PAGE_SIZE};
use crate::spinlock::SpinLock;

// LAPIC register offsets (from the mapped register block).
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SPURIOUS_VECTOR: u32 = 0x0F0;
const LAPIC_IN_SERVICE_BASE: u32 = 0x100;
const LAPIC_REGISTER_SPAN: u32 = 0x400;

/// Virtual address of the mapped LAPIC register block.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

fn lapic_read(offset: u32) -> u32 {
    if offset >= LAPIC_REGISTER_SPAN {
        return 0;
    }
    let base = LAPIC_BASE.load(Ordering::Acquire);
    unsafe { core::ptr::read_volatile((base + offset as u64) as *const u32) }
}

fn lapic_write(offset: u32, value: u32) {
    if offset >= LAPIC_REGISTER_SPAN {
        return;
    }
    let base = LAPIC_BASE.load(Ordering::Acquire);
    unsafe { core::ptr::write_volatile((base + offset as u64) as *mut u32, value) }
}

/// Enable the executing core's LAPIC: spurious vector 0xFF, APIC enable
/// bit set, then an EOI to discard anything queued during boot.
pub fn init_core_lapic() {
    lapic_write(LAPIC_SPURIOUS_VECTOR, 0x1FF);
    log::info!("[apic] core {}: lapic enabled", crate::cpu::core_apic_id());
    send_eoi();
}

/// Vector currently in service, from the eight 32-bit ISR blocks.
/// Returns 0 when none is set, which marks a spurious interrupt.
pub fn serviced_interrupt_vector() -> u8 {
    for block in 0..8u32 {
        let bits = lapic_read(LAPIC_IN_SERVICE_BASE + block * 0x10);
        if bits != 0 {
            return (block * 32 + bits.trailing_zeros()) as u8;
        }
    }
    0
}

pub fn send_eoi() {
    lapic_write(LAPIC_EOI, 0);
}

// IOAPIC memory-mapped index/data register pair.
const IOAPIC_INDEX: usize = 0;
const IOAPIC_DATA: usize = 4;

const IOAPIC_VERSION_INDEX: u32 = 0x01;
const IOAPIC_REDIRECTION_BASE_INDEX: u32 = 0x10;

pub struct IoApic {
    registers: *mut u32,
    #[allow(dead_code)]
    global_system_interrupt_base: u32,
    redirection_entries: usize,
    available_pins: Vec<u8>,
    _window: Arc<VmObject>,
}

unsafe impl Send for IoApic {}

impl IoApic {
    /// Take over an IOAPIC whose registers are mapped at `registers`:
    /// mask every redirection entry and record which pins are grantable
    /// (0..15 stay reserved for legacy ISA routing this kernel never does).
    pub fn new(registers: *mut u32, global_system_interrupt_base: u32, window: Arc<VmObject>) -> Self {
        let mut ioapic = IoApic {
            registers,
            global_system_interrupt_base,
            redirection_entries: 0,
            available_pins: Vec::new(),
            _window: window,
        };

        let version = ioapic.read(IOAPIC_VERSION_INDEX);
        ioapic.redirection_entries = (((version >> 16) & 0xFF) + 1) as usize;
        log::info!(
            "[apic] ioapic version {}, {} pins",
            version & 0xFF,
            ioapic.redirection_entries
        );

        for pin in 0..ioapic.redirection_entries {
            ioapic.write(
                IOAPIC_REDIRECTION_BASE_INDEX + (pin as u32) * 2,
                0xFF | (1 << 16),
            );
            ioapic.write(IOAPIC_REDIRECTION_BASE_INDEX + (pin as u32) * 2 + 1, 0);
            if pin > 15 {
                ioapic.available_pins.push(pin as u8);
            }
        }

        ioapic
    }

    /// Claim `pin`, reserve a CPU vector for it and write the redirection
    /// entry. Returns false when the pin is unavailable; failing to get a
    /// vector for an available pin is fatal.
    pub fn try_register_entry(&mut self, pin: u8, handler: InterruptHandler, data: usize) -> bool {
        let Some(position) = self.available_pins.iter().position(|&p| p == pin) else {
            return false;
        };
        self.available_pins.remove(position);

        let vector = interrupts::reserve_vector(handler, data);
        if vector == 0 {
            panic!("[apic] out of interrupt vectors for IOAPIC pin {}", pin);
        }

        let entry = redirection_entry(vector, interrupts::bsp_apic_id());
        self.write(
            IOAPIC_REDIRECTION_BASE_INDEX + (pin as u32) * 2,
            entry as u32,
        );
        self.write(
            IOAPIC_REDIRECTION_BASE_INDEX + (pin as u32) * 2 + 1,
            (entry >> 32) as u32,
        );
        true
    }

    fn read(&mut self, index: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile(self.registers.add(IOAPIC_INDEX), index);
            core::ptr::read_volatile(self.registers.add(IOAPIC_DATA))
        }
    }

    fn write(&mut self, index: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile(self.registers.add(IOAPIC_INDEX), index);
            core::ptr::write_volatile(self.registers.add(IOAPIC_DATA), value);
        }
    }
}

/// 64-bit redirection entry: fixed delivery of `vector`, physical
/// destination = the BSP's LAPIC id in bits 56..63, everything else zero.
fn redirection_entry(vector: u8, bsp_apic_id: u8) -> u64 {
    (vector as u64) | ((bsp_apic_id as u64) << 56)
}

static IOAPIC: SpinLock<Option<IoApic>> = SpinLock::new(None);

/// Route `pin` of the system IOAPIC to a freshly reserved vector.
pub fn try_register_ioapic_entry(pin: u8, handler: InterruptHandler, data: usize) -> bool {
    let mut ioapic = IOAPIC.lock();
    match ioapic.as_mut() {
        Some(ioapic) => ioapic.try_register_entry(pin, handler, data),
        None => false,
    }
}

// MADT entry types.
const MADT_ENTRY_LAPIC: u8 = 0;
const MADT_ENTRY_IOAPIC: u8 = 1;
const MADT_ENTRY_SOURCE_OVERRIDE: u8 = 2;
const MADT_ENTRY_NMI_SOURCE: u8 = 3;
const MADT_ENTRY_LAPIC_NMI: u8 = 4;
const MADT_ENTRY_ADDRESS_OVERRIDE: u8 = 5;
const MADT_ENTRY_X2APIC: u8 = 9;

/// Result of walking the MADT: the (possibly overridden) LAPIC address and
/// the discovered IOAPICs.
struct MadtSummary {
    lapic_address: u64,
    pcat_compatible: bool,
    ioapics: Vec<(u64, u32)>,
}

/// Walk the MADT's variable-length entry tail, logging everything the way
/// the table describes it. x2APIC configurations are unsupported and fatal.
fn parse_madt(madt: &'static SdtHeader) -> MadtSummary {
    let base = madt as *const SdtHeader as *const u8;
    // Fixed MADT fields after the SDT header: LAPIC address + flags.
    let lapic_address =
        unsafe { (base.add(SDT_HEADER_SIZE) as *const u32).read_unaligned() } as u64;
    let flags = unsafe { (base.add(SDT_HEADER_SIZE + 4) as *const u32).read_unaligned() };

    let mut summary = MadtSummary {
        lapic_address,
        pcat_compatible: flags & 1 != 0,
        ioapics: Vec::new(),
    };

    let mut offset = SDT_HEADER_SIZE + 8;
    let length = madt.length as usize;
    let mut address_overridden = false;

    log::info!("[apic] MADT entries:");
    while offset < length {
        let entry_type = unsafe { *base.add(offset) };
        let entry_length = unsafe { *base.add(offset + 1) } as usize;
        let entry = unsafe { base.add(offset) };

        match entry_type {
            MADT_ENTRY_LAPIC => {
                // Informational only: the boot protocol already started all
                // cores, so enable flags are not acted upon.
                let acpi_id = unsafe { *entry.add(2) };
                let apic_id = unsafe { *entry.add(3) };
                let flags = unsafe { (entry.add(4) as *const u32).read_unaligned() };
                log::info!(
                    "[apic]   - LAPIC: acpi id {}, apic id {}, enabled {}",
                    acpi_id,
                    apic_id,
                    flags & 1 == 1
                );
            }
            MADT_ENTRY_IOAPIC => {
                let apic_id = unsafe { *entry.add(2) };
                let address = unsafe { (entry.add(4) as *const u32).read_unaligned() } as u64;
                let gsi_base = unsafe { (entry.add(8) as *const u32).read_unaligned() };
                log::info!(
                    "[apic]   - IOAPIC: id {}, address {:#x}, gsi base {}",
                    apic_id,
                    address,
                    gsi_base
                );
                summary.ioapics.push((address, gsi_base));
            }
            MADT_ENTRY_SOURCE_OVERRIDE => {
                let bus = unsafe { *entry.add(2) };
                let irq = unsafe { *entry.add(3) };
                let gsi = unsafe { (entry.add(4) as *const u32).read_unaligned() };
                log::info!(
                    "[apic]   - source override: bus {}, irq {}, gsi {}",
                    bus,
                    irq,
                    gsi
                );
            }
            MADT_ENTRY_NMI_SOURCE => {
                let source = unsafe { *entry.add(2) };
                log::info!("[apic]   - IOAPIC NMI source {} (unused)", source);
            }
            MADT_ENTRY_LAPIC_NMI => {
                let acpi_id = unsafe { *entry.add(2) };
                let lint = unsafe { *entry.add(5) };
                log::info!("[apic]   - LAPIC NMI: acpi id {}, lint {}", acpi_id, lint);
            }
            MADT_ENTRY_ADDRESS_OVERRIDE => {
                if address_overridden {
                    log::warn!("[apic]   - LAPIC address override: duplicate, ignored");
                } else {
                    let address = unsafe { (entry.add(4) as *const u64).read_unaligned() };
                    log::info!("[apic]   - LAPIC address override: {:#x}", address);
                    summary.lapic_address = address;
                    address_overridden = true;
                }
            }
            MADT_ENTRY_X2APIC => {
                panic!("[apic] x2APIC configurations are not supported");
            }
            other => {
                log::info!("[apic]   - entry type {} ignored", other);
            }
        }

        offset += entry_length.max(2);
    }

    summary
}

/// Mask every line of the legacy 8259 pair; the IOAPIC owns routing now.
fn disable_legacy_pic() {
    use pic8259::ChainedPics;
    unsafe {
        let mut pics = ChainedPics::new(0x20, 0x28);
        pics.disable();
    }
    log::info!("[apic] legacy PIC masked");
}

/// Parse the MADT, mask the legacy PIC, and map + initialize the IOAPIC
/// and the BSP LAPIC. A missing MADT or a second IOAPIC is fatal.
pub fn init() {
    let madt = acpi::table_by_signature(b"APIC")
        .unwrap_or_else(|| panic!("[apic] MADT table not found"));
    let summary = parse_madt(madt);

    if summary.pcat_compatible {
        disable_legacy_pic();
    }

    if summary.ioapics.len() > 1 {
        panic!("[apic] multiple IOAPICs are not supported");
    }
    if let Some(&(address, gsi_base)) = summary.ioapics.first() {
        let window = Arc::new(VmObject::mmio(address, PAGE_SIZE));
        let mapped = address_space::kernel_map_object(window.clone())
            .unwrap_or_else(|| panic!("[apic] could not map IOAPIC registers"));
        log::info!("[apic] ioapic mapped at {:#x}", mapped);
        *IOAPIC.lock() = Some(IoApic::new(mapped as *mut u32, gsi_base, window));
    }

    let lapic_window = Arc::new(VmObject::mmio(summary.lapic_address, PAGE_SIZE));
    let mapped = address_space::kernel_map_object(lapic_window)
        .unwrap_or_else(|| panic!("[apic] could not map LAPIC registers"));
    LAPIC_BASE.store(mapped, Ordering::Release);
    log::info!(
        "[apic] local APIC at {:#x} (mapped at {:#x})",
        summary.lapic_address,
        mapped
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    #[test]
    fn redirection_entry_targets_the_bsp() {
        assert_eq!(redirection_entry(0x22, 0x02), 0x0200_0000_0000_0022);
        assert_eq!(redirection_entry(0xFD, 0x00), 0xFD);
    }

    #[test]
    fn madt_walk_collects_ioapics_and_override() {
        let mut bytes = std::vec![0u8; SDT_HEADER_SIZE + 8];
        bytes[0..4].copy_from_slice(b"APIC");
        bytes[SDT_HEADER_SIZE..SDT_HEADER_SIZE + 4].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        bytes[SDT_HEADER_SIZE + 4..SDT_HEADER_SIZE + 8].copy_from_slice(&1u32.to_le_bytes());

        // IOAPIC entry: id 1 at 0xFEC00000, gsi base 0.
        let mut ioapic = std::vec![MADT_ENTRY_IOAPIC, 12, 1, 0];
        ioapic.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        ioapic.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&ioapic);

        // LAPIC address override to a 64-bit address.
        let mut address_override = std::vec![MADT_ENTRY_ADDRESS_OVERRIDE, 12, 0, 0];
        address_override.extend_from_slice(&0x1_FEE0_0000u64.to_le_bytes());
        bytes.extend_from_slice(&address_override);

        let length = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&length.to_le_bytes());

        let leaked: &'static [u8] = std::boxed::Box::leak(bytes.into_boxed_slice());
        let madt = unsafe { &*(leaked.as_ptr() as *const SdtHeader) };
        let summary = parse_madt(madt);

        assert!(summary.pcat_compatible);
        assert_eq!(summary.ioapics, std::vec![(0xFEC0_0000, 0)]);
        assert_eq!(summary.lapic_address, 0x1_FEE0_0000);
    }

    #[test]
    fn ioapic_grants_each_high_pin_once() {
        let _guard = testing::lock_global_phys();

        // A fake register block: the version read returns whatever sits in
        // the data slot, so preset 23 redirection entries and version 0x11.
        let mut registers = std::vec![0u32; 8];
        registers[super::IOAPIC_DATA] = (22 << 16) | 0x11;
        let window = Arc::new(VmObject::mmio(0xFEC0_0000, PAGE_SIZE));
        let mut ioapic = IoApic::new(registers.as_mut_ptr(), 0, window);
        assert_eq!(ioapic.redirection_entries, 23);

        fn nop_handler(_data: usize, _vector: u8) {}

        // Legacy pins are never grantable; high pins exactly once.
        assert!(!ioapic.try_register_entry(3, nop_handler, 0));
        assert!(ioapic.try_register_entry(17, nop_handler, 0));
        assert!(!ioapic.try_register_entry(17, nop_handler, 0));
        assert!(ioapic.try_register_entry(22, nop_handler, 0));
        assert!(!ioapic.try_register_entry(23, nop_handler, 0));
    }
}
