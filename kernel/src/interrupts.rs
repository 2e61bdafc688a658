//! Interrupt core: vector reservation, dispatch and MSI encoding.
//!
//! The IDT routes every vector at or above 0x20 into a single stub that asks
//! the LAPIC which vector is in service, fires the registered handler and
//! acknowledges with an EOI. Devices obtain vectors from a simple bump
//! pool; MSI-capable devices additionally get the address/data pair that
//! targets the bootstrap processor.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::spinlock::SpinLock;

/// Handler registered for a vector: `(handler_data, vector)`.
pub type InterruptHandler = fn(usize, u8);

/// First allocatable vector; everything below is CPU-exception territory.
const MIN_VECTOR: u16 = 0x20;
/// Upper bound of the pool. 0xFF stays reserved for the spurious vector.
const MAX_VECTOR: u16 = 0xFE;

struct VectorTable {
    handlers: [Option<(InterruptHandler, usize)>; 256],
    next_free: u16,
}

static VECTORS: SpinLock<VectorTable> = SpinLock::new(VectorTable {
    handlers: [None; 256],
    next_free: MIN_VECTOR,
});

static BSP_APIC_ID: AtomicU8 = AtomicU8::new(0);
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Reserve a vector from the shared pool and register its handler.
/// Returns 0 when the pool is exhausted.
pub fn reserve_vector(handler: InterruptHandler, data: usize) -> u8 {
    let mut table = VECTORS.lock();
    if MAX_VECTOR - table.next_free == 0 {
        return 0;
    }
    let vector = table.next_free;
    table.handlers[vector as usize] = Some((handler, data));
    table.next_free += 1;
    vector as u8
}

/// MSI vectors come from the same pool as IOAPIC vectors.
pub fn reserve_msi_vector(handler: InterruptHandler, data: usize) -> u8 {
    reserve_vector(handler, data)
}

/// MSI address targeting `bsp_apic_id`, per the architected LAPIC window.
/// All message-signaled interrupts go to the bootstrap processor.
pub fn msi_address_for(bsp_apic_id: u8) -> u64 {
    0xFEE0_0000u64 | ((bsp_apic_id as u64) << 12)
}

/// MSI data word: edge-triggered delivery of `vector`.
pub fn msi_data_for(vector: u8) -> u16 {
    vector as u16
}

pub fn msi_address() -> u64 {
    msi_address_for(BSP_APIC_ID.load(Ordering::Relaxed))
}

pub fn msi_data(vector: u8) -> u16 {
    msi_data_for(vector)
}

/// LAPIC id of the bootstrap processor, as reported by the boot protocol.
pub fn bsp_apic_id() -> u8 {
    BSP_APIC_ID.load(Ordering::Relaxed)
}

/// Fire the handler registered for `vector`, if any.
pub fn fire_handler(vector: u8) {
    let entry = VECTORS.lock().handlers[vector as usize];
    match entry {
        Some((handler, data)) => handler(data, vector),
        None => log::warn!("[ints] interrupt {:#x} has no registered handler", vector),
    }
}

/// Spurious interrupts observed so far (ISR query came back empty).
pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

/// Record the BSP id and build the IDT.
pub fn init(bsp_apic_id: u8) {
    BSP_APIC_ID.store(bsp_apic_id, Ordering::Relaxed);
    #[cfg(target_os = "none")]
    idt::build();
}

/// Load the IDT on the executing core (BSP and released APs).
#[cfg(target_os = "none")]
pub fn load_idt() {
    idt::load();
}

/// Shared body of the external-interrupt stubs: query the LAPIC for the
/// in-service vector, dispatch, acknowledge. An empty in-service register
/// means the interrupt was spurious and must not be acknowledged.
#[allow(dead_code)]
fn handle_external_interrupt() {
    let vector = crate::apic::serviced_interrupt_vector();
    if vector != 0 {
        fire_handler(vector);
        crate::apic::send_eoi();
    } else {
        let count = SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("[ints] spurious interrupt ({} so far)", count);
    }
}

#[cfg(target_os = "none")]
mod idt {
    use spin::Once;
    use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

    static IDT: Once<InterruptDescriptorTable> = Once::new();

    pub fn build() {
        IDT.call_once(|| {
            let mut idt = InterruptDescriptorTable::new();

            idt.divide_error.set_handler_fn(divide_error_handler);
            idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
            idt.double_fault.set_handler_fn(double_fault_handler);
            idt.general_protection_fault
                .set_handler_fn(general_protection_fault_handler);
            idt.page_fault.set_handler_fn(page_fault_handler);

            // Every allocatable vector plus the spurious slot funnels into
            // the common LAPIC-driven dispatcher.
            for vector in 32..=255u8 {
                idt[vector].set_handler_fn(external_interrupt_handler);
            }

            idt
        });
    }

    pub fn load() {
        IDT.get().expect("IDT not built").load();
    }

    extern "x86-interrupt" fn external_interrupt_handler(_frame: InterruptStackFrame) {
        super::handle_external_interrupt();
    }

    extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
        log::error!("[ints] divide error at {:#x}", frame.instruction_pointer.as_u64());
        crate::hlt_loop();
    }

    extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
        log::error!("[ints] invalid opcode at {:#x}", frame.instruction_pointer.as_u64());
        crate::hlt_loop();
    }

    extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
        log::error!("[ints] double fault (code {:#x}): {:?}", code, frame);
        crate::hlt_loop();
    }

    extern "x86-interrupt" fn general_protection_fault_handler(
        frame: InterruptStackFrame,
        code: u64,
    ) {
        log::error!(
            "[ints] general protection fault, code {:#x}, rip {:#x}",
            code,
            frame.instruction_pointer.as_u64()
        );
        crate::hlt_loop();
    }

    extern "x86-interrupt" fn page_fault_handler(
        frame: InterruptStackFrame,
        code: PageFaultErrorCode,
    ) {
        log::error!(
            "[ints] page fault at {:#x} ({:?}), rip {:#x}",
            x86_64::registers::control::Cr2::read_raw(),
            code,
            frame.instruction_pointer.as_u64()
        );
        crate::hlt_loop();
    }
}
