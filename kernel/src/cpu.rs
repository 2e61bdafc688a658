//! CPU feature enablement and privileged register access for the BSP and APs.

use core::arch::x86_64::__cpuid;

/// Base of the higher-half direct map of physical memory installed by the
/// boot protocol. Every physical address is readable at `addr + PAGING_BASE`.
pub const PAGING_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Enable the NX (execution-disable) paging bit via EFER.
///
/// Must run before any page-table entry with the execution-disable bit is
/// installed, or the walk faults with a reserved-bit violation.
pub fn enable_nx() {
    use x86_64::registers::model_specific::{Efer, EferFlags};
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
    }
}

/// Enable SYSCALL/SYSRET via EFER.SCE.
pub fn enable_syscall_extensions() {
    use x86_64::registers::model_specific::{Efer, EferFlags};
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

/// LAPIC id of the executing core, from CPUID leaf 1.
pub fn core_apic_id() -> u8 {
    let leaf1 = unsafe { __cpuid(1) };
    (leaf1.ebx >> 24) as u8
}

/// Physical address of the active top-level paging structure.
pub fn read_cr3() -> u64 {
    use x86_64::registers::control::Cr3;
    Cr3::read().0.start_address().as_u64()
}

/// Load a new top-level paging structure (flushes the whole TLB).
///
/// # Safety
/// `phys` must point at a valid PML4 that maps the executing code.
pub unsafe fn write_cr3(phys: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    Cr3::write(
        PhysFrame::containing_address(PhysAddr::new(phys)),
        Cr3Flags::empty(),
    );
}

/// Disable interrupts, returning whether they were enabled beforehand.
///
/// Pairs with [`exit_critical`]; the spinlock uses this pair so that a lock
/// taken with interrupts already disabled does not re-enable them on unlock.
#[inline]
pub fn enter_critical() -> bool {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::interrupts;
        let were_enabled = interrupts::are_enabled();
        interrupts::disable();
        were_enabled
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

/// Restore the interrupt state captured by [`enter_critical`].
#[inline]
pub fn exit_critical(were_enabled: bool) {
    #[cfg(target_os = "none")]
    {
        if were_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = were_enabled;
    }
}

/// RAII critical section: interrupts stay disabled until the guard drops.
pub struct ScopedCritical {
    were_enabled: bool,
}

impl ScopedCritical {
    pub fn new() -> Self {
        Self {
            were_enabled: enter_critical(),
        }
    }
}

impl Default for ScopedCritical {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedCritical {
    fn drop(&mut self) {
        exit_critical(self.were_enabled);
    }
}

/// Globally enable or disable interrupt delivery on the executing core.
#[cfg(target_os = "none")]
pub fn set_interrupt_state(enabled: bool) {
    use x86_64::instructions::interrupts;
    if enabled {
        interrupts::enable();
    } else {
        interrupts::disable();
    }
}
