//! Kernel entry point and bring-up sequencing for the bootstrap processor,
//! plus the parking loop application processors wait in until released.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use core::hint::spin_loop;
    use core::panic::PanicInfo;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use kernel::memory::address_space;
    use kernel::{acpi, apic, block, boot, cpu, drivers, framebuffer, gdt, interrupts, logger,
        memory, serial, serial_println, time};

    extern "C" {
        /// Handoff record the boot protocol leaves at a fixed symbol.
        #[link_name = "bootboot"]
        static mut BOOT_HANDOFF: boot::BootInfo;
    }

    /// 0 while the BSP initializes; 1 once the core subsystems are live and
    /// application processors may come up.
    static INIT_STAGE: AtomicUsize = AtomicUsize::new(0);

    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        cpu::enable_nx();
        cpu::enable_syscall_extensions();

        let info = unsafe { &mut *core::ptr::addr_of_mut!(BOOT_HANDOFF) };
        let bsp_id = info.bsp_id as u8;

        if cpu::core_apic_id() != bsp_id {
            park_application_processor();
        }

        serial::init();
        logger::init();
        log::info!("[main] kernel is booting...");
        log::info!("[main] bootstrap processor id: {}", info.bsp_id);
        log::info!("[main] core count: {}", info.core_count);

        // Complete the higher-half transition, then everything below can
        // rely on the rebased pointers.
        unsafe { address_space::adjust_kernel_memory() };
        boot::register(info);

        memory::init();
        acpi::init();

        apic::init();
        apic::init_core_lapic();

        gdt::init();
        gdt::switch_kernel_segments();
        interrupts::init(bsp_id);
        interrupts::load_idt();
        cpu::set_interrupt_state(true);

        time::hpet::init();

        framebuffer::init();
        logger::attach_framebuffer();

        drivers::pci::init();
        drivers::ahci::init();
        for device in block::devices() {
            log::info!(
                "[main] block device: {} sectors, writable: {}",
                device.sector_count(),
                device.writable()
            );
        }

        log::info!("[main] releasing application processors");
        INIT_STAGE.store(1, Ordering::Release);

        log::info!("[main] kernel initialized successfully");
        kernel::hlt_loop();
    }

    /// Application processors wait here until the BSP releases them, then
    /// adopt the kernel address space, segments, IDT and their own LAPIC.
    fn park_application_processor() -> ! {
        while INIT_STAGE.load(Ordering::Acquire) == 0 {
            spin_loop();
        }

        unsafe { cpu::write_cr3(address_space::kernel_cr3()) };
        gdt::switch_kernel_segments();
        interrupts::load_idt();
        apic::init_core_lapic();
        cpu::set_interrupt_state(true);

        kernel::hlt_loop();
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("[panic] {}", info);
        kernel::hlt_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
