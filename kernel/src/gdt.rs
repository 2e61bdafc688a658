//! Fixed long-mode GDT.
//!
//! Layout is part of the kernel ABI: kernel code = 0x08, kernel data = 0x10,
//! user code = 0x18, user data = 0x20. Loaded on the BSP during init and on
//! every AP when it is released from the parking loop.

use conquer_once::spin::OnceCell;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    #[allow(dead_code)]
    user_code_selector: SegmentSelector,
    #[allow(dead_code)]
    user_data_selector: SegmentSelector,
}

/// Build the GDT. Does not load it; APs share the table built here.
pub fn init() {
    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    });
}

/// Load the GDT on the executing core and reload the kernel segments.
pub fn switch_kernel_segments() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};

    let (gdt, selectors) = GDT.get().expect("GDT not built");
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        DS::set_reg(selectors.data_selector);
        ES::set_reg(selectors.data_selector);
        SS::set_reg(selectors.data_selector);
    }
}

/// Selector the IDT entries point their gates at.
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.get().expect("GDT not built").1.code_selector
}
