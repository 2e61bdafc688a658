//! Virtual address spaces.
//!
//! Each address space owns a four-level paging structure and an ordered
//! region list tiling its allocatable range. VM objects are the only
//! mapping unit; `map_object` finds a free region first-fit, splits it, and
//! writes the leaf entries. The kernel space wraps the paging structure the
//! boot protocol handed over; user spaces share its upper half by PML4 copy.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::cpu::{self, PAGING_BASE};
use crate::memory::phys::{self, KERNEL_PID, LARGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::vm_object::{flags, VmObject};
use crate::spinlock::SpinLock;

/// Page-table entry bits (identical for all four levels where used).
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_CACHE_DISABLE: u64 = 1 << 4;
const PTE_HUGE_PAGE: u64 = 1 << 7;
const PTE_NO_EXECUTE: u64 = 1 << 63;
const PTE_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Kernel allocations start 512 GiB past the physical map so they can never
/// collide with it, and stop short of the top 512 GiB.
const KERNEL_ALLOC_BASE: u64 = PAGING_BASE + (512u64 << 30);
const KERNEL_ALLOC_END: u64 = 0xFFFF_FF80_0000_0000;

/// User allocations span 2 MiB up to the canonical lower-half boundary.
const USER_ALLOC_BASE: u64 = 2 * 1024 * 1024;
const USER_ALLOC_END: u64 = 0x0000_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Free,
    Allocated,
}

struct Region {
    kind: RegionKind,
    object: Option<Arc<VmObject>>,
    address: u64,
    size: u64,
}

pub struct AddressSpace {
    cr3: u64,
    phys_offset: u64,
    regions: Vec<Region>,
}

unsafe impl Send for AddressSpace {}

impl AddressSpace {
    fn with_root(cr3: u64, phys_offset: u64, base: u64, end: u64) -> Self {
        let mut regions = Vec::new();
        regions.push(Region {
            kind: RegionKind::Free,
            object: None,
            address: base,
            size: end - base,
        });
        Self {
            cr3,
            phys_offset,
            regions,
        }
    }

    /// Fresh user address space: empty lower half, upper half shared with
    /// the kernel by copying its present PML4 entries.
    pub fn new_user() -> Self {
        let cr3 = allocate_zeroed_page(PAGING_BASE);
        let space = Self::with_root(cr3, PAGING_BASE, USER_ALLOC_BASE, USER_ALLOC_END);

        let kernel = KERNEL_SPACE.lock();
        let kernel = kernel.as_ref().expect("kernel address space not initialized");
        unsafe {
            let src = (kernel.cr3 + PAGING_BASE) as *const u64;
            let dst = (cr3 + PAGING_BASE) as *mut u64;
            for i in 256..512 {
                let entry = *src.add(i);
                if entry & PTE_PRESENT != 0 {
                    *dst.add(i) = entry;
                }
            }
        }
        space
    }

    /// Physical address of this space's top-level paging structure.
    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    /// Map `object` at the lowest free address that fits, honoring large
    /// page alignment. Returns the chosen virtual address, or `None` when
    /// no region fits. Objects with a preferred address are not supported.
    pub fn map_object(&mut self, object: Arc<VmObject>) -> Option<u64> {
        if object.preferred_address().is_some() {
            return None;
        }

        let object_size = object.size() as u64;

        for i in 0..self.regions.len() {
            if self.regions[i].kind != RegionKind::Free {
                continue;
            }

            let mut region_address = self.regions[i].address;
            let mut region_size = self.regions[i].size;
            let mut alignment_pad = 0u64;

            if object.large_pages() && region_address % LARGE_PAGE_SIZE as u64 != 0 {
                let difference =
                    LARGE_PAGE_SIZE as u64 - (region_address % LARGE_PAGE_SIZE as u64);
                if difference >= region_size {
                    continue;
                }
                alignment_pad = difference;
                region_address += difference;
                region_size -= difference;
            }

            if region_size < object_size {
                continue;
            }

            // Split off the tail first so `i` still names the chosen region.
            if region_size > object_size {
                self.regions.insert(
                    i + 1,
                    Region {
                        kind: RegionKind::Free,
                        object: None,
                        address: region_address + object_size,
                        size: region_size - object_size,
                    },
                );
            }

            self.regions[i].address = region_address;
            self.regions[i].size = object_size;
            self.regions[i].kind = RegionKind::Allocated;
            self.regions[i].object = Some(object.clone());

            if alignment_pad != 0 {
                self.regions.insert(
                    i,
                    Region {
                        kind: RegionKind::Free,
                        object: None,
                        address: region_address - alignment_pad,
                        size: alignment_pad,
                    },
                );
            }

            self.apply_mapping(region_address, object_size, &object);
            return Some(region_address);
        }

        None
    }

    /// Tear down the mapping at `address`. The region becomes free and is
    /// coalesced with free neighbors; the object is dropped (returning its
    /// frames if it owns them). TLB invalidation is the caller's concern.
    pub fn unmap(&mut self, address: u64) {
        let Some(i) = self
            .regions
            .iter()
            .position(|r| r.kind == RegionKind::Allocated && r.address == address)
        else {
            return;
        };

        let object = self.regions[i].object.take().expect("allocated region without object");
        let page_size = object.page_size() as u64;
        let page_count = self.regions[i].size / page_size;
        for page in 0..page_count {
            if let Some(entry) =
                self.entry_for(address + page * page_size, object.large_pages(), false)
            {
                unsafe { core::ptr::write_volatile(entry, 0) };
            }
        }
        drop(object);

        self.regions[i].kind = RegionKind::Free;

        // Merge with the next free region, then the previous one.
        if i + 1 < self.regions.len() && self.regions[i + 1].kind == RegionKind::Free {
            self.regions[i].size += self.regions[i + 1].size;
            self.regions.remove(i + 1);
        }
        if i > 0 && self.regions[i - 1].kind == RegionKind::Free {
            self.regions[i - 1].size += self.regions[i].size;
            self.regions.remove(i);
        }
    }

    /// Walk (and optionally grow) the paging structure down to the entry
    /// mapping `address`. With `large` the walk stops at the page directory.
    pub fn entry_for(&mut self, address: u64, large: bool, create: bool) -> Option<*mut u64> {
        let pt_index = (address >> 12) & 0x1FF;
        let pd_index = (address >> 21) & 0x1FF;
        let pdpt_index = (address >> 30) & 0x1FF;
        let pml4_index = (address >> 39) & 0x1FF;

        let pml4 = (self.cr3 + self.phys_offset) as *mut u64;
        let pdpt = self.descend(unsafe { pml4.add(pml4_index as usize) }, create)?;
        let pd = self.descend(unsafe { pdpt.add(pdpt_index as usize) }, create)?;
        if large {
            return Some(unsafe { pd.add(pd_index as usize) });
        }
        let pt = self.descend(unsafe { pd.add(pd_index as usize) }, create)?;
        Some(unsafe { pt.add(pt_index as usize) })
    }

    /// Follow one paging level, lazily allocating a zeroed table when asked.
    /// Intermediate entries only carry present + writable; access control
    /// lives in the leaves.
    fn descend(&mut self, entry: *mut u64, create: bool) -> Option<*mut u64> {
        unsafe {
            if *entry & PTE_PRESENT == 0 {
                if !create {
                    return None;
                }
                let table = allocate_zeroed_page(self.phys_offset);
                *entry = table | PTE_PRESENT | PTE_WRITABLE;
            }
            Some(((*entry & PTE_ADDRESS_MASK) + self.phys_offset) as *mut u64)
        }
    }

    fn apply_mapping(&mut self, address: u64, size: u64, object: &VmObject) {
        let page_size = object.page_size() as u64;
        let page_count = size / page_size;
        let pages = object.pages();
        if pages.len() as u64 != page_count {
            panic!(
                "[vas] object page count {} does not match region ({} pages)",
                pages.len(),
                page_count
            );
        }

        let object_flags = object.flags();
        let mut leaf = PTE_PRESENT;
        if object_flags & flags::WRITABLE != 0 {
            leaf |= PTE_WRITABLE;
        }
        if object_flags & flags::EXECUTABLE == 0 {
            leaf |= PTE_NO_EXECUTE;
        }
        if object_flags & flags::CACHEABLE == 0 {
            leaf |= PTE_CACHE_DISABLE;
        }
        if object.large_pages() {
            leaf |= PTE_HUGE_PAGE;
        }

        for i in 0..page_count {
            let entry = self
                .entry_for(address + i * page_size, object.large_pages(), true)
                .expect("create-mode walk cannot fail");
            let page = pages[i as usize] & PTE_ADDRESS_MASK;
            // Freshly mapped addresses were non-present before, so no TLB
            // invalidation is needed here.
            unsafe { core::ptr::write_volatile(entry, leaf | page) };
        }
    }

    #[cfg(test)]
    fn region_spans(&self) -> Vec<(bool, u64, u64)> {
        self.regions
            .iter()
            .map(|r| (r.kind == RegionKind::Allocated, r.address, r.size))
            .collect()
    }
}

/// Allocate a kernel-owned 4 KiB frame and zero it through the direct map.
fn allocate_zeroed_page(phys_offset: u64) -> u64 {
    let page = phys::allocate_page(KERNEL_PID, false).as_u64();
    unsafe {
        core::ptr::write_bytes((page + phys_offset) as *mut u8, 0, PAGE_SIZE);
    }
    page
}

/// One-shot completion of the higher-half transition: the boot protocol
/// mirrors the low mapping, so moving PML4 slot 0 to slot 256 and dropping
/// the low half leaves the kernel running purely in the higher half.
///
/// # Safety
/// Must run once, on the BSP, before the low identity mapping is touched;
/// relies on CR3 still being reachable through the identity map.
pub unsafe fn adjust_kernel_memory() {
    let pml4 = cpu::read_cr3() as *mut u64;
    *pml4.add(256) = *pml4;
    *pml4 = 0;
    cpu::write_cr3(pml4 as u64);
}

static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

/// Take over the boot paging structure as the kernel address space.
pub fn init_kernel_space() {
    let cr3 = cpu::read_cr3();
    log::info!("[vas] kernel address space takes over cr3 {:#x}", cr3);

    // The whole physical map must never be executable.
    unsafe {
        let pml4 = (cr3 + PAGING_BASE) as *mut u64;
        *pml4.add(256) |= PTE_NO_EXECUTE;
    }

    let space = AddressSpace::with_root(cr3, PAGING_BASE, KERNEL_ALLOC_BASE, KERNEL_ALLOC_END);
    *KERNEL_SPACE.lock() = Some(space);
}

/// Map an object into the kernel address space.
#[cfg(not(test))]
pub fn kernel_map_object(object: Arc<VmObject>) -> Option<u64> {
    KERNEL_SPACE
        .lock()
        .as_mut()
        .expect("kernel address space not initialized")
        .map_object(object)
}

/// Host tests have no live paging structure to install mappings into, so
/// frame-backed objects are reached through the test arena's direct map
/// instead. Region bookkeeping is covered by the `AddressSpace` tests.
#[cfg(test)]
pub fn kernel_map_object(object: Arc<VmObject>) -> Option<u64> {
    Some(object.physical_address() + crate::memory::testing::global_offset())
}

/// CR3 of the kernel address space, for APs leaving the parking loop.
pub fn kernel_cr3() -> u64 {
    KERNEL_SPACE
        .lock()
        .as_ref()
        .expect("kernel address space not initialized")
        .cr3()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    fn test_space() -> AddressSpace {
        let offset = testing::global_offset();
        let cr3 = allocate_zeroed_page(offset);
        AddressSpace::with_root(cr3, offset, USER_ALLOC_BASE, USER_ALLOC_END)
    }

    fn leaf(space: &mut AddressSpace, address: u64, large: bool) -> u64 {
        let entry = space
            .entry_for(address, large, false)
            .expect("mapping should exist");
        unsafe { *entry }
    }

    #[test]
    fn scenario_writable_data_mapping() {
        let _guard = testing::lock_global_phys();
        let mut space = test_space();

        let object = Arc::new(VmObject::memory_backed(
            2 * PAGE_SIZE,
            true,
            true,
            false,
            true,
            KERNEL_PID,
        ));
        let pages = object.pages().to_vec();
        let address = space.map_object(object).expect("mapping failed");

        for (i, page) in pages.iter().enumerate() {
            let entry = leaf(&mut space, address + (i * PAGE_SIZE) as u64, false);
            assert_eq!(entry & PTE_ADDRESS_MASK, *page);
            assert_ne!(entry & PTE_WRITABLE, 0);
            assert_ne!(entry & PTE_NO_EXECUTE, 0);
            assert_eq!(entry & PTE_CACHE_DISABLE, 0);
        }
    }

    #[test]
    fn mmio_mapping_disables_caching() {
        let _guard = testing::lock_global_phys();
        let mut space = test_space();

        let object = Arc::new(VmObject::mmio(0xFEE0_0000, PAGE_SIZE));
        let address = space.map_object(object).expect("mapping failed");
        let entry = leaf(&mut space, address, false);
        assert_eq!(entry & PTE_ADDRESS_MASK, 0xFEE0_0000);
        assert_ne!(entry & PTE_CACHE_DISABLE, 0);
        assert_ne!(entry & PTE_NO_EXECUTE, 0);
    }

    #[test]
    fn large_object_gets_alignment_pad_region() {
        let _guard = testing::lock_global_phys();
        let mut space = test_space();

        // Knock the free region out of 2 MiB alignment first.
        let small = Arc::new(VmObject::memory_backed(
            PAGE_SIZE,
            true,
            true,
            false,
            true,
            KERNEL_PID,
        ));
        let small_address = space.map_object(small).expect("mapping failed");

        let large = Arc::new(VmObject::memory_backed(
            LARGE_PAGE_SIZE,
            false,
            true,
            false,
            true,
            KERNEL_PID,
        ));
        assert!(large.large_pages());
        let large_pages = large.pages().to_vec();
        let large_address = space.map_object(large).expect("mapping failed");

        assert_eq!(large_address % LARGE_PAGE_SIZE as u64, 0);

        let spans = space.region_spans();
        // [small][alignment pad][large][tail]
        assert_eq!(spans[0], (true, small_address, PAGE_SIZE as u64));
        assert_eq!(
            spans[1],
            (
                false,
                small_address + PAGE_SIZE as u64,
                large_address - small_address - PAGE_SIZE as u64
            )
        );
        assert_eq!(spans[2], (true, large_address, LARGE_PAGE_SIZE as u64));
        assert!(!spans[3].0);

        let entry = leaf(&mut space, large_address, true);
        assert_ne!(entry & PTE_HUGE_PAGE, 0);
        assert_eq!(entry & PTE_ADDRESS_MASK, large_pages[0]);
    }

    #[test]
    fn preferred_addresses_are_refused() {
        let _guard = testing::lock_global_phys();
        let mut space = test_space();

        let object = Arc::new(
            VmObject::mmio(0xFEE0_0000, PAGE_SIZE).with_preferred_address(0x40_0000),
        );
        assert_eq!(space.map_object(object), None);
    }

    #[test]
    fn unmap_coalesces_free_regions() {
        let _guard = testing::lock_global_phys();
        let mut space = test_space();

        let a = Arc::new(VmObject::mmio(0x1000_0000, PAGE_SIZE));
        let b = Arc::new(VmObject::mmio(0x1000_1000, PAGE_SIZE));
        let a_address = space.map_object(a).expect("mapping failed");
        let b_address = space.map_object(b).expect("mapping failed");

        space.unmap(a_address);
        space.unmap(b_address);

        // Everything merged back into one free region covering the range.
        let spans = space.region_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], (false, USER_ALLOC_BASE, USER_ALLOC_END - USER_ALLOC_BASE));
        assert!(space.entry_for(a_address, false, false).is_none()
            || leaf(&mut space, a_address, false) == 0);
    }
}
