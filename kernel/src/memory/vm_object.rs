//! Virtual memory objects: the only unit the address spaces map.
//!
//! An object is an ordered list of page physical addresses plus access
//! flags. The three variants differ only in where the frames come from and
//! whether destruction returns them to the physical allocator.

use alloc::vec::Vec;

use crate::memory::phys::{self, KERNEL_PID, LARGE_PAGE_SIZE, PAGE_SIZE};

pub mod flags {
    pub const WRITABLE: u8 = 1 << 0;
    pub const EXECUTABLE: u8 = 1 << 1;
    pub const CACHEABLE: u8 = 1 << 2;
    pub const USER_MAPPABLE: u8 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmObjectKind {
    /// Device registers; the frames belong to the hardware, never freed.
    Mmio,
    /// Frames allocated at construction, freed at destruction.
    MemoryBacked,
    /// A single non-cacheable frame, freed at destruction.
    UncacheablePage,
}

pub struct VmObject {
    kind: VmObjectKind,
    pages: Vec<u64>,
    flags: u8,
    size: usize,
    large_pages: bool,
    preferred_address: Option<u64>,
}

impl VmObject {
    /// Object covering the device registers at `physical_address`.
    /// `physical_address` must be page-aligned. Mapped writable and
    /// non-cacheable; large pages are used once the window exceeds 2 MiB.
    pub fn mmio(physical_address: u64, length: usize) -> Self {
        let large = length > LARGE_PAGE_SIZE;
        let page_size = if large { LARGE_PAGE_SIZE } else { PAGE_SIZE };
        let page_count = length.div_ceil(page_size);

        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            pages.push(physical_address + (i * page_size) as u64);
        }

        Self {
            kind: VmObjectKind::Mmio,
            pages,
            flags: flags::WRITABLE,
            size: page_count * page_size,
            large_pages: large,
            preferred_address: None,
        }
    }

    /// Object backed by freshly allocated frames. Large pages are chosen
    /// when permitted, the length reaches 2 MiB and any preferred address
    /// would stay 2 MiB-aligned.
    pub fn memory_backed(
        length: usize,
        disallow_large_pages: bool,
        write: bool,
        execute: bool,
        cache: bool,
        pid: u32,
    ) -> Self {
        let large = !disallow_large_pages && length >= LARGE_PAGE_SIZE;
        let page_size = if large { LARGE_PAGE_SIZE } else { PAGE_SIZE };
        let page_count = length.div_ceil(page_size);

        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            pages.push(phys::allocate_page(pid, large).as_u64());
        }

        let mut object_flags = 0;
        if write {
            object_flags |= flags::WRITABLE;
        }
        if execute {
            object_flags |= flags::EXECUTABLE;
        }
        if cache {
            object_flags |= flags::CACHEABLE;
        }

        Self {
            kind: VmObjectKind::MemoryBacked,
            pages,
            flags: object_flags,
            size: page_count * page_size,
            large_pages: large,
            preferred_address: None,
        }
    }

    /// A single freshly allocated frame, mapped writable and non-cacheable.
    /// DMA descriptor memory uses this variant.
    pub fn uncacheable_page(large: bool) -> Self {
        let page = phys::allocate_page(KERNEL_PID, large).as_u64();
        let mut pages = Vec::with_capacity(1);
        pages.push(page);

        Self {
            kind: VmObjectKind::UncacheablePage,
            pages,
            flags: flags::WRITABLE,
            size: if large { LARGE_PAGE_SIZE } else { PAGE_SIZE },
            large_pages: large,
            preferred_address: None,
        }
    }

    /// Request a fixed mapping address. The address-space allocator does not
    /// honor preferred addresses yet and refuses such objects.
    pub fn with_preferred_address(mut self, address: u64) -> Self {
        self.preferred_address = Some(address);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn large_pages(&self) -> bool {
        self.large_pages
    }

    pub fn page_size(&self) -> usize {
        if self.large_pages {
            LARGE_PAGE_SIZE
        } else {
            PAGE_SIZE
        }
    }

    pub fn preferred_address(&self) -> Option<u64> {
        self.preferred_address
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Physical base of a single-frame object.
    pub fn physical_address(&self) -> u64 {
        self.pages[0]
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        match self.kind {
            VmObjectKind::Mmio => {}
            VmObjectKind::MemoryBacked | VmObjectKind::UncacheablePage => {
                for page in &self.pages {
                    phys::free_page(x86_64::PhysAddr::new(*page));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing;

    #[test]
    fn mmio_lists_the_register_window() {
        let object = VmObject::mmio(0xFEC0_0000, PAGE_SIZE);
        assert_eq!(object.pages(), &[0xFEC0_0000]);
        assert_eq!(object.size(), PAGE_SIZE);
        assert!(!object.large_pages());
        assert_eq!(object.flags(), flags::WRITABLE);
    }

    #[test]
    fn mmio_switches_to_large_pages_past_2mib() {
        let object = VmObject::mmio(0xE000_0000, 256 * 1024 * 1024);
        assert!(object.large_pages());
        assert_eq!(object.pages().len(), 128);
        assert_eq!(object.pages()[1], 0xE000_0000 + LARGE_PAGE_SIZE as u64);
    }

    #[test]
    fn memory_backed_returns_frames_on_drop() {
        let _guard = testing::lock_global_phys();
        let (pages_before, large_before) = testing::global_counters();

        let object = VmObject::memory_backed(2 * PAGE_SIZE, true, true, false, true, KERNEL_PID);
        assert_eq!(object.pages().len(), 2);
        assert_eq!(object.flags(), flags::WRITABLE | flags::CACHEABLE);
        drop(object);

        assert_eq!(testing::global_counters(), (pages_before, large_before));
    }

    #[test]
    fn uncacheable_page_is_a_single_writable_frame() {
        let _guard = testing::lock_global_phys();
        let object = VmObject::uncacheable_page(false);
        assert_eq!(object.pages().len(), 1);
        assert_eq!(object.size(), PAGE_SIZE);
        assert_eq!(object.physical_address() % PAGE_SIZE as u64, 0);
        assert_eq!(object.flags(), flags::WRITABLE);
    }
}
