//! Memory management: physical frames, the kernel heap, and virtual
//! address spaces built from VM objects.

pub mod address_space;
pub mod heap;
pub mod phys;
pub mod vm_object;

pub use phys::{KERNEL_PID, LARGE_PAGE_SIZE, PAGE_SIZE};

/// Bring up the memory subsystems in dependency order: physical allocator
/// from the boot memory map, then the heap (which draws chunks from it),
/// then the kernel address space (which allocates regions on the heap).
pub fn init() {
    phys::init(crate::boot::memory_map_mut());
    heap::init();
    address_space::init_kernel_space();
}

/// Test scaffolding: a leaked, 2 MiB-aligned block of host memory stands in
/// for physical RAM. Fake physical address `p` lives at host address
/// `p + offset`, mirroring how the kernel reaches physical memory through
/// the higher-half map.
#[cfg(test)]
pub(crate) mod test_arena {
    use super::LARGE_PAGE_SIZE;

    pub struct Arena {
        offset: u64,
    }

    impl Arena {
        pub fn new(span: usize) -> Self {
            let mut backing = std::vec::Vec::<u8>::new();
            backing.resize(span + LARGE_PAGE_SIZE, 0);
            let base = backing.as_mut_ptr() as u64;
            std::mem::forget(backing);
            let aligned = (base + LARGE_PAGE_SIZE as u64 - 1) & !(LARGE_PAGE_SIZE as u64 - 1);
            Arena { offset: aligned }
        }

        /// The value that plays the role of `PAGING_BASE` for this arena.
        pub fn offset(&self) -> u64 {
            self.offset
        }
    }
}

/// Serialization and setup for tests that go through the module-level
/// singletons (VM objects, address spaces, AHCI): one shared arena backs
/// the global physical allocator, and a mutex keeps such tests from
/// interleaving.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};

    use super::phys;
    use super::test_arena::Arena;
    use crate::boot::{MemoryKind, MemoryMapEntry};

    static GLOBAL_PHYS: Mutex<()> = Mutex::new(());
    static GLOBAL_OFFSET: AtomicU64 = AtomicU64::new(0);

    pub fn lock_global_phys() -> MutexGuard<'static, ()> {
        let guard = match GLOBAL_PHYS.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !phys::is_initialized() {
            let arena = Arena::new(96 * 1024 * 1024);
            let map = std::boxed::Box::leak(std::boxed::Box::new([MemoryMapEntry::new(
                0x10_0000,
                0x500_0000,
                MemoryKind::Free,
            )]));
            phys::init_with(map, arena.offset());
            GLOBAL_OFFSET.store(arena.offset(), Ordering::SeqCst);
        }
        guard
    }

    /// Arena offset of the shared global allocator.
    pub fn global_offset() -> u64 {
        GLOBAL_OFFSET.load(Ordering::SeqCst)
    }

    /// `(free_pages, free_large_frames)` of the global allocator.
    pub fn global_counters() -> (u64, u64) {
        phys::with_allocator(|a| (a.free_pages(), a.free_large_frames()))
    }
}
