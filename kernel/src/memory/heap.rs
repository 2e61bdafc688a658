//! Kernel heap.
//!
//! Variable-size allocation over 2 MiB chunks drawn from the physical
//! allocator. Each chunk starts with a `ChunkInfoBlock` followed by a chain
//! of `AllocationDescriptor`s tiling the rest of the chunk; the chain is the
//! free list. Every returned pointer sits exactly one descriptor past its
//! header, and masking a pointer with the 2 MiB mask recovers the chunk.

use core::alloc::{GlobalAlloc, Layout};

use crate::cpu::PAGING_BASE;
use crate::memory::phys::{self, PhysAllocator, KERNEL_PID, LARGE_PAGE_SIZE};
use crate::spinlock::SpinLock;

const KIND_FREE: usize = 0;
const KIND_ALLOCATED: usize = 1;

#[repr(C)]
struct AllocationDescriptor {
    previous: *mut AllocationDescriptor,
    next: *mut AllocationDescriptor,
    kind: usize,
    size: usize,
}

#[repr(C)]
struct ChunkInfoBlock {
    previous: *mut ChunkInfoBlock,
    next: *mut ChunkInfoBlock,
    first_descriptor: *mut AllocationDescriptor,
    _reserved: usize,
}

const DESCRIPTOR_SIZE: usize = core::mem::size_of::<AllocationDescriptor>();
const INFO_BLOCK_SIZE: usize = core::mem::size_of::<ChunkInfoBlock>();

/// Largest single allocation: a chunk minus its info block and one header.
pub const FULL_CHUNK_SPAN: usize = LARGE_PAGE_SIZE - INFO_BLOCK_SIZE - DESCRIPTOR_SIZE;

/// Sizes round up to the descriptor size so headers stay aligned.
const ALLOCATION_ALIGNMENT: usize = DESCRIPTOR_SIZE;

pub struct ChunkHeap {
    phys_offset: u64,
    first_chunk: *mut ChunkInfoBlock,
    last_chunk: *mut ChunkInfoBlock,
    chunk_count: usize,
}

unsafe impl Send for ChunkHeap {}

impl ChunkHeap {
    pub const fn new(phys_offset: u64) -> Self {
        Self {
            phys_offset,
            first_chunk: core::ptr::null_mut(),
            last_chunk: core::ptr::null_mut(),
            chunk_count: 0,
        }
    }

    /// First-fit allocation across chunks in insertion order. Appends a new
    /// chunk when nothing fits; a request that cannot fit a chunk is fatal.
    pub fn allocate(&mut self, phys: &mut PhysAllocator, size: usize) -> *mut u8 {
        let adjusted = size
            .max(1)
            .div_ceil(ALLOCATION_ALIGNMENT)
            * ALLOCATION_ALIGNMENT;
        if adjusted > FULL_CHUNK_SPAN {
            panic!("[heap] allocation of {:#x} bytes exceeds chunk span", size);
        }

        let mut chunk = self.first_chunk;
        while !chunk.is_null() {
            let address = Self::find_in_chunk(chunk, adjusted);
            if !address.is_null() {
                return address;
            }
            chunk = unsafe { (*chunk).next };
        }

        let chunk = self.append_chunk(phys);
        let address = Self::find_in_chunk(chunk, adjusted);
        if address.is_null() {
            panic!("[heap] allocation failed in a fresh chunk");
        }
        address
    }

    /// Free a previously returned pointer, coalescing with free neighbors.
    /// A chunk whose whole interior becomes one free span is returned to
    /// the physical allocator.
    pub fn free(&mut self, phys: &mut PhysAllocator, address: *mut u8) {
        let chunk = (address as u64 & !(LARGE_PAGE_SIZE as u64 - 1)) as *mut ChunkInfoBlock;
        let mut descriptor = unsafe { (address.sub(DESCRIPTOR_SIZE)) as *mut AllocationDescriptor };

        unsafe {
            (*descriptor).kind = KIND_FREE;

            let previous = (*descriptor).previous;
            let next = (*descriptor).next;
            if !previous.is_null() && (*previous).kind == KIND_FREE {
                (*previous).size += (*descriptor).size + DESCRIPTOR_SIZE;
                (*previous).next = next;
                if !next.is_null() {
                    (*next).previous = previous;
                }
                descriptor = previous;
            }

            let next = (*descriptor).next;
            if !next.is_null() && (*next).kind == KIND_FREE {
                (*descriptor).size += (*next).size + DESCRIPTOR_SIZE;
                (*descriptor).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).previous = descriptor;
                }
            }

            let first = (*chunk).first_descriptor;
            if (*first).kind == KIND_FREE && (*first).size == FULL_CHUNK_SPAN {
                self.remove_chunk(phys, chunk);
            }
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Draw a 2 MiB frame, lay out the info block and one chunk-spanning
    /// free descriptor, and link the chunk at the back of the list.
    pub fn append_chunk(&mut self, phys: &mut PhysAllocator) -> *mut ChunkInfoBlock {
        let frame = phys.allocate(KERNEL_PID, true);
        let chunk = (frame + self.phys_offset) as *mut ChunkInfoBlock;

        unsafe {
            let descriptor = (chunk as *mut u8).add(INFO_BLOCK_SIZE) as *mut AllocationDescriptor;
            (*descriptor).previous = core::ptr::null_mut();
            (*descriptor).next = core::ptr::null_mut();
            (*descriptor).kind = KIND_FREE;
            (*descriptor).size = FULL_CHUNK_SPAN;
            (*chunk).first_descriptor = descriptor;

            if self.chunk_count == 0 {
                (*chunk).previous = core::ptr::null_mut();
                (*chunk).next = core::ptr::null_mut();
                self.first_chunk = chunk;
                self.last_chunk = chunk;
            } else {
                (*chunk).previous = self.last_chunk;
                (*chunk).next = core::ptr::null_mut();
                (*self.last_chunk).next = chunk;
                self.last_chunk = chunk;
            }
        }
        self.chunk_count += 1;

        log::debug!("[heap] appended chunk at {:#x}", chunk as u64);
        chunk
    }

    fn remove_chunk(&mut self, phys: &mut PhysAllocator, chunk: *mut ChunkInfoBlock) {
        unsafe {
            if self.chunk_count == 1 {
                self.first_chunk = core::ptr::null_mut();
                self.last_chunk = core::ptr::null_mut();
            } else {
                if !(*chunk).previous.is_null() {
                    (*(*chunk).previous).next = (*chunk).next;
                } else {
                    self.first_chunk = (*chunk).next;
                }
                if !(*chunk).next.is_null() {
                    (*(*chunk).next).previous = (*chunk).previous;
                } else {
                    self.last_chunk = (*chunk).previous;
                }
            }
        }

        phys.free(chunk as u64 - self.phys_offset);
        self.chunk_count -= 1;

        log::debug!("[heap] released chunk at {:#x}", chunk as u64);
    }

    fn find_in_chunk(chunk: *mut ChunkInfoBlock, size: usize) -> *mut u8 {
        unsafe {
            let mut current = (*chunk).first_descriptor;
            while !current.is_null() {
                if (*current).kind == KIND_FREE && (*current).size >= size {
                    let remainder = (*current).size - size;
                    if remainder >= DESCRIPTOR_SIZE + ALLOCATION_ALIGNMENT {
                        // Split: the tail becomes a new free descriptor.
                        let split = (current as *mut u8).add(DESCRIPTOR_SIZE + size)
                            as *mut AllocationDescriptor;
                        (*split).size = remainder - DESCRIPTOR_SIZE;
                        (*split).kind = KIND_FREE;
                        (*split).previous = current;
                        (*split).next = (*current).next;
                        if !(*current).next.is_null() {
                            (*(*current).next).previous = split;
                        }
                        (*current).size = size;
                        (*current).next = split;
                    }

                    (*current).kind = KIND_ALLOCATED;
                    return (current as *mut u8).add(DESCRIPTOR_SIZE);
                }
                current = (*current).next;
            }
        }
        core::ptr::null_mut()
    }

    #[cfg(test)]
    fn descriptors(&self) -> alloc::vec::Vec<(usize, usize)> {
        let mut list = alloc::vec::Vec::new();
        let mut chunk = self.first_chunk;
        while !chunk.is_null() {
            unsafe {
                let mut current = (*chunk).first_descriptor;
                while !current.is_null() {
                    list.push(((*current).kind, (*current).size));
                    current = (*current).next;
                }
                chunk = (*chunk).next;
            }
        }
        list
    }
}

static HEAP: SpinLock<Option<ChunkHeap>> = SpinLock::new(None);

/// Seed the global heap with its first chunk.
pub fn init() {
    let mut heap = ChunkHeap::new(PAGING_BASE);
    phys::with_allocator(|phys| {
        heap.append_chunk(phys);
    });
    *HEAP.lock() = Some(heap);
    log::info!("[heap] initialized with one 2 MiB chunk");
}

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        assert!(
            layout.align() <= ALLOCATION_ALIGNMENT,
            "[heap] unsupported alignment {}",
            layout.align()
        );
        let mut heap = HEAP.lock();
        let heap = heap.as_mut().expect("heap not initialized");
        phys::with_allocator(|phys| heap.allocate(phys, layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut heap = HEAP.lock();
        let heap = heap.as_mut().expect("heap not initialized");
        phys::with_allocator(|phys| heap.free(phys, ptr));
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryKind, MemoryMapEntry};
    use crate::memory::test_arena::Arena;

    fn test_heap(arena: &Arena) -> (PhysAllocator, ChunkHeap) {
        let mut map = [MemoryMapEntry::new(0x10_0000, 0xE0_0000, MemoryKind::Free)];
        let mut phys = PhysAllocator::from_memory_map(&mut map, arena.offset());
        let mut heap = ChunkHeap::new(arena.offset());
        heap.append_chunk(&mut phys);
        (phys, heap)
    }

    #[test]
    fn scenario_adjacent_allocations_and_chunk_reclaim() {
        let arena = Arena::new(16 * 1024 * 1024);
        let (mut phys, mut heap) = test_heap(&arena);
        let large_before = phys.free_large_frames();

        let first = heap.allocate(&mut phys, 64);
        let second = heap.allocate(&mut phys, 64);
        // 64 bytes of payload plus one 32-byte descriptor header apart.
        assert_eq!(second as usize - first as usize, 96);

        heap.free(&mut phys, first);
        heap.free(&mut phys, second);
        assert_eq!(heap.chunk_count(), 0);
        assert_eq!(phys.free_large_frames(), large_before + 1);
    }

    #[test]
    fn coalescing_restores_original_descriptor() {
        let arena = Arena::new(16 * 1024 * 1024);
        let (mut phys, mut heap) = test_heap(&arena);

        let keeper = heap.allocate(&mut phys, 64);
        let a = heap.allocate(&mut phys, 64);
        let b = heap.allocate(&mut phys, 64);

        // Freeing both halves of the split merges them back with the tail.
        heap.free(&mut phys, a);
        heap.free(&mut phys, b);
        assert_eq!(
            heap.descriptors(),
            alloc::vec![
                (KIND_ALLOCATED, 64),
                (KIND_FREE, FULL_CHUNK_SPAN - 64 - DESCRIPTOR_SIZE),
            ]
        );

        heap.free(&mut phys, keeper);
        assert_eq!(heap.chunk_count(), 0);
    }

    #[test]
    fn mixed_sizes_do_not_corrupt_neighbors() {
        let arena = Arena::new(32 * 1024 * 1024);
        let (mut phys, mut heap) = test_heap(&arena);

        // Deterministic pseudo-random size sequence.
        let mut state: u64 = 0x243F_6A88;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as usize
        };

        let mut live: alloc::vec::Vec<(*mut u8, usize, u8)> = alloc::vec::Vec::new();
        for round in 0..200 {
            let size = 8 + next() % 6000;
            let fill = (round % 251) as u8;
            let ptr = heap.allocate(&mut phys, size);
            unsafe { core::ptr::write_bytes(ptr, fill, size) };
            live.push((ptr, size, fill));

            if round % 3 == 0 {
                let victim = next() % live.len();
                let (ptr, size, fill) = live.swap_remove(victim);
                let slice = unsafe { core::slice::from_raw_parts(ptr, size) };
                assert!(slice.iter().all(|&b| b == fill));
                heap.free(&mut phys, ptr);
            }
        }

        for (ptr, size, fill) in live.drain(..) {
            let slice = unsafe { core::slice::from_raw_parts(ptr, size) };
            assert!(slice.iter().all(|&b| b == fill));
            heap.free(&mut phys, ptr);
        }

        assert_eq!(heap.chunk_count(), 0);
    }

    #[test]
    fn allocation_spans_multiple_chunks() {
        let arena = Arena::new(32 * 1024 * 1024);
        let (mut phys, mut heap) = test_heap(&arena);

        let big = heap.allocate(&mut phys, FULL_CHUNK_SPAN);
        assert_eq!(heap.chunk_count(), 1);
        // The seeded chunk is exhausted, so this forces a second one.
        let small = heap.allocate(&mut phys, 64);
        assert_eq!(heap.chunk_count(), 2);

        heap.free(&mut phys, big);
        assert_eq!(heap.chunk_count(), 1);
        heap.free(&mut phys, small);
        assert_eq!(heap.chunk_count(), 0);
    }
}
