//! Physical page allocator.
//!
//! Tracks 4 KiB and 2 MiB frames inside a 16 GiB window with a two-level
//! bitmap: a brief bitmap holding two bits of state per 2 MiB frame, and a
//! 32-bit pid/flags table with one entry per frame. A frame that hands out
//! 4 KiB sub-pages stores its own allocation bitmap in its first sub-page,
//! which is therefore permanently occupied by metadata.

use x86_64::PhysAddr;

use crate::boot::{MemoryKind, MemoryMapEntry};
use crate::cpu::PAGING_BASE;
use crate::spinlock::SpinLock;

pub const PAGE_SIZE: usize = 4096;
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub const KERNEL_PID: u32 = 0;
const RESERVED_PID: u32 = 0x00ff_ffff;

const BRIEF_BITMAP_PAGES: u64 = 1;
const FRAME_TABLE_PAGES: u64 = 16;

/// Number of 2 MiB frames in the managed window (16 GiB).
pub const MAX_LARGE_FRAME: u64 = 8192;

const FLAG_ALLOCATED: u8 = 0x01;
const FLAG_RESERVED: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum BriefState {
    FullyFree = 0b00,
    FullySingleAllocated = 0b01,
    PartiallyFree = 0b10,
    /// Every 4 KiB sub-page is taken; details live in the frame's own bitmap.
    FullyPageAllocated = 0b11,
}

impl BriefState {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => BriefState::FullyFree,
            0b01 => BriefState::FullySingleAllocated,
            0b10 => BriefState::PartiallyFree,
            _ => BriefState::FullyPageAllocated,
        }
    }
}

/// Self-hosted sub-page bitmap stored at the first 4 KiB of a frame that is
/// `PartiallyFree` or `FullyPageAllocated`. Entry `k` describes sub-page
/// `k + 1`; sub-page 0 holds this structure.
#[repr(C)]
struct FrameBitmap {
    free_pages: u32,
    entries: [u32; 511],
}

fn pack_entry(pid: u32, flags: u8) -> u32 {
    (pid & 0x00ff_ffff) | ((flags as u32) << 24)
}

fn entry_flags(entry: u32) -> u8 {
    (entry >> 24) as u8
}

pub struct PhysAllocator {
    phys_offset: u64,
    brief_bitmap: *mut u8,
    frame_table: *mut u32,
    free_pages: u64,
    free_large_frames: u64,
}

unsafe impl Send for PhysAllocator {}

impl PhysAllocator {
    /// Build the allocator from the boot memory map. Carves the bitmap slab
    /// out of the first suitable free entry (shrinking it in place), marks
    /// the whole window reserved, then frees every aligned 2 MiB frame
    /// covered by a usable entry.
    pub fn from_memory_map(memory_map: &mut [MemoryMapEntry], phys_offset: u64) -> Self {
        log::info!("[physalloc] memory map ({} entries):", memory_map.len());
        for (i, entry) in memory_map.iter().enumerate() {
            log::info!(
                "[physalloc]   - [{}] {:?}: address {:#x}, size {:#x}",
                i,
                entry.kind(),
                entry.address(),
                entry.size()
            );
        }

        // One page of brief bitmap plus sixteen pages of frame table.
        let needed = (BRIEF_BITMAP_PAGES + FRAME_TABLE_PAGES) * PAGE_SIZE as u64;
        let slab = memory_map
            .iter_mut()
            .find(|e| e.address() >= 0x10_0000 && e.is_free() && e.size() >= needed)
            .unwrap_or_else(|| {
                panic!("[physalloc] no free entry large enough for allocation bitmaps")
            });

        let slab_base = slab.address();
        log::info!("[physalloc] allocation bitmaps at {:#x}", slab_base);
        if slab.size() == needed {
            slab.set_kind(MemoryKind::Used);
        } else {
            slab.set_address(slab_base + needed);
            slab.set_size(slab.size() - needed);
        }

        let mut allocator = PhysAllocator {
            phys_offset,
            brief_bitmap: (slab_base + phys_offset) as *mut u8,
            frame_table: (slab_base + PAGE_SIZE as u64 + phys_offset) as *mut u32,
            free_pages: 0,
            free_large_frames: 0,
        };

        // Start from "everything is firmware-reserved" and punch free holes.
        for index in 0..MAX_LARGE_FRAME {
            allocator.set_brief(index, BriefState::FullySingleAllocated);
            allocator.set_frame_entry(index, RESERVED_PID, FLAG_ALLOCATED | FLAG_RESERVED);
        }

        for i in 0..memory_map.len() {
            let entry = memory_map[i];
            if !entry.is_free() || entry.address() < 0x10_0000 {
                continue;
            }
            if entry.size() < LARGE_PAGE_SIZE as u64 {
                continue;
            }

            let mut address = entry.address();
            let mut size = entry.size();

            // Shave the unaligned head and truncate to whole 2 MiB frames.
            let misalignment = address % LARGE_PAGE_SIZE as u64;
            if misalignment != 0 {
                let to_align = LARGE_PAGE_SIZE as u64 - misalignment;
                if size < to_align + LARGE_PAGE_SIZE as u64 {
                    continue;
                }
                size -= to_align;
                size -= size % LARGE_PAGE_SIZE as u64;
                address += to_align;
            }

            let frame_count = size / LARGE_PAGE_SIZE as u64;
            let first_frame = address / LARGE_PAGE_SIZE as u64;
            log::info!(
                "[physalloc] freeing {:#x}..{:#x} ({} large frames)",
                address,
                address + size,
                frame_count
            );
            for j in 0..frame_count {
                if first_frame + j >= MAX_LARGE_FRAME {
                    break;
                }
                allocator.set_brief(first_frame + j, BriefState::FullyFree);
                allocator.set_frame_entry(first_frame + j, 0, 0);
            }

            allocator.free_pages += (size / PAGE_SIZE as u64) - frame_count;
            allocator.free_large_frames += frame_count;
        }

        log::info!(
            "[physalloc] initialized: {} free pages, {} free large frames",
            allocator.free_pages,
            allocator.free_large_frames
        );
        allocator
    }

    /// Allocate a frame for `pid`, 2 MiB when `large`, 4 KiB otherwise.
    /// Running out of physical memory is fatal.
    pub fn allocate(&mut self, pid: u32, large: bool) -> u64 {
        if large {
            self.allocate_large(pid)
        } else {
            self.allocate_small(pid)
        }
    }

    fn allocate_small(&mut self, pid: u32) -> u64 {
        if self.free_pages == 0 {
            panic!("[physalloc] out of memory (no small pages left)");
        }

        // Prefer a frame that already hands out sub-pages; remember the
        // first fully free frame in case none exists. Frame 0 is never used.
        let mut first_free_frame = 0;
        let mut partial_frame = 0;
        let mut found_partial = false;
        for index in 1..MAX_LARGE_FRAME {
            match self.brief(index) {
                BriefState::FullyFree if first_free_frame == 0 => first_free_frame = index,
                BriefState::PartiallyFree => {
                    partial_frame = index;
                    found_partial = true;
                    break;
                }
                _ => {}
            }
        }

        if found_partial {
            let bitmap = unsafe { &mut *self.frame_bitmap(partial_frame) };
            for slot in 0..511 {
                if entry_flags(bitmap.entries[slot]) & FLAG_ALLOCATED == 0 {
                    bitmap.entries[slot] = pack_entry(pid, FLAG_ALLOCATED);
                    bitmap.free_pages -= 1;
                    self.free_pages -= 1;
                    if bitmap.free_pages == 0 {
                        self.set_brief(partial_frame, BriefState::FullyPageAllocated);
                    }
                    return partial_frame * LARGE_PAGE_SIZE as u64
                        + (slot as u64 + 1) * PAGE_SIZE as u64;
                }
            }
            panic!("[physalloc] partially free frame had no free sub-page");
        }

        if first_free_frame == 0 {
            panic!("[physalloc] out of memory (no large frames to split)");
        }

        // Promote a fully free frame: its first sub-page becomes the
        // allocation bitmap, the caller gets the sub-page after it.
        let bitmap = unsafe { &mut *self.frame_bitmap(first_free_frame) };
        bitmap.free_pages = 510;
        bitmap.entries[0] = pack_entry(pid, FLAG_ALLOCATED);
        for slot in 1..511 {
            bitmap.entries[slot] = 0;
        }
        self.set_brief(first_free_frame, BriefState::PartiallyFree);
        self.free_pages -= 1;
        self.free_large_frames -= 1;
        first_free_frame * LARGE_PAGE_SIZE as u64 + PAGE_SIZE as u64
    }

    fn allocate_large(&mut self, pid: u32) -> u64 {
        if self.free_large_frames == 0 {
            panic!("[physalloc] out of memory (no large frames left)");
        }

        for index in 1..MAX_LARGE_FRAME {
            if self.brief(index) == BriefState::FullyFree {
                self.set_brief(index, BriefState::FullySingleAllocated);
                self.set_frame_entry(index, pid, FLAG_ALLOCATED);
                self.free_large_frames -= 1;
                return index * LARGE_PAGE_SIZE as u64;
            }
        }

        panic!("[physalloc] free large frame count out of sync with bitmap");
    }

    /// Return a frame or sub-page to the allocator. Addresses outside the
    /// window, reserved frames and state mismatches are ignored.
    pub fn free(&mut self, address: u64) {
        if address >= MAX_LARGE_FRAME * LARGE_PAGE_SIZE as u64 {
            return;
        }

        let index = address / LARGE_PAGE_SIZE as u64;

        if address % LARGE_PAGE_SIZE as u64 == 0 {
            let flags = entry_flags(self.frame_entry(index));
            if flags & FLAG_ALLOCATED == 0 || flags & FLAG_RESERVED != 0 {
                return;
            }
            if self.brief(index) != BriefState::FullySingleAllocated {
                return;
            }
            self.set_brief(index, BriefState::FullyFree);
            self.set_frame_entry(index, 0, 0);
            self.free_large_frames += 1;
            return;
        }

        let state = self.brief(index);
        if state != BriefState::PartiallyFree && state != BriefState::FullyPageAllocated {
            return;
        }

        let sub_page = (address % LARGE_PAGE_SIZE as u64) / PAGE_SIZE as u64;
        let bitmap = unsafe { &mut *self.frame_bitmap(index) };
        bitmap.entries[sub_page as usize - 1] = 0;
        bitmap.free_pages += 1;
        self.free_pages += 1;

        if bitmap.free_pages == 1 {
            self.set_brief(index, BriefState::PartiallyFree);
        } else if bitmap.free_pages == 511 {
            // Metadata page plus every data sub-page free: the whole frame
            // is reclaimable at large granularity again.
            self.set_brief(index, BriefState::FullyFree);
            self.free_large_frames += 1;
        }
    }

    pub fn free_pages(&self) -> u64 {
        self.free_pages
    }

    pub fn free_large_frames(&self) -> u64 {
        self.free_large_frames
    }

    fn brief(&self, index: u64) -> BriefState {
        self.check_index(index);
        let byte = unsafe { *self.brief_bitmap.add(index as usize / 4) };
        BriefState::from_bits(byte >> ((index % 4) * 2))
    }

    fn set_brief(&mut self, index: u64, state: BriefState) {
        self.check_index(index);
        let offset = (index % 4) * 2;
        unsafe {
            let byte = self.brief_bitmap.add(index as usize / 4);
            *byte &= !(0b11u8 << offset);
            *byte |= (state as u8) << offset;
        }
    }

    fn frame_entry(&self, index: u64) -> u32 {
        self.check_index(index);
        unsafe { *self.frame_table.add(index as usize) }
    }

    fn set_frame_entry(&mut self, index: u64, pid: u32, flags: u8) {
        self.check_index(index);
        unsafe {
            *self.frame_table.add(index as usize) = pack_entry(pid, flags);
        }
    }

    /// Pointer to a frame's self-hosted sub-page bitmap. Raw so callers can
    /// update allocator counters while holding it.
    fn frame_bitmap(&self, index: u64) -> *mut FrameBitmap {
        self.check_index(index);
        (index * LARGE_PAGE_SIZE as u64 + self.phys_offset) as *mut FrameBitmap
    }

    fn check_index(&self, index: u64) {
        if index >= MAX_LARGE_FRAME {
            panic!("[physalloc] frame index {} out of range", index);
        }
    }
}

static PHYS_ALLOCATOR: SpinLock<Option<PhysAllocator>> = SpinLock::new(None);

/// Initialize the global allocator from the boot memory map.
pub fn init(memory_map: &mut [MemoryMapEntry]) {
    let allocator = PhysAllocator::from_memory_map(memory_map, PAGING_BASE);
    *PHYS_ALLOCATOR.lock() = Some(allocator);
}

#[cfg(test)]
pub fn init_with(memory_map: &mut [MemoryMapEntry], phys_offset: u64) {
    let allocator = PhysAllocator::from_memory_map(memory_map, phys_offset);
    *PHYS_ALLOCATOR.lock() = Some(allocator);
}

#[cfg(test)]
pub fn is_initialized() -> bool {
    PHYS_ALLOCATOR.lock().is_some()
}

/// Allocate a page through the global allocator.
pub fn allocate_page(pid: u32, large: bool) -> PhysAddr {
    let mut allocator = PHYS_ALLOCATOR.lock();
    let address = allocator
        .as_mut()
        .expect("physical allocator not initialized")
        .allocate(pid, large);
    PhysAddr::new(address)
}

/// Free a page through the global allocator.
pub fn free_page(address: PhysAddr) {
    let mut allocator = PHYS_ALLOCATOR.lock();
    allocator
        .as_mut()
        .expect("physical allocator not initialized")
        .free(address.as_u64());
}

/// Run `f` against the global allocator. Callers that already hold another
/// subsystem lock use this so the heap -> physical allocator order is kept
/// in one place.
pub fn with_allocator<R>(f: impl FnOnce(&mut PhysAllocator) -> R) -> R {
    let mut allocator = PHYS_ALLOCATOR.lock();
    f(allocator
        .as_mut()
        .expect("physical allocator not initialized"))
}
