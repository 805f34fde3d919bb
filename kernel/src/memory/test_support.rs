//! Host stand-ins for physical memory, the MMU and heap growth.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use super::{
    frame_allocator::BitmapFrameAllocator, heap::HeapGrowth, mmu::Mmu, DirectMap, MemoryRegion,
};
use crate::constants::memory::FRAME_SIZE;

/// A page-aligned host buffer posing as the physical range `[base, base + len)`.
pub(crate) struct PhysArena {
    base: u64,
    len: usize,
    memory: *mut u8,
}

impl PhysArena {
    pub(crate) fn new(base: u64, len: usize) -> Self {
        let layout = Self::layout(len);
        let memory = unsafe { alloc_zeroed(layout) };
        assert!(!memory.is_null(), "host allocation failed");
        Self { base, len, memory }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, FRAME_SIZE).unwrap()
    }

    pub(crate) fn direct_map(&self) -> DirectMap {
        DirectMap::new(self.memory as u64 - self.base)
    }

    /// The whole arena as a single usable region.
    pub(crate) fn usable_region(&self) -> MemoryRegion {
        MemoryRegion::usable(self.base, self.len as u64)
    }

    pub(crate) fn frame_allocator(&self) -> BitmapFrameAllocator {
        unsafe { BitmapFrameAllocator::init(&[self.usable_region()], self.direct_map()) }.unwrap()
    }
}

impl Drop for PhysArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.memory, Self::layout(self.len)) };
    }
}

/// MMU double that remembers every root switch and invalidation.
pub(crate) struct RecordingMmu {
    pub(crate) active: PhysFrame<Size4KiB>,
    pub(crate) switches: Vec<PhysFrame<Size4KiB>>,
    pub(crate) invalidated: Vec<VirtAddr>,
}

impl RecordingMmu {
    pub(crate) fn new(active: PhysAddr) -> Self {
        Self {
            active: PhysFrame::containing_address(active),
            switches: Vec::new(),
            invalidated: Vec::new(),
        }
    }
}

impl Mmu for RecordingMmu {
    fn active_root(&self) -> PhysFrame {
        self.active
    }

    unsafe fn switch_root(&mut self, root: PhysFrame) {
        self.active = root;
        self.switches.push(root);
    }

    fn invalidate(&mut self, vaddr: VirtAddr) {
        self.invalidated.push(vaddr);
    }
}

/// Heap growth backed by one large host buffer; pages must be requested contiguously.
pub(crate) struct HostGrowth {
    memory: *mut u8,
    capacity: usize,
    pub(crate) mapped_pages: usize,
}

unsafe impl Send for HostGrowth {}

impl HostGrowth {
    pub(crate) fn new(capacity: usize) -> Self {
        let memory = unsafe { alloc_zeroed(Self::layout(capacity)) };
        assert!(!memory.is_null(), "host allocation failed");
        Self {
            memory,
            capacity,
            mapped_pages: 0,
        }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, FRAME_SIZE).unwrap()
    }

    pub(crate) fn start(&self) -> u64 {
        self.memory as u64
    }
}

impl HeapGrowth for HostGrowth {
    fn map_pages(&mut self, start: VirtAddr, pages: usize) {
        let expected = self.start() + (self.mapped_pages * FRAME_SIZE) as u64;
        assert_eq!(start.as_u64(), expected, "heap grew non-contiguously");
        assert!(
            (self.mapped_pages + pages) * FRAME_SIZE <= self.capacity,
            "host heap arena exhausted"
        );
        self.mapped_pages += pages;
    }
}

impl Drop for HostGrowth {
    fn drop(&mut self) {
        unsafe { dealloc(self.memory, Self::layout(self.capacity)) };
    }
}
