//! Physical frame allocator.
//!
//! One bit per 4 KiB frame from physical address zero up to the highest address in the memory
//! map: 1 = owned (allocated or never usable), 0 = free. The bitmap itself lives in the tail of
//! the first usable region large enough to hold it, and its frames stay owned forever.

use core::{ops::Range, slice};

use arrayvec::ArrayVec;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{DirectMap, MemoryError, MemoryRegion};
use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_MEMORY_REGIONS},
    debug, info, warn,
};

pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    total_frames: usize,
    bitmap_start: PhysAddr,
    bitmap_frames: usize,
    /// Frame indices released at init; nothing outside them is ever returned to the pool.
    usable: ArrayVec<Range<usize>, MAX_MEMORY_REGIONS>,
    free_bytes: u64,
    used_bytes: u64,
    total_bytes: u64,
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// Every frame starts owned; only whole frames inside usable regions are released, minus the
    /// frames the bitmap occupies.
    ///
    /// # Safety
    ///
    /// `direct_map` must alias every physical address in `regions`, and usable regions must not
    /// be in use by anything else: the bitmap is written into one of them.
    pub unsafe fn init(
        regions: &[MemoryRegion],
        direct_map: DirectMap,
    ) -> Result<Self, MemoryError> {
        // top of physmem, reserved regions included
        let highest = regions.iter().map(MemoryRegion::end).max().unwrap_or(0);
        let total_frames = (highest as usize).div_ceil(FRAME_SIZE);
        if total_frames == 0 {
            return Err(MemoryError::EmptyMemoryMap);
        }

        let words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_bytes = words * size_of::<u64>();
        let bitmap_frames = bitmap_bytes.div_ceil(FRAME_SIZE);

        let bitmap_start = regions
            .iter()
            .filter(|region| region.is_usable())
            .find_map(|region| bitmap_slot(region, bitmap_frames))
            .ok_or(MemoryError::NoBitmapRegion {
                needed: bitmap_bytes,
            })?;

        // SAFETY: the slot is whole frames inside a usable region, reachable through the direct
        // map, and nothing else owns it.
        let bitmap = unsafe {
            slice::from_raw_parts_mut(direct_map.as_mut_ptr::<u64>(bitmap_start), words)
        };
        bitmap.fill(FULL_BITMAP_ENTRY);

        let total_bytes = regions
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| region.length)
            .sum();

        let mut allocator = Self {
            bitmap,
            total_frames,
            bitmap_start,
            bitmap_frames,
            usable: ArrayVec::new(),
            free_bytes: 0,
            used_bytes: 0,
            total_bytes,
        };

        for region in regions.iter().filter(|region| region.is_usable()) {
            let first = (region.base as usize).div_ceil(FRAME_SIZE);
            let last = region.end() as usize / FRAME_SIZE;
            if first >= last {
                continue;
            }
            if allocator.usable.try_push(first..last).is_err() {
                warn!(
                    "more than {} usable regions, {:#x}..{:#x} left unused",
                    MAX_MEMORY_REGIONS,
                    region.base,
                    region.end()
                );
                continue;
            }
            for frame_index in first..last {
                if !allocator.is_bitmap_frame(frame_index) && allocator.is_bit_set(frame_index) {
                    allocator.clear_bit(frame_index);
                    allocator.free_bytes += FRAME_SIZE as u64;
                }
            }
        }
        allocator.used_bytes = allocator.total_bytes.saturating_sub(allocator.free_bytes);

        debug!(
            "frame bitmap: {} bytes at {:?}, {} frames tracked",
            bitmap_bytes, bitmap_start, total_frames
        );
        info!(
            "physical memory: {} KiB usable, {} KiB free",
            allocator.total_bytes / 1024,
            allocator.free_bytes / 1024
        );

        Ok(allocator)
    }

    /// Lowest-addressed free frame, now owned by the caller.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        let (word_index, word) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != FULL_BITMAP_ENTRY)?;

        let frame_index = word_index * BITMAP_ENTRY_SIZE + (!*word).trailing_zeros() as usize;
        if frame_index >= self.total_frames {
            return None;
        }

        self.take(frame_index);
        Some(frame_address(frame_index))
    }

    /// Lowest-addressed run of `count` contiguous free frames.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }

        let mut start = 0;
        while start + count <= self.total_frames {
            match (start..start + count).find(|&index| self.is_bit_set(index)) {
                // no window containing an owned frame can fit, restart past it
                Some(owned) => start = owned + 1,
                None => {
                    for frame_index in start..start + count {
                        self.take(frame_index);
                    }
                    return Some(frame_address(start));
                }
            }
        }

        None
    }

    /// Returns a frame to the pool.
    ///
    /// Only frames that were usable at init can come back; freeing a free, untracked, reserved
    /// or bitmap frame does nothing.
    pub fn free_page(&mut self, addr: PhysAddr) {
        self.release(addr.as_u64() as usize / FRAME_SIZE);
    }

    /// [`free_page`](Self::free_page) for `count` frames from `addr`, stopping at the end of the
    /// tracked range.
    pub fn free_pages(&mut self, addr: PhysAddr, count: usize) {
        let first = addr.as_u64() as usize / FRAME_SIZE;
        let end = first.saturating_add(count).min(self.total_frames);
        for frame_index in first..end {
            self.release(frame_index);
        }
    }

    /// Whether the frame holding `addr` is owned. Frames past the tracked range count as owned.
    pub fn is_frame_used(&self, addr: PhysAddr) -> bool {
        let frame_index = addr.as_u64() as usize / FRAME_SIZE;
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Physical range holding the bitmap.
    pub fn bitmap_range(&self) -> (PhysAddr, PhysAddr) {
        (
            self.bitmap_start,
            self.bitmap_start + (self.bitmap_frames * FRAME_SIZE) as u64,
        )
    }

    fn release(&mut self, frame_index: usize) {
        if frame_index >= self.total_frames || !self.is_bit_set(frame_index) {
            return;
        }
        if self.is_bitmap_frame(frame_index) {
            warn!(
                "refusing to free frame bitmap storage at {:?}",
                frame_address(frame_index)
            );
            return;
        }
        if !self.is_usable_frame(frame_index) {
            warn!(
                "refusing to free reserved frame {:?}",
                frame_address(frame_index)
            );
            return;
        }

        self.clear_bit(frame_index);
        self.free_bytes += FRAME_SIZE as u64;
        self.used_bytes -= FRAME_SIZE as u64;
    }

    fn take(&mut self, frame_index: usize) {
        self.set_bit(frame_index);
        self.free_bytes -= FRAME_SIZE as u64;
        self.used_bytes += FRAME_SIZE as u64;
    }

    fn is_bitmap_frame(&self, frame_index: usize) -> bool {
        let first = self.bitmap_start.as_u64() as usize / FRAME_SIZE;
        (first..first + self.bitmap_frames).contains(&frame_index)
    }

    fn is_usable_frame(&self, frame_index: usize) -> bool {
        self.usable.iter().any(|range| range.contains(&frame_index))
    }

    fn set_bit(&mut self, frame_index: usize) {
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] |= 1 << (frame_index % BITMAP_ENTRY_SIZE);
    }

    fn clear_bit(&mut self, frame_index: usize) {
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] &= !(1 << (frame_index % BITMAP_ENTRY_SIZE));
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & (1 << (frame_index % BITMAP_ENTRY_SIZE)) != 0
    }
}

/// Start of the last `frames` whole frames of `region`, if it has that many.
fn bitmap_slot(region: &MemoryRegion, frames: usize) -> Option<PhysAddr> {
    let first = region.base.div_ceil(FRAME_SIZE as u64);
    let last = region.end() / FRAME_SIZE as u64;
    let available = last.checked_sub(first)?;
    if available < frames as u64 {
        return None;
    }
    Some(PhysAddr::new((last - frames as u64) * FRAME_SIZE as u64))
}

fn frame_address(frame_index: usize) -> PhysAddr {
    PhysAddr::new((frame_index * FRAME_SIZE) as u64)
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_page().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_page(frame.start_address());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::memory::test_support::PhysArena;

    const MIB: u64 = 1024 * 1024;

    fn assert_accounting(frames: &BitmapFrameAllocator) {
        assert_eq!(
            frames.free_bytes() + frames.used_bytes(),
            frames.total_bytes()
        );
    }

    #[test]
    fn first_allocation_is_lowest_usable_frame() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        assert_eq!(frames.alloc_page(), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(frames.alloc_page(), Some(PhysAddr::new(0x10_1000)));
        assert_accounting(&frames);
    }

    #[test]
    fn bitmap_sits_at_region_tail_and_stays_owned() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        // 512 frames need 64 bytes of bitmap, one frame
        let (start, end) = frames.bitmap_range();
        assert_eq!(start, PhysAddr::new(0x1F_F000));
        assert_eq!(end, PhysAddr::new(0x20_0000));
        assert!(frames.is_frame_used(start));

        frames.free_page(start);
        assert!(frames.is_frame_used(start));
        assert_eq!(frames.free_bytes(), 255 * FRAME_SIZE as u64);
        assert_accounting(&frames);
    }

    #[test]
    fn frames_below_first_region_stay_owned() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let frames = arena.frame_allocator();

        assert!(frames.is_frame_used(PhysAddr::new(0)));
        assert!(frames.is_frame_used(PhysAddr::new(0xF_F000)));
        assert!(!frames.is_frame_used(PhysAddr::new(0x10_0000)));
        assert!(frames.is_frame_used(PhysAddr::new(0x40_0000)));
    }

    #[test]
    fn allocations_are_unique_until_exhaustion() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let mut seen = BTreeSet::new();
        while let Some(addr) = frames.alloc_page() {
            assert_eq!(addr.as_u64() % FRAME_SIZE as u64, 0);
            assert!(seen.insert(addr), "frame {addr:?} handed out twice");
        }

        assert_eq!(seen.len(), 255);
        assert_eq!(frames.free_bytes(), 0);
        assert_eq!(frames.alloc_pages(1), None);
        assert_accounting(&frames);
    }

    #[test]
    fn freed_frame_is_reused_first() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let a = frames.alloc_page().unwrap();
        let b = frames.alloc_page().unwrap();
        let _c = frames.alloc_page().unwrap();

        frames.free_page(b);
        frames.free_page(a);
        assert_eq!(frames.alloc_page(), Some(a));
        assert_eq!(frames.alloc_page(), Some(b));
        assert_accounting(&frames);
    }

    #[test]
    fn free_is_idempotent_and_ignores_untracked_frames() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let a = frames.alloc_page().unwrap();
        let before = frames.free_bytes();

        frames.free_page(a);
        frames.free_page(a);
        assert_eq!(frames.free_bytes(), before + FRAME_SIZE as u64);

        frames.free_page(PhysAddr::new(0x4000_0000));
        assert_eq!(frames.free_bytes(), before + FRAME_SIZE as u64);
        assert_accounting(&frames);
    }

    #[test]
    fn freeing_frames_that_were_never_usable_changes_nothing() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let regions = [
            MemoryRegion::usable(0x10_0800, 0x7_F800),
            MemoryRegion::reserved(0x18_0000, 0x4_0000),
            MemoryRegion::usable(0x1C_0000, 0x4_0000),
        ];
        let mut frames = unsafe { BitmapFrameAllocator::init(&regions, arena.direct_map()) }.unwrap();
        let free_before = frames.free_bytes();

        // below the first region, the partial edge frame, inside the reserved hole
        for addr in [0x0, 0x1000, 0x10_0000, 0x18_0000, 0x1B_F000] {
            frames.free_page(PhysAddr::new(addr));
            assert!(frames.is_frame_used(PhysAddr::new(addr)));
            assert_eq!(frames.free_bytes(), free_before);
            assert_accounting(&frames);
        }
        frames.free_pages(PhysAddr::new(0x17_E000), 4);
        assert_eq!(frames.free_bytes(), free_before);
        assert_accounting(&frames);

        // still hands out only usable memory afterwards
        while let Some(addr) = frames.alloc_page() {
            assert!(addr.as_u64() >= 0x10_1000);
            assert!(!(0x18_0000..0x1C_0000).contains(&addr.as_u64()));
        }
        assert_accounting(&frames);
    }

    #[test]
    fn free_pages_stops_at_the_tracked_range() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();
        let free_before = frames.free_bytes();

        frames.free_pages(PhysAddr::new(0x000F_FFFF_FFFF_F000), 2);
        frames.free_pages(PhysAddr::new(0x1F_E000), usize::MAX);
        assert_eq!(frames.free_bytes(), free_before);

        let first = frames.alloc_page().unwrap();
        let run = frames.alloc_pages(254).unwrap();
        assert_eq!(run, PhysAddr::new(0x10_1000));
        frames.free_pages(first, usize::MAX);
        assert_eq!(frames.free_bytes(), 255 * FRAME_SIZE as u64);
        assert_accounting(&frames);
    }

    #[test]
    fn contiguous_run_skips_past_owned_frames() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let first: Vec<_> = (0..6).map(|_| frames.alloc_page().unwrap()).collect();
        // leave holes of one and two frames between owned ones
        frames.free_page(first[1]);
        frames.free_page(first[3]);
        frames.free_page(first[4]);

        assert_eq!(frames.alloc_pages(2), Some(first[3]));
        assert_eq!(frames.alloc_pages(3), Some(PhysAddr::new(0x10_6000)));
        assert!(frames.is_frame_used(PhysAddr::new(0x10_8000)));
        assert!(!frames.is_frame_used(first[1]));
        assert_accounting(&frames);
    }

    #[test]
    fn run_larger_than_memory_fails() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        assert_eq!(frames.alloc_pages(0), None);
        assert_eq!(frames.alloc_pages(256), None);
        assert_eq!(frames.alloc_pages(255), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(frames.free_bytes(), 0);
    }

    #[test]
    fn free_pages_releases_a_run() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let run = frames.alloc_pages(8).unwrap();
        frames.free_pages(run, 8);
        assert_eq!(frames.free_bytes(), 255 * FRAME_SIZE as u64);
        assert_eq!(frames.alloc_pages(8), Some(run));
    }

    #[test]
    fn reserved_regions_and_partial_frames_are_never_handed_out() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let regions = [
            MemoryRegion::usable(0x10_0800, 0x7_F800),
            MemoryRegion::reserved(0x18_0000, 0x4_0000),
            MemoryRegion::usable(0x1C_0000, 0x4_0000),
        ];
        let mut frames = unsafe { BitmapFrameAllocator::init(&regions, arena.direct_map()) }.unwrap();

        // partial first frame is skipped
        assert_eq!(frames.alloc_page(), Some(PhysAddr::new(0x10_1000)));
        assert!(frames.is_frame_used(PhysAddr::new(0x18_0000)));
        assert!(frames.is_frame_used(PhysAddr::new(0x1B_F000)));

        let mut count = 1;
        while let Some(addr) = frames.alloc_page() {
            assert!(!(0x18_0000..0x1C_0000).contains(&addr.as_u64()));
            count += 1;
        }
        // 127 whole frames in the first region minus the bitmap frame, 64 in the last
        assert_eq!(count, 126 + 64);
        assert_accounting(&frames);
    }

    #[test]
    fn missing_bitmap_room_is_reported() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let regions = [
            MemoryRegion::usable(0x10_0000, 0x800),
            MemoryRegion::reserved(0x20_0000, 0x1_0000_0000),
        ];

        let result = unsafe { BitmapFrameAllocator::init(&regions, arena.direct_map()) };
        assert!(matches!(result, Err(MemoryError::NoBitmapRegion { .. })));
    }

    #[test]
    fn empty_memory_map_is_reported() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let result = unsafe { BitmapFrameAllocator::init(&[], arena.direct_map()) };
        assert!(matches!(result, Err(MemoryError::EmptyMemoryMap)));
    }

    #[test]
    fn frame_allocator_trait_hands_out_frames() {
        let arena = PhysArena::new(MIB, MIB as usize);
        let mut frames = arena.frame_allocator();

        let frame = frames.allocate_frame().unwrap();
        assert_eq!(frame.start_address(), PhysAddr::new(0x10_0000));
        unsafe { frames.deallocate_frame(frame) };
        assert!(!frames.is_frame_used(frame.start_address()));
    }
}
