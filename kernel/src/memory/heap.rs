//! Kernel heap.
//!
//! A first-fit free list of variable-sized blocks laid out back to back, in address order, over a
//! window of virtual memory that only ever grows upward. Every block starts with a header
//! carrying a magic value; a mismatch means something wrote over heap metadata and halts the
//! kernel on the spot.

use core::{
    alloc::{GlobalAlloc, Layout},
    marker::PhantomData,
    ptr::{self, NonNull},
};

use x86_64::{structures::paging::PageTableFlags, VirtAddr};

use crate::{
    constants::memory::{
        FRAME_SIZE, HEAP_ALIGN, HEAP_INITIAL_SIZE, HEAP_MAGIC, HEAP_MIN_GROWTH, HEAP_START,
        PAGE_SIZE,
    },
    debug, info,
    sync::IrqMutex,
    warn,
};

#[repr(C, align(16))]
struct BlockHeader {
    size: usize,
    is_free: bool,
    next: Option<NonNull<BlockHeader>>,
    prev: Option<NonNull<BlockHeader>>,
    magic: u64,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const _: () = assert!(HEADER_SIZE % HEAP_ALIGN == 0);

/// Geometry of a heap window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub start: u64,
    pub initial_size: usize,
    pub min_growth: usize,
}

impl HeapConfig {
    pub const KERNEL: Self = Self {
        start: HEAP_START,
        initial_size: HEAP_INITIAL_SIZE,
        min_growth: HEAP_MIN_GROWTH,
    };
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
}

/// Source of fresh pages for the heap window.
pub trait HeapGrowth {
    /// Backs `pages` pages from `start` upward with writable memory. Running out is fatal.
    fn map_pages(&mut self, start: VirtAddr, pages: usize);
}

/// One block as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: usize,
    /// Payload capacity in bytes.
    pub size: usize,
    pub is_free: bool,
}

pub struct FreeListHeap {
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
    start: u64,
    end: u64,
    min_growth: usize,
}

// SAFETY: the heap owns its window; block links never point outside it.
unsafe impl Send for FreeListHeap {}

impl FreeListHeap {
    pub const fn empty() -> Self {
        Self {
            head: None,
            tail: None,
            start: 0,
            end: 0,
            min_growth: HEAP_MIN_GROWTH,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.head.is_some()
    }

    /// Maps the initial window and turns it into a single free block.
    pub fn init(&mut self, config: HeapConfig, growth: &mut impl HeapGrowth) {
        assert!(!self.is_initialized(), "heap initialized twice");
        assert!(
            config.initial_size > HEADER_SIZE,
            "initial heap of {} bytes cannot hold a block",
            config.initial_size
        );

        self.start = config.start;
        self.end = config.start;
        self.min_growth = config.min_growth;
        self.append_pages(config.initial_size.div_ceil(FRAME_SIZE), growth);

        info!(
            "heap at {:#x}, {} KiB initial",
            self.start,
            (self.end - self.start) / 1024
        );
    }

    /// First-fit allocation of `size` bytes, rounded up to 16, growing the window once if
    /// nothing fits. Zero-sized requests get `None`.
    pub fn alloc(&mut self, size: usize, growth: &mut impl HeapGrowth) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        assert!(self.is_initialized(), "heap used before init");
        let aligned = size.checked_next_multiple_of(HEAP_ALIGN)?;

        if let Some(block) = self.take_first_fit(aligned) {
            return Some(payload(block));
        }

        self.expand(aligned, growth);
        match self.take_first_fit(aligned) {
            Some(block) => Some(payload(block)),
            None => panic!("heap grew for {aligned} bytes but still has no block to fit them"),
        }
    }

    /// Releases the block behind `ptr` and merges it with free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = self.header_of(ptr, "free");

        // SAFETY: header validated above; all links point at headers inside the window.
        unsafe {
            let header = block.as_ptr();
            if (*header).is_free {
                warn!("ignoring free of already free block at {:p}", ptr);
                return;
            }
            (*header).is_free = true;

            if let Some(next) = (*header).next {
                check_magic(next, "free");
                if (*next.as_ptr()).is_free {
                    self.absorb_next(block);
                }
            }
            if let Some(prev) = (*header).prev {
                check_magic(prev, "free");
                if (*prev.as_ptr()).is_free {
                    self.absorb_next(prev);
                }
            }
        }
    }

    /// Zeroed allocation of `count * size` bytes; `None` when the product overflows.
    pub fn calloc(
        &mut self,
        count: usize,
        size: usize,
        growth: &mut impl HeapGrowth,
    ) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.alloc(total, growth)?;
        // SAFETY: the block holds at least `total` bytes
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Some(ptr)
    }

    /// Resizes an allocation, moving it only when the current block is too small.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must have come from this heap.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        growth: &mut impl HeapGrowth,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size, growth);
        };
        if new_size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }

        let old_size = self.usable_size(ptr);
        if old_size >= new_size {
            return Some(ptr);
        }

        let moved = self.alloc(new_size, growth)?;
        // SAFETY: distinct live blocks, each at least `old_size` bytes
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size);
            self.free(ptr);
        }
        Some(moved)
    }

    /// Payload capacity of the block behind `ptr`.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.header_of(ptr, "realloc");
        // SAFETY: validated by `header_of`
        unsafe { (*block.as_ptr()).size }
    }

    /// Walks every block in address order, validating each header on the way.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            next: self.head,
            _heap: PhantomData,
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.blocks()
            .fold(HeapStats::default(), |mut stats, block| {
                if block.is_free {
                    stats.free_bytes += block.size;
                    stats.free_blocks += 1;
                } else {
                    stats.used_bytes += block.size;
                    stats.used_blocks += 1;
                }
                stats
            })
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "heap: {} bytes used in {} blocks, {} bytes free in {} blocks, window {:#x}..{:#x}",
            stats.used_bytes,
            stats.used_blocks,
            stats.free_bytes,
            stats.free_blocks,
            self.start,
            self.end
        );
    }

    /// Marks the first free block of at least `aligned` bytes used, splitting off the rest when
    /// it can hold another header plus a minimal payload.
    fn take_first_fit(&mut self, aligned: usize) -> Option<NonNull<BlockHeader>> {
        let mut current = self.head;

        while let Some(block) = current {
            check_magic(block, "alloc");
            // SAFETY: validated header inside the window
            unsafe {
                let header = block.as_ptr();
                if (*header).is_free && (*header).size >= aligned {
                    if (*header).size >= aligned + HEADER_SIZE + HEAP_ALIGN {
                        self.split(block, aligned);
                    }
                    (*header).is_free = false;
                    return Some(block);
                }
                current = (*header).next;
            }
        }

        None
    }

    /// Cuts `block` down to `size` bytes and links the remainder after it as a free block.
    unsafe fn split(&mut self, block: NonNull<BlockHeader>, size: usize) {
        unsafe {
            let header = block.as_ptr();
            let rest = NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(HEADER_SIZE + size))
                .cast::<BlockHeader>();

            rest.as_ptr().write(BlockHeader {
                size: (*header).size - size - HEADER_SIZE,
                is_free: true,
                next: (*header).next,
                prev: Some(block),
                magic: HEAP_MAGIC,
            });

            match (*header).next {
                Some(next) => (*next.as_ptr()).prev = Some(rest),
                None => self.tail = Some(rest),
            }
            (*header).next = Some(rest);
            (*header).size = size;
        }
    }

    /// Folds the block following `block` into it.
    unsafe fn absorb_next(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            let header = block.as_ptr();
            let Some(next) = (*header).next else {
                return;
            };
            let after = (*next.as_ptr()).next;

            (*header).size += HEADER_SIZE + (*next.as_ptr()).size;
            (*header).next = after;
            match after {
                Some(after) => (*after.as_ptr()).prev = Some(block),
                None => self.tail = Some(block),
            }
        }
    }

    /// Grows the window by enough pages for a `min_size` payload, at least the configured
    /// minimum, and merges the new block with a free tail.
    fn expand(&mut self, min_size: usize, growth: &mut impl HeapGrowth) {
        let wanted = min_size.saturating_add(HEADER_SIZE).max(self.min_growth);
        let pages = wanted.div_ceil(FRAME_SIZE);
        let block = self.append_pages(pages, growth);

        // SAFETY: freshly written header, its `prev` is the old tail
        unsafe {
            if let Some(prev) = (*block.as_ptr()).prev {
                check_magic(prev, "expand");
                if (*prev.as_ptr()).is_free {
                    self.absorb_next(prev);
                }
            }
        }

        debug!("heap grew by {} pages, now ends at {:#x}", pages, self.end);
    }

    /// Maps `pages` pages at the high-water mark and links them in as one free tail block.
    fn append_pages(&mut self, pages: usize, growth: &mut impl HeapGrowth) -> NonNull<BlockHeader> {
        let start = self.end;
        growth.map_pages(VirtAddr::new(start), pages);
        self.end += pages as u64 * PAGE_SIZE;

        // SAFETY: the pages were just mapped for us and nothing else lives there
        unsafe {
            let block = NonNull::new_unchecked(start as *mut BlockHeader);
            block.as_ptr().write(BlockHeader {
                size: pages * FRAME_SIZE - HEADER_SIZE,
                is_free: true,
                next: None,
                prev: self.tail,
                magic: HEAP_MAGIC,
            });

            match self.tail {
                Some(tail) => (*tail.as_ptr()).next = Some(block),
                None => self.head = Some(block),
            }
            self.tail = Some(block);
            block
        }
    }

    fn header_of(&self, ptr: NonNull<u8>, operation: &str) -> NonNull<BlockHeader> {
        let addr = ptr.as_ptr() as u64;
        if addr < self.start + HEADER_SIZE as u64 || addr >= self.end {
            panic!("heap corruption detected during {operation}: {ptr:p} is outside the heap");
        }

        // SAFETY: inside the window, so the header slot is mapped
        let block = unsafe { ptr.sub(HEADER_SIZE) }.cast::<BlockHeader>();
        check_magic(block, operation);
        block
    }
}

/// Iterator returned by [`FreeListHeap::blocks`].
pub struct Blocks<'a> {
    next: Option<NonNull<BlockHeader>>,
    _heap: PhantomData<&'a FreeListHeap>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.next?;
        check_magic(block, "walk");
        // SAFETY: validated header, the heap is borrowed for the iterator's lifetime
        let header = unsafe { &*block.as_ptr() };
        self.next = header.next;
        Some(BlockInfo {
            addr: block.as_ptr() as usize,
            size: header.size,
            is_free: header.is_free,
        })
    }
}

fn check_magic(block: NonNull<BlockHeader>, operation: &str) {
    // SAFETY: callers only pass addresses inside the mapped window
    let magic = unsafe { (*block.as_ptr()).magic };
    if magic != HEAP_MAGIC {
        panic!(
            "heap corruption detected during {operation}: bad magic {magic:#x} at {:p}",
            block
        );
    }
}

fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: every block is at least a header long
    unsafe { block.cast::<u8>().add(HEADER_SIZE) }
}

struct LockedState<G> {
    heap: FreeListHeap,
    growth: G,
}

/// A heap and its page source behind one interrupt-safe lock.
pub struct LockedHeap<G> {
    inner: IrqMutex<LockedState<G>>,
}

impl<G: HeapGrowth> LockedHeap<G> {
    pub const fn new(growth: G) -> Self {
        Self {
            inner: IrqMutex::new(LockedState {
                heap: FreeListHeap::empty(),
                growth,
            }),
        }
    }

    pub fn init(&self, config: HeapConfig) {
        let mut guard = self.inner.lock();
        let LockedState { heap, growth } = &mut *guard;
        heap.init(config, growth);
    }

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let LockedState { heap, growth } = &mut *guard;
        heap.alloc(size, growth)
    }

    /// Null is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have come from this heap and not been freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.inner.lock().heap.free(ptr) };
        }
    }

    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let LockedState { heap, growth } = &mut *guard;
        heap.calloc(count, size, growth)
    }

    /// # Safety
    ///
    /// A non-null `ptr` must have come from this heap and not been freed since.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let LockedState { heap, growth } = &mut *guard;
        unsafe { heap.realloc(NonNull::new(ptr), new_size, growth) }
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().heap.stats()
    }

    pub fn log_stats(&self) {
        self.inner.lock().heap.log_stats();
    }
}

unsafe impl<G: HeapGrowth + Send> GlobalAlloc for LockedHeap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            return self.malloc(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // over-allocate, then stash the block pointer just below the aligned payload
        let Some(padded) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(raw) = self.malloc(padded) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr();
        let aligned_addr = (raw as usize + 1).next_multiple_of(layout.align());

        unsafe {
            let aligned = raw.add(aligned_addr - raw as usize);
            aligned.cast::<*mut u8>().sub(1).write(raw);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= HEAP_ALIGN {
            ptr
        } else {
            unsafe { ptr.cast::<*mut u8>().sub(1).read() }
        };
        unsafe { LockedHeap::free(self, raw) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            return unsafe { LockedHeap::realloc(self, ptr, new_size) }
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let moved = unsafe { GlobalAlloc::alloc(self, new_layout) };
        if !moved.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
                GlobalAlloc::dealloc(self, ptr, layout);
            }
        }
        moved
    }
}

/// Grows the kernel heap with frames from the global allocator, mapped into the kernel address
/// space.
pub struct KernelGrowth;

impl HeapGrowth for KernelGrowth {
    fn map_pages(&mut self, start: VirtAddr, pages: usize) {
        super::with_kernel_address_space(|frames, space| {
            for i in 0..pages as u64 {
                let frame = frames
                    .alloc_page()
                    .unwrap_or_else(|| panic!("out of physical memory growing the heap"));
                space.map(
                    frames,
                    start + i * PAGE_SIZE,
                    frame,
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                );
            }
        });
    }
}

pub static KERNEL_HEAP: LockedHeap<KernelGrowth> = LockedHeap::new(KernelGrowth);

/// Sets up the kernel heap. The frame allocator and kernel address space must be up.
pub fn init(config: HeapConfig) {
    KERNEL_HEAP.init(config);
}

/// Zero-sized handle on [`KERNEL_HEAP`], registered as the kernel's global allocator.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { GlobalAlloc::alloc(&KERNEL_HEAP, layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(&KERNEL_HEAP, ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { GlobalAlloc::realloc(&KERNEL_HEAP, ptr, layout, new_size) }
    }
}
