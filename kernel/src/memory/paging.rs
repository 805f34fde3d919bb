//! Four-level page tables.
//!
//! Tables are reached through the direct map, so any frame of the hierarchy can be edited
//! without mapping it first. Mapping builds missing intermediate tables on demand; unmapping
//! only clears the leaf and never reclaims tables.

use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, PageOffset, PageSize, PageTable,
        PageTableFlags, PageTableIndex, PhysFrame, Size1GiB, Size2MiB, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use super::{mmu::Mmu, DirectMap, MemoryError};
use crate::{
    constants::memory::{MMIO_WINDOW_START, PAGE_SIZE},
    debug, trace,
};

/// First top-level slot of the kernel half; slots from here up are shared by every hierarchy.
pub const KERNEL_HALF_START: usize = 256;

/// Leaf flags for device memory: writable, uncached, write-through, never executable.
pub const MMIO: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::NO_CACHE)
    .union(PageTableFlags::WRITE_THROUGH)
    .union(PageTableFlags::NO_EXECUTE);

/// A canonical virtual address split into its table indices and page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIndices {
    pub p4: PageTableIndex,
    pub p3: PageTableIndex,
    pub p2: PageTableIndex,
    pub p1: PageTableIndex,
    pub offset: PageOffset,
}

impl From<VirtAddr> for TableIndices {
    fn from(addr: VirtAddr) -> Self {
        Self {
            p4: addr.p4_index(),
            p3: addr.p3_index(),
            p2: addr.p2_index(),
            p1: addr.p1_index(),
            offset: addr.page_offset(),
        }
    }
}

/// One page table hierarchy and the MMU it is installed on.
pub struct AddressSpace<M: Mmu> {
    root: PhysFrame,
    direct_map: DirectMap,
    mmu: M,
    mmio_next: u64,
}

impl<M: Mmu> AddressSpace<M> {
    /// Creates the kernel's own hierarchy and switches to it.
    ///
    /// The new root starts empty except for the kernel half, which is copied from whatever
    /// hierarchy the bootloader left active, so the kernel image, the direct map and the
    /// current stack stay mapped across the switch.
    ///
    /// # Safety
    ///
    /// `direct_map` must alias all physical memory, including the active hierarchy.
    pub unsafe fn init_kernel(
        frames: &mut impl FrameAllocator<Size4KiB>,
        direct_map: DirectMap,
        mut mmu: M,
    ) -> Result<Self, MemoryError> {
        let root = frames.allocate_frame().ok_or(MemoryError::OutOfFrames)?;
        let active = mmu.active_root();

        // SAFETY: both frames are page tables reachable through the direct map, and the new
        // root was just handed to us so nothing else aliases it.
        unsafe {
            let table = &mut *direct_map.as_mut_ptr::<PageTable>(root.start_address());
            let boot = &*direct_map.as_mut_ptr::<PageTable>(active.start_address());

            table.zero();
            for index in KERNEL_HALF_START..512 {
                table[index] = boot[index].clone();
            }

            mmu.switch_root(root);
        }

        debug!("switched from boot root {:?} to {:?}", active, root);

        Ok(Self {
            root,
            direct_map,
            mmu,
            mmio_next: MMIO_WINDOW_START,
        })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    /// Maps the page holding `vaddr` to the frame holding `paddr`.
    ///
    /// Missing intermediate tables are allocated and zeroed; every intermediate entry on the
    /// path ends up at least present and writable, and user-accessible when `flags` asks for
    /// it. Mapping an already present page, walking into a large page or running out of frames
    /// for tables all halt the kernel.
    pub fn map(
        &mut self,
        frames: &mut impl FrameAllocator<Size4KiB>,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageTableFlags,
    ) {
        let indices = TableIndices::from(vaddr);
        let parent_flags = intermediate_flags(flags);

        // SAFETY: the root and every table linked from a present entry belong to this
        // hierarchy and are only edited while `self` is borrowed mutably.
        let p4 = unsafe { &mut *self.table_ptr(self.root.start_address()) };
        let p3 = self.next_table_or_create(&mut p4[indices.p4], frames, parent_flags, vaddr);
        let p2 = self.next_table_or_create(&mut p3[indices.p3], frames, parent_flags, vaddr);
        let p1 = self.next_table_or_create(&mut p2[indices.p2], frames, parent_flags, vaddr);

        let entry = &mut p1[indices.p1];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            panic!(
                "{:?} is already mapped to {:?}, refusing to remap it to {:?}",
                vaddr,
                entry.addr(),
                paddr
            );
        }

        entry.set_addr(paddr.align_down(PAGE_SIZE), flags);
        self.mmu.invalidate(vaddr);
        trace!("mapped {:?} -> {:?} ({:?})", vaddr, paddr, flags);
    }

    /// Clears the leaf entry for `vaddr` and returns the frame it pointed to.
    ///
    /// Returns `None`, with nothing changed, when the page was not mapped.
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Option<PhysFrame> {
        let indices = TableIndices::from(vaddr);
        let p1 = self.leaf_table(indices)?;
        // SAFETY: see `map`
        let entry = unsafe { &mut (&mut *p1)[indices.p1] };
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        let frame = PhysFrame::containing_address(entry.addr());
        entry.set_unused();
        self.mmu.invalidate(vaddr);
        Some(frame)
    }

    /// Physical address `vaddr` currently resolves to, following 1 GiB and 2 MiB pages.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let indices = TableIndices::from(vaddr);

        // SAFETY: read-only walk of tables owned by this hierarchy
        let p4 = unsafe { &*self.table_ptr(self.root.start_address()) };
        let p3 = unsafe { &*self.next_table(&p4[indices.p4])? };

        let p3_entry = &p3[indices.p3];
        if !p3_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p3_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(large_page_address(p3_entry, vaddr, Size1GiB::SIZE));
        }

        let p2 = unsafe { &*self.table_ptr(p3_entry.addr()) };
        let p2_entry = &p2[indices.p2];
        if !p2_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if p2_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(large_page_address(p2_entry, vaddr, Size2MiB::SIZE));
        }

        let p1 = unsafe { &*self.table_ptr(p2_entry.addr()) };
        let p1_entry = &p1[indices.p1];
        if !p1_entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }

        Some(p1_entry.addr() + u64::from(indices.offset))
    }

    /// Maps `pages` pages of device memory starting at `paddr` into the MMIO window.
    ///
    /// Each call takes the next unused stretch of the window; the returned address keeps the
    /// sub-page offset of `paddr`.
    pub fn map_device_memory(
        &mut self,
        frames: &mut impl FrameAllocator<Size4KiB>,
        paddr: PhysAddr,
        pages: usize,
    ) -> VirtAddr {
        let base = VirtAddr::new(self.mmio_next);
        let phys_base = paddr.align_down(PAGE_SIZE);

        for i in 0..pages as u64 {
            self.map(
                frames,
                base + i * PAGE_SIZE,
                phys_base + i * PAGE_SIZE,
                MMIO,
            );
        }
        self.mmio_next += pages as u64 * PAGE_SIZE;

        debug!("device memory {:?} mapped at {:?}", paddr, base);
        base + (paddr - phys_base)
    }

    fn table_ptr(&self, table: PhysAddr) -> *mut PageTable {
        self.direct_map.as_mut_ptr(table)
    }

    /// Table an entry links to, if the entry is present and not a large page.
    fn next_table(&self, entry: &PageTableEntry) -> Option<*mut PageTable> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        Some(self.table_ptr(entry.addr()))
    }

    fn leaf_table(&self, indices: TableIndices) -> Option<*mut PageTable> {
        // SAFETY: see `map`
        unsafe {
            let p4 = &*self.table_ptr(self.root.start_address());
            let p3 = &*self.next_table(&p4[indices.p4])?;
            let p2 = &*self.next_table(&p3[indices.p3])?;
            self.next_table(&p2[indices.p2])
        }
    }

    fn next_table_or_create<'t>(
        &self,
        entry: &mut PageTableEntry,
        frames: &mut impl FrameAllocator<Size4KiB>,
        parent_flags: PageTableFlags,
        vaddr: VirtAddr,
    ) -> &'t mut PageTable {
        let flags = entry.flags();

        if !flags.contains(PageTableFlags::PRESENT) {
            let frame = frames.allocate_frame().unwrap_or_else(|| {
                panic!("out of physical memory building page tables for {vaddr:?}")
            });
            // SAFETY: fresh frame from the allocator, reachable through the direct map
            let table = unsafe { &mut *self.table_ptr(frame.start_address()) };
            table.zero();
            entry.set_frame(frame, parent_flags);
            return table;
        }

        if flags.contains(PageTableFlags::HUGE_PAGE) {
            panic!("cannot map {vaddr:?}: the range is covered by a large page");
        }
        if !flags.contains(parent_flags) {
            entry.set_flags(flags | parent_flags);
        }

        // SAFETY: present, non-huge entries link to page tables of this hierarchy
        unsafe { &mut *self.table_ptr(entry.addr()) }
    }
}

/// Minimum flags an intermediate entry needs so a leaf with `leaf` flags is reachable.
fn intermediate_flags(leaf: PageTableFlags) -> PageTableFlags {
    PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | (leaf & PageTableFlags::USER_ACCESSIBLE)
}

fn large_page_address(entry: &PageTableEntry, vaddr: VirtAddr, size: u64) -> PhysAddr {
    entry.addr().align_down(size) + (vaddr.as_u64() & (size - 1))
}
