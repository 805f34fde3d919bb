//! Memory management.
//!
//! Bring-up runs strictly in this order: the physical frame allocator, then the kernel address
//! space, then the heap. Each later stage draws frames from the allocator built before it.
//!
//! The global locks keep interrupts masked while held, so a thread is never preempted holding
//! one. Whenever more than one is needed they are taken in the order heap, frame allocator,
//! kernel address space.

pub mod error;
pub mod frame_allocator;
pub mod heap;
pub mod mmu;
pub mod paging;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::MemoryError;

use frame_allocator::BitmapFrameAllocator;
use limine::memory_map::{Entry, EntryType};
use mmu::HardwareMmu;
use paging::AddressSpace;
use x86_64::{
    registers::model_specific::{Efer, EferFlags},
    PhysAddr, VirtAddr,
};

use crate::{info, sync::IrqMutex};

/// Physical frame allocator, available once [`init`] has run.
pub static FRAME_ALLOCATOR: IrqMutex<Option<BitmapFrameAllocator>> = IrqMutex::new(None);

/// The kernel's page table hierarchy, available once [`init`] has run.
pub static KERNEL_ADDRESS_SPACE: IrqMutex<Option<AddressSpace<HardwareMmu>>> =
    IrqMutex::new(None);

/// Fixed offset at which the bootloader maps all of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub fn phys_to_virt(self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64() + self.offset)
    }

    pub fn virt_to_phys(self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new(virt.as_u64() - self.offset)
    }

    /// Pointer through which the physical address can be accessed.
    pub fn as_mut_ptr<T>(self, phys: PhysAddr) -> *mut T {
        self.phys_to_virt(phys).as_mut_ptr()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// One entry of the boot memory map, reduced to what the kernel cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Reserved,
        }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn is_usable(&self) -> bool {
        self.kind == RegionKind::Usable
    }
}

impl From<&Entry> for MemoryRegion {
    fn from(entry: &Entry) -> Self {
        let kind = if entry.entry_type == EntryType::USABLE {
            RegionKind::Usable
        } else {
            RegionKind::Reserved
        };

        Self {
            base: entry.base,
            length: entry.length,
            kind,
        }
    }
}

/// Brings up physical and virtual memory management and the kernel heap.
///
/// # Safety
///
/// Must run once, on the boot processor, with `direct_map` aliasing all of physical memory and
/// `regions` marking as usable only memory nobody else owns.
pub unsafe fn init(regions: &[MemoryRegion], direct_map: DirectMap) -> Result<(), MemoryError> {
    let mut frames = unsafe { BitmapFrameAllocator::init(regions, direct_map) }?;

    unsafe {
        // Must be done after enabling long mode + paging
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
    }

    let space = unsafe { AddressSpace::init_kernel(&mut frames, direct_map, HardwareMmu) }?;
    info!("kernel address space rooted at {:?}", space.root());

    *FRAME_ALLOCATOR.lock() = Some(frames);
    *KERNEL_ADDRESS_SPACE.lock() = Some(space);

    heap::init(heap::HeapConfig::KERNEL);

    Ok(())
}

/// Runs `f` with the global frame allocator and the kernel address space, locked in that order.
pub fn with_kernel_address_space<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator, &mut AddressSpace<HardwareMmu>) -> R,
{
    let mut frames_guard = FRAME_ALLOCATOR.lock();
    let mut space_guard = KERNEL_ADDRESS_SPACE.lock();
    let frames = frames_guard
        .as_mut()
        .expect("frame allocator used before memory::init");
    let space = space_guard
        .as_mut()
        .expect("kernel address space used before memory::init");
    f(frames, space)
}

/// Maps `pages` pages of device memory at `phys` into the uncached MMIO window.
pub fn map_device_memory(phys: PhysAddr, pages: usize) -> VirtAddr {
    with_kernel_address_space(|frames, space| space.map_device_memory(frames, phys, pages))
}
