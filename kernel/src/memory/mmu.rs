//! The privileged half of paging: reading and loading the root table and flushing the TLB.

use x86_64::{
    instructions::tlb,
    registers::control::Cr3,
    structures::paging::PhysFrame,
    VirtAddr,
};

pub trait Mmu {
    /// Root table of the hierarchy the CPU is currently walking.
    fn active_root(&self) -> PhysFrame;

    /// Makes `root` the active hierarchy.
    ///
    /// # Safety
    ///
    /// `root` must be a complete top-level table that maps the running code, its stack and
    /// everything reachable from them.
    unsafe fn switch_root(&mut self, root: PhysFrame);

    /// Drops any cached translation for `vaddr` on this processor.
    fn invalidate(&mut self, vaddr: VirtAddr);
}

/// The processor's own MMU, driven through CR3 and `invlpg`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    fn active_root(&self) -> PhysFrame {
        Cr3::read().0
    }

    unsafe fn switch_root(&mut self, root: PhysFrame) {
        let (_, flags) = Cr3::read();
        unsafe { Cr3::write(root, flags) };
    }

    fn invalidate(&mut self, vaddr: VirtAddr) {
        tlb::flush(vaddr);
    }
}
