//! Interrupt handling.
//!
//! Descriptor tables, the legacy PIC/PIT tick source and control of the interrupt-enable flag.
//! On the host (unit tests) the flag is simulated per test thread so lock guards that save and
//! restore it can be exercised without privileged instructions.

pub mod gdt;
pub mod idt;
pub mod pit;

use crate::constants::idt::TIMER_FREQUENCY;

#[cfg(not(test))]
pub use x86_64::instructions::interrupts::{are_enabled, disable, enable};

#[cfg(test)]
pub use host_flag::{are_enabled, disable, enable};

/// Loads the GDT and IDT, then programs the PIC and PIT. Interrupts stay disabled.
pub fn init() {
    gdt::init();
    idt::init_idt();
    pit::init(TIMER_FREQUENCY);
}

#[cfg(test)]
mod host_flag {
    use core::cell::Cell;

    std::thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(false) };
    }

    pub fn are_enabled() -> bool {
        ENABLED.with(Cell::get)
    }

    pub fn enable() {
        ENABLED.with(|flag| flag.set(true));
    }

    pub fn disable() {
        ENABLED.with(|flag| flag.set(false));
    }
}
