#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod sync;
pub mod threads;

pub use devices::serial;

pub mod prelude {
    pub use crate::serial_print;
    pub use crate::serial_println;
}

/// Sleeps until the next interrupt, forever. Preemption still runs other threads.
pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

/// Stops this processor for good.
pub fn halt() -> ! {
    interrupts::disable();
    loop {
        hlt();
    }
}
