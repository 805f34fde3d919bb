//! COM1, the kernel console.
//!
//! Everything the kernel prints ends up here, log records included. The UART is programmed on
//! first use.

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use uart_16550::SerialPort;

use crate::{constants::ports::SERIAL_PORT, sync::IrqMutex};

lazy_static! {
    /// The console port. Writers hold it with interrupts off, so the timer can never preempt a
    /// thread halfway through a line and leave the port locked.
    pub static ref COM1: IrqMutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        IrqMutex::new(port)
    };
}

/// Releases the console lock whoever holds it, so a panic can always be reported.
///
/// # Safety
///
/// Only for the panic path: the previous holder must never run again.
pub unsafe fn force_unlock() {
    if COM1.is_locked() {
        unsafe { COM1.force_unlock() };
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    COM1.lock().write_fmt(args).expect("Printing to serial failed");
}

/// Writes formatted text to the console.
///
/// ```ignore
/// serial_print!("{} frames free", count);
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Writes formatted text to the console, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
