//! Legacy 8259 PIC and 8253/8254 PIT: the periodic tick that drives preemption.

use x86_64::instructions::port::Port;

use crate::constants::{
    idt::{PIC1_OFFSET, PIC2_OFFSET, PIT_BASE_FREQUENCY, TIMER_VECTOR},
    ports::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA, PIT_CHANNEL_0, PIT_MODE_CMD},
};
use crate::debug;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

// Unused POST diagnostic port, written to give the PICs time between commands
const IO_WAIT_PORT: u16 = 0x80;

// Channel 0, lobyte/hibyte, mode 3 (square wave)
const PIT_SQUARE_WAVE: u8 = 0x36;

struct Pic {
    command: Port<u8>,
    data: Port<u8>,
}

impl Pic {
    const fn new(command: u16, data: u16) -> Self {
        Self {
            command: Port::new(command),
            data: Port::new(data),
        }
    }

    unsafe fn command(&mut self, value: u8) {
        self.command.write(value);
        io_wait();
    }

    unsafe fn data(&mut self, value: u8) {
        self.data.write(value);
        io_wait();
    }
}

unsafe fn io_wait() {
    Port::<u8>::new(IO_WAIT_PORT).write(0);
}

struct Pit {
    channel0: Port<u8>,
    mode_cmd: Port<u8>,
}

impl Pit {
    const fn new() -> Self {
        Self {
            channel0: Port::new(PIT_CHANNEL_0),
            mode_cmd: Port::new(PIT_MODE_CMD),
        }
    }

    unsafe fn start_periodic(&mut self, divisor: u16) {
        let [low, high] = divisor.to_le_bytes();
        self.mode_cmd.write(PIT_SQUARE_WAVE);
        self.channel0.write(low);
        self.channel0.write(high);
    }
}

/// Reload value that makes the PIT fire `frequency` times per second.
///
/// Frequencies too low to fit the 16-bit counter saturate at the slowest rate.
pub const fn divisor_for(frequency: u32) -> u16 {
    if frequency == 0 {
        return u16::MAX;
    }
    let divisor = PIT_BASE_FREQUENCY / frequency;
    if divisor > u16::MAX as u32 {
        u16::MAX
    } else if divisor == 0 {
        1
    } else {
        divisor as u16
    }
}

/// Remaps both PICs past the exception vectors, masks every line except IRQ 0 and starts the
/// PIT at `frequency` Hz.
pub fn init(frequency: u32) {
    let mut master = Pic::new(PIC1_COMMAND, PIC1_DATA);
    let mut slave = Pic::new(PIC2_COMMAND, PIC2_DATA);
    let mut pit = Pit::new();

    unsafe {
        master.command(ICW1_INIT | ICW1_ICW4);
        slave.command(ICW1_INIT | ICW1_ICW4);
        master.data(PIC1_OFFSET);
        slave.data(PIC2_OFFSET);
        // slave sits on IRQ 2
        master.data(0b0000_0100);
        slave.data(0b0000_0010);
        master.data(ICW4_8086);
        slave.data(ICW4_8086);

        master.data(!0b0000_0001);
        slave.data(0xFF);

        pit.start_periodic(divisor_for(frequency));
    }

    debug!(
        "PIT ticking at {} Hz on vector {}",
        frequency, TIMER_VECTOR
    );
}

/// Acknowledges the timer interrupt at the master PIC.
pub fn send_eoi() {
    let mut master = Pic::new(PIC1_COMMAND, PIC1_DATA);
    unsafe { master.command.write(PIC_EOI) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_matches_requested_rate() {
        assert_eq!(divisor_for(100), 11_931);
        assert_eq!(divisor_for(1000), 1_193);
    }

    #[test]
    fn divisor_saturates_at_both_ends() {
        assert_eq!(divisor_for(0), u16::MAX);
        assert_eq!(divisor_for(1), u16::MAX);
        assert_eq!(divisor_for(PIT_BASE_FREQUENCY * 2), 1);
    }
}
