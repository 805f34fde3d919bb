//! Interrupt Descriptor Table configuration.

/// Vector number assigned to the timer interrupt (legacy IRQ 0 after the PIC remap).
pub const TIMER_VECTOR: u8 = 32;

/// First vector used by the master PIC after remapping.
pub const PIC1_OFFSET: u8 = 32;
/// First vector used by the slave PIC after remapping.
pub const PIC2_OFFSET: u8 = 40;

/// Frequency of the periodic timer tick in Hertz.
pub const TIMER_FREQUENCY: u32 = 100;

/// Input clock of the 8253/8254 programmable interval timer, in Hz.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;
