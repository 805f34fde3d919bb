//! Global Descriptor Table and stack configuration.

/// Index in the Interrupt Stack Table (IST) for handling double faults.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of each IST stack in bytes.
/// Set to 16KB (4 pages) to handle deep call stacks during faults.
pub const IST_STACK_SIZE: usize = 4096 * 4;

/// Selector of the kernel code segment (GDT entry 1, ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Selector of the kernel data segment (GDT entry 2, ring 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
