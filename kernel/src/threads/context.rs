use core::fmt;

use crate::constants::{
    gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR},
    sched::THREAD_INITIAL_RFLAGS,
};

/// Register state saved on a thread's own stack when the timer interrupt preempts it.
///
/// Lowest address first: the fifteen general-purpose registers in the order the interrupt
/// trampoline pushes them (so `r15` ends up on top), the vector number and error code it pushes
/// before them, and finally the frame the CPU itself pushed on entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const TRAP_FRAME_SIZE: usize = 22 * 8;
const _: () = assert!(size_of::<TrapFrame>() == TRAP_FRAME_SIZE);

impl TrapFrame {
    /// Frame that, once popped by the trampoline, starts executing `entry` in ring 0 on the
    /// stack at `stack_pointer` with interrupts enabled.
    pub fn for_kernel_thread(entry: u64, stack_pointer: u64) -> Self {
        Self {
            rip: entry,
            cs: u64::from(KERNEL_CODE_SELECTOR),
            rflags: THREAD_INITIAL_RFLAGS,
            rsp: stack_pointer,
            ss: u64::from(KERNEL_DATA_SELECTOR),
            ..Self::default()
        }
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("TrapFrame");

        ds.field("rax", &format_args!("{:#016x}", self.rax))
            .field("rbx", &format_args!("{:#016x}", self.rbx))
            .field("rcx", &format_args!("{:#016x}", self.rcx))
            .field("rdx", &format_args!("{:#016x}", self.rdx))
            .field("rsi", &format_args!("{:#016x}", self.rsi))
            .field("rdi", &format_args!("{:#016x}", self.rdi))
            .field("rbp", &format_args!("{:#016x}", self.rbp))
            .field("r8", &format_args!("{:#016x}", self.r8))
            .field("r9", &format_args!("{:#016x}", self.r9))
            .field("r10", &format_args!("{:#016x}", self.r10))
            .field("r11", &format_args!("{:#016x}", self.r11))
            .field("r12", &format_args!("{:#016x}", self.r12))
            .field("r13", &format_args!("{:#016x}", self.r13))
            .field("r14", &format_args!("{:#016x}", self.r14))
            .field("r15", &format_args!("{:#016x}", self.r15))
            .field("int_no", &self.int_no)
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("rflags", &format_args!("{:#016x}", self.rflags))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("ss", &format_args!("{:#x}", self.ss));

        ds.finish()
    }
}
