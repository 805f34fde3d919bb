//! Interrupt Descriptor Table and the assembly entry points behind it.
//!
//! Every installed vector enters through a naked trampoline that completes a [`TrapFrame`] on
//! the interrupted stack and passes its address to Rust. The timer handler may hand back the
//! address of a different frame; the trampoline then pops from that one instead, which is the
//! whole of a thread switch.

use core::arch::naked_asm;

use lazy_static::lazy_static;
use x86_64::{registers::control::Cr2, structures::idt::InterruptDescriptorTable, VirtAddr};

use crate::{
    constants::{gdt::DOUBLE_FAULT_IST_INDEX, idt::TIMER_VECTOR},
    debug,
    interrupts::pit,
    threads::{self, context::TrapFrame},
};

const BREAKPOINT_VECTOR: u64 = 3;
const PAGE_FAULT_VECTOR: u64 = 14;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt.divide_error.set_handler_addr(entry_addr(divide_error_entry));
            idt.breakpoint.set_handler_addr(entry_addr(breakpoint_entry));
            idt.invalid_opcode.set_handler_addr(entry_addr(invalid_opcode_entry));
            idt.double_fault
                .set_handler_addr(entry_addr(double_fault_entry))
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt.stack_segment_fault.set_handler_addr(entry_addr(stack_segment_entry));
            idt.general_protection_fault.set_handler_addr(entry_addr(general_protection_entry));
            idt.page_fault.set_handler_addr(entry_addr(page_fault_entry));
            idt[TIMER_VECTOR].set_handler_addr(entry_addr(timer_entry));
        }
        idt
    };
}

pub fn init_idt() {
    IDT.load();
}

fn entry_addr(entry: extern "C" fn()) -> VirtAddr {
    VirtAddr::new(entry as usize as u64)
}

/// Trampoline for an exception; vectors without a CPU error code push a zero in its place.
macro_rules! exception_entry {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym exception_common,
            )
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym exception_common,
            )
        }
    };
}

exception_entry!(divide_error_entry, 0);
exception_entry!(breakpoint_entry, 3);
exception_entry!(invalid_opcode_entry, 6);
exception_entry!(double_fault_entry, 8, error_code);
exception_entry!(stack_segment_entry, 12, error_code);
exception_entry!(general_protection_entry, 13, error_code);
exception_entry!(page_fault_entry, 14, error_code);

#[unsafe(naked)]
extern "C" fn exception_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        handler = sym exception_handler,
    )
}

#[unsafe(naked)]
extern "C" fn timer_entry() {
    naked_asm!(
        "push 0",
        "push {vector}",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "call {handler}",
        // non-zero means resume another thread from the frame at that address
        "test rax, rax",
        "jz 2f",
        "mov rsp, rax",
        "2:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        vector = const TIMER_VECTOR,
        handler = sym timer_interrupt,
    )
}

/// Returns the frame address to resume from, or 0 to resume the interrupted thread.
extern "C" fn timer_interrupt(current_sp: u64) -> u64 {
    pit::send_eoi();
    threads::tick(current_sp).unwrap_or(0)
}

extern "C" fn exception_handler(frame: &TrapFrame) {
    handle_exception(frame);
}

fn handle_exception(frame: &TrapFrame) {
    match frame.int_no {
        BREAKPOINT_VECTOR => debug!("EXCEPTION: BREAKPOINT at {:#x}", frame.rip),
        PAGE_FAULT_VECTOR => panic!(
            "EXCEPTION: PAGE FAULT accessing {:?}, error code {:#x}\n{:#?}",
            Cr2::read(),
            frame.error_code,
            frame
        ),
        vector => panic!(
            "EXCEPTION: {} (vector {}), error code {:#x}\n{:#?}",
            exception_name(vector),
            vector,
            frame.error_code,
            frame
        ),
    }
}

fn exception_name(vector: u64) -> &'static str {
    match vector {
        0 => "DIVIDE ERROR",
        3 => "BREAKPOINT",
        6 => "INVALID OPCODE",
        8 => "DOUBLE FAULT",
        12 => "STACK SEGMENT FAULT",
        13 => "GENERAL PROTECTION FAULT",
        14 => "PAGE FAULT",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_exceptions_have_names() {
        for vector in [0, 3, 6, 8, 12, 13, 14] {
            assert_ne!(exception_name(vector), "UNKNOWN");
        }
        assert_eq!(exception_name(2), "UNKNOWN");
    }

    #[test]
    #[should_panic(expected = "GENERAL PROTECTION FAULT")]
    fn faults_other_than_breakpoint_are_fatal() {
        let frame = TrapFrame {
            int_no: 13,
            error_code: 0x10,
            ..TrapFrame::default()
        };
        handle_exception(&frame);
    }

    #[test]
    fn breakpoint_resumes() {
        let frame = TrapFrame {
            int_no: BREAKPOINT_VECTOR,
            rip: 0x1000,
            ..TrapFrame::default()
        };
        handle_exception(&frame);
    }
}
