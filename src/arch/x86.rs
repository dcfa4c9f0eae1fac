//! x86_64 bare-metal CPU: interrupt flag handling and a callee-saved-register
//! stack switch (System V ABI).

use alloc::boxed::Box;
use core::arch::naked_asm;
use core::sync::atomic::AtomicUsize;
use ::x86_64::instructions::{hlt, interrupts};

use super::Cpu;
use crate::scheduler::context::{ContextStart, StackPointer};

/// Words pushed by `switch_stacks`: rbp, rbx, r12..r15 and the return address.
const FRAME_WORDS: usize = 7;

pub struct X86Cpu;

impl Cpu for X86Cpu {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn wait_for_interrupt(&self) {
        interrupts::enable_and_hlt();
        interrupts::disable();
    }

    fn init_context(&self, stack: &mut [u8], start: ContextStart) -> StackPointer {
        let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xF;
        // After the six pops and `ret`, rsp must be 16-byte aligned so that
        // `context_entry`'s `call` hands an ABI-conforming stack to Rust.
        let sp = top - (FRAME_WORDS + 2) * 8;
        let start = Box::into_raw(Box::new(start)) as usize;

        // Pop order in `switch_stacks`: r15, r14, r13, r12, rbx, rbp, ret.
        let frame: [usize; FRAME_WORDS] = [0, 0, 0, start, 0, 0, context_entry as usize];
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), sp as *mut usize, FRAME_WORDS);
        }
        sp
    }

    fn switch(&self, save_into: &AtomicUsize, restore_from: StackPointer) {
        unsafe { switch_stacks(save_into.as_ptr(), restore_from) }
    }

    fn exit_to(&self, restore_from: StackPointer) -> ! {
        unsafe { restore_stack(restore_from) }
    }
}

/// Save callee-saved registers on the current stack, store rsp into
/// `save_into`, then load `restore_from` and pop the other context's frame.
///
/// # Safety
/// `restore_from` must come from `init_context` or an earlier `switch_stacks`.
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(save_into: *mut usize, restore_from: usize) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Like `switch_stacks` without saving anything.
///
/// # Safety
/// Same contract as `switch_stacks`.
#[unsafe(naked)]
unsafe extern "C" fn restore_stack(restore_from: usize) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First instruction of every fresh context; r12 carries the boxed start.
#[unsafe(naked)]
unsafe extern "C" fn context_entry() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "call {start}",
        "ud2",
        start = sym start_context,
    );
}

extern "C" fn start_context(start: *mut ContextStart) -> ! {
    let start = unsafe { Box::from_raw(start) };
    (*start)();
    // The start closure ends in `finish_current`, which never comes back.
    loop {
        hlt();
    }
}
