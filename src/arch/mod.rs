//! The CPU as seen by the scheduler: interrupt masking and the raw
//! stack-switch primitive.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86;

use crate::scheduler::context::{ContextStart, StackPointer};
use core::sync::atomic::AtomicUsize;

pub trait Cpu: Send + Sync {
    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Sleep until the next interrupt. Entered and left with interrupts
    /// disabled.
    fn wait_for_interrupt(&self);

    /// Prime `stack` so that the first switch to the returned stack pointer
    /// runs `start`. `start` never returns.
    fn init_context(&self, stack: &mut [u8], start: ContextStart) -> StackPointer;

    /// Save the running context into `save_into` and resume `restore_from`.
    /// Returns when something switches back to the saved context.
    fn switch(&self, save_into: &AtomicUsize, restore_from: StackPointer);

    /// Resume `restore_from` and abandon the running context.
    fn exit_to(&self, restore_from: StackPointer) -> !;
}

/// Run `f` with interrupts masked, restoring the previous state afterwards.
///
/// A context switch inside `f` is fine: every context restores its own
/// interrupt state when its closure finishes.
pub fn without_interrupts<R>(cpu: &dyn Cpu, f: impl FnOnce() -> R) -> R {
    let were_enabled = cpu.interrupts_enabled();
    if were_enabled {
        cpu.disable_interrupts();
    }
    let ret = f();
    if were_enabled {
        cpu.enable_interrupts();
    }
    ret
}
