use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Saved stack pointer of a suspended context. Opaque to everything but the
/// [`Cpu`](crate::arch::Cpu) that produced it.
pub type StackPointer = usize;

/// What a fresh context runs the first time it is switched to.
pub type ContextStart = Box<dyn FnOnce() + Send + 'static>;

/// Slot the context-switch primitive saves a stack pointer into.
///
/// Shared between the owning process and the switch in flight, so the
/// scheduler lock never has to be held across `Cpu::switch`.
#[derive(Debug, Default)]
pub struct Context {
    sp: AtomicUsize,
}

impl Context {
    pub fn new(sp: StackPointer) -> Self {
        Context { sp: AtomicUsize::new(sp) }
    }

    pub fn stack_pointer(&self) -> StackPointer {
        self.sp.load(Ordering::Acquire)
    }

    pub fn set_stack_pointer(&self, sp: StackPointer) {
        self.sp.store(sp, Ordering::Release);
    }

    /// The slot handed to `Cpu::switch` as `save_into`.
    pub fn slot(&self) -> &AtomicUsize {
        &self.sp
    }
}
