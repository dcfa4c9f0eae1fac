#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod logger;
pub mod memory;
pub mod scheduler;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod serial;
pub mod sync;
pub mod table;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use fs::pipe::PipeId;
pub use kernel::{Kernel, Platform, ProcessList, SpawnRequest, INIT_PID};
pub use scheduler::{Priority, ProcessId, ProcessState, ProcessSummary};
pub use sync::semaphore::SemId;

use spin::Once;

static KERNEL: Once<&'static Kernel> = Once::new();

/// Boot the kernel core and make it reachable through [`kernel`].
///
/// Must be called once, from the boot context, before interrupts are
/// enabled. Later calls return the kernel booted first.
pub fn init(config: KernelConfig, platform: Platform) -> KernelResult<&'static Kernel> {
    if let Some(kernel) = KERNEL.get() {
        return Ok(*kernel);
    }
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    serial::init(log::LevelFilter::Info);
    let kernel = Kernel::boot(config, platform)?;
    Ok(*KERNEL.call_once(|| kernel))
}

/// The kernel installed by [`init`], for interrupt handlers.
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get().copied()
}
