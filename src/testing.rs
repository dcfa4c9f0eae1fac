//! Hosted platform for tests.
//!
//! Every kernel context runs on its own OS thread. A single baton decides
//! which one may execute, so exactly one context runs at a time and
//! `switch` really suspends the caller until someone switches back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::arch::Cpu;
use crate::config::KernelConfig;
use crate::fs::Terminal;
use crate::kernel::{Kernel, Platform};
use crate::memory::{HeapMemory, MemoryManager};
use crate::scheduler::context::{ContextStart, StackPointer};

/// Token of the thread that boots the kernel (the test itself).
const BOOT_TOKEN: usize = 0;

#[derive(Default)]
struct Baton {
    holder: Mutex<usize>,
    turn: Condvar,
}

impl Baton {
    fn wait_for(&self, token: usize) {
        let mut holder = self.holder.lock().unwrap();
        while *holder != token {
            holder = self.turn.wait(holder).unwrap();
        }
    }
}

pub struct HostCpu {
    baton: Arc<Baton>,
    next_token: AtomicUsize,
    interrupts: AtomicBool,
    /// Times interrupts went from enabled to masked.
    masked: Arc<AtomicUsize>,
}

impl HostCpu {
    pub fn new() -> Self {
        HostCpu {
            baton: Arc::new(Baton::default()),
            next_token: AtomicUsize::new(BOOT_TOKEN + 1),
            interrupts: AtomicBool::new(true),
            masked: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Cpu for HostCpu {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        if self.interrupts.swap(false, Ordering::SeqCst) {
            self.masked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        thread::sleep(Duration::from_millis(1));
    }

    fn init_context(&self, _stack: &mut [u8], start: ContextStart) -> StackPointer {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let baton = self.baton.clone();
        thread::Builder::new()
            .name(format!("context-{}", token))
            .spawn(move || {
                baton.wait_for(token);
                start();
            })
            .unwrap();
        token
    }

    fn switch(&self, save_into: &AtomicUsize, restore_from: StackPointer) {
        let mut holder = self.baton.holder.lock().unwrap();
        let me = *holder;
        save_into.store(me, Ordering::SeqCst);
        *holder = restore_from;
        self.baton.turn.notify_all();
        while *holder != me {
            holder = self.baton.turn.wait(holder).unwrap();
        }
    }

    fn exit_to(&self, restore_from: StackPointer) -> ! {
        let mut holder = self.baton.holder.lock().unwrap();
        *holder = restore_from;
        self.baton.turn.notify_all();
        loop {
            holder = self.baton.turn.wait(holder).unwrap();
        }
    }
}

/// Terminal with scripted input that records everything written to it.
#[derive(Default)]
pub struct RecordingTerminal {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl RecordingTerminal {
    pub fn type_in(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes);
    }

    pub fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }
}

impl Terminal for Arc<RecordingTerminal> {
    fn read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        let n = buf.len().min(input.len());
        for (slot, byte) in buf.iter_mut().zip(input.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn write(&self, buf: &[u8]) -> usize {
        self.output.lock().unwrap().extend_from_slice(buf);
        buf.len()
    }
}

pub struct TestKernel {
    pub kernel: &'static Kernel,
    pub terminal: Arc<RecordingTerminal>,
    masked: Arc<AtomicUsize>,
}

impl TestKernel {
    /// Critical sections entered so far with interrupts masked.
    pub fn masked_sections(&self) -> usize {
        self.masked.load(Ordering::SeqCst)
    }
}

pub fn boot_with(config: KernelConfig, memory: impl MemoryManager + 'static) -> TestKernel {
    let terminal = Arc::new(RecordingTerminal::default());
    let cpu = HostCpu::new();
    let masked = cpu.masked.clone();
    let platform = Platform {
        cpu: Box::new(cpu),
        memory: Box::new(memory),
        terminal: Box::new(terminal.clone()),
    };
    let kernel = Kernel::boot(config, platform).unwrap();
    TestKernel { kernel, terminal, masked }
}

/// Small stacks: the host never runs on them.
pub fn test_config() -> KernelConfig {
    KernelConfig::default().with_kernel_stack_size(4096)
}

pub fn boot() -> &'static Kernel {
    boot_with(test_config(), HeapMemory::new()).kernel
}
