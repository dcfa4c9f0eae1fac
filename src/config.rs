//! Boot-time tunables for the kernel core.

use crate::error::{KernelError, KernelResult};

/// Number of entries in every process's file-descriptor table.
pub const FD_TABLE_SIZE: usize = 16;

/// Default size of each process's kernel stack (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Default capacity of a pipe's circular buffer.
pub const PIPE_CAPACITY: usize = 4096;

/// Default number of timer ticks a process may run before preemption.
pub const QUANTUM_TICKS: u64 = 4;

/// Default size of the semaphore and pipe tables.
pub const TABLE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub quantum_ticks: u64,
    pub max_processes: usize,
    pub max_semaphores: usize,
    pub max_pipes: usize,
    pub pipe_capacity: usize,
    pub kernel_stack_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            quantum_ticks: QUANTUM_TICKS,
            max_processes: TABLE_SIZE,
            max_semaphores: TABLE_SIZE,
            max_pipes: TABLE_SIZE,
            pipe_capacity: PIPE_CAPACITY,
            kernel_stack_size: KERNEL_STACK_SIZE,
        }
    }
}

impl KernelConfig {
    /// Parse a boot command line such as `quantum=8 pipe_capacity=512`.
    ///
    /// Keys that are not ours belong to other subsystems and are skipped.
    pub fn from_cmdline(cmdline: &str) -> KernelResult<Self> {
        let mut config = KernelConfig::default();
        for word in cmdline.split_whitespace() {
            let Some((key, value)) = word.split_once('=') else {
                continue;
            };
            let slot = match key {
                "quantum" => {
                    config.quantum_ticks = parse_nonzero(key, value)? as u64;
                    continue;
                }
                "max_processes" => &mut config.max_processes,
                "max_semaphores" => &mut config.max_semaphores,
                "max_pipes" => &mut config.max_pipes,
                "pipe_capacity" => &mut config.pipe_capacity,
                "stack_size" => &mut config.kernel_stack_size,
                _ => {
                    log::debug!("config: ignoring unknown key '{}'", key);
                    continue;
                }
            };
            *slot = parse_nonzero(key, value)?;
        }
        Ok(config)
    }

    pub fn with_quantum(mut self, ticks: u64) -> Self {
        self.quantum_ticks = ticks;
        self
    }

    pub fn with_max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    pub fn with_max_semaphores(mut self, n: usize) -> Self {
        self.max_semaphores = n;
        self
    }

    pub fn with_max_pipes(mut self, n: usize) -> Self {
        self.max_pipes = n;
        self
    }

    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes;
        self
    }

    pub fn with_kernel_stack_size(mut self, bytes: usize) -> Self {
        self.kernel_stack_size = bytes;
        self
    }
}

fn parse_nonzero(key: &str, value: &str) -> KernelResult<usize> {
    match value.parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => {
            log::warn!("config: bad value '{}' for '{}'", value, key);
            Err(KernelError::InvalidArgument)
        }
    }
}
