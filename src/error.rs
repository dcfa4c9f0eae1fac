use core::fmt;

/// Kernel core error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    ProcessTableFull,
    SemaphoreTableFull,
    PipeTableFull,
    NoSuchProcess,
    NoSuchSemaphore,
    NoSuchPipe,
    BadDescriptor,
    InvalidArgument,
    NoCurrentProcess,
    /// A blocking call was cut short by an explicit `unblock`.
    Interrupted,
}

impl KernelError {
    /// Negative return code handed back through the syscall ABI.
    pub fn code(self) -> i64 {
        match self {
            KernelError::OutOfMemory => -1,
            KernelError::ProcessTableFull => -2,
            KernelError::SemaphoreTableFull => -3,
            KernelError::PipeTableFull => -4,
            KernelError::NoSuchProcess => -5,
            KernelError::NoSuchSemaphore => -6,
            KernelError::NoSuchPipe => -7,
            KernelError::BadDescriptor => -8,
            KernelError::InvalidArgument => -9,
            KernelError::NoCurrentProcess => -10,
            KernelError::Interrupted => -11,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::ProcessTableFull => write!(f, "Process table full"),
            KernelError::SemaphoreTableFull => write!(f, "Semaphore table full"),
            KernelError::PipeTableFull => write!(f, "Pipe table full"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::NoSuchSemaphore => write!(f, "No such semaphore"),
            KernelError::NoSuchPipe => write!(f, "No such pipe"),
            KernelError::BadDescriptor => write!(f, "Bad file descriptor"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::NoCurrentProcess => write!(f, "No process is running"),
            KernelError::Interrupted => write!(f, "Interrupted"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
