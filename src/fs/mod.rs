//! Byte streams a process can hold descriptors to: the terminal and pipes.

pub mod fd;
pub mod pipe;

/// The terminal driver behind `FileDescriptor::Terminal`.
pub trait Terminal: Send + Sync {
    /// Copy pending input into `buf`, returning the number of bytes; never
    /// blocks.
    fn read(&self, buf: &mut [u8]) -> usize;
    fn write(&self, buf: &[u8]) -> usize;
}
