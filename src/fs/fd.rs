use crate::config::FD_TABLE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs::pipe::PipeId;
use crate::kernel::Kernel;

/// One open descriptor. Pipe ends refer to the pipe by id; the reference
/// count lives in the pipe's reader/writer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDescriptor {
    Terminal,
    PipeRead(PipeId),
    PipeWrite(PipeId),
}

impl FileDescriptor {
    pub fn pipe_end(id: PipeId, as_writer: bool) -> Self {
        if as_writer {
            FileDescriptor::PipeWrite(id)
        } else {
            FileDescriptor::PipeRead(id)
        }
    }
}

/// Per-process descriptor table, owned by exactly one PCB.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: [Option<FileDescriptor>; FD_TABLE_SIZE],
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { slots: [None; FD_TABLE_SIZE] }
    }

    /// stdin/stdout: a pipe end when given, the terminal otherwise.
    pub fn standard(stdin: Option<PipeId>, stdout: Option<PipeId>) -> Self {
        let mut table = FdTable::new();
        table.slots[0] = Some(stdin.map_or(FileDescriptor::Terminal, FileDescriptor::PipeRead));
        table.slots[1] = Some(stdout.map_or(FileDescriptor::Terminal, FileDescriptor::PipeWrite));
        table
    }

    pub fn get(&self, fd: usize) -> KernelResult<FileDescriptor> {
        self.slots
            .get(fd)
            .copied()
            .flatten()
            .ok_or(KernelError::BadDescriptor)
    }

    /// Put `desc` in slot `fd`, handing back whatever was there.
    pub fn install(
        &mut self,
        fd: usize,
        desc: FileDescriptor,
    ) -> KernelResult<Option<FileDescriptor>> {
        let slot = self.slots.get_mut(fd).ok_or(KernelError::BadDescriptor)?;
        Ok(slot.replace(desc))
    }

    pub fn take(&mut self, fd: usize) -> KernelResult<FileDescriptor> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadDescriptor)
    }

    /// Empty the table, yielding every open descriptor.
    pub fn drain(&mut self) -> impl Iterator<Item = FileDescriptor> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Kernel {
    fn descriptor(&self, fd: usize) -> KernelResult<FileDescriptor> {
        self.atomically(|| {
            let scheduler = self.scheduler.lock();
            let pid = scheduler.current_pid().ok_or(KernelError::NoCurrentProcess)?;
            scheduler
                .get(pid)
                .ok_or(KernelError::NoSuchProcess)?
                .fds
                .get(fd)
        })
    }

    /// Give back what a descriptor holds: pipe ends are closed.
    pub(crate) fn close_descriptor(&self, desc: FileDescriptor) -> KernelResult<()> {
        match desc {
            FileDescriptor::Terminal => Ok(()),
            FileDescriptor::PipeRead(id) => self.pipe_close(id, false),
            FileDescriptor::PipeWrite(id) => self.pipe_close(id, true),
        }
    }

    /// Open one end of `id` and install it as the caller's `fd`, closing
    /// whatever `fd` referred to before.
    pub fn pipe_dup(&self, fd: usize, id: PipeId, as_writer: bool) -> KernelResult<()> {
        if fd >= FD_TABLE_SIZE {
            return Err(KernelError::BadDescriptor);
        }
        let pid = self.current_pid()?;
        self.pipe_open(id, as_writer)?;
        let desc = FileDescriptor::pipe_end(id, as_writer);
        let installed = self.atomically(|| {
            self.scheduler.lock().live_mut(pid).and_then(|p| p.fds.install(fd, desc))
        });
        match installed {
            Ok(Some(old)) => self.close_descriptor(old),
            Ok(None) => Ok(()),
            Err(e) => {
                let _ = self.pipe_close(id, as_writer);
                Err(e)
            }
        }
    }

    pub fn release_fd(&self, fd: usize) -> KernelResult<()> {
        let pid = self.current_pid()?;
        let desc = self.atomically(|| self.scheduler.lock().live_mut(pid)?.fds.take(fd))?;
        self.close_descriptor(desc)
    }

    /// Read from `fd`. The terminal only yields input to the foreground
    /// process; everyone else reads nothing.
    pub fn fd_read(&self, fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
        match self.descriptor(fd)? {
            FileDescriptor::Terminal => {
                let pid = self.current_pid()?;
                if self.foreground_pid() == Some(pid) {
                    Ok(self.terminal.read(buf))
                } else {
                    Ok(0)
                }
            }
            FileDescriptor::PipeRead(id) => self.pipe_read(id, buf),
            FileDescriptor::PipeWrite(_) => Err(KernelError::BadDescriptor),
        }
    }

    pub fn fd_write(&self, fd: usize, buf: &[u8]) -> KernelResult<usize> {
        match self.descriptor(fd)? {
            FileDescriptor::Terminal => Ok(self.terminal.write(buf)),
            FileDescriptor::PipeWrite(id) => self.pipe_write(id, buf),
            FileDescriptor::PipeRead(_) => Err(KernelError::BadDescriptor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn standard_table_wires_pipes_or_terminal() {
        let table = FdTable::standard(Some(PipeId(4)), None);
        assert_eq!(table.get(0), Ok(FileDescriptor::PipeRead(PipeId(4))));
        assert_eq!(table.get(1), Ok(FileDescriptor::Terminal));
        assert_eq!(table.get(2), Err(KernelError::BadDescriptor));
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn install_returns_the_displaced_descriptor() {
        let mut table = FdTable::standard(None, None);
        let old = table.install(1, FileDescriptor::PipeWrite(PipeId(0))).unwrap();
        assert_eq!(old, Some(FileDescriptor::Terminal));
        assert_eq!(
            table.install(FD_TABLE_SIZE, FileDescriptor::Terminal),
            Err(KernelError::BadDescriptor)
        );
        assert_eq!(table.install(15, FileDescriptor::Terminal), Ok(None));
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = FdTable::standard(Some(PipeId(1)), Some(PipeId(2)));
        let drained: Vec<_> = table.drain().collect();
        assert_eq!(
            drained,
            [FileDescriptor::PipeRead(PipeId(1)), FileDescriptor::PipeWrite(PipeId(2))]
        );
        assert_eq!(table.open_count(), 0);
        assert_eq!(table.take(0), Err(KernelError::BadDescriptor));
    }
}
