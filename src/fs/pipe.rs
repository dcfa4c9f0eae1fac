use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sync::semaphore::SemId;
use crate::table::FixedTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(pub usize);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-capacity circular byte buffer.
pub struct RingBuffer {
    buffer: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buffer: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buffer[self.write_pos] = byte;
        self.write_pos = (self.write_pos + 1) % self.capacity();
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buffer[self.read_pos];
        self.read_pos = (self.read_pos + 1) % self.capacity();
        self.count -= 1;
        Some(byte)
    }
}

/// The three semaphores guarding a pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeSems {
    /// Readable bytes.
    pub items: SemId,
    /// Writable slots.
    pub spaces: SemId,
    pub mutex: SemId,
}

/// Buffer and open counts. Only touched while holding the pipe's `mutex`
/// semaphore; the spin lock just makes that access safe to express.
pub struct PipeInner {
    ring: RingBuffer,
    readers: usize,
    writers: usize,
}

/// What closing one end did to the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Open,
    LastWriter { readers: usize },
    LastReader { writers: usize },
    Destroyed,
}

impl PipeInner {
    fn new(capacity: usize) -> Self {
        PipeInner { ring: RingBuffer::new(capacity), readers: 0, writers: 0 }
    }

    fn add_end(&mut self, as_writer: bool) {
        if as_writer {
            self.writers += 1;
        } else {
            self.readers += 1;
        }
    }

    fn drop_end(&mut self, as_writer: bool) -> KernelResult<Closed> {
        let count = if as_writer { &mut self.writers } else { &mut self.readers };
        *count = count.checked_sub(1).ok_or(KernelError::InvalidArgument)?;
        Ok(match (self.readers, self.writers) {
            (0, 0) => Closed::Destroyed,
            (readers, 0) if as_writer => Closed::LastWriter { readers },
            (0, writers) if !as_writer => Closed::LastReader { writers },
            _ => Closed::Open,
        })
    }
}

pub struct Pipe {
    pub id: PipeId,
    pub sems: PipeSems,
    inner: Mutex<PipeInner>,
}

/// Point-in-time view of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub buffered: usize,
    pub capacity: usize,
    pub readers: usize,
    pub writers: usize,
}

pub struct PipeTable {
    slots: FixedTable<Arc<Pipe>>,
}

impl PipeTable {
    pub fn new(capacity: usize) -> Self {
        PipeTable { slots: FixedTable::new(capacity) }
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    pub fn insert(&mut self, sems: PipeSems, capacity: usize) -> KernelResult<PipeId> {
        self.slots
            .insert_with(|id| {
                Arc::new(Pipe {
                    id: PipeId(id),
                    sems,
                    inner: Mutex::new(PipeInner::new(capacity)),
                })
            })
            .map(PipeId)
            .ok_or(KernelError::PipeTableFull)
    }

    pub fn get(&self, id: PipeId) -> KernelResult<Arc<Pipe>> {
        self.slots.get(id.0).cloned().ok_or(KernelError::NoSuchPipe)
    }

    pub fn remove(&mut self, id: PipeId) -> Option<Arc<Pipe>> {
        self.slots.remove(id.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

enum Push {
    Pushed,
    Broken,
    /// A wake-up token with no free slot behind it; wait again.
    Spurious,
}

impl Kernel {
    pub(crate) fn pipe(&self, id: PipeId) -> KernelResult<Arc<Pipe>> {
        self.atomically(|| self.pipes.lock().get(id))
    }

    /// Run `f` on the pipe state inside the pipe's `mutex`. The section runs
    /// with interrupts masked, so the mutex is never held across a switch
    /// and a killed process can never leave it taken.
    fn locked<R>(&self, pipe: &Pipe, f: impl FnOnce(&mut PipeInner) -> R) -> KernelResult<R> {
        self.atomically(|| {
            self.sem_wait(pipe.sems.mutex)?;
            let ret = f(&mut *pipe.inner.lock());
            self.sem_signal(pipe.sems.mutex)?;
            Ok(ret)
        })
    }

    /// New pipe with no ends open and the configured capacity.
    pub fn pipe_create(&self) -> KernelResult<PipeId> {
        if self.atomically(|| self.pipes.lock().is_full()) {
            log::warn!("pipe: table full");
            return Err(KernelError::PipeTableFull);
        }
        let capacity = self.config.pipe_capacity;
        let items = self.sem_create(0)?;
        let spaces = match self.sem_create(capacity) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.sem_close(items);
                return Err(e);
            }
        };
        let mutex = match self.sem_create(1) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.sem_close(items);
                let _ = self.sem_close(spaces);
                return Err(e);
            }
        };
        let sems = PipeSems { items, spaces, mutex };
        match self.atomically(|| self.pipes.lock().insert(sems, capacity)) {
            Ok(id) => {
                log::info!("pipe: created {} ({} bytes)", id, capacity);
                Ok(id)
            }
            Err(e) => {
                self.close_pipe_sems(sems);
                Err(e)
            }
        }
    }

    fn close_pipe_sems(&self, sems: PipeSems) {
        for sem in [sems.items, sems.spaces, sems.mutex] {
            let _ = self.sem_close(sem);
        }
    }

    pub fn pipe_open(&self, id: PipeId, as_writer: bool) -> KernelResult<()> {
        let pipe = self.pipe(id)?;
        self.locked(&pipe, |inner| inner.add_end(as_writer))
    }

    /// Close one end. The last writer leaving wakes every reader so they see
    /// end-of-stream; the last reader leaving wakes every writer so they see
    /// a broken pipe. With both sides gone the pipe and its semaphores go.
    pub fn pipe_close(&self, id: PipeId, as_writer: bool) -> KernelResult<()> {
        let pipe = self.pipe(id)?;
        let PipeSems { items, spaces, mutex } = pipe.sems;
        let closed = self.atomically(|| {
            self.sem_wait(mutex)?;
            let closed = pipe.inner.lock().drop_end(as_writer);
            match closed {
                Ok(Closed::Destroyed) => {
                    self.pipes.lock().remove(id);
                    self.close_pipe_sems(pipe.sems);
                }
                _ => self.sem_signal(mutex)?,
            }
            closed
        })?;
        match closed {
            Closed::LastWriter { readers } => {
                for _ in 0..readers {
                    self.sem_signal(items)?;
                }
            }
            Closed::LastReader { writers } => {
                for _ in 0..writers {
                    self.sem_signal(spaces)?;
                }
            }
            Closed::Destroyed => log::info!("pipe: {} destroyed", id),
            Closed::Open => {}
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes, blocking while the pipe is empty and a
    /// writer remains. Returns 0 only at end-of-stream.
    pub fn pipe_read(&self, id: PipeId, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let pipe = self.pipe(id)?;
        let mut read = 0;
        while read < buf.len() {
            match self.pipe_read_byte(&pipe) {
                Ok(Some(byte)) => {
                    buf[read] = byte;
                    read += 1;
                }
                Ok(None) => break,
                Err(e) if read == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(read)
    }

    fn pipe_read_byte(&self, pipe: &Pipe) -> KernelResult<Option<u8>> {
        let PipeSems { items, spaces, .. } = pipe.sems;
        loop {
            let drained = self.locked(pipe, |inner| inner.ring.is_empty() && inner.writers == 0)?;
            if drained {
                return Ok(None);
            }

            // from the `items` unit to the freed slot nothing can switch away
            let (byte, writers) = self.atomically(|| {
                self.sem_wait(items)?;
                let popped = self.locked(pipe, |inner| (inner.ring.pop(), inner.writers))?;
                if popped.0.is_some() {
                    self.sem_signal(spaces)?;
                }
                Ok::<_, KernelError>(popped)
            })?;
            match byte {
                Some(byte) => return Ok(Some(byte)),
                // woken by the last writer closing
                None if writers == 0 => return Ok(None),
                None => continue,
            }
        }
    }

    /// Write `buf`, blocking while the pipe is full. Stops early once no
    /// reader is left.
    pub fn pipe_write(&self, id: PipeId, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let pipe = self.pipe(id)?;
        let mut written = 0;
        for &byte in buf {
            match self.pipe_write_byte(&pipe, byte) {
                Ok(true) => written += 1,
                Ok(false) => {
                    log::debug!("pipe: {} broken after {} bytes", pipe.id, written);
                    break;
                }
                Err(e) if written == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(written)
    }

    fn pipe_write_byte(&self, pipe: &Pipe, byte: u8) -> KernelResult<bool> {
        let PipeSems { items, spaces, .. } = pipe.sems;
        loop {
            if self.locked(pipe, |inner| inner.readers)? == 0 {
                return Ok(false);
            }

            let push = self.atomically(|| {
                self.sem_wait(spaces)?;
                let push = self.locked(pipe, |inner| {
                    if inner.readers == 0 {
                        Push::Broken
                    } else if inner.ring.push(byte) {
                        Push::Pushed
                    } else {
                        Push::Spurious
                    }
                })?;
                match push {
                    Push::Pushed => self.sem_signal(items)?,
                    // hand the token on to the next writer
                    Push::Broken => self.sem_signal(spaces)?,
                    Push::Spurious => {}
                }
                Ok::<_, KernelError>(push)
            })?;
            match push {
                Push::Pushed => return Ok(true),
                Push::Broken => return Ok(false),
                Push::Spurious => continue,
            }
        }
    }

    pub fn pipe_stats(&self, id: PipeId) -> KernelResult<PipeStats> {
        let pipe = self.pipe(id)?;
        Ok(self.atomically(|| {
            let inner = pipe.inner.lock();
            PipeStats {
                buffered: inner.ring.len(),
                capacity: inner.ring.capacity(),
                readers: inner.readers,
                writers: inner.writers,
            }
        }))
    }

    pub fn pipes_in_use(&self) -> usize {
        self.atomically(|| self.pipes.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    #[test]
    fn ring_wraps_around() {
        let mut ring = RingBuffer::new(4);
        for b in b"abcd" {
            assert!(ring.push(*b));
        }
        assert!(!ring.push(b'e'));
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert!(ring.push(b'e'));
        assert!(ring.push(b'f'));
        let out: Vec<u8> = core::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(out, b"cdef");
        assert!(ring.is_empty());
    }

    #[test]
    fn closing_ends_reports_transitions() {
        let mut inner = PipeInner::new(8);
        inner.add_end(true);
        inner.add_end(false);
        inner.add_end(false);
        assert_eq!(inner.drop_end(true), Ok(Closed::LastWriter { readers: 2 }));
        assert_eq!(inner.drop_end(false), Ok(Closed::Open));
        assert_eq!(inner.drop_end(true), Err(KernelError::InvalidArgument));
        assert_eq!(inner.drop_end(false), Ok(Closed::Destroyed));
    }

    #[test]
    fn last_reader_leaving_reports_writers() {
        let mut inner = PipeInner::new(8);
        inner.add_end(true);
        inner.add_end(true);
        inner.add_end(false);
        assert_eq!(inner.drop_end(false), Ok(Closed::LastReader { writers: 2 }));
    }

    #[test]
    fn table_hands_out_ids_until_full() {
        let sems = PipeSems { items: SemId(0), spaces: SemId(1), mutex: SemId(2) };
        let mut table = PipeTable::new(1);
        let id = table.insert(sems, 16).unwrap();
        assert!(table.is_full());
        assert_eq!(table.insert(sems, 16).err(), Some(KernelError::PipeTableFull));
        assert!(table.remove(id).is_some());
        assert_eq!(table.get(id).err(), Some(KernelError::NoSuchPipe));
    }

    proptest! {
        #[test]
        fn ring_preserves_byte_order(
            capacity in 1usize..64,
            ops in prop::collection::vec(prop::option::of(any::<u8>()), 0..256),
        ) {
            let mut ring = RingBuffer::new(capacity);
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Some(byte) => {
                        let accepted = ring.push(byte);
                        prop_assert_eq!(accepted, model.len() < capacity);
                        if accepted {
                            model.push_back(byte);
                        }
                    }
                    None => prop_assert_eq!(ring.pop(), model.pop_front()),
                }
                prop_assert_eq!(ring.len(), model.len());
                prop_assert!(ring.len() <= ring.capacity());
            }
        }
    }
}
