//! Counting semaphores with reference counting and FIFO wake-up.
//!
//! A signal either wakes the head waiter or increments the value, never both,
//! so `value > 0` implies an empty wait queue.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::scheduler::{ProcessId, WaitReason};
use crate::sync::wait_queue::WaitQueue;
use crate::table::FixedTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub usize);

impl fmt::Display for SemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of [`SemaphoreState::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// The caller was appended to the wait queue and must suspend.
    Enqueued,
}

/// Outcome of [`SemaphoreState::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Woke(ProcessId),
    Incremented,
}

#[derive(Debug)]
pub struct SemaphoreState {
    value: usize,
    refcount: usize,
    waiters: WaitQueue,
}

impl SemaphoreState {
    pub fn new(value: usize) -> Self {
        SemaphoreState { value, refcount: 1, waiters: WaitQueue::new() }
    }

    pub fn value(&self) -> usize {
        self.value
    }

    pub fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    pub fn acquire(&mut self, pid: ProcessId) -> Acquire {
        if self.value > 0 {
            self.value -= 1;
            Acquire::Acquired
        } else {
            self.waiters.push_back(pid);
            Acquire::Enqueued
        }
    }

    pub fn release(&mut self) -> Release {
        match self.waiters.pop_front() {
            Some(pid) => Release::Woke(pid),
            None => {
                self.value += 1;
                Release::Incremented
            }
        }
    }

    /// Hand `value` units to waiters in arrival order, keeping the rest.
    pub fn set(&mut self, value: usize) -> Vec<ProcessId> {
        let mut woken = Vec::new();
        while woken.len() < value {
            match self.waiters.pop_front() {
                Some(pid) => woken.push(pid),
                None => break,
            }
        }
        self.value = value - woken.len();
        woken
    }

    /// Take `pid` out of the wait queue (kill, explicit unblock).
    pub fn cancel(&mut self, pid: ProcessId) -> bool {
        self.waiters.remove(pid)
    }
}

pub struct Semaphore {
    pub id: SemId,
    pub state: Mutex<SemaphoreState>,
}

impl Semaphore {
    fn new(id: SemId, value: usize) -> Self {
        Semaphore { id, state: Mutex::new(SemaphoreState::new(value)) }
    }
}

/// Fixed-size registry of semaphores.
pub struct SemaphoreTable {
    slots: FixedTable<Arc<Semaphore>>,
}

impl SemaphoreTable {
    pub fn new(capacity: usize) -> Self {
        SemaphoreTable { slots: FixedTable::new(capacity) }
    }

    pub fn create(&mut self, value: usize) -> KernelResult<SemId> {
        self.slots
            .insert_with(|id| Arc::new(Semaphore::new(SemId(id), value)))
            .map(SemId)
            .ok_or(KernelError::SemaphoreTableFull)
    }

    pub fn get(&self, id: SemId) -> KernelResult<Arc<Semaphore>> {
        self.slots.get(id.0).cloned().ok_or(KernelError::NoSuchSemaphore)
    }

    /// Drop one reference. Returns the semaphore if that was the last one,
    /// after freeing its slot.
    pub fn close(&mut self, id: SemId) -> KernelResult<Option<Arc<Semaphore>>> {
        let sem = self.get(id)?;
        let mut state = sem.state.lock();
        state.refcount -= 1;
        if state.refcount > 0 {
            return Ok(None);
        }
        drop(state);
        Ok(self.slots.remove(id.0))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Kernel {
    fn semaphore(&self, id: SemId) -> KernelResult<Arc<Semaphore>> {
        self.atomically(|| self.semaphores.lock().get(id))
    }

    pub fn sem_create(&self, initial: usize) -> KernelResult<SemId> {
        let id = self
            .atomically(|| self.semaphores.lock().create(initial))
            .inspect_err(|_| log::warn!("sem: table full"))?;
        log::debug!("sem: created {} (value {})", id, initial);
        Ok(id)
    }

    pub fn sem_open(&self, id: SemId) -> KernelResult<()> {
        let sem = self.semaphore(id)?;
        self.atomically(|| sem.state.lock().refcount += 1);
        Ok(())
    }

    /// Drop a reference; the last one frees the slot. Processes still queued
    /// on a freed semaphore are released with `Interrupted`.
    pub fn sem_close(&self, id: SemId) -> KernelResult<()> {
        let stranded = self.atomically(|| -> KernelResult<Option<usize>> {
            let Some(sem) = self.semaphores.lock().close(id)? else {
                return Ok(None);
            };
            let stranded: Vec<ProcessId> = sem.state.lock().waiters.drain().collect();
            let mut scheduler = self.scheduler.lock();
            for &pid in &stranded {
                if let Some(p) = scheduler.get_mut(pid) {
                    p.interrupted = true;
                }
                let _ = scheduler.unblock(pid);
            }
            Ok(Some(stranded.len()))
        })?;
        match stranded {
            Some(0) => log::debug!("sem: freed {}", id),
            Some(n) => log::warn!("sem: {} freed with {} waiters", id, n),
            None => {}
        }
        Ok(())
    }

    /// P operation. Blocks the caller until a unit is available.
    ///
    /// Enqueueing and blocking happen under the semaphore lock with
    /// interrupts off, so a signal cannot slip in between them.
    pub fn sem_wait(&self, id: SemId) -> KernelResult<()> {
        let sem = self.semaphore(id)?;
        self.atomically(|| {
            let pid = self.current_pid()?;
            {
                let mut state = sem.state.lock();
                if state.acquire(pid) == Acquire::Acquired {
                    return Ok(());
                }
                if let Err(e) = self
                    .scheduler
                    .lock()
                    .suspend(pid, Some(WaitReason::Semaphore(id)))
                {
                    state.cancel(pid);
                    return Err(e);
                }
            }
            log::trace!("sem: {} waits on {}", pid, id);
            self.reschedule();
            if let Some(p) = self.scheduler.lock().get_mut(pid) {
                p.granted_by = None;
            }
            self.take_interrupted(pid)
        })
    }

    /// V operation: wake the longest waiter, or bank the unit.
    pub fn sem_signal(&self, id: SemId) -> KernelResult<()> {
        let sem = self.semaphore(id)?;
        self.atomically(|| {
            let mut state = sem.state.lock();
            if let Release::Woke(pid) = state.release() {
                log::trace!("sem: {} wakes {}", id, pid);
                let _ = self.scheduler.lock().hand_over(pid, id);
            }
        });
        Ok(())
    }

    pub fn sem_set(&self, id: SemId, value: i64) -> KernelResult<()> {
        let value = usize::try_from(value).map_err(|_| KernelError::InvalidArgument)?;
        let sem = self.semaphore(id)?;
        self.atomically(|| {
            let mut state = sem.state.lock();
            let woken = state.set(value);
            if !woken.is_empty() {
                let mut scheduler = self.scheduler.lock();
                for pid in woken {
                    let _ = scheduler.hand_over(pid, id);
                }
            }
        });
        Ok(())
    }

    pub fn sem_get(&self, id: SemId) -> KernelResult<usize> {
        let sem = self.semaphore(id)?;
        Ok(self.atomically(|| sem.state.lock().value()))
    }

    /// Number of processes parked on `id`.
    pub fn sem_waiters(&self, id: SemId) -> KernelResult<usize> {
        let sem = self.semaphore(id)?;
        Ok(self.atomically(|| sem.state.lock().waiters().len()))
    }

    pub fn semaphores_in_use(&self) -> usize {
        self.atomically(|| self.semaphores.lock().len())
    }

    /// Take `pid` off the semaphore it is parked on, if any.
    pub(crate) fn cancel_sem_wait(&self, pid: ProcessId, id: SemId) {
        if let Ok(sem) = self.semaphore(id) {
            self.atomically(|| sem.state.lock().cancel(pid));
        }
    }
}
