//! FIFO of parked execution contexts, linked by pid.
//!
//! Used for the per-priority ready queues, every semaphore, and the
//! `wait(pid)` list hanging off each process.

use alloc::collections::VecDeque;
use crate::scheduler::ProcessId;

#[derive(Debug, Default, Clone)]
pub struct WaitQueue {
    entries: VecDeque<ProcessId>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue { entries: VecDeque::new() }
    }

    /// Append at the tail. A pid already queued is moved to the tail so that
    /// it is never linked twice.
    pub fn push_back(&mut self, pid: ProcessId) {
        self.remove(pid);
        self.entries.push_back(pid);
    }

    pub fn pop_front(&mut self) -> Option<ProcessId> {
        self.entries.pop_front()
    }

    /// Unlink `pid` wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, pid: ProcessId) -> bool {
        match self.entries.iter().position(|&p| p == pid) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.entries.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.iter().copied()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn pid(n: u64) -> ProcessId {
        ProcessId(n)
    }

    #[test]
    fn pops_in_arrival_order() {
        let mut q = WaitQueue::new();
        q.push_back(pid(3));
        q.push_back(pid(1));
        q.push_back(pid(2));
        assert_eq!(q.pop_front(), Some(pid(3)));
        assert_eq!(q.pop_front(), Some(pid(1)));
        assert_eq!(q.pop_front(), Some(pid(2)));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn requeue_moves_to_tail_instead_of_duplicating() {
        let mut q = WaitQueue::new();
        q.push_back(pid(1));
        q.push_back(pid(2));
        q.push_back(pid(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.iter().collect::<Vec<_>>(), [pid(2), pid(1)]);
    }

    #[test]
    fn remove_from_middle_keeps_the_rest_linked() {
        let mut q = WaitQueue::new();
        for n in 1..=4 {
            q.push_back(pid(n));
        }
        assert!(q.remove(pid(2)));
        assert!(!q.remove(pid(2)));
        assert!(!q.contains(pid(2)));
        assert_eq!(q.drain().collect::<Vec<_>>(), [pid(1), pid(3), pid(4)]);
        assert!(q.is_empty());
    }
}
