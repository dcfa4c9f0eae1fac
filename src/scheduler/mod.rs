pub mod context;
pub mod task;
pub mod tree;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::fs::fd::FdTable;
use crate::memory::Region;
use crate::sync::semaphore::SemId;
use crate::sync::wait_queue::WaitQueue;
use context::{Context, StackPointer};
pub use task::{Priority, Process, ProcessId, ProcessState, ProcessSummary, WaitReason};
use tree::ProcessTable;

/// A context switch decided by [`Scheduler::schedule`], performed by the
/// caller once the scheduler lock is dropped.
pub struct Switch {
    /// Where to save the outgoing stack pointer; `None` when the outgoing
    /// context is finished and will never run again.
    pub from: Option<Arc<Context>>,
    pub to: StackPointer,
}

/// What a terminated process leaves behind for the caller to release
/// outside the scheduler lock.
pub struct Remains {
    pub fds: FdTable,
    pub stacks: Vec<Region>,
    /// Semaphore unit handed to the process that it never got to take.
    pub unclaimed: Option<SemId>,
}

/// Process table plus per-priority ready queues.
pub struct Scheduler {
    processes: ProcessTable,
    ready: [WaitQueue; Priority::COUNT],
    /// Running process, `None` while the idle context runs.
    current: Option<ProcessId>,
    idle: Arc<Context>,
    next_pid: u64,
    max_processes: usize,
    quantum: u64,
    ticks: u64,
    last_switch: u64,
    switches: u64,
    /// Stacks of exited contexts; they were still in use when the process
    /// finished, so they are released after the next switch.
    graveyard: Vec<Region>,
}

impl Scheduler {
    pub fn new(config: &KernelConfig, idle: Arc<Context>) -> Self {
        Scheduler {
            processes: ProcessTable::new(),
            ready: [WaitQueue::new(), WaitQueue::new(), WaitQueue::new()],
            current: None,
            idle,
            next_pid: 0,
            max_processes: config.max_processes,
            quantum: config.quantum_ticks,
            ticks: 0,
            last_switch: 0,
            switches: 0,
            graveyard: Vec::new(),
        }
    }

    pub fn current_pid(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// Live (not finished) process lookup.
    pub fn live_mut(&mut self, pid: ProcessId) -> KernelResult<&mut Process> {
        self.processes
            .get_mut(&pid)
            .filter(|p| p.state.is_alive())
            .ok_or(KernelError::NoSuchProcess)
    }

    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.processes.get(&pid).is_some_and(|p| p.state.is_alive())
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Whether another PCB fits, reaping one zombie to make space if needed.
    pub fn has_room(&mut self) -> bool {
        if self.processes.len() < self.max_processes {
            return true;
        }
        let zombie = self
            .processes
            .values()
            .find(|p| !p.state.is_alive() && p.waiters.is_empty())
            .map(|p| p.pid);
        match zombie {
            Some(pid) => self.reap(pid),
            None => false,
        }
    }

    /// Install the context that is already executing (the boot context).
    pub fn adopt_current(&mut self, mut process: Process) {
        let pid = process.pid;
        process.state = ProcessState::Running;
        self.processes.insert(pid, process);
        self.current = Some(pid);
    }

    /// Insert a freshly built PCB, link it under `parent` and make it Ready.
    pub fn admit(&mut self, process: Process, parent: Option<ProcessId>) -> KernelResult<()> {
        if parent.is_some_and(|p| !self.is_alive(p)) {
            return Err(KernelError::NoSuchProcess);
        }
        if !self.has_room() {
            return Err(KernelError::ProcessTableFull);
        }
        let pid = process.pid;
        self.processes.insert(pid, process);
        if let Some(parent) = parent {
            tree::link_child(&mut self.processes, parent, pid);
        }
        self.enqueue(pid);
        Ok(())
    }

    /// Unlink `pid` from every ready queue.
    fn detach(&mut self, pid: ProcessId) {
        for queue in self.ready.iter_mut() {
            queue.remove(pid);
        }
    }

    /// Mark `pid` Ready at the tail of its priority level.
    fn enqueue(&mut self, pid: ProcessId) {
        self.detach(pid);
        if let Some(p) = self.processes.get_mut(&pid) {
            p.state = ProcessState::Ready;
            self.ready[p.priority.index()].push_back(pid);
        }
    }

    fn pop_ready(&mut self) -> Option<ProcessId> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.ready[p.index()].pop_front())
    }

    /// Park `pid`: off the ready queues, state Blocked, remembering what it
    /// waits for. The caller has already linked it into that wait structure.
    pub fn suspend(&mut self, pid: ProcessId, reason: Option<WaitReason>) -> KernelResult<()> {
        let process = self.live_mut(pid)?;
        process.state = ProcessState::Blocked;
        process.interrupted = false;
        match reason {
            Some(WaitReason::Semaphore(sem)) => process.waiting_on_sem = Some(sem),
            Some(WaitReason::Process(target)) => process.waiting_on_pid = Some(target),
            None => {}
        }
        self.detach(pid);
        Ok(())
    }

    /// Blocked → Ready. Ready and Running processes are left alone.
    pub fn unblock(&mut self, pid: ProcessId) -> KernelResult<()> {
        let process = self.live_mut(pid)?;
        if process.state == ProcessState::Blocked {
            process.waiting_on_sem = None;
            process.waiting_on_pid = None;
            self.enqueue(pid);
        }
        Ok(())
    }

    /// Wake `pid` with a unit of `sem` already taken on its behalf.
    pub fn hand_over(&mut self, pid: ProcessId, sem: SemId) -> KernelResult<()> {
        self.live_mut(pid)?.granted_by = Some(sem);
        self.unblock(pid)
    }

    /// Pull a Blocked process out of the wait it is parked in and flag the
    /// wait as interrupted. Removing it from a semaphore queue is left to the
    /// caller, which holds the semaphore table.
    pub fn cancel_wait(&mut self, pid: ProcessId) -> KernelResult<Option<WaitReason>> {
        let process = self.live_mut(pid)?;
        if process.state != ProcessState::Blocked {
            return Ok(None);
        }
        let reason = process.wait_reason();
        process.waiting_on_sem = None;
        process.waiting_on_pid = None;
        process.interrupted = reason.is_some();
        if let Some(WaitReason::Process(target)) = reason {
            if let Some(t) = self.processes.get_mut(&target) {
                t.waiters.remove(pid);
            }
        }
        Ok(reason)
    }

    /// Advance the tick counter. Returns whether the quantum has run out.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.ticks - self.last_switch >= self.quantum
    }

    /// Pick what runs next.
    ///
    /// Unless `force` is set, nothing happens before the quantum is used up.
    /// A running process goes back to the tail of its level; the head of the
    /// highest non-empty level wins; with nothing ready the idle context runs.
    /// Returns `None` when the current context keeps the CPU.
    pub fn schedule(&mut self, force: bool) -> Option<Switch> {
        if !force && self.ticks - self.last_switch < self.quantum {
            return None;
        }
        self.last_switch = self.ticks;

        let outgoing = self.current;
        if let Some(pid) = outgoing {
            if self.processes.get(&pid).map(|p| p.state) == Some(ProcessState::Running) {
                self.enqueue(pid);
            }
        }

        let next = self.pop_ready();
        if next == outgoing {
            if let Some(p) = next.and_then(|pid| self.processes.get_mut(&pid)) {
                p.state = ProcessState::Running;
            }
            return None;
        }

        let from = match outgoing {
            Some(pid) => self
                .processes
                .get(&pid)
                .filter(|p| p.state.is_alive())
                .map(|p| p.context.clone()),
            None => Some(self.idle.clone()),
        };
        let to = match next.and_then(|pid| self.processes.get_mut(&pid)) {
            Some(p) => {
                p.state = ProcessState::Running;
                p.context.stack_pointer()
            }
            None => self.idle.stack_pointer(),
        };

        self.current = next;
        self.switches += 1;
        log::trace!("sched: switch {:?} -> {:?}", outgoing, next);
        Some(Switch { from, to })
    }

    /// Rewrite both priorities; a Ready process moves to its new level.
    pub fn set_priority(&mut self, pid: ProcessId, priority: Priority) -> KernelResult<()> {
        let process = self.live_mut(pid)?;
        process.priority = priority;
        process.base_priority = priority;
        if process.state == ProcessState::Ready {
            self.enqueue(pid);
        }
        Ok(())
    }

    /// Move `pid` to Finished and clear every reference other PCBs hold to it.
    ///
    /// Waiters are made Ready, the first of them inheriting the foreground
    /// flag (the parent gets it when nobody waits). Children are orphaned,
    /// finished ones reaped. The PCB itself stays as a zombie until it is
    /// waited for, its parent finishes or [`Scheduler::has_room`] needs the
    /// slot. The caller must already have taken `pid` out of any semaphore
    /// wait queue.
    pub fn terminate(&mut self, pid: ProcessId) -> KernelResult<Remains> {
        let process = self.live_mut(pid)?;
        process.state = ProcessState::Finished;
        process.waiting_on_sem = None;
        let unclaimed = process.granted_by.take();
        let waiting_on = process.waiting_on_pid.take();
        let was_foreground = mem::replace(&mut process.is_foreground, false);
        let fds = mem::take(&mut process.fds);
        let mut stacks: Vec<Region> = process
            .kernel_stack
            .take()
            .into_iter()
            .chain(process.user_stack.take())
            .collect();
        let waiters: Vec<ProcessId> = process.waiters.drain().collect();
        let parent = process.parent;

        self.detach(pid);
        if let Some(target) = waiting_on.and_then(|t| self.processes.get_mut(&t)) {
            target.waiters.remove(pid);
        }

        let mut heir = None;
        for waiter in waiters {
            if self.unblock(waiter).is_ok() {
                heir.get_or_insert(waiter);
            }
        }
        if was_foreground {
            let heir = heir.or(parent.filter(|&p| self.is_alive(p)));
            if let Some(p) = heir.and_then(|h| self.processes.get_mut(&h)) {
                p.is_foreground = true;
            }
        }

        for child in tree::children(&self.processes, pid) {
            tree::unlink(&mut self.processes, child);
            if !self.is_alive(child) {
                self.processes.remove(&child);
            }
        }

        if self.current == Some(pid) {
            self.graveyard.append(&mut stacks);
        }
        Ok(Remains { fds, stacks, unclaimed })
    }

    /// Drop a finished PCB nobody is waiting on.
    pub fn reap(&mut self, pid: ProcessId) -> bool {
        match self.processes.get(&pid) {
            Some(p) if !p.state.is_alive() && p.waiters.is_empty() => {
                tree::unlink(&mut self.processes, pid);
                self.processes.remove(&pid);
                true
            }
            _ => false,
        }
    }

    pub fn take_graveyard(&mut self) -> Vec<Region> {
        mem::take(&mut self.graveyard)
    }

    pub fn foreground(&self) -> Option<ProcessId> {
        self.processes
            .values()
            .find(|p| p.is_foreground && p.state.is_alive())
            .map(|p| p.pid)
    }

    pub fn snapshot(&self, limit: usize) -> Vec<ProcessSummary> {
        self.processes.values().take(limit).map(Process::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    #[cfg(test)]
    fn queued_count(&self, pid: ProcessId) -> usize {
        self.ready.iter().filter(|q| q.contains(pid)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn scheduler(quantum: u64) -> Scheduler {
        let config = KernelConfig::default().with_quantum(quantum).with_max_processes(8);
        Scheduler::new(&config, Arc::new(Context::new(0xD1E)))
    }

    /// Admit a process whose saved stack pointer is `1000 + pid`.
    fn admit(s: &mut Scheduler, priority: Priority, parent: Option<ProcessId>) -> ProcessId {
        let pid = s.allocate_pid();
        let ctx = Arc::new(Context::new(1000 + pid.0 as usize));
        s.admit(Process::new(pid, "t", priority, ctx), parent).unwrap();
        pid
    }

    fn boot(s: &mut Scheduler) -> ProcessId {
        let pid = s.allocate_pid();
        let mut init = Process::new(pid, "init", Priority::Medium, Arc::new(Context::default()));
        init.is_foreground = true;
        s.adopt_current(init);
        pid
    }

    #[test]
    fn high_priority_always_wins() {
        let mut s = scheduler(1);
        let low = admit(&mut s, Priority::Low, None);
        let med = admit(&mut s, Priority::Medium, None);
        let high = admit(&mut s, Priority::High, None);

        let sw = s.schedule(true).unwrap();
        assert_eq!(sw.to, 1000 + high.0 as usize);
        assert_eq!(s.current_pid(), Some(high));
        // Only High is runnable at its level: it keeps the CPU on every tick.
        for _ in 0..5 {
            s.tick();
            assert!(s.schedule(false).is_none());
            assert_eq!(s.current_pid(), Some(high));
        }
        s.suspend(high, None).unwrap();
        s.schedule(true).unwrap();
        assert_eq!(s.current_pid(), Some(med));
        s.unblock(high).unwrap();
        s.schedule(true).unwrap();
        assert_eq!(s.current_pid(), Some(high));
        assert_eq!(s.get(low).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn round_robin_within_a_level() {
        let mut s = scheduler(1);
        let a = admit(&mut s, Priority::Medium, None);
        let b = admit(&mut s, Priority::Medium, None);
        let c = admit(&mut s, Priority::Medium, None);
        let mut order = vec![];
        for _ in 0..6 {
            s.schedule(true);
            order.push(s.current_pid().unwrap());
        }
        assert_eq!(order, [a, b, c, a, b, c]);
    }

    #[test]
    fn quantum_gates_timer_preemption() {
        let mut s = scheduler(3);
        let a = admit(&mut s, Priority::Medium, None);
        let b = admit(&mut s, Priority::Medium, None);
        s.schedule(true);
        assert_eq!(s.current_pid(), Some(a));
        assert!(!s.tick());
        assert!(s.schedule(false).is_none());
        assert!(!s.tick());
        assert!(s.schedule(false).is_none());
        assert!(s.tick());
        let sw = s.schedule(false).unwrap();
        assert_eq!(s.current_pid(), Some(b));
        assert_eq!(sw.to, 1000 + b.0 as usize);
        assert!(sw.from.is_some());
    }

    #[test]
    fn nothing_ready_runs_idle() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        s.suspend(init, None).unwrap();
        let sw = s.schedule(true).unwrap();
        assert_eq!(sw.to, 0xD1E);
        assert_eq!(s.current_pid(), None);
        // idle with nothing to do stays idle
        assert!(s.schedule(true).is_none());
        s.unblock(init).unwrap();
        let sw = s.schedule(true).unwrap();
        assert_eq!(s.current_pid(), Some(init));
        assert_eq!(sw.from.unwrap().stack_pointer(), 0xD1E);
    }

    #[test]
    fn pcb_sits_in_at_most_one_queue() {
        let mut s = scheduler(1);
        let a = admit(&mut s, Priority::Low, None);
        s.set_priority(a, Priority::High).unwrap();
        s.unblock(a).unwrap();
        s.set_priority(a, Priority::Medium).unwrap();
        assert_eq!(s.queued_count(a), 1);
        s.suspend(a, None).unwrap();
        assert_eq!(s.queued_count(a), 0);
        s.unblock(a).unwrap();
        s.unblock(a).unwrap();
        assert_eq!(s.queued_count(a), 1);
        assert_eq!(s.get(a).unwrap().base_priority, Priority::Medium);
    }

    #[test]
    fn unknown_pids_have_no_side_effects() {
        let mut s = scheduler(1);
        let ghost = ProcessId(99);
        assert_eq!(s.unblock(ghost), Err(KernelError::NoSuchProcess));
        assert_eq!(s.set_priority(ghost, Priority::High), Err(KernelError::NoSuchProcess));
        assert_eq!(s.suspend(ghost, None), Err(KernelError::NoSuchProcess));
        assert!(s.terminate(ghost).is_err());
        assert!(s.is_empty());
    }

    #[test]
    fn terminate_wakes_waiters_and_hands_over_foreground() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        let child = admit(&mut s, Priority::Medium, Some(init));
        s.get_mut(init).unwrap().is_foreground = false;
        s.get_mut(child).unwrap().is_foreground = true;

        s.get_mut(child).unwrap().waiters.push_back(init);
        s.suspend(init, Some(WaitReason::Process(child))).unwrap();
        s.schedule(true);
        assert_eq!(s.current_pid(), Some(child));

        let remains = s.terminate(child).unwrap();
        assert!(remains.stacks.is_empty());
        assert_eq!(s.get(child).unwrap().state, ProcessState::Finished);
        assert_eq!(s.get(init).unwrap().state, ProcessState::Ready);
        assert_eq!(s.get(init).unwrap().waiting_on_pid, None);
        assert_eq!(s.foreground(), Some(init));

        // the finished context is not saved
        let sw = s.schedule(true).unwrap();
        assert!(sw.from.is_none());
        assert_eq!(s.current_pid(), Some(init));

        // zombie stays in the parent's child list until reaped
        assert_eq!(tree::children(&s.processes, init), [child]);
        assert!(s.reap(child));
        assert!(s.get(child).is_none());
        assert!(tree::children(&s.processes, init).is_empty());
    }

    #[test]
    fn cancel_wait_detaches_from_the_target() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        let child = admit(&mut s, Priority::Medium, Some(init));
        s.get_mut(child).unwrap().waiters.push_back(init);
        s.suspend(init, Some(WaitReason::Process(child))).unwrap();

        assert_eq!(s.cancel_wait(init), Ok(Some(WaitReason::Process(child))));
        assert!(s.get(child).unwrap().waiters.is_empty());
        assert!(s.get(init).unwrap().interrupted);
        s.unblock(init).unwrap();
        // a ready process has nothing to cancel
        assert_eq!(s.cancel_wait(init), Ok(None));
    }

    #[test]
    fn foreground_falls_back_to_parent() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        let child = admit(&mut s, Priority::Low, Some(init));
        s.get_mut(init).unwrap().is_foreground = false;
        s.get_mut(child).unwrap().is_foreground = true;
        s.terminate(child).unwrap();
        assert_eq!(s.foreground(), Some(init));
    }

    #[test]
    fn orphans_are_unlinked_and_finished_children_reaped() {
        let mut s = scheduler(1);
        let parent = admit(&mut s, Priority::Medium, None);
        let live = admit(&mut s, Priority::Medium, Some(parent));
        let dead = admit(&mut s, Priority::Medium, Some(parent));
        s.terminate(dead).unwrap();
        assert!(s.get(dead).is_some());

        s.terminate(parent).unwrap();
        assert!(s.get(dead).is_none());
        assert_eq!(s.get(live).unwrap().parent, None);
        // parentless zombies wait to be reaped like any other
        assert_eq!(s.get(parent).unwrap().state, ProcessState::Finished);
        s.terminate(live).unwrap();
        assert_eq!(s.get(live).unwrap().state, ProcessState::Finished);
        assert!(s.reap(live));
        assert!(s.reap(parent));
        assert!(s.is_empty());
    }

    #[test]
    fn admit_rejects_a_dead_parent() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        let done = admit(&mut s, Priority::Medium, Some(init));
        s.terminate(done).unwrap();
        for parent in [done, ProcessId(42)] {
            let pid = s.allocate_pid();
            let p = Process::new(pid, "x", Priority::Low, Arc::new(Context::default()));
            assert_eq!(s.admit(p, Some(parent)).unwrap_err(), KernelError::NoSuchProcess);
            assert!(s.get(pid).is_none());
        }
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn unclaimed_grant_is_returned_on_terminate() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        let a = admit(&mut s, Priority::Medium, Some(init));
        s.suspend(a, Some(WaitReason::Semaphore(SemId(4)))).unwrap();
        s.hand_over(a, SemId(4)).unwrap();
        assert_eq!(s.get(a).unwrap().state, ProcessState::Ready);
        assert_eq!(s.get(a).unwrap().wait_reason(), None);
        assert_eq!(s.terminate(a).unwrap().unclaimed, Some(SemId(4)));
    }

    #[test]
    fn full_table_reaps_a_zombie() {
        let config = KernelConfig::default().with_max_processes(2);
        let mut s = Scheduler::new(&config, Arc::new(Context::default()));
        let init = boot(&mut s);
        let a = admit(&mut s, Priority::Low, Some(init));
        let pid = s.allocate_pid();
        let extra = Process::new(pid, "x", Priority::Low, Arc::new(Context::default()));
        assert_eq!(s.admit(extra, Some(init)).unwrap_err(), KernelError::ProcessTableFull);

        s.terminate(a).unwrap();
        let pid = s.allocate_pid();
        let extra = Process::new(pid, "x", Priority::Low, Arc::new(Context::default()));
        s.admit(extra, Some(init)).unwrap();
        assert!(s.get(a).is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn current_stacks_go_to_the_graveyard() {
        let mut s = scheduler(1);
        let init = boot(&mut s);
        s.get_mut(init).unwrap().kernel_stack = Some(Region::new(vec![0u8; 64].into_boxed_slice()));
        let remains = s.terminate(init).unwrap();
        assert!(remains.stacks.is_empty());
        assert_eq!(s.take_graveyard().len(), 1);
        assert!(s.take_graveyard().is_empty());
    }
}
