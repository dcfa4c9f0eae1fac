use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use super::context::Context;
use crate::fs::fd::FdTable;
use crate::memory::Region;
use crate::sync::semaphore::SemId;
use crate::sync::wait_queue::WaitQueue;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Finished,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self != ProcessState::Finished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Priority {
    pub const COUNT: usize = 3;

    /// Scan order for the scheduler: highest level first.
    pub const DESCENDING: [Priority; Priority::COUNT] =
        [Priority::High, Priority::Medium, Priority::Low];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What a blocked process is parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Semaphore(SemId),
    Process(ProcessId),
}

/// Process control block.
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub context: Arc<Context>,
    /// Owned stack memory, `None` for the boot context and once released.
    pub kernel_stack: Option<Region>,
    pub user_stack: Option<Region>,
    pub arg: usize,
    pub is_foreground: bool,

    pub parent: Option<ProcessId>,
    pub first_child: Option<ProcessId>,
    pub next_sibling: Option<ProcessId>,
    pub prev_sibling: Option<ProcessId>,

    /// Processes blocked in `wait_pid` on this one.
    pub waiters: WaitQueue,
    pub waiting_on_pid: Option<ProcessId>,
    pub waiting_on_sem: Option<SemId>,
    /// Set when an explicit `unblock` pulled this process out of a wait.
    pub interrupted: bool,
    /// Woken by a signal on this semaphore and not yet back in `sem_wait`.
    pub granted_by: Option<SemId>,

    pub fds: FdTable,
}

impl Process {
    pub fn new(pid: ProcessId, name: &str, priority: Priority, context: Arc<Context>) -> Self {
        Process {
            pid,
            name: String::from(name),
            state: ProcessState::New,
            priority,
            base_priority: priority,
            context,
            kernel_stack: None,
            user_stack: None,
            arg: 0,
            is_foreground: false,
            parent: None,
            first_child: None,
            next_sibling: None,
            prev_sibling: None,
            waiters: WaitQueue::new(),
            waiting_on_pid: None,
            waiting_on_sem: None,
            interrupted: false,
            granted_by: None,
            fds: FdTable::new(),
        }
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        match (self.waiting_on_sem, self.waiting_on_pid) {
            (Some(sem), _) => Some(WaitReason::Semaphore(sem)),
            (None, Some(pid)) => Some(WaitReason::Process(pid)),
            (None, None) => None,
        }
    }

    pub fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            foreground: self.is_foreground,
            parent: self.parent,
            arg: self.arg,
            open_fds: self.fds.open_count(),
            stack_base: self.kernel_stack.as_ref().map(Region::base),
        }
    }
}

/// Read-only view of a process for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub pid: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub priority: Priority,
    pub foreground: bool,
    pub parent: Option<ProcessId>,
    pub arg: usize,
    pub open_fds: usize,
    pub stack_base: Option<usize>,
}

impl fmt::Display for ProcessSummary {
    /// One `ps` line: pid, state, priority, foreground marker, name.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = alloc::format!("{:?}", self.state);
        let priority = alloc::format!("{:?}", self.priority);
        write!(
            f,
            "{:>3}  {:9}  {:6}  {}  {}",
            self.pid.0,
            state,
            priority,
            if self.foreground { '+' } else { ' ' },
            self.name
        )
    }
}
