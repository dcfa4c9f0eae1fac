//! The kernel core: process lifecycle on top of the scheduler, plus the
//! shared tables the semaphore and pipe operations work on.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use spin::{Mutex, Once};

use crate::arch::{without_interrupts, Cpu};
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::fs::fd::FdTable;
use crate::fs::pipe::{PipeId, PipeTable};
use crate::fs::Terminal;
use crate::memory::{MemoryManager, Region};
use crate::scheduler::context::Context;
use crate::scheduler::{
    Priority, Process, ProcessId, ProcessState, ProcessSummary, Remains, Scheduler, Switch,
    WaitReason,
};
use crate::sync::semaphore::SemaphoreTable;

/// The boot context, adopted as the first process. It can never be killed.
pub const INIT_PID: ProcessId = ProcessId(0);

/// External collaborators the core runs on.
pub struct Platform {
    pub cpu: Box<dyn Cpu>,
    pub memory: Box<dyn MemoryManager>,
    pub terminal: Box<dyn Terminal>,
}

/// Parameters of [`Kernel::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub name: &'a str,
    /// Defaults to the calling process.
    pub parent: Option<ProcessId>,
    pub priority: Priority,
    pub foreground: bool,
    /// Pipe whose read end becomes fd 0; the terminal otherwise.
    pub stdin: Option<PipeId>,
    /// Pipe whose write end becomes fd 1; the terminal otherwise.
    pub stdout: Option<PipeId>,
    pub user_stack_size: Option<usize>,
}

impl<'a> SpawnRequest<'a> {
    pub fn new(name: &'a str) -> Self {
        SpawnRequest {
            name,
            parent: None,
            priority: Priority::Medium,
            foreground: false,
            stdin: None,
            stdout: None,
            user_stack_size: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent: ProcessId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn foreground(mut self) -> Self {
        self.foreground = true;
        self
    }

    pub fn stdin(mut self, pipe: PipeId) -> Self {
        self.stdin = Some(pipe);
        self
    }

    pub fn stdout(mut self, pipe: PipeId) -> Self {
        self.stdout = Some(pipe);
        self
    }

    pub fn user_stack(mut self, size: usize) -> Self {
        self.user_stack_size = Some(size);
        self
    }
}

/// Snapshot of the process table, yielded lazily.
pub struct ProcessList {
    inner: vec::IntoIter<ProcessSummary>,
}

impl Iterator for ProcessList {
    type Item = ProcessSummary;

    fn next(&mut self) -> Option<ProcessSummary> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) cpu: Box<dyn Cpu>,
    pub(crate) memory: Box<dyn MemoryManager>,
    pub(crate) terminal: Box<dyn Terminal>,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) semaphores: Mutex<SemaphoreTable>,
    pub(crate) pipes: Mutex<PipeTable>,
    idle_stack: Once<Region>,
}

impl Kernel {
    /// Bring up the core. The calling context becomes `init` (pid 0,
    /// foreground, terminal on fds 0 and 1) and an idle context is prepared
    /// for when nothing is ready.
    pub fn boot(config: KernelConfig, platform: Platform) -> KernelResult<&'static Kernel> {
        let Platform { cpu, memory, terminal } = platform;
        let idle = Arc::new(Context::default());
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel {
            config,
            cpu,
            memory,
            terminal,
            scheduler: Mutex::new(Scheduler::new(&config, idle.clone())),
            semaphores: Mutex::new(SemaphoreTable::new(config.max_semaphores)),
            pipes: Mutex::new(PipeTable::new(config.max_pipes)),
            idle_stack: Once::new(),
        }));

        let mut stack = kernel.memory.allocate(config.kernel_stack_size)?;
        let sp = kernel
            .cpu
            .init_context(stack.as_mut_slice(), Box::new(move || kernel.idle_loop()));
        idle.set_stack_pointer(sp);
        kernel.idle_stack.call_once(|| stack);

        let mut scheduler = kernel.scheduler.lock();
        let pid = scheduler.allocate_pid();
        let mut init = Process::new(pid, "init", Priority::Medium, Arc::new(Context::default()));
        init.is_foreground = true;
        init.fds = FdTable::standard(None, None);
        scheduler.adopt_current(init);
        drop(scheduler);

        log::info!(
            "kernel: up (quantum {} ticks, {} process slots)",
            config.quantum_ticks,
            config.max_processes
        );
        Ok(kernel)
    }

    fn idle_loop(&'static self) {
        self.enter_fresh_context();
        loop {
            self.cpu.disable_interrupts();
            self.cpu.wait_for_interrupt();
            self.reschedule();
        }
    }

    /// Run `f` with interrupts masked.
    pub(crate) fn atomically<R>(&self, f: impl FnOnce() -> R) -> R {
        without_interrupts(&*self.cpu, f)
    }

    pub(crate) fn current_pid(&self) -> KernelResult<ProcessId> {
        self.atomically(|| self.scheduler.lock().current_pid())
            .ok_or(KernelError::NoCurrentProcess)
    }

    /// Consume the flag an explicit `unblock` left on `pid`.
    pub(crate) fn take_interrupted(&self, pid: ProcessId) -> KernelResult<()> {
        let interrupted = self.atomically(|| {
            self.scheduler
                .lock()
                .get_mut(pid)
                .is_some_and(|p| mem::take(&mut p.interrupted))
        });
        if interrupted {
            Err(KernelError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Give up the CPU to whatever the scheduler picks.
    pub(crate) fn reschedule(&self) {
        self.atomically(|| {
            let switch = self.scheduler.lock().schedule(true);
            self.perform(switch);
        });
    }

    fn perform(&self, switch: Option<Switch>) {
        let Some(Switch { from, to }) = switch else {
            return;
        };
        match from {
            Some(context) => {
                self.cpu.switch(context.slot(), to);
                self.after_switch();
            }
            None => self.cpu.exit_to(to),
        }
    }

    /// Runs in the incoming context after every switch: frees the stacks of
    /// contexts that exited.
    fn after_switch(&self) {
        let dead = self.atomically(|| self.scheduler.lock().take_graveyard());
        self.release_regions(dead);
    }

    fn enter_fresh_context(&self) {
        self.after_switch();
        self.cpu.enable_interrupts();
    }

    fn release_regions(&self, regions: impl IntoIterator<Item = Region>) {
        for region in regions {
            self.memory.release(region);
        }
    }

    fn release_remains(&self, remains: Remains) {
        let Remains { mut fds, stacks, unclaimed } = remains;
        self.release_regions(stacks);
        if let Some(sem) = unclaimed {
            // pass the unit on to the next waiter
            let _ = self.sem_signal(sem);
        }
        for desc in fds.drain() {
            if let Err(e) = self.close_descriptor(desc) {
                log::warn!("proc: closing {:?} failed: {}", desc, e);
            }
        }
    }

    /// Timer interrupt entry. Counts a tick and preempts the running process
    /// once its quantum is used up. Call after acknowledging the interrupt.
    pub fn timer_tick(&self) {
        self.atomically(|| {
            let switch = {
                let mut scheduler = self.scheduler.lock();
                if !scheduler.tick() {
                    return;
                }
                scheduler.schedule(false)
            };
            self.perform(switch);
        });
    }

    pub fn ticks(&self) -> u64 {
        self.atomically(|| self.scheduler.lock().ticks())
    }

    pub fn context_switches(&self) -> u64 {
        self.atomically(|| self.scheduler.lock().switches())
    }

    /// Create a process running `entry(kernel, arg)`.
    ///
    /// Nothing is left behind on failure: stacks and pipe ends are given
    /// back and a foreground flag taken for the child is restored.
    pub fn spawn<F>(
        &'static self,
        request: SpawnRequest<'_>,
        entry: F,
        arg: usize,
    ) -> KernelResult<ProcessId>
    where
        F: FnOnce(&'static Kernel, usize) + Send + 'static,
    {
        if let Some(parent) = request.parent {
            if !self.atomically(|| self.scheduler.lock().is_alive(parent)) {
                log::warn!("proc: cannot spawn '{}' under {}", request.name, parent);
                return Err(KernelError::NoSuchProcess);
            }
        }
        for pipe in [request.stdin, request.stdout].into_iter().flatten() {
            self.pipe(pipe)?;
        }
        let caller = self.current_process();
        let parent = request.parent.or(caller);

        let previous_foreground = if request.foreground {
            self.atomically(|| {
                let mut scheduler = self.scheduler.lock();
                let holder = scheduler.foreground();
                if let Some(p) = holder.and_then(|pid| scheduler.get_mut(pid)) {
                    p.is_foreground = false;
                }
                holder
            })
        } else {
            None
        };

        let spawned = self.build_process(&request, parent, entry, arg);
        match spawned {
            Ok(pid) => {
                log::info!("proc: spawned {} '{}' ({:?})", pid, request.name, request.priority);
                Ok(pid)
            }
            Err(e) => {
                if let Some(holder) = previous_foreground {
                    self.atomically(|| {
                        if let Some(p) = self.scheduler.lock().get_mut(holder) {
                            p.is_foreground = true;
                        }
                    });
                }
                log::warn!("proc: cannot spawn '{}': {}", request.name, e);
                Err(e)
            }
        }
    }

    fn build_process<F>(
        &'static self,
        request: &SpawnRequest<'_>,
        parent: Option<ProcessId>,
        entry: F,
        arg: usize,
    ) -> KernelResult<ProcessId>
    where
        F: FnOnce(&'static Kernel, usize) + Send + 'static,
    {
        let kernel_stack = self.memory.allocate(self.config.kernel_stack_size)?;
        let user_stack = match request.user_stack_size {
            Some(size) => match self.memory.allocate(size) {
                Ok(region) => Some(region),
                Err(e) => {
                    self.memory.release(kernel_stack);
                    return Err(e);
                }
            },
            None => None,
        };
        let mut stacks = Some((kernel_stack, user_stack));

        let opened = self.open_standard_pipes(request.stdin, request.stdout);
        let admitted = opened.and_then(|()| {
            self.atomically(|| {
                let mut scheduler = self.scheduler.lock();
                if parent.is_some_and(|p| !scheduler.is_alive(p)) {
                    return Err(KernelError::NoSuchProcess);
                }
                if !scheduler.has_room() {
                    return Err(KernelError::ProcessTableFull);
                }
                let Some((mut kernel_stack, user_stack)) = stacks.take() else {
                    return Err(KernelError::OutOfMemory);
                };
                let pid = scheduler.allocate_pid();
                let context = Arc::new(Context::default());
                let sp = self.cpu.init_context(
                    kernel_stack.as_mut_slice(),
                    Box::new(move || self.run_process(entry, arg)),
                );
                context.set_stack_pointer(sp);

                let mut process = Process::new(pid, request.name, request.priority, context);
                process.kernel_stack = Some(kernel_stack);
                process.user_stack = user_stack;
                process.arg = arg;
                process.is_foreground = request.foreground;
                process.fds = FdTable::standard(request.stdin, request.stdout);
                scheduler.admit(process, parent)?;
                Ok(pid)
            })
        });

        if admitted.is_err() {
            if opened.is_ok() {
                self.close_standard_pipes(request.stdin, request.stdout);
            }
            if let Some((kernel_stack, user_stack)) = stacks {
                self.release_regions(core::iter::once(kernel_stack).chain(user_stack));
            }
        }
        admitted
    }

    fn open_standard_pipes(
        &self,
        stdin: Option<PipeId>,
        stdout: Option<PipeId>,
    ) -> KernelResult<()> {
        if let Some(id) = stdin {
            self.pipe_open(id, false)?;
        }
        if let Some(id) = stdout {
            if let Err(e) = self.pipe_open(id, true) {
                self.close_standard_pipes(stdin, None);
                return Err(e);
            }
        }
        Ok(())
    }

    fn close_standard_pipes(&self, stdin: Option<PipeId>, stdout: Option<PipeId>) {
        if let Some(id) = stdin {
            let _ = self.pipe_close(id, false);
        }
        if let Some(id) = stdout {
            let _ = self.pipe_close(id, true);
        }
    }

    fn run_process<F>(&'static self, entry: F, arg: usize)
    where
        F: FnOnce(&'static Kernel, usize),
    {
        self.enter_fresh_context();
        entry(self, arg);
        self.finish_current();
    }

    /// End the running process: close its descriptors, wake whoever waits
    /// for it and switch away for good.
    pub fn finish_current(&self) -> ! {
        if let Ok(pid) = self.current_pid() {
            let fds = self.atomically(|| {
                self.scheduler.lock().get_mut(pid).map(|p| mem::take(&mut p.fds))
            });
            if let Some(mut fds) = fds {
                for desc in fds.drain() {
                    let _ = self.close_descriptor(desc);
                }
            }
            let remains = self.atomically(|| self.scheduler.lock().terminate(pid));
            if let Ok(remains) = remains {
                self.release_remains(remains);
            }
            log::info!("proc: {} finished", pid);
        }
        loop {
            self.reschedule();
        }
    }

    /// Terminate `pid`. A process parked on a semaphore is taken off its
    /// queue first.
    pub fn kill(&self, pid: ProcessId) -> KernelResult<()> {
        if pid == INIT_PID {
            log::warn!("proc: refusing to kill init");
            return Err(KernelError::InvalidArgument);
        }
        if self.current_process() == Some(pid) {
            log::info!("proc: {} killed itself", pid);
            self.finish_current();
        }
        let remains = self.atomically(|| {
            let reason = self.scheduler.lock().live_mut(pid)?.wait_reason();
            if let Some(WaitReason::Semaphore(sem)) = reason {
                self.cancel_sem_wait(pid, sem);
            }
            self.scheduler.lock().terminate(pid)
        })?;
        log::info!("proc: {} killed", pid);
        self.release_remains(remains);
        Ok(())
    }

    /// Ctrl+C: kill the foreground process unless it is `init`.
    pub fn kill_foreground(&self) -> KernelResult<ProcessId> {
        let pid = self.foreground_pid().ok_or(KernelError::NoSuchProcess)?;
        self.kill(pid)?;
        Ok(pid)
    }

    /// Park `pid` until someone unblocks it. Blocking the caller switches
    /// away at once.
    pub fn block(&self, pid: ProcessId) -> KernelResult<()> {
        if self.current_process() == Some(pid) {
            return self.block_current();
        }
        self.atomically(|| {
            let mut scheduler = self.scheduler.lock();
            let state = scheduler.live_mut(pid)?.state;
            match state {
                ProcessState::Ready => scheduler.suspend(pid, None),
                _ => Ok(()),
            }
        })
    }

    pub fn block_current(&self) -> KernelResult<()> {
        self.atomically(|| {
            let pid = self.current_pid()?;
            self.scheduler.lock().suspend(pid, None)?;
            self.reschedule();
            Ok(())
        })
    }

    /// Go to the back of the caller's ready queue.
    pub fn yield_current(&self) {
        self.reschedule();
    }

    /// Make a blocked process ready. If it was parked in `sem_wait` or
    /// `wait_pid`, that call returns [`KernelError::Interrupted`].
    pub fn unblock(&self, pid: ProcessId) -> KernelResult<()> {
        self.atomically(|| {
            let reason = self.scheduler.lock().cancel_wait(pid)?;
            if let Some(WaitReason::Semaphore(sem)) = reason {
                self.cancel_sem_wait(pid, sem);
            }
            self.scheduler.lock().unblock(pid)
        })
    }

    pub fn set_priority(&self, pid: ProcessId, priority: Priority) -> KernelResult<()> {
        self.atomically(|| self.scheduler.lock().set_priority(pid, priority))
    }

    /// Block until `pid` finishes, then reap it. Returns at once for a
    /// process that already finished.
    pub fn wait_pid(&self, pid: ProcessId) -> KernelResult<()> {
        self.atomically(|| {
            let me = self.current_pid()?;
            if me == pid {
                return Err(KernelError::InvalidArgument);
            }
            {
                let mut scheduler = self.scheduler.lock();
                let target = scheduler.get_mut(pid).ok_or(KernelError::NoSuchProcess)?;
                if !target.state.is_alive() {
                    scheduler.reap(pid);
                    return Ok(());
                }
                target.waiters.push_back(me);
                if let Err(e) = scheduler.suspend(me, Some(WaitReason::Process(pid))) {
                    if let Some(t) = scheduler.get_mut(pid) {
                        t.waiters.remove(me);
                    }
                    return Err(e);
                }
            }
            self.reschedule();
            self.take_interrupted(me)?;
            self.scheduler.lock().reap(pid);
            Ok(())
        })
    }

    pub fn current_process(&self) -> Option<ProcessId> {
        self.atomically(|| self.scheduler.lock().current_pid())
    }

    pub fn foreground_pid(&self) -> Option<ProcessId> {
        self.atomically(|| self.scheduler.lock().foreground())
    }

    pub fn process(&self, pid: ProcessId) -> Option<ProcessSummary> {
        self.atomically(|| self.scheduler.lock().get(pid).map(Process::summary))
    }

    /// Up to `limit` processes in pid order.
    pub fn list_processes(&self, limit: usize) -> ProcessList {
        let snapshot: Vec<ProcessSummary> =
            self.atomically(|| self.scheduler.lock().snapshot(limit));
        ProcessList { inner: snapshot.into_iter() }
    }

    pub fn memory_in_use(&self) -> usize {
        self.memory.in_use()
    }
}
